//! LSS 시뮬레이션 - 가상 버스 위에서 채널 동작 확인
//!
//! 가상 서보를 붙인 `SimulatedBus`로 채널을 띄우고
//! scan → 주기적 질의 → health/통계 출력 순서로 실행한다.
//!
//! 사용법:
//!   cargo run --release --bin lss-sim -- [OPTIONS]
//!
//! 예시:
//!   # 서보 1, 2, 5 + 5번은 30% 응답 누락
//!   cargo run --release --bin lss-sim -- --servos 1,2,5 --flaky 5:0.3
//!
//!   # 3번 서보가 응답하지 않는 버스
//!   cargo run --release --bin lss-sim -- --servos 1,3 --silent 3 --rounds 20

use std::time::Duration;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lss::{Behavior, Channel, ChannelConfig, Outcome, Packet, ServoId, SimulatedBus};

/// 시뮬레이션 설정
struct SimConfig {
    servos: Vec<ServoId>,
    flaky: Vec<(ServoId, f64)>,
    silent: Vec<ServoId>,
    rounds: usize,
    scan_end: ServoId,
    interval: Duration,
    verbose: bool,
    config: ChannelConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            servos: vec![1, 2, 3],
            flaky: Vec::new(),
            silent: Vec::new(),
            rounds: 10,
            scan_end: 10,
            interval: Duration::from_millis(20),
            verbose: false,
            config: ChannelConfig::new("sim", 16),
        }
    }
}

fn parse_ids(value: &str) -> Vec<ServoId> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse().expect("유효한 서보 ID 필요"))
        .collect()
}

fn parse_args() -> SimConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SimConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--servos" | "-s" => {
                if i + 1 < args.len() {
                    config.servos = parse_ids(&args[i + 1]);
                    i += 1;
                }
            }
            "--flaky" => {
                if i + 1 < args.len() {
                    let (id, rate) = args[i + 1]
                        .split_once(':')
                        .expect("<ID>:<RATE> 형식 필요");
                    let rate: f64 = rate.parse().expect("유효한 숫자 필요");
                    if !(0.0..=1.0).contains(&rate) {
                        eprintln!("--flaky 확률은 0.0 ~ 1.0 사이여야 함: {}", rate);
                        std::process::exit(2);
                    }
                    config.flaky.push((id.parse().expect("유효한 서보 ID 필요"), rate));
                    i += 1;
                }
            }
            "--silent" => {
                if i + 1 < args.len() {
                    config.silent.extend(parse_ids(&args[i + 1]));
                    i += 1;
                }
            }
            "--rounds" | "-r" => {
                if i + 1 < args.len() {
                    config.rounds = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--scan-end" => {
                if i + 1 < args.len() {
                    config.scan_end = args[i + 1].parse().expect("유효한 서보 ID 필요");
                    i += 1;
                }
            }
            "--timeout-us" => {
                if i + 1 < args.len() {
                    config.config.timeout_usec = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--limit" => {
                if i + 1 < args.len() {
                    config.config.unresponsive_request_limit =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--disable-ms" => {
                if i + 1 < args.len() {
                    config.config.unresponsive_disable_interval =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"LSS Sim - 가상 버스 위의 LSS 채널

사용법:
  cargo run --release --bin lss-sim -- [OPTIONS]

옵션:
  -s, --servos <IDS>      버스에 붙일 서보 (기본: 1,2,3)
  --flaky <ID:RATE>       해당 서보의 응답 누락 확률 (반복 가능)
  --silent <IDS>          응답하지 않는 서보
  -r, --rounds <N>        질의 반복 횟수 (기본: 10)
  --scan-end <ID>         scan 범위 끝 (기본: 10, 시작은 0)
  --timeout-us <US>       응답 대기 시간 (기본: 5000)
  --limit <N>             비활성화까지 연속 누락 횟수 (기본: 3)
  --disable-ms <MS>       비활성화 시간 (기본: 10000)
  -v, --verbose           DEBUG 로그 출력
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sim_config = parse_args();

    // 로깅 설정
    let level = if sim_config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("LSS Sim starting...");
    info!("Servos: {:?}", sim_config.servos);
    info!("Timeout: {} us", sim_config.config.timeout_usec);
    info!(
        "Unresponsive: {} misses -> {} ms disabled",
        sim_config.config.unresponsive_request_limit,
        sim_config.config.unresponsive_disable_interval
    );

    // 가상 버스 구성
    let bus = SimulatedBus::with_servos(&sim_config.servos);
    for &(id, drop_rate) in &sim_config.flaky {
        bus.set_behavior(id, Behavior::Flaky { drop_rate });
    }
    for &id in &sim_config.silent {
        bus.set_behavior(id, Behavior::Silent);
    }

    let channel = Channel::new(sim_config.config.clone(), bus.clone())?;
    channel.create(&sim_config.servos)?;
    channel.start()?;

    // scan은 blocking이므로 런타임 워커를 점유하지 않게 분리
    let report = tokio::task::block_in_place(|| channel.scan(0, sim_config.scan_end))?;
    info!("Scan found {} servos: {:?}", report.count(), report.found);

    let targets = channel.servo_ids();
    if targets.is_empty() {
        warn!("No servos found, nothing to do");
        channel.stop()?;
        return Ok(());
    }

    for round in 1..=sim_config.rounds {
        let packets = targets.iter().map(|&id| Packet::query(id, "QD"));
        let promise = channel.send(packets)?;

        match promise.wait_async().await {
            Outcome::Success { replies } => {
                info!("[{:>3}] ok: {} replies", round, replies.len());
            }
            Outcome::Partial { replies, missing } => {
                warn!(
                    "[{:>3}] partial: {} replies, missing {:?}",
                    round,
                    replies.len(),
                    missing
                );
            }
            Outcome::Failed(reason) => {
                warn!("[{:>3}] failed: {}", round, reason);
                break;
            }
        }

        tokio::time::sleep(sim_config.interval).await;
    }

    // health 출력
    for id in channel.servo_ids() {
        let status = channel.status(id)?;
        info!(
            "Servo {:>3}: misses={} disabled={}",
            status.id,
            status.consecutive_misses,
            status
                .disabled_for
                .map(|d| format!("{}ms", d.as_millis()))
                .unwrap_or_else(|| "-".into())
        );
    }

    info!("{}", channel.stats().summary());
    channel.stop()?;

    Ok(())
}
