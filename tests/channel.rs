//! 채널 통합 테스트

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lss::{
    Behavior, Channel, ChannelConfig, ChannelState, Error, FailureReason, Outcome, Packet,
    ProbeReset, Reply, SimulatedBus, StreamTransport,
};

fn started(config: ChannelConfig, bus: &SimulatedBus) -> Channel {
    let channel = Channel::new(config, bus.clone()).unwrap();
    channel.start().unwrap();
    channel
}

fn config(timeout_usec: u64) -> ChannelConfig {
    ChannelConfig::new("it", 8).with_timeout_usec(timeout_usec)
}

#[test]
fn test_fifo_resolution_order() {
    let bus = SimulatedBus::with_servos(&[1, 2]);
    let channel = started(config(20_000), &bus);

    let promises: Vec<_> = (0..20)
        .map(|i| {
            let id = if i % 2 == 0 { 1 } else { 2 };
            channel.send([Packet::query(id, format!("QD{}", i))]).unwrap()
        })
        .collect();

    for window in promises.windows(2) {
        assert!(window[0].seq() < window[1].seq());
    }

    for (i, promise) in promises.iter().enumerate() {
        assert!(promise.wait().is_success());
        // 앞선 트랜잭션은 모두 먼저 완료되어 있어야 함
        assert!(promises[..i].iter().all(|p| p.is_resolved()));
    }

    let frames = bus.transmitted();
    assert_eq!(frames.len(), 20);
    for (i, frame) in frames.iter().enumerate() {
        let expected = format!("QD{}\r", i);
        assert!(frame.ends_with(expected.as_bytes()));
    }
}

#[test]
fn test_concurrent_send_sequence_numbers() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 50;

    let bus = SimulatedBus::new();
    let channel = Arc::new(started(config(5_000), &bus));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let channel = channel.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let tag = format!("D{}_{}", t, i);
                        let promise = channel.send([Packet::command(1, tag.clone())]).unwrap();
                        (tag, promise)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seq_by_tag = HashMap::new();
    let mut seqs = HashSet::new();
    for handle in handles {
        let sent = handle.join().unwrap();
        for pair in sent.windows(2) {
            assert!(pair[0].1.seq() < pair[1].1.seq());
        }
        for (tag, promise) in sent {
            assert!(promise.wait().is_success());
            assert!(seqs.insert(promise.seq()), "중복 seq {}", promise.seq());
            seq_by_tag.insert(tag, promise.seq());
        }
    }

    let total = (THREADS * PER_THREAD) as u64;
    assert_eq!(seqs, (1..=total).collect::<HashSet<_>>());

    // 버스에 나간 순서 = seq 순서
    let transmitted: Vec<u64> = bus
        .transmitted()
        .iter()
        .map(|frame| {
            let text = std::str::from_utf8(frame).unwrap();
            let tag = text.trim_start_matches("#1").trim_end_matches('\r');
            seq_by_tag[tag]
        })
        .collect();
    assert_eq!(transmitted.len(), THREADS * PER_THREAD);
    assert!(transmitted.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_all_replies_success() {
    let bus = SimulatedBus::with_servos(&[1, 2, 3]);
    bus.set_value(2, "900");
    let channel = started(config(50_000), &bus);
    channel.create(&[1, 2, 3]).unwrap();

    let promise = channel
        .send([
            Packet::query(1, "QD"),
            Packet::query(2, "QD"),
            Packet::command(3, "D100"),
        ])
        .unwrap();

    match promise.wait() {
        Outcome::Success { replies } => {
            assert_eq!(replies.len(), 2);
            assert!(replies.contains(&Reply::new(2, "QD900")));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let stats = channel.stats();
    assert_eq!(stats.transactions_succeeded, 1);
    assert_eq!(stats.packets_transmitted, 3);
    assert_eq!(stats.replies_received, 2);
}

#[test]
fn test_silent_servo_partial_after_timeout() {
    let bus = SimulatedBus::with_servos(&[1]);
    bus.attach(4, Behavior::Silent);
    let channel = started(config(30_000), &bus);

    let started_at = Instant::now();
    let promise = channel
        .send([Packet::query(1, "QD"), Packet::query(4, "QD")])
        .unwrap();
    let outcome = promise.wait();
    let elapsed = started_at.elapsed();

    assert_eq!(outcome.missing(), &[4]);
    assert!(outcome.reply_from(1).is_some());
    assert!(elapsed >= Duration::from_micros(30_000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn test_unresponsive_servo_disabled_then_probed() {
    let bus = SimulatedBus::new();
    bus.attach(3, Behavior::Silent);
    let config = config(10_000).with_unresponsive(2, 150);
    let channel = started(config, &bus);
    channel.add(3).unwrap();

    for _ in 0..2 {
        let outcome = channel.send([Packet::query(3, "QD")]).unwrap().wait();
        assert_eq!(outcome.missing(), &[3]);
    }
    let status = channel.status(3).unwrap();
    assert!(status.is_disabled());
    assert_eq!(status.consecutive_misses, 2);

    // 비활성 중에는 전송하지 않고 바로 누락 처리
    let started_at = Instant::now();
    let outcome = channel.send([Packet::query(3, "QD")]).unwrap().wait();
    assert_eq!(outcome.missing(), &[3]);
    assert!(started_at.elapsed() < Duration::from_millis(150));
    assert_eq!(bus.frames_to(3), 2);
    assert_eq!(channel.stats().packets_skipped, 1);

    // 비활성 구간 이후 다시 시도
    thread::sleep(Duration::from_millis(200));
    bus.set_behavior(3, Behavior::Responsive);
    let outcome = channel.send([Packet::query(3, "QD")]).unwrap().wait();
    assert!(outcome.is_success());
    assert_eq!(bus.frames_to(3), 3);

    let status = channel.status(3).unwrap();
    assert!(!status.is_disabled());
    assert_eq!(status.consecutive_misses, 0);
    assert_eq!(channel.stats().servos_disabled, 1);
}

#[test]
fn test_probe_reset_on_reply_redisables_after_failed_probe() {
    let bus = SimulatedBus::new();
    bus.attach(6, Behavior::Silent);
    let config = config(10_000)
        .with_unresponsive(2, 100)
        .with_probe_reset(ProbeReset::OnReply);
    let channel = started(config, &bus);
    channel.add(6).unwrap();

    for _ in 0..2 {
        channel.send([Packet::query(6, "QD")]).unwrap().wait();
    }
    assert!(channel.status(6).unwrap().is_disabled());

    thread::sleep(Duration::from_millis(150));
    let outcome = channel.send([Packet::query(6, "QD")]).unwrap().wait();
    assert_eq!(outcome.missing(), &[6]);
    assert_eq!(bus.frames_to(6), 3);

    // probe 실패 한 번으로 다시 비활성화
    assert!(channel.status(6).unwrap().is_disabled());
    assert_eq!(channel.stats().servos_disabled, 2);
}

#[test]
fn test_scan_finds_present_servos() {
    let bus = SimulatedBus::with_servos(&[3, 7, 20]);
    let channel = started(config(5_000), &bus);

    let report = channel.scan(1, 10).unwrap();
    assert_eq!(report.count(), 2);
    assert_eq!(report.found, vec![3, 7]);
    assert!(report.aborted.is_none());

    let frames = bus.transmitted();
    assert_eq!(frames.len(), 10);
    assert_eq!(&frames[0][..], b"#1QID\r");
    assert_eq!(&frames[9][..], b"#10QID\r");
}

#[test]
fn test_registry_overflow_leaves_registry_unchanged() {
    let bus = SimulatedBus::new();
    let channel = Channel::new(ChannelConfig::new("small", 2), bus).unwrap();
    channel.create(&[1, 2]).unwrap();

    let err = channel.add(3).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { capacity: 2 }));
    assert_eq!(channel.servo_ids(), vec![1, 2]);
    assert!(!channel.contains(3));
    assert!(matches!(
        channel.status(3),
        Err(Error::ServoNotFound { id: 3 })
    ));
}

#[test]
fn test_transport_failure_fails_all_pending() {
    let bus = SimulatedBus::with_servos(&[1]);
    let channel = Channel::new(config(10_000), bus.clone()).unwrap();

    // 시작 전에 쌓아 둔 트랜잭션
    let promises: Vec<_> = (0..4)
        .map(|_| channel.send([Packet::query(1, "QD")]).unwrap())
        .collect();

    bus.fail_next_transmit();
    channel.start().unwrap();

    for promise in &promises {
        assert!(matches!(
            promise.wait(),
            Outcome::Failed(FailureReason::TransportFailed(_))
        ));
    }
    assert_eq!(channel.state(), ChannelState::Error);
    assert_eq!(channel.pending_len(), 0);

    let late = channel.send([Packet::query(1, "QD")]).unwrap();
    assert!(matches!(
        late.try_outcome(),
        Some(Outcome::Failed(FailureReason::TransportFailed(_)))
    ));

    // 명시적 재시작
    channel.start().unwrap();
    assert!(channel.send([Packet::query(1, "QD")]).unwrap().wait().is_success());
    assert_eq!(channel.stats().transactions_failed, 5);
}

#[test]
fn test_stray_replies_are_ignored() {
    let bus = SimulatedBus::new();
    bus.attach(4, Behavior::Silent);
    let channel = started(config(100_000), &bus);

    let promise = channel.send([Packet::query(4, "QD")]).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(bus.inject(Reply::new(9, "QD1")));

    let outcome = promise.wait();
    assert_eq!(outcome.missing(), &[4]);
    assert!(outcome.replies().is_empty());
    assert_eq!(channel.stats().stray_replies, 1);
}

#[test]
fn test_late_reply_does_not_complete_next_transaction() {
    let bus = SimulatedBus::new();
    bus.attach(2, Behavior::Delayed(Duration::from_millis(60)));
    bus.attach(5, Behavior::Silent);
    let channel = started(config(10_000), &bus);

    let first = channel.send([Packet::query(2, "QD")]).unwrap();
    assert_eq!(first.wait().missing(), &[2]);

    // 늦게 도착한 2번 응답은 5번을 기다리는 트랜잭션과 무관
    let second = channel.send([Packet::query(5, "QD")]).unwrap();
    thread::sleep(Duration::from_millis(80));
    assert_eq!(second.wait().missing(), &[5]);

    let third = channel.send([Packet::command(5, "D0")]).unwrap();
    assert!(third.wait().is_success());
    assert_eq!(channel.stats().stray_replies, 1);
}

#[test]
fn test_stream_transport_without_reader_times_out() {
    let channel = Channel::new(config(5_000), StreamTransport::new(Vec::new())).unwrap();
    channel.start().unwrap();

    assert!(channel.send([Packet::command(1, "D0")]).unwrap().wait().is_success());
    assert_eq!(
        channel.send([Packet::query(1, "QD")]).unwrap().wait().missing(),
        &[1]
    );
    assert_eq!(channel.stats().bytes_transmitted, b"#1D0\r#1QD\r".len() as u64);
}

#[test]
fn test_idle_release_keeps_miss_count_until_probe() {
    let bus = SimulatedBus::new();
    bus.attach(3, Behavior::Silent);
    let mut config = config(10_000).with_unresponsive(2, 60);
    config.health_check_interval_ms = 10;
    let channel = started(config, &bus);
    channel.add(3).unwrap();

    for _ in 0..2 {
        channel.send([Packet::query(3, "QD")]).unwrap().wait();
    }
    assert!(channel.status(3).unwrap().is_disabled());

    // 주기 점검이 비활성을 풀어도 probe 전까지 카운터 유지
    thread::sleep(Duration::from_millis(150));
    let status = channel.status(3).unwrap();
    assert!(!status.is_disabled());
    assert_eq!(status.consecutive_misses, 2);

    bus.set_behavior(3, Behavior::Responsive);
    assert!(channel.send([Packet::query(3, "QD")]).unwrap().wait().is_success());
    assert_eq!(channel.status(3).unwrap().consecutive_misses, 0);
}

/// 4번 서보처럼 질의마다 응답을 reader 쪽으로 돌려주는 writer
struct LoopbackServo {
    replies: crossbeam_channel::Sender<Vec<u8>>,
    answered: u32,
    fail_next: Arc<AtomicBool>,
}

impl Write for LoopbackServo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line down"));
        }
        if buf.starts_with(b"#4Q") {
            self.answered += 1;
            let reply = format!("*4QD{}\r", self.answered);
            let _ = self.replies.send(reply.into_bytes());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 받은 바이트 묶음을 순서대로 돌려주는 reader (writer가 사라지면 EOF)
struct LoopbackReader {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for LoopbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

fn loopback_channel() -> (Channel, Arc<AtomicBool>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let fail_next = Arc::new(AtomicBool::new(false));
    let writer = LoopbackServo {
        replies: tx,
        answered: 0,
        fail_next: fail_next.clone(),
    };
    let reader = LoopbackReader {
        rx,
        pending: Vec::new(),
    };
    let transport = StreamTransport::new(writer).with_reader(reader);
    let channel = Channel::new(config(500_000), transport).unwrap();
    (channel, fail_next)
}

fn query_payload(channel: &Channel) -> Option<Vec<u8>> {
    channel
        .send([Packet::query(4, "QD")])
        .unwrap()
        .wait()
        .reply_from(4)
        .map(|reply| reply.payload.to_vec())
}

#[test]
fn test_stream_transport_replies_after_restart() {
    let (channel, _fail_next) = loopback_channel();
    channel.start().unwrap();
    assert_eq!(query_payload(&channel), Some(b"QD1".to_vec()));

    channel.stop().unwrap();
    channel.start().unwrap();
    assert_eq!(query_payload(&channel), Some(b"QD2".to_vec()));
    assert_eq!(channel.stats().transactions_partial, 0);
}

#[test]
fn test_stream_transport_replies_after_error_restart() {
    let (channel, fail_next) = loopback_channel();
    channel.start().unwrap();
    assert_eq!(query_payload(&channel), Some(b"QD1".to_vec()));

    fail_next.store(true, Ordering::SeqCst);
    let failed = channel.send([Packet::query(4, "QD")]).unwrap().wait();
    assert!(matches!(
        failed,
        Outcome::Failed(FailureReason::TransportFailed(_))
    ));
    assert_eq!(channel.state(), ChannelState::Error);

    channel.start().unwrap();
    assert_eq!(query_payload(&channel), Some(b"QD2".to_vec()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_wait() {
    let bus = SimulatedBus::with_servos(&[8]);
    let channel = started(config(20_000), &bus);

    let promises: Vec<_> = (0..5)
        .map(|_| channel.send([Packet::query(8, "QD")]).unwrap())
        .collect();

    for promise in promises {
        let outcome = promise.wait_async().await;
        assert!(outcome.is_success());
    }
}
