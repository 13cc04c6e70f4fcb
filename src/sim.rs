//! 시뮬레이션 버스
//!
//! 프로세스 안의 가상 서보로 응답을 흉내 낸다. 테스트와 `lss-sim` 데모에서 사용.
//! LSS처럼 `Q`로 시작하는 질의에만 응답하고 broadcast에는 응답하지 않는다.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use crate::packet::{Reply, ServoId, COMMAND_START, FRAME_END};
use crate::transport::{ReplySink, Transport};
use crate::BROADCAST_ID;

/// 가상 서보 동작
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    /// 즉시 응답
    Responsive,

    /// 응답하지 않음
    Silent,

    /// 주어진 확률로 응답 누락
    Flaky { drop_rate: f64 },

    /// 지연 후 응답
    Delayed(Duration),
}

#[derive(Debug, Clone)]
struct VirtualServo {
    behavior: Behavior,
    value: Bytes,
}

#[derive(Default)]
struct BusState {
    servos: HashMap<ServoId, VirtualServo>,
    sink: Option<ReplySink>,
    transmitted: Vec<Bytes>,
    fail_next: bool,
    started: u32,
}

/// 시뮬레이션 버스 핸들 (복제본은 같은 버스를 가리킴)
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 즉시 응답하는 서보들로 버스 생성
    pub fn with_servos(ids: &[ServoId]) -> Self {
        let bus = Self::new();
        for &id in ids {
            bus.attach(id, Behavior::Responsive);
        }
        bus
    }

    /// 가상 서보 연결 (이미 있으면 동작 교체)
    pub fn attach(&self, id: ServoId, behavior: Behavior) {
        let mut state = self.state.lock();
        state
            .servos
            .entry(id)
            .and_modify(|s| s.behavior = behavior)
            .or_insert(VirtualServo {
                behavior,
                value: Bytes::from_static(b"0"),
            });
    }

    /// 동작 변경
    pub fn set_behavior(&self, id: ServoId, behavior: Behavior) {
        self.attach(id, behavior);
    }

    /// 질의에 붙여 돌려줄 값
    pub fn set_value(&self, id: ServoId, value: impl Into<Bytes>) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.value = value.into();
        }
    }

    /// 가상 서보 제거
    pub fn detach(&self, id: ServoId) {
        self.state.lock().servos.remove(&id);
    }

    /// 다음 전송을 실패시킴
    pub fn fail_next_transmit(&self) {
        self.state.lock().fail_next = true;
    }

    /// 지금까지 전송된 프레임
    pub fn transmitted(&self) -> Vec<Bytes> {
        self.state.lock().transmitted.clone()
    }

    /// 특정 서보로 전송된 프레임 수
    pub fn frames_to(&self, id: ServoId) -> usize {
        self.state
            .lock()
            .transmitted
            .iter()
            .filter(|frame| parse_command(frame).map(|(target, _)| target) == Some(id))
            .count()
    }

    /// `on_start` 호출 횟수
    pub fn start_count(&self) -> u32 {
        self.state.lock().started
    }

    /// 버스 밖에서 임의 응답 주입 (stray 테스트용)
    pub fn inject(&self, reply: Reply) -> bool {
        let sink = self.state.lock().sink.clone();
        sink.map(|s| s.deliver(reply)).unwrap_or(false)
    }
}

impl Transport for SimulatedBus {
    fn transmit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let (servo, sink) = {
            let mut state = self.state.lock();
            if state.fail_next {
                state.fail_next = false;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated bus failure"));
            }
            state.transmitted.push(Bytes::copy_from_slice(bytes));

            let Some((id, payload)) = parse_command(bytes) else {
                return Ok(());
            };
            if id == BROADCAST_ID || !payload.starts_with(b"Q") {
                return Ok(());
            }

            let servo = state.servos.get(&id).cloned().map(|servo| {
                let mut reply = payload.to_vec();
                reply.extend_from_slice(&servo.value);
                (id, servo.behavior, reply)
            });
            (servo, state.sink.clone())
        };

        let (Some((id, behavior, payload)), Some(sink)) = (servo, sink) else {
            return Ok(());
        };
        let frame = Reply::new(id, payload).encode();

        match behavior {
            Behavior::Responsive => {
                sink.deliver_bytes(&frame);
            }
            Behavior::Silent => trace!("servo {} silent", id),
            Behavior::Flaky { drop_rate } => {
                if !rand::thread_rng().gen_bool(drop_probability(drop_rate)) {
                    sink.deliver_bytes(&frame);
                }
            }
            Behavior::Delayed(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    sink.deliver_bytes(&frame);
                });
            }
        }

        Ok(())
    }

    fn on_start(&mut self, replies: ReplySink) -> io::Result<()> {
        let mut state = self.state.lock();
        state.sink = Some(replies);
        state.started += 1;
        Ok(())
    }

    fn on_stop(&mut self) {
        self.state.lock().sink = None;
    }
}

/// `gen_bool`에 넘길 수 있는 확률 (NaN/무한대는 0)
fn drop_probability(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// `#<id><payload>\r` 명령 프레임 파싱
fn parse_command(frame: &[u8]) -> Option<(ServoId, &[u8])> {
    let body = frame.strip_prefix(&[COMMAND_START])?;
    let body = body.strip_suffix(&[FRAME_END]).unwrap_or(body);

    let digits = body.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || digits > 3 {
        return None;
    }
    let id: u16 = std::str::from_utf8(&body[..digits]).ok()?.parse().ok()?;
    let id = ServoId::try_from(id).ok()?;
    Some((id, &body[digits..]))
}
