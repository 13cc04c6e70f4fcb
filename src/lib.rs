//! # LSS (Lynxmotion Smart Servo) 채널
//!
//! half-duplex 버스 위의 서보 그룹과 요청/응답을 주고받는 통신 코어
//!
//! ## 핵심 특징
//! - **트랜잭션**: 함께 보낼 패킷 묶음을 하나의 단위로 추적
//! - **Promise**: `send`는 즉시 반환, 결과는 응답/타임아웃 후 한 번만 resolve
//! - **FIFO 드라이버**: 전용 스레드가 큐 순서대로 전송과 응답 라우팅 담당
//! - **서보 health**: 연속 미응답 서보를 일정 시간 전송에서 제외 후 다시 probe
//! - **Transport 추상화**: 시리얼 스트림, 시뮬레이션 버스 등 매체 교체 가능

pub mod channel;
pub mod config;
pub mod error;
pub mod health;
pub mod packet;
pub mod promise;
pub mod sim;
pub mod stats;
pub mod transaction;
pub mod transport;

pub use channel::{Channel, ChannelState, ScanReport, ServoHandle};
pub use config::{ChannelConfig, ProbeReset};
pub use error::{Error, Result};
pub use health::{ServoRegistry, ServoStatus};
pub use packet::{Packet, Reply, ServoId, Target};
pub use promise::{FailureReason, Outcome, Promise};
pub use sim::{Behavior, SimulatedBus};
pub use stats::ChannelStats;
pub use transaction::{Transaction, TransactionState};
pub use transport::{ReplyDecoder, ReplySink, StreamTransport, Transport};

/// 주소 지정 가능한 최대 서보 ID
pub const MAX_SERVO_ID: ServoId = 250;

/// broadcast ID
pub const BROADCAST_ID: ServoId = 254;

/// scan에서 서보 존재 확인에 쓰는 기본 질의 (Query ID)
pub const SCAN_COMMAND: &[u8] = b"QID";
