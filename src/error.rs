//! 에러 타입 정의

use thiserror::Error;

use crate::channel::ChannelState;
use crate::packet::ServoId;

/// LSS 채널 에러 타입
///
/// 동기적으로 호출자에게 돌려주는 에러만 담는다.
/// 트랜잭션 진행 중 발생한 실패(부분 응답, 전송 실패)는 `Outcome`으로 전달된다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 인자: {0}")]
    InvalidArgument(String),

    #[error("유효하지 않은 서보 ID: {id}")]
    InvalidServoId { id: u16 },

    #[error("서보 레지스트리 용량 초과: 최대 {capacity}")]
    CapacityExceeded { capacity: usize },

    #[error("이미 등록된 서보: id={id}")]
    DuplicateServo { id: ServoId },

    #[error("서보 없음: id={id}")]
    ServoNotFound { id: ServoId },

    #[error("이미 완료된 promise: seq={seq}")]
    AlreadyResolved { seq: u64 },

    #[error("현재 상태에서 불가능한 동작: {state:?}")]
    InvalidState { state: ChannelState },

    #[error("채널이 실행 중이 아님")]
    NotRunning,

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
