//! 패킷과 응답 정의
//!
//! - Packet: 하나의 서보(또는 broadcast)로 가는 명령 단위
//! - Reply: 서보가 돌려준 응답 (transport 쪽에서 디코딩됨)
//!
//! LSS ASCII 형식: 명령 `#<id><payload>\r`, 응답 `*<id><payload>\r`

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{BROADCAST_ID, MAX_SERVO_ID};

/// 서보 ID
pub type ServoId = u8;

/// 명령 시작 문자
pub const COMMAND_START: u8 = b'#';

/// 응답 시작 문자
pub const REPLY_START: u8 = b'*';

/// 프레임 종료 문자
pub const FRAME_END: u8 = b'\r';

/// 패킷 주소
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Servo(ServoId),
    Broadcast,
}

impl Target {
    /// 와이어에 쓰이는 ID
    pub fn wire_id(&self) -> ServoId {
        match self {
            Target::Servo(id) => *id,
            Target::Broadcast => BROADCAST_ID,
        }
    }
}

/// 송신 패킷 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    target: Target,
    payload: Bytes,
    expects_reply: bool,
}

impl Packet {
    /// 새 패킷 생성
    ///
    /// broadcast 패킷은 응답을 기대하지 않는다.
    pub fn new(target: Target, payload: impl Into<Bytes>, expects_reply: bool) -> Self {
        Self {
            target,
            payload: payload.into(),
            expects_reply: expects_reply && target != Target::Broadcast,
        }
    }

    /// 응답이 없는 명령 (예: `D1800`)
    pub fn command(id: ServoId, payload: impl Into<Bytes>) -> Self {
        Self::new(Target::Servo(id), payload, false)
    }

    /// 응답을 기다리는 질의 (예: `QD`)
    pub fn query(id: ServoId, payload: impl Into<Bytes>) -> Self {
        Self::new(Target::Servo(id), payload, true)
    }

    /// 모든 서보에 대한 명령
    pub fn broadcast(payload: impl Into<Bytes>) -> Self {
        Self::new(Target::Broadcast, payload, false)
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == Target::Broadcast
    }

    /// 이 패킷이 해당 서보에 전달되는지 (broadcast 포함)
    pub fn addressed_to(&self, id: ServoId) -> bool {
        match self.target {
            Target::Servo(target) => target == id,
            Target::Broadcast => true,
        }
    }

    /// 응답을 보내야 할 서보 ID
    pub fn reply_from(&self) -> Option<ServoId> {
        match self.target {
            Target::Servo(id) if self.expects_reply => Some(id),
            _ => None,
        }
    }

    /// 와이어 바이트로 직렬화
    pub fn encode(&self) -> Bytes {
        let id = self.target.wire_id().to_string();
        let mut buf = BytesMut::with_capacity(2 + id.len() + self.payload.len());
        buf.put_u8(COMMAND_START);
        buf.put_slice(id.as_bytes());
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
        buf.freeze()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}{}",
            self.target.wire_id(),
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// 서보 응답
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: ServoId,
    pub payload: Bytes,
}

impl Reply {
    pub fn new(id: ServoId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// 프레임 본문 파싱 (`*`와 `\r` 사이, 예: `5QD1800`)
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let digits = frame.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || digits > 3 {
            return None;
        }

        let id: u16 = std::str::from_utf8(&frame[..digits]).ok()?.parse().ok()?;
        if id > MAX_SERVO_ID as u16 {
            return None;
        }

        Some(Self {
            id: id as ServoId,
            payload: Bytes::copy_from_slice(&frame[digits..]),
        })
    }

    /// 와이어 바이트로 직렬화 (시뮬레이터용)
    pub fn encode(&self) -> Bytes {
        let id = self.id.to_string();
        let mut buf = BytesMut::with_capacity(2 + id.len() + self.payload.len());
        buf.put_u8(REPLY_START);
        buf.put_slice(id.as_bytes());
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
        buf.freeze()
    }
}
