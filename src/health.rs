//! 서보 레지스트리와 health 추적
//!
//! - 고정 용량, 등록 순서 유지 (append-only)
//! - 서보별 연속 미응답 카운터
//! - 미응답 한계 도달 시 일정 시간 비활성화, 이후 probe

use std::time::{Duration, Instant};

use crate::config::{ChannelConfig, ProbeReset};
use crate::packet::ServoId;
use crate::{Error, Result, MAX_SERVO_ID};

/// 디스패치 직전 서보 판정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 정상 전송
    Send,

    /// 비활성 구간이 끝나 다시 시도하는 전송
    Probe,

    /// 비활성 상태, 전송하지 않고 누락 처리
    Skip,
}

/// 서보 health 기록
#[derive(Debug, Clone)]
pub struct ServoHealth {
    id: ServoId,
    disabled_until: Option<Instant>,
    consecutive_misses: u32,

    /// 비활성 구간이 끝났고 아직 probe를 보내지 않음
    probe_pending: bool,
}

impl ServoHealth {
    pub fn new(id: ServoId) -> Self {
        Self {
            id,
            disabled_until: None,
            consecutive_misses: 0,
            probe_pending: false,
        }
    }

    pub fn id(&self) -> ServoId {
        self.id
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn is_disabled(&self, now: Instant) -> bool {
        matches!(self.disabled_until, Some(until) if now < until)
    }

    /// 전송 전 판정
    ///
    /// `OnAttempt` 정책의 카운터 초기화는 probe를 실제로 보낼 때만 일어난다.
    pub fn admit(&mut self, now: Instant, policy: ProbeReset) -> Admission {
        if self.is_disabled(now) {
            return Admission::Skip;
        }
        self.release_if_expired(now);

        if !self.probe_pending {
            return Admission::Send;
        }
        self.probe_pending = false;
        if policy == ProbeReset::OnAttempt {
            self.consecutive_misses = 0;
        }
        Admission::Probe
    }

    /// 응답 수신
    pub fn record_reply(&mut self) {
        self.consecutive_misses = 0;
        self.disabled_until = None;
        self.probe_pending = false;
    }

    /// 미응답 기록, 이번에 비활성화되면 true
    pub fn record_miss(&mut self, now: Instant, limit: u32, interval: Duration) -> bool {
        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        if self.consecutive_misses >= limit && !self.is_disabled(now) {
            self.disabled_until = Some(now + interval);
            return true;
        }
        false
    }

    /// 비활성 구간이 끝났으면 해제하고 다음 전송을 probe로 표시, 해제했으면 true
    ///
    /// 미응답 카운터는 건드리지 않는다.
    pub fn release_if_expired(&mut self, now: Instant) -> bool {
        match self.disabled_until {
            Some(until) if now >= until => {
                self.disabled_until = None;
                self.probe_pending = true;
                true
            }
            _ => false,
        }
    }

    /// 외부 조회용 스냅샷
    pub fn status(&self, now: Instant) -> ServoStatus {
        ServoStatus {
            id: self.id,
            consecutive_misses: self.consecutive_misses,
            disabled_for: self
                .disabled_until
                .filter(|&until| now < until)
                .map(|until| until - now),
        }
    }
}

/// 서보 상태 스냅샷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoStatus {
    pub id: ServoId,
    pub consecutive_misses: u32,

    /// 비활성 상태면 남은 시간
    pub disabled_for: Option<Duration>,
}

impl ServoStatus {
    pub fn is_disabled(&self) -> bool {
        self.disabled_for.is_some()
    }
}

/// 고정 용량 서보 레지스트리
#[derive(Debug)]
pub struct ServoRegistry {
    capacity: usize,
    servos: Vec<ServoHealth>,
}

impl ServoRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            servos: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.servos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servos.is_empty()
    }

    /// 서보 등록, 인덱스 반환
    pub fn add(&mut self, id: ServoId) -> Result<usize> {
        self.check_new(id)?;
        if self.servos.len() >= self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.servos.push(ServoHealth::new(id));
        Ok(self.servos.len() - 1)
    }

    /// 일괄 등록 (실패 시 아무것도 등록하지 않음)
    pub fn create(&mut self, ids: &[ServoId]) -> Result<()> {
        for (i, &id) in ids.iter().enumerate() {
            self.check_new(id)?;
            if ids[..i].contains(&id) {
                return Err(Error::DuplicateServo { id });
            }
        }
        if self.servos.len() + ids.len() > self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        self.servos.extend(ids.iter().map(|&id| ServoHealth::new(id)));
        Ok(())
    }

    fn check_new(&self, id: ServoId) -> Result<()> {
        if id > MAX_SERVO_ID {
            return Err(Error::InvalidServoId { id: id as u16 });
        }
        if self.contains(id) {
            return Err(Error::DuplicateServo { id });
        }
        Ok(())
    }

    pub fn contains(&self, id: ServoId) -> bool {
        self.servos.iter().any(|s| s.id == id)
    }

    /// ID로 조회
    pub fn get(&self, id: ServoId) -> Result<&ServoHealth> {
        self.servos
            .iter()
            .find(|s| s.id == id)
            .ok_or(Error::ServoNotFound { id })
    }

    pub fn get_mut(&mut self, id: ServoId) -> Result<&mut ServoHealth> {
        self.servos
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(Error::ServoNotFound { id })
    }

    /// 등록 순서대로 ID
    pub fn ids(&self) -> Vec<ServoId> {
        self.servos.iter().map(|s| s.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServoHealth> {
        self.servos.iter()
    }

    /// 트랜잭션 결과 반영, 새로 비활성화된 서보 반환
    pub fn apply_outcome(
        &mut self,
        replied: &[ServoId],
        missed: &[ServoId],
        now: Instant,
        config: &ChannelConfig,
    ) -> Vec<ServoId> {
        for &id in replied {
            if let Ok(servo) = self.get_mut(id) {
                servo.record_reply();
            }
        }

        let mut disabled = Vec::new();
        let mut seen = Vec::with_capacity(missed.len());
        for &id in missed {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);

            if let Ok(servo) = self.get_mut(id) {
                if servo.is_disabled(now) {
                    continue;
                }
                if servo.record_miss(
                    now,
                    config.unresponsive_request_limit,
                    config.disable_interval(),
                ) {
                    disabled.push(id);
                }
            }
        }
        disabled
    }

    /// 비활성 구간이 끝난 서보 해제
    pub fn release_expired(&mut self, now: Instant) -> Vec<ServoId> {
        self.servos
            .iter_mut()
            .filter_map(|s| s.release_if_expired(now).then_some(s.id))
            .collect()
    }
}
