//! 채널 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, MAX_SERVO_ID};

/// 비활성화된 서보를 다시 시도(probe)할 때 미응답 카운터를 언제 초기화할지
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProbeReset {
    /// 비활성 구간이 끝난 뒤 첫 전송 시점에 초기화 (결과와 무관)
    #[default]
    OnAttempt,

    /// 비활성 구간 이후 첫 성공 응답에서만 초기화
    /// probe가 실패하면 곧바로 다시 비활성화된다
    OnReply,
}

/// LSS 채널 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 채널 이름 (진단용)
    pub name: String,

    /// 등록 가능한 최대 서보 수
    pub capacity: usize,

    /// 서보 응답 대기 시간 (마이크로초)
    pub timeout_usec: u64,

    /// 연속으로 이 횟수만큼 응답이 없으면 서보를 비활성화
    pub unresponsive_request_limit: u32,

    /// 비활성화된 서보가 제외되는 시간 (밀리초)
    pub unresponsive_disable_interval: u64,

    /// 유휴 상태에서 health 점검 주기 (밀리초)
    pub health_check_interval_ms: u64,

    /// probe 시 카운터 초기화 정책
    pub probe_reset: ProbeReset,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "lss".to_string(),
            capacity: 16,
            timeout_usec: 5_000,                  // 5ms
            unresponsive_request_limit: 3,
            unresponsive_disable_interval: 10_000, // 10초
            health_check_interval_ms: 250,
            probe_reset: ProbeReset::OnAttempt,
        }
    }
}

impl ChannelConfig {
    /// 이름과 용량을 지정해 생성
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            ..Self::default()
        }
    }

    /// 느린 버스용 설정 (낮은 baudrate, 긴 케이블)
    pub fn slow_bus() -> Self {
        Self {
            timeout_usec: 50_000,                 // 50ms
            unresponsive_request_limit: 5,
            unresponsive_disable_interval: 3_000,
            health_check_interval_ms: 500,
            ..Self::default()
        }
    }

    /// 응답 없는 서보를 빠르게 배제하는 설정
    pub fn strict() -> Self {
        Self {
            timeout_usec: 2_000,
            unresponsive_request_limit: 1,
            unresponsive_disable_interval: 30_000,
            health_check_interval_ms: 100,
            ..Self::default()
        }
    }

    pub fn with_timeout_usec(mut self, timeout_usec: u64) -> Self {
        self.timeout_usec = timeout_usec;
        self
    }

    pub fn with_unresponsive(mut self, limit: u32, disable_interval_ms: u64) -> Self {
        self.unresponsive_request_limit = limit;
        self.unresponsive_disable_interval = disable_interval_ms;
        self
    }

    pub fn with_probe_reset(mut self, probe_reset: ProbeReset) -> Self {
        self.probe_reset = probe_reset;
        self
    }

    /// 응답 대기 시간
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_usec)
    }

    /// 비활성화 구간
    pub fn disable_interval(&self) -> Duration {
        Duration::from_millis(self.unresponsive_disable_interval)
    }

    /// 유휴 점검 주기
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity는 1 이상이어야 함".into()));
        }
        if self.capacity > MAX_SERVO_ID as usize + 1 {
            return Err(Error::InvalidConfig(format!(
                "capacity {}는 주소 가능한 서보 수({})를 넘음",
                self.capacity,
                MAX_SERVO_ID as usize + 1
            )));
        }
        if self.timeout_usec == 0 {
            return Err(Error::InvalidConfig("timeout_usec는 0일 수 없음".into()));
        }
        if self.unresponsive_request_limit == 0 {
            return Err(Error::InvalidConfig(
                "unresponsive_request_limit는 1 이상이어야 함".into(),
            ));
        }
        Ok(())
    }
}
