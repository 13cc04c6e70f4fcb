//! 채널 통계

use std::time::{Duration, Instant};

/// 채널 전체 통계
#[derive(Debug, Clone)]
pub struct ChannelStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 큐에 들어간 트랜잭션 수
    pub transactions_queued: u64,

    /// 모든 응답을 받고 끝난 트랜잭션 수
    pub transactions_succeeded: u64,

    /// 일부 응답이 누락된 트랜잭션 수
    pub transactions_partial: u64,

    /// 채널 실패/정지/취소로 끝난 트랜잭션 수
    pub transactions_failed: u64,

    /// 전송한 패킷 수
    pub packets_transmitted: u64,

    /// 전송한 바이트 수
    pub bytes_transmitted: u64,

    /// 비활성 서보라서 건너뛴 패킷 수
    pub packets_skipped: u64,

    /// 수신해 트랜잭션에 반영된 응답 수
    pub replies_received: u64,

    /// 버려진 stray 응답 수
    pub stray_replies: u64,

    /// 서보 비활성화 횟수
    pub servos_disabled: u64,

    /// 마지막 트랜잭션 완료 시간
    pub last_completion: Option<Instant>,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            transactions_queued: 0,
            transactions_succeeded: 0,
            transactions_partial: 0,
            transactions_failed: 0,
            packets_transmitted: 0,
            bytes_transmitted: 0,
            packets_skipped: 0,
            replies_received: 0,
            stray_replies: 0,
            servos_disabled: 0,
            last_completion: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 완료된 트랜잭션 수
    pub fn transactions_completed(&self) -> u64 {
        self.transactions_succeeded + self.transactions_partial + self.transactions_failed
    }

    /// 초당 완료 트랜잭션
    pub fn transaction_rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.transactions_completed() as f64 / elapsed
    }

    /// 응답 누락률 (부분 실패 트랜잭션 비율)
    pub fn partial_rate(&self) -> f64 {
        let total = self.transactions_succeeded + self.transactions_partial;
        if total == 0 {
            return 0.0;
        }
        self.transactions_partial as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Txn: {} ok / {} partial / {} failed | Packets: {} sent, {} skipped | Replies: {} (+{} stray) | Disabled: {}",
            self.elapsed().as_secs_f64(),
            self.transactions_succeeded,
            self.transactions_partial,
            self.transactions_failed,
            self.packets_transmitted,
            self.packets_skipped,
            self.replies_received,
            self.stray_replies,
            self.servos_disabled,
        )
    }
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self::new()
    }
}
