//! 트랜잭션 결과를 전달하는 단일 할당 promise
//!
//! - 드라이버 스레드가 한 번만 resolve
//! - 호출자는 blocking(`wait`) 또는 async(`wait_async`)로 대기

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::packet::{Reply, ServoId};
use crate::{Error, Result};

/// 채널 차원의 실패 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// transport가 바이트를 쓰지 못함
    TransportFailed(String),

    /// 채널이 정지되며 버려짐
    Stopped,

    /// 대기 중 취소됨
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TransportFailed(reason) => write!(f, "transport 실패: {}", reason),
            FailureReason::Stopped => write!(f, "채널 정지"),
            FailureReason::Cancelled => write!(f, "취소됨"),
        }
    }
}

/// 트랜잭션 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 기대한 응답이 모두 도착
    Success { replies: Vec<Reply> },

    /// 타임아웃 시점에 일부 응답 누락
    /// 비활성화되어 건너뛴 서보도 `missing`에 포함된다
    Partial {
        replies: Vec<Reply>,
        missing: Vec<ServoId>,
    },

    /// 채널 실패
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// 수신된 응답
    pub fn replies(&self) -> &[Reply] {
        match self {
            Outcome::Success { replies } | Outcome::Partial { replies, .. } => replies,
            Outcome::Failed(_) => &[],
        }
    }

    /// 응답하지 않은 서보 ID
    pub fn missing(&self) -> &[ServoId] {
        match self {
            Outcome::Partial { missing, .. } => missing,
            _ => &[],
        }
    }

    /// 해당 서보의 첫 응답
    pub fn reply_from(&self, id: ServoId) -> Option<&Reply> {
        self.replies().iter().find(|r| r.id == id)
    }
}

struct Shared {
    seq: u64,
    slot: Mutex<Option<Outcome>>,
    cond: Condvar,
    notify: Notify,
}

/// 트랜잭션 결과 promise
///
/// 복제본은 같은 결과를 공유한다.
#[derive(Clone)]
pub struct Promise {
    shared: Arc<Shared>,
}

impl Promise {
    /// 미해결 promise 생성
    pub fn new(seq: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                seq,
                slot: Mutex::new(None),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// 이미 결과가 정해진 promise
    pub fn resolved(seq: u64, outcome: Outcome) -> Self {
        let promise = Self::new(seq);
        *promise.shared.slot.lock() = Some(outcome);
        promise
    }

    /// 이 promise를 만든 트랜잭션 번호
    pub fn seq(&self) -> u64 {
        self.shared.seq
    }

    /// 결과 저장 후 모든 대기자 깨움
    ///
    /// 두 번째 호출은 `Error::AlreadyResolved`.
    pub fn resolve(&self, outcome: Outcome) -> Result<()> {
        {
            let mut slot = self.shared.slot.lock();
            if slot.is_some() {
                return Err(Error::AlreadyResolved {
                    seq: self.shared.seq,
                });
            }
            *slot = Some(outcome);
        }

        self.shared.cond.notify_all();
        self.shared.notify.notify_waiters();
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.slot.lock().is_some()
    }

    /// 대기 없이 결과 조회
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.shared.slot.lock().clone()
    }

    /// 결과가 나올 때까지 blocking
    pub fn wait(&self) -> Outcome {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.shared.cond.wait(&mut slot);
        }
    }

    /// 제한 시간 동안 blocking, 시간 초과 시 `None`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.clone();
            }
        }
    }

    /// async 대기
    pub async fn wait_async(&self) -> Outcome {
        loop {
            // resolve가 확인과 대기 사이에 끼어들어도 놓치지 않도록 먼저 등록
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("seq", &self.shared.seq)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolve_once() {
        let promise = Promise::new(7);
        assert!(!promise.is_resolved());

        promise
            .resolve(Outcome::Success { replies: vec![] })
            .unwrap();
        assert!(promise.is_resolved());

        let second = promise.resolve(Outcome::Failed(FailureReason::Cancelled));
        assert!(matches!(second, Err(Error::AlreadyResolved { seq: 7 })));

        // 첫 결과가 유지되어야 함
        assert!(promise.wait().is_success());
    }

    #[test]
    fn test_wait_across_threads() {
        let promise = Promise::new(1);
        let producer = promise.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer
                .resolve(Outcome::Partial {
                    replies: vec![],
                    missing: vec![4],
                })
                .unwrap();
        });

        let outcome = promise.wait();
        assert_eq!(outcome.missing(), &[4]);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let promise = Promise::new(2);
        assert!(promise.wait_timeout(Duration::from_millis(10)).is_none());

        promise
            .resolve(Outcome::Failed(FailureReason::Stopped))
            .unwrap();
        assert_eq!(
            promise.wait_timeout(Duration::from_millis(10)),
            Some(Outcome::Failed(FailureReason::Stopped))
        );
    }

    #[tokio::test]
    async fn test_wait_async() {
        let promise = Promise::new(3);
        let producer = promise.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer
                .resolve(Outcome::Success {
                    replies: vec![Reply::new(1, "QD0")],
                })
                .unwrap();
        });

        let outcome = promise.wait_async().await;
        assert_eq!(outcome.reply_from(1).map(|r| r.payload.as_ref()), Some(&b"QD0"[..]));
    }

    #[test]
    fn test_resolved_constructor() {
        let promise = Promise::resolved(9, Outcome::Failed(FailureReason::Cancelled));
        assert!(promise.is_resolved());
        assert_eq!(promise.seq(), 9);
    }
}
