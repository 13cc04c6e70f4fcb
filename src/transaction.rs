//! 트랜잭션: 함께 전송되고 하나의 단위로 응답을 기다리는 패킷 묶음

use crate::packet::{Packet, Reply, ServoId};
use crate::promise::{FailureReason, Outcome, Promise};

/// 트랜잭션 상태 (앞으로만 진행)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransactionState {
    Pending,
    Transmitting,
    AwaitingReplies,
    Complete,
}

/// 응답 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    Accepted,
    Stray,
}

/// 트랜잭션
#[derive(Debug)]
pub struct Transaction {
    seq: u64,
    packets: Vec<Packet>,
    state: TransactionState,

    /// 아직 응답이 오지 않은 서보 (같은 ID가 여러 번 있을 수 있음)
    outstanding: Vec<ServoId>,

    replies: Vec<Reply>,

    /// 전송 없이 누락 처리된 서보 (비활성화)
    skipped: Vec<ServoId>,

    promise: Promise,
}

impl Transaction {
    pub fn new(seq: u64, packets: Vec<Packet>) -> Self {
        let outstanding = packets.iter().filter_map(Packet::reply_from).collect();
        Self {
            seq,
            packets,
            state: TransactionState::Pending,
            outstanding,
            replies: Vec::new(),
            skipped: Vec::new(),
            promise: Promise::new(seq),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn promise(&self) -> Promise {
        self.promise.clone()
    }

    /// 기대 응답 수
    pub fn expected_replies(&self) -> usize {
        self.packets.iter().filter(|p| p.expects_reply()).count()
    }

    pub fn received_replies(&self) -> usize {
        self.replies.len()
    }

    /// 남은 응답 대기 서보
    pub fn outstanding(&self) -> &[ServoId] {
        &self.outstanding
    }

    /// 모든 기대 응답이 처리됨
    pub fn is_satisfied(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// 상태 전이, 뒤로 가는 전이는 무시하고 false
    pub fn advance(&mut self, next: TransactionState) -> bool {
        if next <= self.state {
            return false;
        }
        self.state = next;
        true
    }

    /// 비활성 서보로 가는 패킷을 전송 없이 누락 처리
    pub fn skip(&mut self, packet_index: usize) {
        if let Some(id) = self.packets.get(packet_index).and_then(Packet::reply_from) {
            if let Some(pos) = self.outstanding.iter().position(|&o| o == id) {
                self.outstanding.remove(pos);
                self.skipped.push(id);
            }
        }
    }

    /// 현재 트랜잭션에 응답 추가
    pub fn accept(&mut self, reply: Reply) -> ReplyDisposition {
        match self.outstanding.iter().position(|&id| id == reply.id) {
            Some(pos) => {
                self.outstanding.remove(pos);
                self.replies.push(reply);
                ReplyDisposition::Accepted
            }
            None => ReplyDisposition::Stray,
        }
    }

    /// 트랜잭션 종료, 응답한 서보와 결과를 돌려준다
    ///
    /// promise는 호출자가 `resolve`한다.
    pub fn finish(mut self) -> (Promise, Outcome) {
        self.state = TransactionState::Complete;

        let mut missing = self.skipped;
        missing.append(&mut self.outstanding);

        let outcome = if missing.is_empty() {
            Outcome::Success {
                replies: self.replies,
            }
        } else {
            Outcome::Partial {
                replies: self.replies,
                missing,
            }
        };

        (self.promise, outcome)
    }

    /// 채널 실패로 종료
    pub fn fail(mut self, reason: FailureReason) -> (Promise, Outcome) {
        self.state = TransactionState::Complete;
        (self.promise, Outcome::Failed(reason))
    }
}
