//! LSS 채널
//!
//! - 호출자는 `send`로 트랜잭션을 큐에 넣고 즉시 `Promise`를 받는다
//! - 전용 드라이버 스레드 하나가 transport와 현재 트랜잭션을 독점한다
//! - 큐 락은 enqueue/dequeue 동안만 잡고, 전송이나 응답 대기 중에는 잡지 않는다
//! - 응답 없는 서보는 health 정책에 따라 일시적으로 전송 대상에서 빠진다

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver as CrossbeamReceiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::health::{Admission, ServoRegistry, ServoStatus};
use crate::packet::{Packet, Reply, ServoId, Target};
use crate::promise::{FailureReason, Outcome, Promise};
use crate::stats::ChannelStats;
use crate::transaction::{ReplyDisposition, Transaction, TransactionState};
use crate::transport::{ReplySink, Transport};
use crate::{Error, Result, MAX_SERVO_ID};

/// 채널 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Starting,
    Idle,
    Processing,
    Stopping,
    Error,
}

impl ChannelState {
    /// 드라이버가 트랜잭션을 처리할 수 있는 상태
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ChannelState::Starting | ChannelState::Idle | ChannelState::Processing
        )
    }
}

/// 큐 락으로 보호되는 상태
struct Queue {
    pending: VecDeque<Transaction>,
    next_seq: u64,
    state: ChannelState,
    stop_requested: bool,

    /// 마지막 transport 실패 사유
    failure: Option<String>,
}

/// 호출자와 드라이버가 공유하는 상태
struct Shared {
    config: ChannelConfig,
    scan_command: Bytes,
    queue: Mutex<Queue>,
    wake: Condvar,
    registry: RwLock<ServoRegistry>,
    stats: Mutex<ChannelStats>,
}

impl Shared {
    fn resolve(&self, promise: Promise, outcome: Outcome) {
        if let Err(e) = promise.resolve(outcome) {
            error!("채널 '{}': {}", self.config.name, e);
        }
    }

    /// 현재가 아닌 트랜잭션을 실패로 종료
    fn fail_all(&self, transactions: Vec<Transaction>, reason: FailureReason) {
        if transactions.is_empty() {
            return;
        }
        self.stats.lock().transactions_failed += transactions.len() as u64;
        for txn in transactions {
            let (promise, outcome) = txn.fail(reason.clone());
            self.resolve(promise, outcome);
        }
    }
}

/// scan 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub begin: ServoId,
    pub end: ServoId,

    /// 응답한 서보 (ID 오름차순)
    pub found: Vec<ServoId>,

    /// 채널 실패로 scan이 중단된 경우 사유
    pub aborted: Option<FailureReason>,
}

impl ScanReport {
    /// 찾은 서보 수
    pub fn count(&self) -> usize {
        self.found.len()
    }
}

/// LSS 채널
pub struct Channel {
    shared: Arc<Shared>,

    /// 정지 상태에서만 채워진다 (실행 중에는 드라이버가 소유)
    transport: Mutex<Option<Box<dyn Transport>>>,

    driver: Mutex<Option<JoinHandle<Box<dyn Transport>>>>,
}

impl Channel {
    /// 새 채널 생성 (정지 상태)
    pub fn new(config: ChannelConfig, transport: impl Transport) -> Result<Self> {
        config.validate()?;

        let shared = Shared {
            scan_command: transport.scan_command(),
            registry: RwLock::new(ServoRegistry::new(config.capacity)),
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                next_seq: 1,
                state: ChannelState::Stopped,
                stop_requested: false,
                failure: None,
            }),
            wake: Condvar::new(),
            stats: Mutex::new(ChannelStats::new()),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            transport: Mutex::new(Some(Box::new(transport))),
            driver: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ChannelState {
        self.shared.queue.lock().state
    }

    /// 대기 중인 트랜잭션 수 (현재 트랜잭션 제외)
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> ChannelStats {
        self.shared.stats.lock().clone()
    }

    /// 드라이버 시작
    ///
    /// `Stopped` 또는 `Error` 상태에서만 가능하다.
    pub fn start(&self) -> Result<()> {
        let mut driver = self.driver.lock();

        let state = self.state();
        if !matches!(state, ChannelState::Stopped | ChannelState::Error) {
            return Err(Error::InvalidState { state });
        }

        // 에러로 끝난 드라이버에서 transport 회수
        if let Some(handle) = driver.take() {
            self.reclaim(handle);
        }

        let mut transport = self
            .transport
            .lock()
            .take()
            .ok_or(Error::InvalidState { state })?;

        self.shared.queue.lock().state = ChannelState::Starting;

        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        if let Err(e) = transport.on_start(ReplySink::new(reply_tx)) {
            warn!("채널 '{}' transport 시작 실패: {}", self.name(), e);
            *self.transport.lock() = Some(transport);
            let mut queue = self.shared.queue.lock();
            queue.state = ChannelState::Error;
            queue.failure = Some(e.to_string());
            return Err(e.into());
        }

        {
            let mut queue = self.shared.queue.lock();
            queue.state = ChannelState::Idle;
            queue.stop_requested = false;
            queue.failure = None;
        }

        let worker = Driver {
            shared: self.shared.clone(),
            transport,
            replies: reply_rx,
        };

        let handle = thread::Builder::new()
            .name(format!("lss-{}", self.name()))
            .spawn(move || worker.run());

        match handle {
            Ok(handle) => {
                *driver = Some(handle);
                info!("LSS channel '{}' started", self.name());
                Ok(())
            }
            Err(e) => {
                let mut queue = self.shared.queue.lock();
                queue.state = ChannelState::Error;
                queue.failure = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// 드라이버 정지
    ///
    /// 현재 트랜잭션은 끝까지 처리하고, 대기 중인 트랜잭션은 `Stopped`로 실패시킨다.
    pub fn stop(&self) -> Result<()> {
        let mut driver = self.driver.lock();

        {
            let mut queue = self.shared.queue.lock();
            match queue.state {
                ChannelState::Stopped => return Ok(()),
                ChannelState::Error => {}
                _ => {
                    queue.state = ChannelState::Stopping;
                    queue.stop_requested = true;
                }
            }
        }
        self.shared.wake.notify_all();

        if let Some(handle) = driver.take() {
            self.reclaim(handle);
        }

        let discarded: Vec<Transaction> = {
            let mut queue = self.shared.queue.lock();
            queue.state = ChannelState::Stopped;
            queue.stop_requested = false;
            queue.pending.drain(..).collect()
        };

        if !discarded.is_empty() {
            debug!(
                "채널 '{}' 정지: 대기 트랜잭션 {}개 폐기",
                self.name(),
                discarded.len()
            );
        }
        self.shared.fail_all(discarded, FailureReason::Stopped);

        info!("LSS channel '{}' stopped", self.name());
        Ok(())
    }

    fn reclaim(&self, handle: JoinHandle<Box<dyn Transport>>) {
        match handle.join() {
            Ok(mut transport) => {
                transport.on_stop();
                *self.transport.lock() = Some(transport);
            }
            Err(_) => error!("채널 '{}' 드라이버 스레드 panic, transport 유실", self.name()),
        }
    }

    /// 트랜잭션 큐에 추가하고 promise 반환
    ///
    /// 빈 패킷 목록은 `Error::InvalidArgument`. `Error` 상태에서는 이미 실패한 promise를 돌려준다.
    pub fn send(&self, packets: impl IntoIterator<Item = Packet>) -> Result<Promise> {
        let packets: Vec<Packet> = packets.into_iter().collect();
        if packets.is_empty() {
            return Err(Error::InvalidArgument("빈 패킷 목록".into()));
        }

        let (promise, wake) = {
            let mut queue = self.shared.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;

            if queue.state == ChannelState::Error {
                let reason = queue.failure.clone().unwrap_or_default();
                drop(queue);
                self.shared.stats.lock().transactions_failed += 1;
                return Ok(Promise::resolved(
                    seq,
                    Outcome::Failed(FailureReason::TransportFailed(reason)),
                ));
            }

            let txn = Transaction::new(seq, packets);
            let promise = txn.promise();
            queue.pending.push_back(txn);
            (promise, queue.pending.len() == 1)
        };

        self.shared.stats.lock().transactions_queued += 1;
        if wake {
            self.shared.wake.notify_one();
        }

        trace!("txn {} queued", promise.seq());
        Ok(promise)
    }

    /// 대기 중인 트랜잭션 취소
    ///
    /// 이미 전송 중인 트랜잭션은 취소할 수 없다.
    pub fn cancel(&self, seq: u64) -> bool {
        let txn = {
            let mut queue = self.shared.queue.lock();
            let Some(pos) = queue.pending.iter().position(|t| t.seq() == seq) else {
                return false;
            };
            queue.pending.remove(pos)
        };

        self.shared.fail_all(txn.into_iter().collect(), FailureReason::Cancelled);
        true
    }

    /// ID 범위의 서보 탐색
    ///
    /// ID마다 질의 트랜잭션 하나씩 연속으로 넣어 half-duplex 버스에서 응답이 겹치지 않게 한다.
    pub fn scan(&self, begin: ServoId, end: ServoId) -> Result<ScanReport> {
        if begin > end || end > MAX_SERVO_ID {
            return Err(Error::InvalidArgument(format!(
                "잘못된 scan 범위: {}..={}",
                begin, end
            )));
        }
        if !self.state().is_running() {
            return Err(Error::NotRunning);
        }

        let promises = (begin..=end)
            .map(|id| self.send([Packet::query(id, self.shared.scan_command.clone())]))
            .collect::<Result<Vec<_>>>()?;

        let mut report = ScanReport {
            begin,
            end,
            found: Vec::new(),
            aborted: None,
        };

        for (id, promise) in (begin..=end).zip(promises) {
            match promise.wait() {
                Outcome::Success { .. } => report.found.push(id),
                Outcome::Partial { .. } => {}
                Outcome::Failed(reason) => {
                    if report.aborted.is_none() {
                        report.aborted = Some(reason);
                    }
                }
            }
        }

        info!(
            "채널 '{}' scan {}..={}: {}개 발견",
            self.name(),
            begin,
            end,
            report.count()
        );
        Ok(report)
    }

    /// 서보 등록
    pub fn add(&self, id: ServoId) -> Result<usize> {
        self.shared.registry.write().add(id)
    }

    /// 서보 일괄 등록
    pub fn create(&self, ids: &[ServoId]) -> Result<()> {
        self.shared.registry.write().create(ids)
    }

    pub fn contains(&self, id: ServoId) -> bool {
        self.shared.registry.read().contains(id)
    }

    /// 등록 순서대로 서보 ID
    pub fn servo_ids(&self) -> Vec<ServoId> {
        self.shared.registry.read().ids()
    }

    /// 서보 health 조회
    pub fn status(&self, id: ServoId) -> Result<ServoStatus> {
        let registry = self.shared.registry.read();
        Ok(registry.get(id)?.status(Instant::now()))
    }

    /// 서보 계층이 사용할 핸들
    pub fn servo(&self, id: ServoId) -> Result<ServoHandle<'_>> {
        if !self.contains(id) {
            return Err(Error::ServoNotFound { id });
        }
        Ok(ServoHandle { id, channel: self })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// 서보 하나에 대한 채널 기능 핸들
///
/// 레지스트리 항목을 직접 들고 있지 않고 ID만 기억한다.
#[derive(Clone, Copy)]
pub struct ServoHandle<'a> {
    id: ServoId,
    channel: &'a Channel,
}

impl<'a> ServoHandle<'a> {
    pub fn id(&self) -> ServoId {
        self.id
    }

    pub fn status(&self) -> Result<ServoStatus> {
        self.channel.status(self.id)
    }

    pub fn is_disabled(&self) -> Result<bool> {
        Ok(self.status()?.is_disabled())
    }

    /// 응답 없는 명령 전송
    pub fn command(&self, payload: impl Into<Bytes>) -> Result<Promise> {
        self.channel.send([Packet::command(self.id, payload)])
    }

    /// 질의 전송
    pub fn query(&self, payload: impl Into<Bytes>) -> Result<Promise> {
        self.channel.send([Packet::query(self.id, payload)])
    }
}

/// 드라이버 스레드 상태 (단일 스레드에서만 접근)
struct Driver {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    replies: CrossbeamReceiver<Reply>,
}

impl Driver {
    fn run(mut self) -> Box<dyn Transport> {
        debug!("채널 '{}' 드라이버 루프 시작", self.shared.config.name);

        while let Some(txn) = self.next_transaction() {
            if let Err(e) = self.process(txn) {
                self.enter_error(&e);
                break;
            }
        }

        debug!("채널 '{}' 드라이버 루프 종료", self.shared.config.name);
        self.transport
    }

    /// 다음 트랜잭션 대기 (큐가 비면 wake 신호나 health 점검 주기까지 block)
    fn next_transaction(&self) -> Option<Transaction> {
        let interval = self.shared.config.health_check_interval();

        loop {
            {
                let mut queue = self.shared.queue.lock();
                loop {
                    if queue.stop_requested {
                        return None;
                    }
                    if let Some(txn) = queue.pending.pop_front() {
                        queue.state = ChannelState::Processing;
                        return Some(txn);
                    }
                    queue.state = ChannelState::Idle;
                    if self.shared.wake.wait_for(&mut queue, interval).timed_out() {
                        break;
                    }
                }
            }

            self.health_tick();
        }
    }

    /// 트랜잭션 하나 처리: 전송, 응답 대기, 완료
    fn process(&mut self, mut txn: Transaction) -> io::Result<()> {
        let config = &self.shared.config;
        self.drain_strays();

        txn.advance(TransactionState::Transmitting);
        let now = Instant::now();

        let admissions: Vec<Admission> = {
            let mut registry = self.shared.registry.write();
            txn.packets()
                .iter()
                .map(|packet| match packet.target() {
                    Target::Servo(id) => registry
                        .get_mut(id)
                        .map(|servo| servo.admit(now, config.probe_reset))
                        .unwrap_or(Admission::Send),
                    Target::Broadcast => Admission::Send,
                })
                .collect()
        };

        let mut transmitted = 0u64;
        let mut transmitted_bytes = 0u64;
        let mut skipped = 0u64;

        for (index, admission) in admissions.into_iter().enumerate() {
            if admission == Admission::Skip {
                txn.skip(index);
                skipped += 1;
                continue;
            }

            let packet = &txn.packets()[index];
            if admission == Admission::Probe {
                debug!("서보 probe: {}", packet);
            }

            let bytes = packet.encode();
            if let Err(e) = self.transport.transmit(&bytes) {
                let (promise, outcome) =
                    txn.fail(FailureReason::TransportFailed(e.to_string()));
                {
                    let mut stats = self.shared.stats.lock();
                    stats.packets_transmitted += transmitted;
                    stats.bytes_transmitted += transmitted_bytes;
                    stats.packets_skipped += skipped;
                    stats.transactions_failed += 1;
                }
                self.shared.resolve(promise, outcome);
                return Err(e);
            }

            transmitted += 1;
            transmitted_bytes += bytes.len() as u64;
        }

        txn.advance(TransactionState::AwaitingReplies);
        let (accepted, strays) = self.await_replies(&mut txn);

        {
            let mut stats = self.shared.stats.lock();
            stats.packets_transmitted += transmitted;
            stats.bytes_transmitted += transmitted_bytes;
            stats.packets_skipped += skipped;
            stats.replies_received += accepted;
            stats.stray_replies += strays;
        }

        self.complete(txn);
        Ok(())
    }

    /// 기대 응답이 모두 오거나 timeout까지 대기
    fn await_replies(&self, txn: &mut Transaction) -> (u64, u64) {
        let deadline = Instant::now() + self.shared.config.timeout();
        let mut accepted = 0u64;
        let mut strays = 0u64;

        while !txn.is_satisfied() {
            match self.replies.recv_deadline(deadline) {
                Ok(reply) => {
                    let id = reply.id;
                    match txn.accept(reply) {
                        ReplyDisposition::Accepted => accepted += 1,
                        ReplyDisposition::Stray => {
                            trace!("txn {}: stray 응답 servo={}", txn.seq(), id);
                            strays += 1;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    // 응답 경로가 없으면 timeout까지 기다린 뒤 누락 처리
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    break;
                }
            }
        }

        (accepted, strays)
    }

    /// 결과 결정, health 반영, promise resolve
    fn complete(&self, txn: Transaction) {
        let seq = txn.seq();
        let (promise, outcome) = txn.finish();
        let now = Instant::now();

        let replied: Vec<ServoId> = outcome.replies().iter().map(|r| r.id).collect();
        let disabled = self.shared.registry.write().apply_outcome(
            &replied,
            outcome.missing(),
            now,
            &self.shared.config,
        );

        for id in &disabled {
            warn!(
                "서보 {} 응답 없음: {}회 연속 누락, {}ms 동안 비활성화",
                id,
                self.shared.config.unresponsive_request_limit,
                self.shared.config.unresponsive_disable_interval
            );
        }

        {
            let mut stats = self.shared.stats.lock();
            if outcome.is_success() {
                stats.transactions_succeeded += 1;
            } else {
                stats.transactions_partial += 1;
            }
            stats.servos_disabled += disabled.len() as u64;
            stats.last_completion = Some(now);
        }

        debug!(
            "txn {} 완료: {} 응답, 누락 {:?}",
            seq,
            outcome.replies().len(),
            outcome.missing()
        );
        self.shared.resolve(promise, outcome);
    }

    /// 트랜잭션 사이에 도착한 응답 폐기
    fn drain_strays(&self) {
        let mut strays = 0u64;
        while let Ok(reply) = self.replies.try_recv() {
            trace!("트랜잭션 밖 stray 응답 servo={}", reply.id);
            strays += 1;
        }
        if strays > 0 {
            self.shared.stats.lock().stray_replies += strays;
        }
    }

    /// 비활성 구간이 끝난 서보 해제
    fn health_tick(&self) {
        let released = self
            .shared
            .registry
            .write()
            .release_expired(Instant::now());

        for id in released {
            info!("서보 {} 비활성 해제, 다음 요청에서 다시 시도", id);
        }
    }

    /// transport 실패: 채널을 `Error`로, 대기 트랜잭션 모두 실패
    fn enter_error(&self, e: &io::Error) {
        let drained: Vec<Transaction> = {
            let mut queue = self.shared.queue.lock();
            queue.state = ChannelState::Error;
            queue.failure = Some(e.to_string());
            queue.pending.drain(..).collect()
        };

        warn!(
            "채널 '{}' transport 실패: {} (대기 트랜잭션 {}개 실패 처리)",
            self.shared.config.name,
            e,
            drained.len()
        );
        self.shared
            .fail_all(drained, FailureReason::TransportFailed(e.to_string()));
    }
}
