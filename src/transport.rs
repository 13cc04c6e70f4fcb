//! Transport 추상화
//!
//! 채널은 transport를 통해 바이트를 쓰고, transport는 디코딩한 응답을
//! `ReplySink`로 밀어 넣는다. 매체별 구현:
//! - `StreamTransport`: `std::io::Write` 바이트 스트림 (시리얼 장치 등)
//! - `SimulatedBus`: 프로세스 내 가상 서보 (`sim` 모듈)

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender as CrossbeamSender;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::packet::{Reply, FRAME_END, REPLY_START};
use crate::SCAN_COMMAND;

/// 응답 프레임 최대 길이 (이보다 길면 버림)
pub const MAX_REPLY_FRAME: usize = 64;

/// 채널과 전송 매체 사이의 경계
pub trait Transport: Send + 'static {
    /// 바이트 전송 (blocking). 에러는 채널에 치명적이다.
    fn transmit(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// 채널 시작 시 호출, 응답을 넣을 sink를 받는다
    fn on_start(&mut self, replies: ReplySink) -> io::Result<()>;

    /// 채널 정지 시 호출
    fn on_stop(&mut self) {}

    /// scan에서 서보 존재를 확인할 질의 명령
    fn scan_command(&self) -> Bytes {
        Bytes::from_static(SCAN_COMMAND)
    }
}

/// 응답 전달 핸들 (어느 스레드에서든 사용 가능)
#[derive(Debug, Clone)]
pub struct ReplySink {
    tx: CrossbeamSender<Reply>,
}

impl ReplySink {
    pub(crate) fn new(tx: CrossbeamSender<Reply>) -> Self {
        Self { tx }
    }

    /// 디코딩된 응답 전달, 채널이 사라졌으면 false
    pub fn deliver(&self, reply: Reply) -> bool {
        self.tx.send(reply).is_ok()
    }

    /// 완결된 프레임들을 담은 바이트 전달
    pub fn deliver_bytes(&self, bytes: &[u8]) -> bool {
        let mut decoder = ReplyDecoder::new();
        decoder
            .feed(bytes)
            .into_iter()
            .all(|reply| self.deliver(reply))
    }
}

/// `*<id><payload>\r` 응답 프레임 점진 디코더
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    buf: BytesMut,
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 바이트를 넣고 완성된 응답을 꺼낸다
    pub fn feed(&mut self, data: &[u8]) -> Vec<Reply> {
        self.buf.extend_from_slice(data);
        let mut replies = Vec::new();

        loop {
            // 시작 문자 이전 쓰레기 제거
            match self.buf.iter().position(|&b| b == REPLY_START) {
                Some(start) => {
                    let _ = self.buf.split_to(start);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }

            let end = match self.buf.iter().position(|&b| b == FRAME_END) {
                Some(end) => end,
                None => {
                    if self.buf.len() > MAX_REPLY_FRAME {
                        trace!("응답 프레임 초과, {} bytes 버림", self.buf.len());
                        let _ = self.buf.split_to(1);
                        continue;
                    }
                    break;
                }
            };

            let frame = self.buf.split_to(end + 1);
            let mut body = &frame[1..end];

            // 중간에 끊긴 프레임 뒤에 새 프레임이 시작된 경우
            if let Some(restart) = body.iter().rposition(|&b| b == REPLY_START) {
                body = &body[restart + 1..];
            }

            match Reply::parse(body) {
                Some(reply) => replies.push(reply),
                None => trace!("잘못된 응답 프레임: {:?}", String::from_utf8_lossy(body)),
            }
        }

        replies
    }
}

/// 바이트 스트림 transport
///
/// writer로 패킷을 쓰고, reader가 있으면 첫 시작 때 수신 스레드를 띄워 응답을 디코딩한다.
/// 수신 스레드는 재시작을 넘어 유지되며, 시작할 때마다 새 sink로 교체된다.
/// 정지 중에 들어온 응답은 버린다. 스레드는 EOF나 읽기 에러에서 끝난다.
pub struct StreamTransport<W: Write + Send + 'static> {
    writer: W,
    reader: Option<Box<dyn Read + Send>>,
    sink: Arc<Mutex<Option<ReplySink>>>,
    reader_handle: Option<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> StreamTransport<W> {
    /// 쓰기 전용 transport
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            reader: None,
            sink: Arc::new(Mutex::new(None)),
            reader_handle: None,
        }
    }

    /// 응답을 읽을 reader 지정
    pub fn with_reader(mut self, reader: impl Read + Send + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// 수신 스레드가 살아 있는지
    pub fn is_reading(&self) -> bool {
        self.reader_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn spawn_reader(&mut self, mut reader: Box<dyn Read + Send>) -> io::Result<()> {
        let sink = self.sink.clone();

        let handle = thread::Builder::new()
            .name("lss-reader".into())
            .spawn(move || {
                let mut decoder = ReplyDecoder::new();
                let mut buf = [0u8; 256];

                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            debug!("reader EOF");
                            break;
                        }
                        Ok(n) => {
                            let replies = decoder.feed(&buf[..n]);
                            let sink = sink.lock();
                            for reply in replies {
                                match sink.as_ref() {
                                    Some(sink) => {
                                        sink.deliver(reply);
                                    }
                                    None => trace!("채널 정지 중 응답 버림: servo={}", reply.id),
                                }
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::Interrupted
                                    | io::ErrorKind::WouldBlock
                                    | io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            warn!("수신 에러: {}", e);
                            break;
                        }
                    }
                }
            })?;

        self.reader_handle = Some(handle);
        Ok(())
    }
}

impl<W: Write + Send + 'static> Transport for StreamTransport<W> {
    fn transmit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn on_start(&mut self, replies: ReplySink) -> io::Result<()> {
        *self.sink.lock() = Some(replies);

        match self.reader.take() {
            Some(reader) => {
                let result = self.spawn_reader(reader);
                if result.is_err() {
                    self.sink.lock().take();
                }
                result
            }
            None => {
                if self.reader_handle.is_some() && !self.is_reading() {
                    warn!("수신 스레드가 이미 종료됨, 응답을 받을 수 없음");
                }
                Ok(())
            }
        }
    }

    fn on_stop(&mut self) {
        // blocking read는 깨울 수 없으므로 스레드는 남겨 두고 sink만 끊는다
        self.sink.lock().take();
    }
}
