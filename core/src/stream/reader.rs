//! Per-direction byte source for protocol parsers.
//!
//! A [Reader] turns the queue of ordered byte ranges of one direction into an [AsyncRead]. A read
//! waits for the next range, and reports end-of-stream once the queue is detached or no range
//! arrived within the idle timeout.
//!
//! While the stream is unclassified the reader records every byte it serves, so that a parser that
//! fails to recognize the data can [rewind](Reader::rewind) for the next parser in priority order.
//! Recording stops once a parser [identifies](Reader::identify) the stream.

use super::Stream;
use crate::output::emitter::Emitter;
use crate::output::Message;
use crate::protocols::stream::ProtocolKind;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, Instant, Sleep};

/// An ordered byte range and the capture time of the segment that completed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderChunk {
    pub data: Vec<u8>,
    pub seen: SystemTime,
}

/// Consumer side of one direction of a stream.
#[derive(Debug)]
pub struct Reader {
    is_client: bool,
    rx: Receiver<ReaderChunk>,
    /// Range being served and the offset of its first unread byte.
    current: Option<(ReaderChunk, usize)>,
    idle_timeout: Duration,
    idle: Option<Pin<Box<Sleep>>>,
    eof: bool,
    /// Bytes served since the last identification, replayed after a rewind.
    record: Vec<u8>,
    recording: bool,
    /// Offset into `record` of the next replayed byte.
    replay_pos: usize,
    fed: u64,
    consumed: u64,
    last_seen: SystemTime,
    stream: Weak<Stream>,
    emitter: Arc<Emitter>,
}

impl Reader {
    pub(crate) fn new(
        is_client: bool,
        rx: Receiver<ReaderChunk>,
        idle_timeout: Duration,
        stream: Weak<Stream>,
        emitter: Arc<Emitter>,
    ) -> Self {
        Reader {
            is_client,
            rx,
            current: None,
            idle_timeout,
            idle: None,
            eof: false,
            record: vec![],
            recording: true,
            replay_pos: 0,
            fed: 0,
            consumed: 0,
            last_seen: SystemTime::UNIX_EPOCH,
            stream,
            emitter,
        }
    }

    /// `true` for the client to server direction.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Total bytes received from the queue.
    pub fn fed(&self) -> u64 {
        self.fed
    }

    /// Total bytes handed out, replays excluded.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Capture time of the most recently received range.
    pub fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.stream.upgrade()
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.stream().and_then(|stream| stream.protocol())
    }

    /// Serves recorded bytes again from the start.
    pub fn rewind(&mut self) {
        self.replay_pos = 0;
    }

    /// Classifies the stream as `kind`, then drops the bytes recorded for other parsers.
    ///
    /// Returns `false` if the stream is gone or already classified as something else.
    pub fn identify(&mut self, kind: ProtocolKind) -> bool {
        let identified = match self.stream() {
            Some(stream) => stream.set_protocol(kind),
            None => false,
        };
        if identified && self.recording {
            self.recording = false;
            self.record = self.record.split_off(self.replay_pos);
            self.replay_pos = 0;
        }
        identified
    }

    /// Returns the next request (client side) or response (server side) ordinal of `kind`.
    pub fn next_ordinal(&self, kind: ProtocolKind) -> Option<u64> {
        let stream = self.stream()?;
        let slot = stream.slot(kind)?;
        Some(if self.is_client {
            slot.counters.next_request()
        } else {
            slot.counters.next_response()
        })
    }

    /// Hands a parsed message to the stream's correlator of `kind`.
    pub fn register(&self, kind: ProtocolKind, key: &str, message: Message) {
        if let Some(stream) = self.stream() {
            stream.correlate(kind, key, message, &self.emitter);
        }
    }

    fn replay(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        let pending = &self.record[self.replay_pos..];
        if pending.is_empty() {
            return false;
        }
        let n = pending.len().min(buf.remaining());
        buf.put_slice(&pending[..n]);
        self.replay_pos += n;
        if !self.recording && self.replay_pos == self.record.len() {
            // nothing left to replay once identified
            self.record = Vec::new();
            self.replay_pos = 0;
        }
        true
    }

    fn serve_current(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        let (chunk, pos) = match self.current.as_mut() {
            Some(current) => current,
            None => return false,
        };
        let n = (chunk.data.len() - *pos).min(buf.remaining());
        let served = &chunk.data[*pos..*pos + n];
        buf.put_slice(served);
        if self.recording {
            self.record.extend_from_slice(served);
            self.replay_pos = self.record.len();
        }
        *pos += n;
        if *pos == chunk.data.len() {
            self.current = None;
        }
        self.consumed += n as u64;
        true
    }

    fn reset_idle(&mut self) {
        let deadline = Instant::now() + self.idle_timeout;
        if let Some(idle) = self.idle.as_mut() {
            idle.as_mut().reset(deadline);
        }
    }
}

impl AsyncRead for Reader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 || this.replay(buf) || this.serve_current(buf) {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.reset_idle();
                    if chunk.data.is_empty() {
                        continue;
                    }
                    this.fed += chunk.data.len() as u64;
                    this.last_seen = chunk.seen;
                    this.current = Some((chunk, 0));
                    this.serve_current(buf);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => {
                    this.eof = true;
                }
                Poll::Pending => {
                    let idle_timeout = this.idle_timeout;
                    let idle = this
                        .idle
                        .get_or_insert_with(|| Box::pin(sleep(idle_timeout)));
                    if idle.as_mut().poll(cx).is_ready() {
                        log::debug!(
                            "{} reader idle for {:?}, ending",
                            if this.is_client { "Client" } else { "Server" },
                            idle_timeout
                        );
                        this.eof = true;
                    } else {
                        return Poll::Pending;
                    }
                }
            }
        }
    }
}
