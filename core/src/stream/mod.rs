//! Stream lifecycle.
//!
//! A [Stream] is the long-lived session object created for every targeted connection. It holds
//! the write-once protocol classification, the emission counter and one correlator per registered
//! protocol, and owns the sending halves of the two [Reader](reader::Reader) queues. Readers run in
//! their own tasks and only keep a weak reference back to the stream.

pub mod factory;
pub mod reader;
pub mod registry;

use self::reader::ReaderChunk;
use crate::correlate::{CounterPair, Correlator};
use crate::output::emitter::Emitter;
use crate::output::{ConnectionInfo, Message, OutputItem};
use crate::protocols::stream::ProtocolKind;
use crate::stats::{StatExt, READER_OVERFLOWS};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc::{error::TrySendError, Sender};

/// Correlation state of one protocol within a stream.
#[derive(Debug)]
pub struct CorrelationSlot {
    pub counters: CounterPair,
    pub correlator: Correlator,
}

#[derive(Debug, Default)]
struct Feeds {
    client: Option<Sender<ReaderChunk>>,
    server: Option<Sender<ReaderChunk>>,
}

#[derive(Debug, Default)]
struct StreamState {
    closed: bool,
    feeds: Feeds,
}

/// A targeted bidirectional connection.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    connection: ConnectionInfo,
    identify_only: bool,
    created_at: Instant,
    first_seen: SystemTime,
    protocol: OnceLock<ProtocolKind>,
    state: Mutex<StreamState>,
    /// Index of the next emitted item.
    emitted: Mutex<u64>,
    persistent: AtomicBool,
    correlators: Vec<CorrelationSlot>,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        connection: ConnectionInfo,
        identify_only: bool,
        correlators: Vec<Correlator>,
    ) -> Self {
        Stream {
            id,
            connection,
            identify_only,
            created_at: Instant::now(),
            first_seen: SystemTime::now(),
            protocol: OnceLock::new(),
            state: Mutex::new(StreamState::default()),
            emitted: Mutex::new(0),
            persistent: AtomicBool::new(false),
            correlators: correlators
                .into_iter()
                .map(|correlator| CorrelationSlot {
                    counters: CounterPair::default(),
                    correlator,
                })
                .collect(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn identify_only(&self) -> bool {
        self.identify_only
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wall-clock creation time.
    pub fn first_seen(&self) -> SystemTime {
        self.first_seen
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.protocol.get().copied()
    }

    /// Classifies the stream. Only the first call has an effect.
    ///
    /// Returns `true` if the stream ends up classified as `kind`.
    pub fn set_protocol(&self, kind: ProtocolKind) -> bool {
        if self.protocol.set(kind).is_ok() {
            log::debug!("Stream {} identified as {}", self.id, kind);
        }
        self.protocol() == Some(kind)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub(crate) fn mark_persistent(&self) {
        self.persistent.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Correlation slots, in protocol priority order.
    pub fn correlators(&self) -> &[CorrelationSlot] {
        &self.correlators
    }

    pub fn slot(&self, kind: ProtocolKind) -> Option<&CorrelationSlot> {
        self.correlators
            .iter()
            .find(|slot| slot.correlator.protocol() == kind)
    }

    /// Number of items emitted so far.
    pub fn emitted(&self) -> u64 {
        *self.emitted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the next emission index under the stream's emission lock. The counter only
    /// advances if `f` returns `true`.
    pub(crate) fn with_next_index<F>(&self, f: F)
    where
        F: FnOnce(u64) -> bool,
    {
        let mut emitted = self.emitted.lock().unwrap_or_else(PoisonError::into_inner);
        if f(*emitted) {
            *emitted += 1;
        }
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the reader queues. Ignored once the stream is closed.
    pub(crate) fn attach(&self, client: Sender<ReaderChunk>, server: Sender<ReaderChunk>) {
        let mut state = self.state();
        if !state.closed {
            state.feeds = Feeds {
                client: Some(client),
                server: Some(server),
            };
        }
    }

    /// Queues an ordered byte range for the reader of direction `dir` (`true` is client to
    /// server).
    ///
    /// Never blocks. A full queue detaches that reader, which then observes end-of-stream.
    pub(crate) fn feed(&self, dir: bool, chunk: ReaderChunk) {
        let mut state = self.state();
        let feed = if dir {
            &mut state.feeds.client
        } else {
            &mut state.feeds.server
        };
        let sender = match feed.as_ref() {
            Some(sender) => sender,
            None => return,
        };
        match sender.try_send(chunk) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                READER_OVERFLOWS.inc();
                log::warn!(
                    "Stream {}: {} reader queue full, ending that direction",
                    self.id,
                    if dir { "client" } else { "server" }
                );
                *feed = None;
            }
            Err(TrySendError::Closed(_)) => *feed = None,
        }
    }

    /// Marks the stream closed and detaches both readers.
    ///
    /// Returns `true` for the one call that performed the transition.
    pub fn close(&self) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.feeds = Feeds::default();
        true
    }

    /// Registers a parsed message with the correlator of `kind`, emitting the pair on a match.
    pub fn correlate(&self, kind: ProtocolKind, key: &str, message: Message, emitter: &Emitter) {
        let slot = match self.slot(kind) {
            Some(slot) => slot,
            None => {
                log::debug!("Stream {}: no correlator for {}", self.id, kind);
                return;
            }
        };
        if let Some(pair) = slot.correlator.register(key, message) {
            let item = OutputItem {
                stream: self.id,
                index: 0,
                protocol: kind,
                timestamp: pair.request.capture_time,
                elapsed: pair.elapsed(),
                connection: self.connection.clone(),
                pair,
            };
            emitter.emit(self, item);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::correlate::tests::{answer, query};
    use crate::output::sink::OutputSink;

    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn connection() -> ConnectionInfo {
        ConnectionInfo {
            client: "10.0.0.1:40000".parse().unwrap(),
            server: "10.0.0.2:53".parse().unwrap(),
            is_outgoing: false,
            source: "test".to_owned(),
        }
    }

    pub(crate) fn stream(id: u64, identify_only: bool) -> Stream {
        let correlators = ProtocolKind::ALL
            .iter()
            .map(|kind| Correlator::new(*kind, 16))
            .collect();
        Stream::new(id, connection(), identify_only, correlators)
    }

    #[test]
    fn protocol_is_write_once() {
        let stream = stream(0, false);
        assert!(stream.protocol().is_none());
        assert!(stream.set_protocol(ProtocolKind::Http));
        assert!(!stream.set_protocol(ProtocolKind::Kafka));
        assert_eq!(stream.protocol(), Some(ProtocolKind::Http));
    }

    #[test]
    fn close_happens_once() {
        let stream = Arc::new(stream(0, false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stream = Arc::clone(&stream);
                std::thread::spawn(move || stream.close())
            })
            .collect();
        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|closed| *closed)
            .count();
        assert_eq!(transitions, 1);
        assert!(stream.is_closed());
        assert!(!stream.close());
    }

    #[test]
    fn emission_indices_are_gap_free() {
        let sink = OutputSink::new(16);
        let rx = sink.receiver();
        let emitter = Emitter::new(sink);
        let stream = stream(3, false);
        let t0 = SystemTime::now();
        for id in 0..5u16 {
            let key = id.to_string();
            stream.correlate(ProtocolKind::Dns, &key, query(id, t0), &emitter);
            stream.correlate(
                ProtocolKind::Dns,
                &key,
                answer(id, t0 + Duration::from_millis(1)),
                &emitter,
            );
        }
        let indices: Vec<u64> = rx.try_iter().map(|item| item.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(stream.emitted(), 5);
        assert!(stream.is_persistent());
    }

    #[test]
    fn dropped_items_do_not_consume_indices() {
        let sink = OutputSink::new(1);
        let rx = sink.receiver();
        let emitter = Emitter::new(sink);
        let stream = stream(4, false);
        let t0 = SystemTime::now();
        for id in 0..2u16 {
            let key = id.to_string();
            stream.correlate(ProtocolKind::Dns, &key, query(id, t0), &emitter);
            stream.correlate(ProtocolKind::Dns, &key, answer(id, t0), &emitter);
        }
        assert_eq!(stream.emitted(), 1);
        assert_eq!(rx.try_recv().unwrap().index, 0);
        stream.correlate(ProtocolKind::Dns, "9", query(9, t0), &emitter);
        stream.correlate(ProtocolKind::Dns, "9", answer(9, t0), &emitter);
        assert_eq!(rx.try_recv().unwrap().index, 1);
    }

    #[test]
    fn identify_only_never_forwards() {
        let sink = OutputSink::new(16);
        let rx = sink.receiver();
        let emitter = Emitter::new(sink);
        let stream = stream(5, true);
        let t0 = SystemTime::now();
        stream.correlate(ProtocolKind::Dns, "1", query(1, t0), &emitter);
        stream.correlate(ProtocolKind::Dns, "1", answer(1, t0), &emitter);
        assert!(rx.try_recv().is_err());
        assert!(stream.is_persistent());
        assert_eq!(stream.emitted(), 0);
    }
}
