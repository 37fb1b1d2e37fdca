//! Per-source connection state management.
//!
//! A [ConnTracker] owns every TCP connection seen by one segment source. It decodes frames, runs
//! the admission checks, reassembles each direction into ordered byte ranges, and hands those
//! ranges to the connection's [Trackable]. Connections leave the table on FIN/RST, when they go
//! stale, or when the tracker is drained.

pub mod conn;
pub mod conn_id;
pub mod pdu;
mod timerwheel;

pub use self::conn::tcp_conn::reassembly::{BufferBudget, RangeStats, ScatterGather, Skip};

use self::conn::{Admission, Conn};
use self::conn_id::{ConnId, Flow};
use self::pdu::{CapturedFrame, L4Context, PduError};
use self::timerwheel::TimerWheel;
use crate::config::AssemblyConfig;
use crate::stats::{
    StatExt, MALFORMED_FRAMES, NEW_CONNECTIONS, NON_TCP_FRAMES, SEGMENTS_SEEN, TABLE_FULL_DROPS,
};

use std::sync::Arc;
use std::time::Instant;

use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

/// Per-connection consumer of reassembled data.
pub trait Trackable {
    /// `false` for connections tracked for their lifecycle only. Their payload is never copied or
    /// buffered.
    fn wants_payload(&self) -> bool;

    /// Ordered-delivery callback, invoked with each contiguous byte range of either direction.
    fn reassembled(&mut self, sg: &mut ScatterGather<'_>);

    /// Completion callback, invoked once when the connection leaves the table.
    fn complete(&mut self);
}

/// Builds the [Trackable] of each new connection.
pub trait TrackableFactory {
    type Tracked: Trackable;

    /// Called on the first segment of a connection not yet in the table.
    fn new_conn(&self, flow: &Flow) -> Self::Tracked;
}

/// Manages state for all TCP connections of one segment source.
///
/// Intake through a `ConnTracker` is sequential. Trackers of different sources may share one
/// [BufferBudget] so that the total buffered-bytes cap holds across all of them.
pub struct ConnTracker<F>
where
    F: TrackableFactory,
{
    /// Configuration
    config: TrackerConfig,
    /// Builds per-connection consumers.
    factory: F,
    /// Manages `ConnId` to `Conn<T>` mappings.
    table: LinkedHashMap<ConnId, Conn<F::Tracked>>,
    /// Manages connection timeouts.
    timerwheel: TimerWheel,
    /// Shared out-of-order buffer accounting.
    budget: Arc<BufferBudget>,
}

impl<F> ConnTracker<F>
where
    F: TrackableFactory,
{
    /// Creates a new `ConnTracker`.
    pub fn new(config: &AssemblyConfig, factory: F, budget: Arc<BufferBudget>) -> Self {
        let config = TrackerConfig::from(config);
        let table = LinkedHashMap::with_capacity(config.max_connections.min(1 << 16));
        let timerwheel = TimerWheel::new(config.stale_timeout, config.timeout_resolution);
        ConnTracker {
            config,
            factory,
            table,
            timerwheel,
            budget,
        }
    }

    /// Returns the number of entries in the table.
    #[inline]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Process a single captured frame.
    pub fn process(&mut self, frame: &CapturedFrame) {
        SEGMENTS_SEEN.inc();
        let ctxt = match L4Context::new(frame, self.config.verify_checksum) {
            Ok(ctxt) => ctxt,
            Err(PduError::NotTcp(_)) | Err(PduError::NotIp(_)) => {
                NON_TCP_FRAMES.inc();
                return;
            }
            Err(error) => {
                MALFORMED_FRAMES.inc();
                log::debug!("Dropping malformed frame: {}", error);
                return;
            }
        };

        let conn_id = ConnId::new(ctxt.src, ctxt.dst);
        match self.table.raw_entry_mut().from_key(&conn_id) {
            RawEntryMut::Occupied(mut occupied) => {
                let conn = occupied.get_mut();
                conn.last_seen_ts = Instant::now();
                let dir = conn.packet_dir(&ctxt);
                conn.update(frame, ctxt, dir, &self.config);
                if conn.terminated() {
                    conn.terminate(&self.config);
                    occupied.remove();
                }
            }
            RawEntryMut::Vacant(_) => {
                if self.size() >= self.config.max_connections {
                    TABLE_FULL_DROPS.inc();
                    log::error!("Table full. Dropping packet.");
                    return;
                }
                let flow = Flow::from_ctxt(&ctxt);
                let dir = flow.orig == ctxt.src;
                let mut admission = Admission::new(&self.config);
                if !admission.admit(&flow, &ctxt, dir, &self.config) {
                    return;
                }
                let tracked = self.factory.new_conn(&flow);
                let mut conn = Conn::new(
                    flow,
                    admission,
                    tracked,
                    &self.config,
                    Arc::clone(&self.budget),
                );
                conn.ingest(frame, ctxt, dir, &self.config);
                NEW_CONNECTIONS.inc();
                if conn.terminated() {
                    conn.terminate(&self.config);
                } else {
                    self.timerwheel
                        .insert(&conn_id, conn.last_seen_ts, conn.inactivity_window);
                    self.table.insert(conn_id, conn);
                }
            }
        }
    }

    /// Flushes and closes every remaining connection.
    pub fn drain(&mut self) {
        log::info!("Draining Connection table ({} connections)", self.table.len());
        for (_, mut conn) in self.table.drain() {
            conn.terminate(&self.config);
        }
    }

    /// Checks for and removes inactive connections.
    pub fn check_inactive(&mut self) {
        self.timerwheel
            .check_inactive(&mut self.table, &self.config);
    }

    /// Flushes and closes connections inactive as of `now`. Returns the number removed.
    pub fn remove_inactive(&mut self, now: Instant) -> usize {
        self.timerwheel
            .remove_inactive(now, &mut self.table, &self.config)
    }
}

/// Configurable options for a `ConnTracker`.
#[derive(Debug, Clone)]
pub(crate) struct TrackerConfig {
    /// Maximum number of connections that can be tracked per source.
    pub(crate) max_connections: usize,
    /// Cap on out-of-order bytes held by a single connection.
    pub(crate) max_buffered_bytes_per_connection: usize,
    /// Time to expire inactive connections (in milliseconds).
    pub(crate) stale_timeout: usize,
    /// Frequency to check for inactive connections (in milliseconds).
    pub(crate) timeout_resolution: usize,
    pub(crate) reject_fsm_errors: bool,
    pub(crate) reject_option_errors: bool,
    pub(crate) verify_checksum: bool,
    pub(crate) allow_missing_init: bool,
}

impl From<&AssemblyConfig> for TrackerConfig {
    fn from(config: &AssemblyConfig) -> Self {
        TrackerConfig {
            max_connections: config.max_connections,
            max_buffered_bytes_per_connection: config.max_buffered_bytes_per_connection,
            stale_timeout: config.stale_timeout,
            timeout_resolution: config.timeout_resolution,
            reject_fsm_errors: config.reject_fsm_errors,
            reject_option_errors: config.reject_option_errors,
            verify_checksum: config.verify_checksum,
            allow_missing_init: config.allow_missing_init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::pdu::{ACK, PSH};
    use crate::stats::snapshot;
    use crate::testing::{Conversation, FrameBuilder};

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Range {
        dir: bool,
        skip: Skip,
        data: Vec<u8>,
    }

    #[derive(Default)]
    struct Recorded {
        ranges: Vec<Range>,
        completed: usize,
        created: usize,
    }

    impl Recorded {
        fn bytes(&self, dir: bool) -> Vec<u8> {
            self.ranges
                .iter()
                .filter(|r| r.dir == dir && !matches!(r.skip, Skip::Lost(_)))
                .flat_map(|r| r.data.clone())
                .collect()
        }
    }

    struct Recorder {
        log: Rc<RefCell<Recorded>>,
        payload: bool,
    }

    impl Trackable for Recorder {
        fn wants_payload(&self) -> bool {
            self.payload
        }

        fn reassembled(&mut self, sg: &mut ScatterGather<'_>) {
            self.log.borrow_mut().ranges.push(Range {
                dir: sg.dir(),
                skip: sg.skip(),
                data: sg.data().to_vec(),
            });
        }

        fn complete(&mut self) {
            self.log.borrow_mut().completed += 1;
        }
    }

    struct RecorderFactory {
        log: Rc<RefCell<Recorded>>,
        payload: bool,
    }

    impl TrackableFactory for RecorderFactory {
        type Tracked = Recorder;

        fn new_conn(&self, _flow: &Flow) -> Recorder {
            self.log.borrow_mut().created += 1;
            Recorder {
                log: Rc::clone(&self.log),
                payload: self.payload,
            }
        }
    }

    fn tracker(config: AssemblyConfig) -> (ConnTracker<RecorderFactory>, Rc<RefCell<Recorded>>) {
        let log = Rc::new(RefCell::new(Recorded::default()));
        let factory = RecorderFactory {
            log: Rc::clone(&log),
            payload: true,
        };
        let budget = Arc::new(BufferBudget::new(config.max_buffered_bytes_total));
        (ConnTracker::new(&config, factory, budget), log)
    }

    /// Deterministic Fisher-Yates shuffle driven by a small LCG.
    fn shuffle<T>(items: &mut [T], mut seed: u64) {
        for i in (1..items.len()).rev() {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let j = (seed >> 33) as usize % (i + 1);
            items.swap(i, j);
        }
    }

    #[test]
    fn in_order_stream_is_delivered_verbatim() {
        let (mut tracker, log) = tracker(AssemblyConfig::default());
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        tracker.process(&conv.client_data(b"GET / HTTP/1.1\r\n"));
        tracker.process(&conv.server_data(b"HTTP/1.1 200 OK\r\n"));
        let log = log.borrow();
        assert_eq!(log.bytes(true), b"GET / HTTP/1.1\r\n");
        assert_eq!(log.bytes(false), b"HTTP/1.1 200 OK\r\n");
        assert!(log.ranges.iter().all(|r| r.skip == Skip::None));
    }

    #[test]
    fn permuted_and_duplicated_segments_reassemble_exactly() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        for seed in 1..20u64 {
            let (mut tracker, log) = tracker(AssemblyConfig::default());
            let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
            for frame in conv.handshake() {
                tracker.process(&frame);
            }
            let mut segments = conv.client_segments(&payload, 97);
            // retransmit a few segments
            let duplicates: Vec<_> = segments.iter().step_by(7).cloned().collect();
            segments.extend(duplicates);
            shuffle(&mut segments, seed);
            for frame in &segments {
                tracker.process(frame);
            }
            let log = log.borrow();
            assert_eq!(log.bytes(true), payload, "seed {}", seed);
            assert!(log.ranges.iter().all(|r| r.skip == Skip::None));
        }
    }

    #[test]
    fn partially_overlapping_retransmission_is_trimmed() {
        let (mut tracker, log) = tracker(AssemblyConfig::default());
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        let start = conv.client_seq;
        tracker.process(&conv.client_data(b"abcd"));
        // resend "cd" together with new bytes "ef"
        let overlapping = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(start + 2)
            .flags(ACK | PSH)
            .payload(b"cdef")
            .build();
        tracker.process(&overlapping);
        assert_eq!(log.borrow().bytes(true), b"abcdef");
    }

    #[test]
    fn mid_stream_start_reports_unknown_skip() {
        let (mut tracker, log) = tracker(AssemblyConfig::default());
        let frame = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(777)
            .flags(ACK | PSH)
            .payload(b"late")
            .build();
        tracker.process(&frame);
        let log = log.borrow();
        assert_eq!(log.ranges.len(), 1);
        assert_eq!(log.ranges[0].skip, Skip::Unknown);
        assert_eq!(log.ranges[0].data, b"late");
    }

    #[test]
    fn per_connection_cap_forces_flush_past_gap() {
        let config = AssemblyConfig {
            max_buffered_bytes_per_connection: 100,
            ..AssemblyConfig::default()
        };
        let (mut tracker, log) = tracker(config);
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        // lose the first 50 bytes, then keep sending
        let _lost = conv.client_data(&[b'x'; 50]);
        for _ in 0..5 {
            tracker.process(&conv.client_data(&[b'y'; 40]));
            let buffered: usize = tracker
                .table
                .values()
                .map(|c| c.tcp_conn.buffered())
                .sum();
            assert!(buffered <= 100, "buffered {} exceeds cap", buffered);
        }
        assert!(tracker.budget.used() <= 100);

        let log = log.borrow();
        let lost = log
            .ranges
            .iter()
            .find(|r| matches!(r.skip, Skip::Lost(_)))
            .expect("a forced flush past the gap");
        assert_eq!(lost.skip, Skip::Lost(50));
        // the range after the gap is dropped, later ranges continue
        assert_eq!(log.bytes(true), vec![b'y'; 40 * 5 - 40]);
    }

    #[test]
    fn rejected_first_segment_allocates_nothing() {
        let config = AssemblyConfig {
            reject_fsm_errors: true,
            allow_missing_init: false,
            ..AssemblyConfig::default()
        };
        let (mut tracker, log) = tracker(config);
        let before = snapshot().reject_fsm;
        let frame = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(777)
            .flags(ACK | PSH)
            .payload(b"late")
            .build();
        tracker.process(&frame);
        tracker.process(&frame);
        assert_eq!(tracker.size(), 0);
        assert!(snapshot().reject_fsm >= before + 2);
        let log = log.borrow();
        assert_eq!(log.created, 0);
        assert!(log.ranges.is_empty());
    }

    #[test]
    fn out_of_window_segment_is_rejected_when_configured() {
        let config = AssemblyConfig {
            reject_option_errors: true,
            ..AssemblyConfig::default()
        };
        let (mut tracker, log) = tracker(config);
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        let before = snapshot().reject_options;
        let beyond = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(conv.client_seq.wrapping_add(70_000))
            .ack(conv.server_seq)
            .flags(ACK | PSH)
            .payload(b"far")
            .build();
        tracker.process(&beyond);
        assert!(snapshot().reject_options > before);
        // never buffered
        assert_eq!(tracker.budget.used(), 0);

        tracker.process(&conv.client_data(b"near"));
        assert_eq!(log.borrow().bytes(true), b"near");
    }

    #[test]
    fn bad_checksum_is_rejected_when_verified() {
        let config = AssemblyConfig {
            verify_checksum: true,
            ..AssemblyConfig::default()
        };
        let (mut tracker, log) = tracker(config);
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        let before = snapshot().reject_checksum;
        let start = conv.client_seq;
        let mut corrupt = conv.client_data(b"abcd");
        let last = corrupt.data.len() - 1;
        corrupt.data[last] ^= 0xff;
        tracker.process(&corrupt);
        assert!(snapshot().reject_checksum > before);
        assert!(log.borrow().ranges.is_empty());

        // the retransmission is intact
        conv.client_seq = start;
        tracker.process(&conv.client_data(b"abcd"));
        assert_eq!(log.borrow().bytes(true), b"abcd");
    }

    #[test]
    fn total_cap_holds_across_connections() {
        let config = AssemblyConfig {
            max_buffered_bytes_total: 100,
            ..AssemblyConfig::default()
        };
        let (mut tracker, log) = tracker(config);
        let mut first = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        let mut second = Conversation::new("10.0.0.3:40000", "10.0.0.2:80");
        for frame in first.handshake().into_iter().chain(second.handshake()) {
            tracker.process(&frame);
        }
        assert_eq!(tracker.size(), 2);

        let _hole = first.client_data(&[b'x'; 10]);
        tracker.process(&first.client_data(&[b'a'; 80]));
        assert_eq!(tracker.budget.used(), 80);

        // pushes the total over the cap, so the second connection flushes past its gap
        let _hole = second.client_data(&[b'x'; 10]);
        tracker.process(&second.client_data(&[b'b'; 40]));
        assert_eq!(tracker.budget.used(), 80);
        {
            let log = log.borrow();
            assert_eq!(log.ranges.len(), 1);
            assert_eq!(log.ranges[0].skip, Skip::Lost(10));
            assert_eq!(log.ranges[0].data, vec![b'b'; 40]);
        }

        tracker.process(&first.client_data(&[b'a'; 30]));
        assert!(tracker.budget.used() <= 100);
        assert_eq!(tracker.budget.used(), 0);
        let log = log.borrow();
        let lost: Vec<_> = log
            .ranges
            .iter()
            .filter(|r| matches!(r.skip, Skip::Lost(_)))
            .collect();
        assert_eq!(lost.len(), 2);
        assert_eq!(lost[1].data, vec![b'a'; 80]);
        assert_eq!(log.ranges.last().map(|r| r.data.len()), Some(30));
    }

    #[test]
    fn fin_from_both_sides_completes_once() {
        let (mut tracker, log) = tracker(AssemblyConfig::default());
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        tracker.process(&conv.client_data(b"ping"));
        for frame in conv.teardown() {
            tracker.process(&frame);
        }
        assert_eq!(tracker.size(), 0);
        assert_eq!(log.borrow().completed, 1);
        tracker.drain();
        assert_eq!(log.borrow().completed, 1);
    }

    #[test]
    fn stale_connections_are_flushed_and_closed() {
        let config = AssemblyConfig {
            stale_timeout: 50,
            timeout_resolution: 10,
            ..AssemblyConfig::default()
        };
        let (mut tracker, log) = tracker(config);
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        // a future segment waits in the buffer behind a hole
        let _hole = conv.client_data(b"hole");
        tracker.process(&conv.client_data(b"tail"));
        assert_eq!(tracker.size(), 1);
        assert!(log.borrow().ranges.is_empty());

        let removed = tracker.remove_inactive(Instant::now() + Duration::from_millis(500));
        assert_eq!(removed, 1);
        assert_eq!(tracker.size(), 0);
        assert_eq!(tracker.budget.used(), 0);
        let log = log.borrow();
        assert_eq!(log.completed, 1);
        assert_eq!(log.ranges.len(), 1);
        assert_eq!(log.ranges[0].skip, Skip::Lost(4));
    }

    #[test]
    fn bookkeeping_only_connections_never_buffer() {
        let log = Rc::new(RefCell::new(Recorded::default()));
        let factory = RecorderFactory {
            log: Rc::clone(&log),
            payload: false,
        };
        let budget = Arc::new(BufferBudget::new(1000));
        let mut tracker = ConnTracker::new(&AssemblyConfig::default(), factory, budget);
        let mut conv = Conversation::new("10.0.0.1:40000", "10.0.0.2:80");
        for frame in conv.handshake() {
            tracker.process(&frame);
        }
        let _hole = conv.client_data(b"hole");
        tracker.process(&conv.client_data(b"future"));
        assert_eq!(tracker.budget.used(), 0);
        for frame in conv.teardown() {
            tracker.process(&frame);
        }
        let log = log.borrow();
        assert!(log.ranges.is_empty());
        assert_eq!(log.completed, 1);
    }

    #[test]
    fn malformed_frames_are_ignored() {
        let (mut tracker, log) = tracker(AssemblyConfig::default());
        let mut frame = FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
            .payload(b"abc")
            .build();
        frame.data.truncate(20);
        tracker.process(&frame);
        assert_eq!(tracker.size(), 0);
        assert!(log.borrow().ranges.is_empty());
    }
}
