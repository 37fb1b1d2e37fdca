//! Process-wide counters.
//!
//! Counters are updated from the intake threads, the direction tasks and the sweepers alike, so
//! every statistic is a relaxed atomic. [snapshot] reads them all at once for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub(crate) static SEGMENTS_SEEN: AtomicU64 = AtomicU64::new(0);
pub(crate) static SEGMENTS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
pub(crate) static MALFORMED_FRAMES: AtomicU64 = AtomicU64::new(0);
pub(crate) static NON_TCP_FRAMES: AtomicU64 = AtomicU64::new(0);

pub(crate) static REJECT_FSM: AtomicU64 = AtomicU64::new(0);
pub(crate) static CONNS_WITH_FSM_ERRORS: AtomicU64 = AtomicU64::new(0);
pub(crate) static REJECT_OPTIONS: AtomicU64 = AtomicU64::new(0);
pub(crate) static REJECT_CHECKSUM: AtomicU64 = AtomicU64::new(0);

pub(crate) static NEW_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
pub(crate) static TARGETED_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
pub(crate) static IGNORED_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
pub(crate) static TABLE_FULL_DROPS: AtomicU64 = AtomicU64::new(0);

pub(crate) static REASSEMBLED_BYTES: AtomicU64 = AtomicU64::new(0);
pub(crate) static OUT_OF_ORDER_BYTES: AtomicU64 = AtomicU64::new(0);
pub(crate) static OUT_OF_ORDER_PACKETS: AtomicU64 = AtomicU64::new(0);
pub(crate) static BIGGEST_CHUNK_BYTES: AtomicU64 = AtomicU64::new(0);
pub(crate) static OVERLAP_BYTES: AtomicU64 = AtomicU64::new(0);
pub(crate) static OVERLAP_PACKETS: AtomicU64 = AtomicU64::new(0);
pub(crate) static INVALID_OVERLAPS: AtomicU64 = AtomicU64::new(0);
pub(crate) static SKIPPED_BYTES: AtomicU64 = AtomicU64::new(0);
pub(crate) static DROPPED_RANGES: AtomicU64 = AtomicU64::new(0);
pub(crate) static FORCED_FLUSHES: AtomicU64 = AtomicU64::new(0);
pub(crate) static STALE_FLUSHES: AtomicU64 = AtomicU64::new(0);

pub(crate) static READER_OVERFLOWS: AtomicU64 = AtomicU64::new(0);
pub(crate) static STREAMS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);

pub(crate) static MATCHED_PAIRS: AtomicU64 = AtomicU64::new(0);
pub(crate) static DISPATCHED_ITEMS: AtomicU64 = AtomicU64::new(0);
pub(crate) static DROPPED_ITEMS: AtomicU64 = AtomicU64::new(0);
pub(crate) static EXPIRED_ENTRIES: AtomicU64 = AtomicU64::new(0);
pub(crate) static ABANDONED_ENTRIES: AtomicU64 = AtomicU64::new(0);

pub(crate) trait StatExt: Sized {
    fn inc(&'static self) {
        self.inc_by(1);
    }
    fn inc_by(&'static self, val: u64);
    fn record_max(&'static self, val: u64);
}

impl StatExt for AtomicU64 {
    fn inc_by(&'static self, val: u64) {
        self.fetch_add(val, Ordering::Relaxed);
    }

    fn record_max(&'static self, val: u64) {
        self.fetch_max(val, Ordering::Relaxed);
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub segments_seen: u64,
    pub segments_accepted: u64,
    pub malformed_frames: u64,
    pub non_tcp_frames: u64,
    pub reject_fsm: u64,
    pub conns_with_fsm_errors: u64,
    pub reject_options: u64,
    pub reject_checksum: u64,
    pub new_connections: u64,
    pub targeted_connections: u64,
    pub ignored_connections: u64,
    pub table_full_drops: u64,
    pub reassembled_bytes: u64,
    pub out_of_order_bytes: u64,
    pub out_of_order_packets: u64,
    pub biggest_chunk_bytes: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
    pub invalid_overlaps: u64,
    pub skipped_bytes: u64,
    pub dropped_ranges: u64,
    pub forced_flushes: u64,
    pub stale_flushes: u64,
    pub reader_overflows: u64,
    pub streams_timed_out: u64,
    pub matched_pairs: u64,
    pub dispatched_items: u64,
    pub dropped_items: u64,
    pub expired_entries: u64,
    pub abandoned_entries: u64,
}

/// Reads every counter.
pub fn snapshot() -> StatsSnapshot {
    let get = |stat: &AtomicU64| stat.load(Ordering::Relaxed);
    StatsSnapshot {
        segments_seen: get(&SEGMENTS_SEEN),
        segments_accepted: get(&SEGMENTS_ACCEPTED),
        malformed_frames: get(&MALFORMED_FRAMES),
        non_tcp_frames: get(&NON_TCP_FRAMES),
        reject_fsm: get(&REJECT_FSM),
        conns_with_fsm_errors: get(&CONNS_WITH_FSM_ERRORS),
        reject_options: get(&REJECT_OPTIONS),
        reject_checksum: get(&REJECT_CHECKSUM),
        new_connections: get(&NEW_CONNECTIONS),
        targeted_connections: get(&TARGETED_CONNECTIONS),
        ignored_connections: get(&IGNORED_CONNECTIONS),
        table_full_drops: get(&TABLE_FULL_DROPS),
        reassembled_bytes: get(&REASSEMBLED_BYTES),
        out_of_order_bytes: get(&OUT_OF_ORDER_BYTES),
        out_of_order_packets: get(&OUT_OF_ORDER_PACKETS),
        biggest_chunk_bytes: get(&BIGGEST_CHUNK_BYTES),
        overlap_bytes: get(&OVERLAP_BYTES),
        overlap_packets: get(&OVERLAP_PACKETS),
        invalid_overlaps: get(&INVALID_OVERLAPS),
        skipped_bytes: get(&SKIPPED_BYTES),
        dropped_ranges: get(&DROPPED_RANGES),
        forced_flushes: get(&FORCED_FLUSHES),
        stale_flushes: get(&STALE_FLUSHES),
        reader_overflows: get(&READER_OVERFLOWS),
        streams_timed_out: get(&STREAMS_TIMED_OUT),
        matched_pairs: get(&MATCHED_PAIRS),
        dispatched_items: get(&DISPATCHED_ITEMS),
        dropped_items: get(&DROPPED_ITEMS),
        expired_entries: get(&EXPIRED_ENTRIES),
        abandoned_entries: get(&ABANDONED_ENTRIES),
    }
}
