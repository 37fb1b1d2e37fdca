//! Stale-connection expiry.
//!
//! Connections are hashed into slots by the millisecond at which they would go stale. Each tick
//! visits the slots that elapsed since the previous one: stale connections are flushed and
//! closed, the others are moved to the slot of their current deadline.

use crate::conntrack::conn::Conn;
use crate::conntrack::conn_id::ConnId;
use crate::conntrack::{TrackerConfig, Trackable};
use crate::stats::{StatExt, STALE_FLUSHES};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam::channel::{tick, Receiver};
use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

pub(super) struct TimerWheel {
    /// Slot width in milliseconds.
    resolution: usize,
    epoch: Instant,
    ticker: Receiver<Instant>,
    /// First slot not yet visited, counted from `epoch`.
    cursor: usize,
    slots: Vec<VecDeque<ConnId>>,
}

impl TimerWheel {
    /// Wheel covering `max_timeout` milliseconds in slots of `resolution` milliseconds. The
    /// resolution is clamped to `[1, max_timeout]`.
    pub(super) fn new(max_timeout: usize, resolution: usize) -> Self {
        let max_timeout = max_timeout.max(1);
        let resolution = resolution.clamp(1, max_timeout);
        TimerWheel {
            resolution,
            epoch: Instant::now(),
            ticker: tick(Duration::from_millis(resolution as u64)),
            cursor: 0,
            slots: vec![VecDeque::new(); max_timeout / resolution],
        }
    }

    fn millis(&self, ts: Instant) -> usize {
        ts.saturating_duration_since(self.epoch).as_millis() as usize
    }

    fn slot(&self, deadline: usize) -> usize {
        (deadline / self.resolution) % self.slots.len()
    }

    /// Schedules `conn_id` to be checked `window` milliseconds after `last_seen`.
    pub(super) fn insert(&mut self, conn_id: &ConnId, last_seen: Instant, window: usize) {
        let deadline = self.millis(last_seen) + window;
        let slot = self.slot(deadline);
        log::trace!("Scheduling {} in slot {}", conn_id, slot);
        self.slots[slot].push_back(conn_id.clone());
    }

    /// Expires stale connections if the ticker fired since the last call.
    pub(super) fn check_inactive<T: Trackable>(
        &mut self,
        table: &mut LinkedHashMap<ConnId, Conn<T>>,
        config: &TrackerConfig,
    ) {
        if let Ok(now) = self.ticker.try_recv() {
            let before = table.len();
            let removed = self.remove_inactive(now, table, config);
            if removed > 0 {
                log::debug!("Expired {} of {} connections", removed, before);
            }
        }
    }

    /// Flushes and closes connections idle for longer than their inactivity window as of `now`.
    /// Returns the number removed.
    pub(super) fn remove_inactive<T: Trackable>(
        &mut self,
        now: Instant,
        table: &mut LinkedHashMap<ConnId, Conn<T>>,
        config: &TrackerConfig,
    ) -> usize {
        let end = self.millis(now) / self.resolution;
        let check_time = end * self.resolution;
        let mut rescheduled = vec![];
        let mut removed = 0;

        for visit in self.cursor..end {
            let slot = visit % self.slots.len();
            let due: Vec<ConnId> = self.slots[slot].drain(..).collect();
            for conn_id in due {
                let mut entry = match table.raw_entry_mut().from_key(&conn_id) {
                    RawEntryMut::Occupied(entry) => entry,
                    // already closed
                    RawEntryMut::Vacant(_) => continue,
                };
                let conn = entry.get_mut();
                let deadline = self.millis(conn.last_seen_ts) + conn.inactivity_window;
                if deadline < check_time {
                    STALE_FLUSHES.inc();
                    log::debug!("Flushing stale connection {}", conn.flow);
                    conn.terminate(config);
                    entry.remove();
                    removed += 1;
                } else {
                    rescheduled.push((self.slot(deadline), conn_id));
                }
            }
            for (slot, conn_id) in rescheduled.drain(..) {
                self.slots[slot].push_back(conn_id);
            }
        }
        self.cursor = self.cursor.max(end);
        removed
    }
}
