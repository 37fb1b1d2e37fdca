//! Periodic deletion of unmatched correlator entries.

use crate::stats::{StatExt, EXPIRED_ENTRIES};
use crate::stream::registry::StreamRegistry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Reference time of correlator expiry.
///
/// Entries carry capture timestamps. When captures are replayed from files those timestamps lie
/// in the past, so the clock follows the newest capture time observed instead of the wall clock.
#[derive(Debug, Default)]
pub struct CaptureClock {
    replay: AtomicBool,
    /// Newest observed capture time, in nanoseconds since the epoch.
    latest: AtomicU64,
}

impl CaptureClock {
    pub fn new() -> Self {
        CaptureClock::default()
    }

    /// Switches between wall-clock and capture-time mode.
    pub fn set_replay(&self, replay: bool) {
        self.replay.store(replay, Ordering::Relaxed);
    }

    /// Records the capture time of a frame.
    pub fn observe(&self, ts: SystemTime) {
        if let Ok(since_epoch) = ts.duration_since(UNIX_EPOCH) {
            let nanos = u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX);
            self.latest.fetch_max(nanos, Ordering::Relaxed);
        }
    }

    pub fn now(&self) -> SystemTime {
        let latest = self.latest.load(Ordering::Relaxed);
        if self.replay.load(Ordering::Relaxed) && latest > 0 {
            UNIX_EPOCH + Duration::from_nanos(latest)
        } else {
            SystemTime::now()
        }
    }
}

/// Deletes unmatched halves older than the expiry window from every live stream.
#[derive(Debug)]
pub struct ExpirySweeper {
    registry: Arc<StreamRegistry>,
    window: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<StreamRegistry>, window: Duration) -> Self {
        ExpirySweeper { registry, window }
    }

    /// Runs one pass at `now`. Returns the number of entries deleted.
    pub fn sweep(&self, now: SystemTime) -> usize {
        let cutoff = match now.checked_sub(self.window) {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let mut expired = 0;
        for stream in self.registry.snapshot() {
            for slot in stream.correlators() {
                expired += slot.correlator.expire_older_than(cutoff);
            }
        }
        if expired > 0 {
            EXPIRED_ENTRIES.inc_by(expired as u64);
            log::debug!("Expired {} unmatched correlator entries", expired);
        }
        expired
    }

    /// Sweeps every `period` until `shutdown` flips to `true`.
    pub async fn run(
        self,
        period: Duration,
        clock: Arc<CaptureClock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(clock.now());
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Expiry sweeper stopped");
    }
}
