//! Live stream registry and the unclassified-stream sweep.

use super::Stream;
use crate::stats::{StatExt, STREAMS_TIMED_OUT};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Owns every live [Stream] by id.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: DashMap<u64, Arc<Stream>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry::default()
    }

    /// Allocates the next stream id. Ids are never reused within a registry.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, stream: Arc<Stream>) {
        self.streams.insert(stream.id(), stream);
    }

    pub fn get(&self, id: u64) -> Option<Arc<Stream>> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Live streams at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<Stream>> {
        self.streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Closes `stream` and removes it. Returns `true` for the call that performed the close.
    pub fn close(&self, stream: &Stream) -> bool {
        if !stream.close() {
            return false;
        }
        self.streams.remove(&stream.id());
        log::debug!(
            "Closed stream {} ({} -> {}, {} items)",
            stream.id(),
            stream.connection().client,
            stream.connection().server,
            stream.emitted()
        );
        true
    }

    /// Closes streams still unclassified `timeout` after their creation, as of `now`. Returns the
    /// number closed.
    pub fn close_unclassified(&self, now: Instant, timeout: Duration) -> usize {
        let mut closed = 0;
        // close outside of the map iteration, removal locks the shard
        for stream in self.snapshot() {
            if stream.protocol().is_some() || stream.is_closed() {
                continue;
            }
            if now.saturating_duration_since(stream.created_at()) < timeout {
                continue;
            }
            if self.close(&stream) {
                STREAMS_TIMED_OUT.inc();
                closed += 1;
            }
        }
        if closed > 0 {
            log::debug!("Closed {} unclassified streams", closed);
        }
        closed
    }
}

/// Periodically closes unclassified streams.
#[derive(Debug)]
pub struct RegistrySweeper {
    registry: Arc<StreamRegistry>,
    timeout: Duration,
}

impl RegistrySweeper {
    pub fn new(registry: Arc<StreamRegistry>, timeout: Duration) -> Self {
        RegistrySweeper { registry, timeout }
    }

    /// Sweeps every `period` until `shutdown` flips to `true`.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.registry.close_unclassified(Instant::now(), self.timeout);
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Registry sweeper stopped");
    }
}
