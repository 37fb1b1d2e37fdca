//! Tapwire runtime.
//!
//! The runtime owns the state shared by every capture source: the stream registry, the emitter,
//! the targeting filter and the protocol list. Direction tasks and the periodic sweeps run on a
//! tokio worker pool, while each segment source is consumed sequentially by its own connection
//! tracker on a dedicated thread.

mod offline;

pub use self::offline::{MemorySource, OfflineSource};

use crate::config::RuntimeConfig;
use crate::conntrack::pdu::CapturedFrame;
use crate::conntrack::{BufferBudget, ConnTracker};
use crate::correlate::expiry::{CaptureClock, ExpirySweeper};
use crate::output::emitter::Emitter;
use crate::output::sink::OutputSink;
use crate::output::OutputItem;
use crate::protocols::stream::ProtocolRegistry;
use crate::stream::factory::{StreamContext, StreamFactory};
use crate::stream::registry::{RegistrySweeper, StreamRegistry};
use crate::targeting::TargetSet;

use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

/// An ordered feed of captured frames.
pub trait SegmentSource: Send {
    /// Label recorded as the capture source of every stream opened from this feed.
    fn name(&self) -> &str;

    /// The next frame, or `None` once the feed is exhausted.
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, SourceError>;

    /// `true` if frame timestamps come from a recording rather than the wall clock.
    fn is_replay(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unable to open {path}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid capture format: {0}")]
    Format(String),
    #[error("capture read failed: {0}")]
    Read(String),
}

/// Intake totals of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub frames: u64,
    pub bytes: u64,
    /// Set if the source failed before it was exhausted.
    pub error: Option<String>,
}

/// Result of [Runtime::run].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sources: Vec<SourceSummary>,
    /// Streams still registered after draining.
    pub open_streams: usize,
}

impl RunSummary {
    pub fn frames(&self) -> u64 {
        self.sources.iter().map(|s| s.frames).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.sources.iter().map(|s| s.bytes).sum()
    }
}

/// The tapwire runtime.
pub struct Runtime {
    config: RuntimeConfig,
    rt: tokio::runtime::Runtime,
    ctx: Arc<StreamContext>,
    budget: Arc<BufferBudget>,
    clock: Arc<CaptureClock>,
    shutdown: watch::Sender<bool>,
}

impl Runtime {
    /// Creates a runtime from the `config` settings, the protocols to dissect, and the queue that
    /// receives matched pairs.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tapwire_core::config::default_config;
    /// use tapwire_core::output::sink::OutputSink;
    /// use tapwire_core::protocols::stream::ProtocolRegistry;
    /// use tapwire_core::{OfflineSource, Runtime, SegmentSource};
    ///
    /// let config = default_config();
    /// let sink = OutputSink::new(config.output.sink_capacity);
    /// let items = sink.receiver();
    /// let source = OfflineSource::open("trace.pcap", &config.offline).unwrap();
    /// let runtime = Runtime::new(config, ProtocolRegistry::all(), sink).unwrap();
    /// let sources: Vec<Box<dyn SegmentSource>> = vec![Box::new(source)];
    /// runtime.run(sources).unwrap();
    /// drop(runtime);
    /// for item in items.iter() {
    ///     println!("{} {}", item.stream, item.index);
    /// }
    /// ```
    pub fn new(
        config: RuntimeConfig,
        protocols: ProtocolRegistry,
        sink: OutputSink<OutputItem>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!("Initializing tapwire runtime...");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tapwire-worker")
            .build()?;

        let targets = Arc::new(TargetSet::new(config.targets.iter())?);
        let registry = Arc::new(StreamRegistry::new());
        let emitter = Arc::new(Emitter::new(sink));
        let ctx = Arc::new(StreamContext::new(
            rt.handle().clone(),
            targets,
            Arc::clone(&registry),
            emitter,
            Arc::new(protocols),
            config.streams.clone(),
            config.correlation.max_attempts,
        ));
        let budget = Arc::new(BufferBudget::new(config.assembly.max_buffered_bytes_total));
        let clock = Arc::new(CaptureClock::new());

        let (shutdown, signal) = watch::channel(false);
        let sweeper = RegistrySweeper::new(Arc::clone(&registry), config.streams.channel_timeout());
        rt.spawn(sweeper.run(config.streams.sweep_interval(), signal.clone()));
        let expiry = ExpirySweeper::new(registry, config.correlation.expiry_window());
        rt.spawn(expiry.run(config.correlation.clean_period(), Arc::clone(&clock), signal));

        log::info!("Runtime ready.");
        Ok(Runtime {
            config,
            rt,
            ctx,
            budget,
            clock,
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        self.ctx.registry()
    }

    /// The targeting filter. Replacing its targets affects connections seen afterwards.
    pub fn targets(&self) -> &Arc<TargetSet> {
        self.ctx.targets()
    }

    /// Consumes every source concurrently, one thread each, until all are exhausted.
    ///
    /// Tracked connections are drained once their source ends. Returns after every direction
    /// task has finished.
    pub fn run(&self, sources: Vec<Box<dyn SegmentSource>>) -> Result<RunSummary> {
        if sources.is_empty() {
            bail!("no segment source");
        }
        self.clock
            .set_replay(sources.iter().any(|source| source.is_replay()));

        let summaries = thread::scope(|scope| {
            let handles: Vec<_> = sources
                .into_iter()
                .map(|source| {
                    let name = source.name().to_owned();
                    let handle = thread::Builder::new()
                        .name(format!("tapwire-intake-{}", name))
                        .spawn_scoped(scope, move || self.intake(source));
                    (name, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let joined = handle
                        .map_err(|e| anyhow!(e))
                        .and_then(|h| h.join().map_err(|_| anyhow!("intake thread panicked")));
                    joined.unwrap_or_else(|e| SourceSummary {
                        name,
                        frames: 0,
                        bytes: 0,
                        error: Some(e.to_string()),
                    })
                })
                .collect::<Vec<_>>()
        });

        log::info!("Waiting for {} stream tasks", self.ctx.active().count());
        self.rt.block_on(self.ctx.active().wait_idle());

        let summary = RunSummary {
            sources: summaries,
            open_streams: self.registry().len(),
        };
        log::info!(
            "Processed {} frames, {} bytes",
            summary.frames(),
            summary.bytes()
        );
        Ok(summary)
    }

    fn intake(&self, mut source: Box<dyn SegmentSource>) -> SourceSummary {
        let factory = StreamFactory::new(Arc::clone(&self.ctx), source.name());
        let mut tracker = ConnTracker::new(&self.config.assembly, factory, Arc::clone(&self.budget));
        let mut summary = SourceSummary {
            name: source.name().to_owned(),
            frames: 0,
            bytes: 0,
            error: None,
        };
        log::info!("Intake of {} started", summary.name);
        loop {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    summary.frames += 1;
                    summary.bytes += frame.caplen as u64;
                    self.clock.observe(frame.timestamp);
                    tracker.process(&frame);
                    tracker.check_inactive();
                }
                Ok(None) => break,
                Err(error) => {
                    log::error!("Intake of {} failed: {}", summary.name, error);
                    summary.error = Some(error.to_string());
                    break;
                }
            }
        }
        log::info!(
            "Intake of {} done, draining {} connections",
            summary.name,
            tracker.size()
        );
        tracker.drain();
        summary
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::protocols::stream::ProtocolKind;
    use crate::testing::Conversation;

    fn http_frames(client: &str, server: &str) -> Vec<CapturedFrame> {
        let mut conv = Conversation::new(client, server);
        let mut frames = conv.handshake();
        frames.push(conv.client_data(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n"));
        frames.push(conv.server_data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"));
        frames.extend(conv.teardown());
        frames
    }

    #[test]
    fn sources_run_concurrently() {
        let config = default_config();
        let sink = OutputSink::new(config.output.sink_capacity);
        let items = sink.receiver();
        let runtime = Runtime::new(config, ProtocolRegistry::all(), sink).unwrap();
        let sources: Vec<Box<dyn SegmentSource>> = vec![
            Box::new(MemorySource::new(
                "one",
                http_frames("10.0.0.1:40000", "10.0.0.9:80"),
            )),
            Box::new(MemorySource::new(
                "two",
                http_frames("10.0.0.2:40000", "10.0.0.9:80"),
            )),
        ];
        let summary = runtime.run(sources).unwrap();
        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.frames(), 14);
        assert!(summary.sources.iter().all(|s| s.error.is_none()));
        assert_eq!(summary.open_streams, 0);

        let mut got: Vec<_> = items.try_iter().collect();
        got.sort_by_key(|item| item.stream);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|item| item.protocol == ProtocolKind::Http));
        assert!(got.iter().all(|item| item.index == 0));
        assert_ne!(got[0].stream, got[1].stream);
        let mut labels: Vec<_> = got.iter().map(|i| i.connection.source.clone()).collect();
        labels.sort();
        assert_eq!(labels, vec!["one", "two"]);
    }

    #[test]
    fn run_without_sources_fails() {
        let config = default_config();
        let sink = OutputSink::new(4);
        let runtime = Runtime::new(config, ProtocolRegistry::all(), sink).unwrap();
        assert!(runtime.run(vec![]).is_err());
    }
}
