//! Passive request/response observability for TCP traffic.
//!
//! Tapwire reassembles captured TCP segments into per-direction byte streams, recognizes the
//! application protocol spoken on each targeted connection, and pairs every request with its
//! response. Matched pairs leave the core as [OutputItem](output::OutputItem)s on a bounded
//! [OutputSink](output::sink::OutputSink), where a consumer turns them into normalized records
//! with the protocol's `analyze` and `summarize` operations.
//!
//! The pipeline, from capture to output:
//!
//! - A [SegmentSource] hands frames to a per-source [ConnTracker](conntrack::ConnTracker), which
//!   admits, reorders and reassembles them.
//! - The [targeting](targeting) filter decides which connections get a
//!   [Stream](stream::Stream). All others are tracked for bookkeeping only.
//! - Two [Reader](stream::reader::Reader)s per stream feed the protocol parsers, which classify
//!   the stream and register parsed messages with its [Correlator](correlate::Correlator).
//! - Matched pairs are sequenced per stream by the [Emitter](output::emitter::Emitter).
//!
//! ```rust,no_run
//! use tapwire_core::config::default_config;
//! use tapwire_core::output::sink::OutputSink;
//! use tapwire_core::protocols::stream::ProtocolRegistry;
//! use tapwire_core::{OfflineSource, Runtime, SegmentSource};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = default_config();
//!     let sink = OutputSink::new(config.output.sink_capacity);
//!     let items = sink.receiver();
//!     let pcap = OfflineSource::open("trace.pcap", &config.offline)?;
//!     let runtime = Runtime::new(config, ProtocolRegistry::all(), sink)?;
//!     let sources: Vec<Box<dyn SegmentSource>> = vec![Box::new(pcap)];
//!     runtime.run(sources)?;
//!     drop(runtime);
//!     for item in items.iter() {
//!         println!("stream {} #{}: {}", item.stream, item.index, item.protocol);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conntrack;
pub mod correlate;
pub mod output;
pub mod protocols;
mod runtime;
pub mod stats;
pub mod stream;
pub mod targeting;

#[cfg(test)]
pub(crate) mod testing;

pub use self::conntrack::conn_id::{ConnId, Flow};
pub use self::conntrack::pdu::{CapturedFrame, LinkType};
pub use self::runtime::{
    MemorySource, OfflineSource, RunSummary, Runtime, SegmentSource, SourceError, SourceSummary,
};
