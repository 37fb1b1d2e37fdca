//! Creation of streams for newly tracked connections.
//!
//! The [StreamFactory] is the reassembly engine's view of the stream layer. For every new
//! connection it applies the targeting decision. Targeted connections get a [Stream] registered
//! with the [StreamRegistry] and two direction tasks running the protocol parsers over their
//! [Reader]s. Other connections are tracked for bookkeeping only.

use super::reader::{Reader, ReaderChunk};
use super::registry::StreamRegistry;
use super::Stream;
use crate::config::StreamsConfig;
use crate::conntrack::conn_id::Flow;
use crate::conntrack::{ScatterGather, Skip, Trackable, TrackableFactory};
use crate::output::emitter::Emitter;
use crate::output::ConnectionInfo;
use crate::protocols::stream::dns::parser::parse_message;
use crate::protocols::stream::dns::DNS_PORT;
use crate::protocols::stream::{ProtocolKind, ProtocolRegistry};
use crate::stats::*;
use crate::targeting::TargetSet;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

/// Counts direction task groups still running.
#[derive(Debug, Default)]
pub struct ActiveTasks {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveTasks {
    pub fn new() -> Self {
        ActiveTasks::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once no task group is running.
    pub async fn wait_idle(&self) {
        loop {
            // registered on creation, before the count is read
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// State shared by the stream factories of every source.
#[derive(Debug)]
pub struct StreamContext {
    handle: Handle,
    targets: Arc<TargetSet>,
    registry: Arc<StreamRegistry>,
    emitter: Arc<Emitter>,
    protocols: Arc<ProtocolRegistry>,
    streams: StreamsConfig,
    max_attempts: u32,
    active: Arc<ActiveTasks>,
}

impl StreamContext {
    pub fn new(
        handle: Handle,
        targets: Arc<TargetSet>,
        registry: Arc<StreamRegistry>,
        emitter: Arc<Emitter>,
        protocols: Arc<ProtocolRegistry>,
        streams: StreamsConfig,
        max_attempts: u32,
    ) -> Self {
        StreamContext {
            handle,
            targets,
            registry,
            emitter,
            protocols,
            streams,
            max_attempts,
            active: Arc::new(ActiveTasks::new()),
        }
    }

    pub fn targets(&self) -> &Arc<TargetSet> {
        &self.targets
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn active(&self) -> &Arc<ActiveTasks> {
        &self.active
    }

    /// `true` if `flow` is DNS demultiplexed in the delivery callback.
    fn is_inline_dns(&self, flow: &Flow) -> bool {
        flow.resp.port() == DNS_PORT && self.protocols.get(ProtocolKind::Dns).is_some()
    }

    /// Creates, registers and starts the stream of a targeted connection.
    fn open(&self, flow: &Flow, is_outgoing: bool, source: &str, inline_dns: bool) -> Arc<Stream> {
        let id = self.registry.next_id();
        let connection = ConnectionInfo {
            client: flow.orig,
            server: flow.resp,
            is_outgoing,
            source: source.to_owned(),
        };
        let stream = Arc::new(Stream::new(
            id,
            connection,
            self.streams.identify_only,
            self.protocols.new_correlators(self.max_attempts),
        ));
        self.registry.insert(Arc::clone(&stream));
        log::debug!("Stream {} opened for {}", id, flow);
        if !inline_dns {
            self.spawn_readers(&stream);
        }
        stream
    }

    fn spawn_readers(&self, stream: &Arc<Stream>) {
        let capacity = self.streams.reader_queue_capacity;
        let (client_tx, client_rx) = mpsc::channel(capacity);
        let (server_tx, server_rx) = mpsc::channel(capacity);
        stream.attach(client_tx, server_tx);

        let idle = self.streams.reader_idle_timeout();
        let client = Reader::new(
            true,
            client_rx,
            idle,
            Arc::downgrade(stream),
            Arc::clone(&self.emitter),
        );
        let server = Reader::new(
            false,
            server_rx,
            idle,
            Arc::downgrade(stream),
            Arc::clone(&self.emitter),
        );

        let protocols = Arc::clone(&self.protocols);
        let registry = Arc::clone(&self.registry);
        let active = Arc::clone(&self.active);
        let stream = Arc::clone(stream);
        active.start();
        self.handle.spawn(async move {
            let client_task = tokio::spawn(dissect(Arc::clone(&protocols), client));
            let server_task = tokio::spawn(dissect(protocols, server));
            let (client_done, server_done) = tokio::join!(client_task, server_task);
            for result in [client_done, server_done] {
                if let Err(error) = result {
                    log::error!("Stream {} direction task failed: {}", stream.id(), error);
                }
            }
            registry.close(&stream);
            active.finish();
        });
    }
}

async fn dissect(protocols: Arc<ProtocolRegistry>, mut reader: Reader) {
    protocols.dissect(&mut reader).await;
}

/// Builds a [TapConn] for each new connection of one source.
#[derive(Debug)]
pub struct StreamFactory {
    ctx: Arc<StreamContext>,
    source: String,
}

impl StreamFactory {
    pub fn new(ctx: Arc<StreamContext>, source: &str) -> Self {
        StreamFactory {
            ctx,
            source: source.to_owned(),
        }
    }
}

impl TrackableFactory for StreamFactory {
    type Tracked = TapConn;

    fn new_conn(&self, flow: &Flow) -> TapConn {
        let targeting = self.ctx.targets.decide(flow);
        if !targeting.is_targeted {
            IGNORED_CONNECTIONS.inc();
            return TapConn {
                ctx: Arc::clone(&self.ctx),
                stream: None,
                inline_dns: false,
            };
        }
        TARGETED_CONNECTIONS.inc();
        let inline_dns = self.ctx.is_inline_dns(flow);
        let stream = self
            .ctx
            .open(flow, targeting.is_outgoing, &self.source, inline_dns);
        TapConn {
            ctx: Arc::clone(&self.ctx),
            stream: Some(stream),
            inline_dns,
        }
    }
}

/// Connection-side handle of a stream.
#[derive(Debug)]
pub struct TapConn {
    ctx: Arc<StreamContext>,
    /// `None` for connections that are not targeted.
    stream: Option<Arc<Stream>>,
    inline_dns: bool,
}

impl Trackable for TapConn {
    fn wants_payload(&self) -> bool {
        self.stream.is_some()
    }

    fn reassembled(&mut self, sg: &mut ScatterGather<'_>) {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return,
        };
        record_range(sg);
        if let Skip::Lost(lost) = sg.skip() {
            SKIPPED_BYTES.inc_by(lost as u64);
            DROPPED_RANGES.inc();
            log::debug!(
                "Stream {}: {} bytes lost, dropping {} bytes after the gap",
                stream.id(),
                lost,
                sg.len()
            );
            return;
        }
        if self.inline_dns {
            demux_dns(stream, sg, &self.ctx.emitter);
        } else {
            stream.feed(
                sg.dir(),
                ReaderChunk {
                    data: sg.data().to_vec(),
                    seen: sg.seen(),
                },
            );
        }
    }

    fn complete(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.ctx.registry.close(&stream);
        }
    }
}

fn record_range(sg: &ScatterGather<'_>) {
    let stats = sg.stats();
    REASSEMBLED_BYTES.inc_by(sg.len() as u64);
    OUT_OF_ORDER_BYTES.inc_by(stats.queued_bytes as u64);
    OUT_OF_ORDER_PACKETS.inc_by(stats.queued_packets as u64);
    BIGGEST_CHUNK_BYTES.record_max(sg.len() as u64);
    OVERLAP_BYTES.inc_by(stats.overlap_bytes as u64);
    OVERLAP_PACKETS.inc_by(stats.overlap_packets as u64);
    if stats.overlap_bytes > 0 && stats.overlap_packets == 0 {
        INVALID_OVERLAPS.inc();
        log::debug!(
            "Overlap of {} bytes without an overlapping segment",
            stats.overlap_bytes
        );
    }
}

/// Parses every complete length-prefixed DNS message in `sg`, keeping a trailing partial message
/// for the next range.
fn demux_dns(stream: &Stream, sg: &mut ScatterGather<'_>, emitter: &Emitter) {
    let data = sg.data();
    let mut offset = 0;
    while data.len() - offset >= 2 {
        let len = BigEndian::read_u16(&data[offset..]) as usize;
        let end = offset + 2 + len;
        if end > data.len() {
            break;
        }
        match parse_message(&data[offset + 2..end], sg.seen()) {
            Ok((key, message)) => {
                if stream.set_protocol(ProtocolKind::Dns) {
                    stream.correlate(ProtocolKind::Dns, &key, message, emitter);
                }
            }
            Err(error) => log::debug!("Stream {}: bad DNS message: {}", stream.id(), error),
        }
        offset = end;
    }
    if offset < data.len() {
        sg.keep_from(offset);
    }
}
