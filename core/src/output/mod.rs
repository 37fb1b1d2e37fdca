//! Items handed to downstream consumers.
//!
//! Every matched request/response pair becomes one [OutputItem]. Items are identified by their
//! stream id and a per-stream index assigned by the [Emitter](emitter::Emitter) at the moment the
//! item enters the [OutputSink](sink::OutputSink).

pub mod emitter;
pub mod records;
pub mod sink;

use crate::protocols::stream::dns::{DnsQuery, DnsResponse};
use crate::protocols::stream::http::{HttpRequest, HttpResponse};
use crate::protocols::stream::kafka::{KafkaRequest, KafkaResponse};
use crate::protocols::stream::ProtocolKind;

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Endpoints of a stream, as seen by the targeting decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub client: SocketAddr,
    pub server: SocketAddr,
    /// Traffic leaves the targeted endpoint.
    pub is_outgoing: bool,
    /// Name of the segment source that captured the stream.
    pub source: String,
}

/// Protocol-specific content of one half of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageData {
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    KafkaRequest(KafkaRequest),
    KafkaResponse(KafkaResponse),
    DnsQuery(DnsQuery),
    DnsResponse(DnsResponse),
}

impl MessageData {
    /// The protocol-specific content alone, without the variant tag.
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            MessageData::HttpRequest(inner) => serde_json::to_value(inner),
            MessageData::HttpResponse(inner) => serde_json::to_value(inner),
            MessageData::KafkaRequest(inner) => serde_json::to_value(inner),
            MessageData::KafkaResponse(inner) => serde_json::to_value(inner),
            MessageData::DnsQuery(inner) => serde_json::to_value(inner),
            MessageData::DnsResponse(inner) => serde_json::to_value(inner),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// One half of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub is_request: bool,
    /// Capture time of the segment the message was read from.
    pub capture_time: SystemTime,
    /// Bytes the message occupied on the wire.
    pub captured_size: usize,
    pub payload: MessageData,
}

/// A matched request and response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestResponsePair {
    pub request: Message,
    pub response: Message,
}

impl RequestResponsePair {
    /// Response capture time minus request capture time, floored at zero.
    pub fn elapsed(&self) -> Duration {
        self.response
            .capture_time
            .duration_since(self.request.capture_time)
            .unwrap_or(Duration::ZERO)
    }
}

/// The unit of output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputItem {
    /// Id of the originating stream.
    pub stream: u64,
    /// Emission sequence number within the stream.
    pub index: u64,
    pub protocol: ProtocolKind,
    /// Request capture time.
    pub timestamp: SystemTime,
    pub elapsed: Duration,
    pub connection: ConnectionInfo,
    pub pair: RequestResponsePair,
}
