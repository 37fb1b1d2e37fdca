//! Normalized records derived from output items.
//!
//! An [Entry] is the full, protocol-tagged record of one exchange. A [BaseEntry] is its compact
//! index form and a [Representation] its human-readable form.

use super::OutputItem;
use crate::protocols::stream::ProtocolDescriptor;

use std::net::SocketAddr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Names resolved for the endpoints of an item, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedNames {
    pub source: Option<String>,
    pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub name: Option<String>,
}

impl Endpoint {
    fn new(addr: SocketAddr, name: Option<String>) -> Self {
        Endpoint {
            ip: addr.ip().to_string(),
            port: addr.port(),
            name,
        }
    }
}

/// Full record of one request/response exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    /// `<stream>-<index>`, unique per run.
    pub id: String,
    pub stream: u64,
    pub index: u64,
    pub protocol: ProtocolDescriptor,
    pub capture_source: String,
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub outgoing: bool,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub request_size: usize,
    pub response_size: usize,
    pub elapsed_ms: u64,
}

impl Entry {
    pub(crate) fn new(
        descriptor: &ProtocolDescriptor,
        item: &OutputItem,
        names: &ResolvedNames,
    ) -> Self {
        let pair = &item.pair;
        Entry {
            id: format!("{}-{}", item.stream, item.index),
            stream: item.stream,
            index: item.index,
            protocol: descriptor.clone(),
            capture_source: item.connection.source.clone(),
            timestamp: to_utc(item.timestamp),
            start_time: to_utc(pair.request.capture_time),
            source: Endpoint::new(item.connection.client, names.source.clone()),
            destination: Endpoint::new(item.connection.server, names.destination.clone()),
            outgoing: item.connection.is_outgoing,
            request: pair.request.payload.to_json(),
            response: pair.response.payload.to_json(),
            request_size: pair.request.captured_size,
            response_size: pair.response.captured_size,
            elapsed_ms: u64::try_from(item.elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// String field at `path` of the request record, empty if absent.
    pub fn request_str(&self, path: &[&str]) -> String {
        lookup(&self.request, path)
            .map(display_value)
            .unwrap_or_default()
    }

    /// String field at `path` of the response record, empty if absent.
    pub fn response_str(&self, path: &[&str]) -> String {
        lookup(&self.response, path)
            .map(display_value)
            .unwrap_or_default()
    }
}

fn to_utc(ts: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(ts)
}

fn lookup<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    path.iter().try_fold(value, |value, key| match value {
        serde_json::Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => value.get(key),
    })
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compact index record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseEntry {
    pub id: String,
    pub protocol: &'static str,
    pub method: String,
    pub summary: String,
    /// Numeric status, where the protocol has one.
    pub status: Option<u16>,
    /// Query path of the status field.
    pub status_query: String,
    pub elapsed_ms: u64,
    pub outgoing: bool,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub timestamp: DateTime<Utc>,
}

impl BaseEntry {
    pub(crate) fn new(entry: &Entry, method: String, summary: String) -> Self {
        BaseEntry {
            id: entry.id.clone(),
            protocol: entry.protocol.abbreviation,
            method,
            summary,
            status: None,
            status_query: String::new(),
            elapsed_ms: entry.elapsed_ms,
            outgoing: entry.outgoing,
            source: entry.source.clone(),
            destination: entry.destination.clone(),
            timestamp: entry.timestamp,
        }
    }

    pub(crate) fn with_status(mut self, status: Option<u16>, query: &str) -> Self {
        self.status = status;
        self.status_query = query.to_owned();
        self
    }
}

/// A labeled value in a representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub name: String,
    pub value: String,
    /// Query path selecting this value.
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub title: String,
    pub rows: Vec<Row>,
}

impl Section {
    pub(crate) fn new(title: &str) -> Self {
        Section {
            title: title.to_owned(),
            rows: vec![],
        }
    }

    pub(crate) fn row<V: ToString>(mut self, name: &str, value: V, selector: &str) -> Self {
        self.rows.push(Row {
            name: name.to_owned(),
            value: value.to_string(),
            selector: selector.to_owned(),
        });
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Human-readable sections of both halves of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Representation {
    pub request: Vec<Section>,
    pub response: Vec<Section>,
}

impl Representation {
    pub(crate) fn push_request(&mut self, section: Section) {
        if !section.is_empty() {
            self.request.push(section);
        }
    }

    pub(crate) fn push_response(&mut self, section: Section) {
        if !section.is_empty() {
            self.response.push(section);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let value = serde_json::json!({
            "method": "GET",
            "headers": [{"name": "Host", "value": "example.com"}],
            "status": 200,
        });
        assert_eq!(lookup(&value, &["method"]).map(display_value).unwrap(), "GET");
        assert_eq!(
            lookup(&value, &["headers", "0", "value"]).map(display_value).unwrap(),
            "example.com"
        );
        assert_eq!(lookup(&value, &["status"]).map(display_value).unwrap(), "200");
        assert!(lookup(&value, &["missing", "x"]).is_none());
    }
}
