//! Types for parsing and manipulating stream-level network protocols.
//!
//! The set of supported protocols is closed: [ConnParser] has one variant per protocol, and a
//! [ProtocolRegistry] is an ordered, immutable list of them built once at startup. The order is the
//! priority in which parsers try to claim an unclassified stream.

pub mod dns;
pub(crate) mod framer;
pub mod http;
pub mod kafka;

use self::dns::parser::DnsParser;
use self::http::parser::HttpParser;
use self::kafka::parser::KafkaParser;
use crate::correlate::Correlator;
use crate::output::records::{BaseEntry, Entry, Representation, ResolvedNames};
use crate::output::{OutputItem, RequestResponsePair};
use crate::stream::reader::Reader;

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Serialize;
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Identifies a registered protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProtocolKind {
    Http,
    Kafka,
    Dns,
}

impl ProtocolKind {
    /// Every protocol, in default priority order.
    pub const ALL: [ProtocolKind; 3] = [ProtocolKind::Http, ProtocolKind::Kafka, ProtocolKind::Dns];
}

/// Static description of a protocol, attached to every analyzed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub long_name: &'static str,
    pub abbreviation: &'static str,
    pub macro_name: &'static str,
    pub version: &'static str,
    pub background_color: &'static str,
    pub foreground_color: &'static str,
    pub reference_link: &'static str,
    /// Well-known server ports.
    pub ports: &'static [u16],
    /// Lower claims first.
    pub priority: u8,
}

/// Why a dissection loop ended.
#[derive(Error, Debug)]
pub enum DissectError {
    #[error("end of stream")]
    Eof,

    #[error("read failed")]
    Io(#[from] std::io::Error),

    #[error("malformed {protocol} data: {reason}")]
    Malformed {
        protocol: ProtocolKind,
        reason: String,
    },

    #[error("stream already identified as another protocol than {0}")]
    Claimed(ProtocolKind),
}

impl DissectError {
    pub(crate) fn malformed<R: ToString>(protocol: ProtocolKind, reason: R) -> Self {
        DissectError::Malformed {
            protocol,
            reason: reason.to_string(),
        }
    }
}

/// Behavior every protocol provides besides its dissection loop.
pub(crate) trait ProtocolParser {
    fn descriptor(&self) -> &'static ProtocolDescriptor;

    /// Converts a matched pair and resolved endpoint names into a normalized record.
    fn analyze(&self, item: &OutputItem, names: &ResolvedNames) -> Entry {
        Entry::new(self.descriptor(), item, names)
    }

    /// Produces the compact index record of `entry`.
    fn summarize(&self, entry: &Entry) -> BaseEntry;

    /// Human-readable sections of the request and response.
    fn represent(&self, pair: &RequestResponsePair) -> Representation;

    /// Query macro expansions.
    fn macros(&self) -> HashMap<&'static str, &'static str>;
}

/// A connection protocol parser.
#[derive(Debug, Clone, Copy, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ConnParser {
    Http(HttpParser),
    Kafka(KafkaParser),
    Dns(DnsParser),
}

impl ConnParser {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ConnParser::Http(_) => ProtocolKind::Http,
            ConnParser::Kafka(_) => ProtocolKind::Kafka,
            ConnParser::Dns(_) => ProtocolKind::Dns,
        }
    }

    pub fn descriptor(&self) -> &'static ProtocolDescriptor {
        match self {
            ConnParser::Http(parser) => parser.descriptor(),
            ConnParser::Kafka(parser) => parser.descriptor(),
            ConnParser::Dns(parser) => parser.descriptor(),
        }
    }

    pub fn analyze(&self, item: &OutputItem, names: &ResolvedNames) -> Entry {
        match self {
            ConnParser::Http(parser) => parser.analyze(item, names),
            ConnParser::Kafka(parser) => parser.analyze(item, names),
            ConnParser::Dns(parser) => parser.analyze(item, names),
        }
    }

    pub fn summarize(&self, entry: &Entry) -> BaseEntry {
        match self {
            ConnParser::Http(parser) => parser.summarize(entry),
            ConnParser::Kafka(parser) => parser.summarize(entry),
            ConnParser::Dns(parser) => parser.summarize(entry),
        }
    }

    pub fn represent(&self, pair: &RequestResponsePair) -> Representation {
        match self {
            ConnParser::Http(parser) => parser.represent(pair),
            ConnParser::Kafka(parser) => parser.represent(pair),
            ConnParser::Dns(parser) => parser.represent(pair),
        }
    }

    pub fn macros(&self) -> HashMap<&'static str, &'static str> {
        match self {
            ConnParser::Http(parser) => parser.macros(),
            ConnParser::Kafka(parser) => parser.macros(),
            ConnParser::Dns(parser) => parser.macros(),
        }
    }

    /// A fresh, empty correlator for this protocol.
    pub fn new_correlator(&self, max_attempts: u32) -> Correlator {
        Correlator::new(self.kind(), max_attempts)
    }

    /// Runs the dissection loop over `reader` until the data ends or stops parsing.
    pub async fn dissect(&self, reader: &mut Reader) -> Result<(), DissectError> {
        match self {
            ConnParser::Http(parser) => parser.dissect(reader).await,
            ConnParser::Kafka(parser) => parser.dissect(reader).await,
            ConnParser::Dns(parser) => parser.dissect(reader).await,
        }
    }
}

/// The ordered set of protocol parsers.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry(Vec<ConnParser>);

impl ProtocolRegistry {
    /// Every supported protocol, in priority order.
    pub fn all() -> Self {
        ProtocolRegistry(vec![
            ConnParser::Http(HttpParser),
            ConnParser::Kafka(KafkaParser),
            ConnParser::Dns(DnsParser),
        ])
    }

    /// Builds a registry from protocol names. Priority follows the protocol descriptors, not the
    /// order of `names`.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsers: Vec<ConnParser> = vec![];
        for name in names {
            let name = name.as_ref().trim().to_lowercase();
            match ConnParser::from_str(&name) {
                Ok(parser) => {
                    if !parsers.iter().any(|p| p.kind() == parser.kind()) {
                        parsers.push(parser);
                    }
                }
                Err(_) => bail!("Unknown application-layer protocol {:?}", name),
            }
        }
        if parsers.is_empty() {
            bail!("No application-layer protocol registered");
        }
        parsers.sort_by_key(|parser| parser.descriptor().priority);
        Ok(ProtocolRegistry(parsers))
    }

    pub fn parsers(&self) -> &[ConnParser] {
        &self.0
    }

    pub fn get(&self, kind: ProtocolKind) -> Option<&ConnParser> {
        self.0.iter().find(|parser| parser.kind() == kind)
    }

    /// One correlator per registered protocol, in priority order.
    pub fn new_correlators(&self, max_attempts: u32) -> Vec<Correlator> {
        self.0
            .iter()
            .map(|parser| parser.new_correlator(max_attempts))
            .collect()
    }

    /// Query macros of every registered protocol.
    pub fn macros(&self) -> HashMap<&'static str, &'static str> {
        self.0.iter().flat_map(|parser| parser.macros()).collect()
    }

    /// Offers `reader` to each parser in priority order until one claims it.
    ///
    /// A parser that fails before its protocol is set on the stream hands the recorded bytes to the
    /// next one. Once the stream is classified, by this direction or the peer, only the matching
    /// parser runs, from the start of the recorded bytes. Its failure ends the direction.
    pub async fn dissect(&self, reader: &mut Reader) {
        let side = if reader.is_client() { "client" } else { "server" };
        for parser in self.0.iter() {
            if reader.protocol().is_some() {
                break;
            }
            let kind = parser.kind();
            match parser.dissect(reader).await {
                Ok(()) => return,
                Err(error) => {
                    if reader.protocol() == Some(kind) {
                        log::debug!("{} dissection of {} side ended: {}", kind, side, error);
                        return;
                    }
                    log::trace!("{} does not match {} side: {}", kind, side, error);
                    reader.rewind();
                }
            }
        }
        match reader.protocol().and_then(|claimed| self.get(claimed)) {
            Some(parser) => {
                if let Err(error) = parser.dissect(reader).await {
                    log::debug!("{} dissection of {} side ended: {}", parser.kind(), side, error);
                }
            }
            None => log::debug!("No parser claimed the {} side", side),
        }
    }
}
