//! DNS over TCP parsing.
//!
//! Streams on port 53 are demultiplexed inline by the reassembly callback with
//! [parse_message](parser::parse_message). DNS on other ports is found by the regular dissection
//! loop.

pub mod parser;
mod transaction;

pub use self::transaction::*;

use self::parser::DnsParser;
use crate::output::records::{BaseEntry, Entry, Representation, Section};
use crate::output::{MessageData, RequestResponsePair};
use crate::protocols::stream::{ProtocolDescriptor, ProtocolParser};

use std::collections::HashMap;

use maplit::hashmap;

/// Server port of DNS streams demultiplexed inline.
pub const DNS_PORT: u16 = 53;

pub static DNS: ProtocolDescriptor = ProtocolDescriptor {
    name: "dns",
    long_name: "Domain Name System",
    abbreviation: "DNS",
    macro_name: "dns",
    version: "0",
    background_color: "#606060",
    foreground_color: "#ffffff",
    reference_link: "https://datatracker.ietf.org/doc/html/rfc1035",
    ports: &[DNS_PORT],
    priority: 4,
};

impl ProtocolParser for DnsParser {
    fn descriptor(&self) -> &'static ProtocolDescriptor {
        &DNS
    }

    fn summarize(&self, entry: &Entry) -> BaseEntry {
        BaseEntry::new(
            entry,
            entry.request_str(&["queries", "0", "qtype"]),
            entry.request_str(&["queries", "0", "name"]),
        )
        .with_status(None, "response.response_code")
    }

    fn represent(&self, pair: &RequestResponsePair) -> Representation {
        let mut repr = Representation::default();
        if let MessageData::DnsQuery(query) = &pair.request.payload {
            repr.push_request(
                Section::new("Details")
                    .row("Transaction ID", query.transaction_id, "request.transaction_id")
                    .row(
                        "Recursion Desired",
                        query.recursion_desired,
                        "request.recursion_desired",
                    ),
            );
            let questions = query
                .queries
                .iter()
                .fold(Section::new("Questions"), |section, q| {
                    section.row(&q.qtype, &q.name, "request.queries")
                });
            repr.push_request(questions);
        }
        if let MessageData::DnsResponse(response) = &pair.response.payload {
            repr.push_response(
                Section::new("Details")
                    .row("Code", &response.response_code, "response.response_code")
                    .row(
                        "Authoritative",
                        response.authoritative,
                        "response.authoritative",
                    )
                    .row(
                        "Recursion Available",
                        response.recursion_available,
                        "response.recursion_available",
                    ),
            );
            for (title, records, selector) in [
                ("Answers", &response.answers, "response.answers"),
                ("Authorities", &response.nameservers, "response.nameservers"),
                ("Additionals", &response.additionals, "response.additionals"),
            ] {
                let section = records.iter().fold(Section::new(title), |section, record| {
                    section.row(&record.name, &record.data, selector)
                });
                repr.push_response(section);
            }
        }
        repr
    }

    fn macros(&self) -> HashMap<&'static str, &'static str> {
        hashmap! {
            "dns" => "proto.name == \"dns\"",
        }
    }
}
