//! Kafka request/response parsing.

pub mod parser;
mod transaction;

pub use self::transaction::{KafkaRequest, KafkaResponse};

use self::parser::KafkaParser;
use crate::output::records::{BaseEntry, Entry, Representation, Section};
use crate::output::{MessageData, RequestResponsePair};
use crate::protocols::stream::{ProtocolDescriptor, ProtocolParser};

use std::collections::HashMap;

use maplit::hashmap;

pub static KAFKA: ProtocolDescriptor = ProtocolDescriptor {
    name: "kafka",
    long_name: "Apache Kafka Protocol",
    abbreviation: "KAFKA",
    macro_name: "kafka",
    version: "12",
    background_color: "#000000",
    foreground_color: "#ffffff",
    reference_link: "https://kafka.apache.org/protocol",
    ports: &[9092],
    priority: 2,
};

impl ProtocolParser for KafkaParser {
    fn descriptor(&self) -> &'static ProtocolDescriptor {
        &KAFKA
    }

    fn summarize(&self, entry: &Entry) -> BaseEntry {
        BaseEntry::new(
            entry,
            entry.request_str(&["api_name"]),
            entry.request_str(&["client_id"]),
        )
    }

    fn represent(&self, pair: &RequestResponsePair) -> Representation {
        let mut repr = Representation::default();
        if let MessageData::KafkaRequest(request) = &pair.request.payload {
            let mut details = Section::new("Details")
                .row("API", &request.api_name, "request.api_name")
                .row("API Version", request.api_version, "request.api_version")
                .row(
                    "Correlation ID",
                    request.correlation_id,
                    "request.correlation_id",
                );
            if let Some(client_id) = &request.client_id {
                details = details.row("Client ID", client_id, "request.client_id");
            }
            repr.push_request(details.row("Size", request.size, "request.size"));
        }
        if let MessageData::KafkaResponse(response) = &pair.response.payload {
            repr.push_response(
                Section::new("Details")
                    .row(
                        "Correlation ID",
                        response.correlation_id,
                        "response.correlation_id",
                    )
                    .row("Size", response.size, "response.size")
                    .row("Payload", &response.payload, "response.payload"),
            );
        }
        repr
    }

    fn macros(&self) -> HashMap<&'static str, &'static str> {
        hashmap! {
            "kafka" => "proto.name == \"kafka\"",
        }
    }
}
