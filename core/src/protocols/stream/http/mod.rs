//! HTTP/1.x exchange parsing.
//!
//! Requests and responses are parsed in full, including bodies framed by `Content-Length` or
//! chunked transfer encoding. Body contents are captured up to a fixed limit. A `101 Switching
//! Protocols` response or a body delimited by connection close ends dissection of the stream.

pub mod parser;
mod transaction;

pub use self::transaction::{HttpBody, HttpHeader, HttpRequest, HttpResponse};

use self::parser::HttpParser;
use crate::output::records::{BaseEntry, Entry, Representation, Section};
use crate::output::{MessageData, RequestResponsePair};
use crate::protocols::stream::{ProtocolDescriptor, ProtocolParser};

use std::collections::HashMap;

use maplit::hashmap;

pub static HTTP11: ProtocolDescriptor = ProtocolDescriptor {
    name: "http",
    long_name: "Hypertext Transfer Protocol -- HTTP/1.1",
    abbreviation: "HTTP",
    macro_name: "http",
    version: "1.1",
    background_color: "#205cf5",
    foreground_color: "#ffffff",
    reference_link: "https://datatracker.ietf.org/doc/html/rfc2616",
    ports: &[80, 8080],
    priority: 0,
};

impl ProtocolParser for HttpParser {
    fn descriptor(&self) -> &'static ProtocolDescriptor {
        &HTTP11
    }

    fn summarize(&self, entry: &Entry) -> BaseEntry {
        let status = entry.response_str(&["status_code"]).parse().ok();
        BaseEntry::new(
            entry,
            entry.request_str(&["method"]),
            entry.request_str(&["uri"]),
        )
        .with_status(status, "response.status_code")
    }

    fn represent(&self, pair: &RequestResponsePair) -> Representation {
        let mut repr = Representation::default();
        if let MessageData::HttpRequest(request) = &pair.request.payload {
            let mut details = Section::new("Details")
                .row("Method", &request.method, "request.method")
                .row("Path", &request.uri, "request.uri")
                .row("Version", &request.version, "request.version");
            if let Some(host) = &request.host {
                details = details.row("Host", host, "request.host");
            }
            details = details.row("Body Size (bytes)", request.body.size, "request.body.size");
            repr.push_request(details);
            repr.push_request(headers(&request.headers, "request"));
            repr.push_request(body(&request.body, "request"));
        }
        if let MessageData::HttpResponse(response) = &pair.response.payload {
            let details = Section::new("Details")
                .row("Status", response.status_code, "response.status_code")
                .row("Status Text", &response.status_msg, "response.status_msg")
                .row("Version", &response.version, "response.version")
                .row(
                    "Body Size (bytes)",
                    response.body.size,
                    "response.body.size",
                );
            repr.push_response(details);
            repr.push_response(headers(&response.headers, "response"));
            repr.push_response(body(&response.body, "response"));
        }
        repr
    }

    fn macros(&self) -> HashMap<&'static str, &'static str> {
        hashmap! {
            "http" => "proto.name == \"http\"",
        }
    }
}

fn headers(headers: &[HttpHeader], half: &str) -> Section {
    headers.iter().fold(Section::new("Headers"), |section, header| {
        let selector = format!("{}.headers[\"{}\"]", half, header.name);
        section.row(&header.name, &header.value, &selector)
    })
}

fn body(body: &HttpBody, half: &str) -> Section {
    let section = Section::new("Body");
    if body.size == 0 {
        return section;
    }
    let mut content = body.content.clone();
    if body.truncated {
        content.push_str(" [truncated]");
    }
    section.row("Content", content, &format!("{}.body.content", half))
}
