//! Parsed DNS messages.

use dns_parser::{Packet, Question, RData, ResourceRecord};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsQuery {
    pub transaction_id: u16,
    pub num_questions: u16,
    pub recursion_desired: bool,
    pub queries: Vec<DnsQuestion>,
}

impl DnsQuery {
    /// Name of the first question, or `""` if there is none.
    pub fn domain(&self) -> &str {
        self.queries.first().map_or("", |q| q.name.as_str())
    }
}

impl From<&Packet<'_>> for DnsQuery {
    fn from(pkt: &Packet<'_>) -> Self {
        DnsQuery {
            transaction_id: pkt.header.id,
            num_questions: pkt.header.questions,
            recursion_desired: pkt.header.recursion_desired,
            queries: pkt.questions.iter().map(DnsQuestion::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: String,
    pub qclass: String,
}

impl From<&Question<'_>> for DnsQuestion {
    fn from(q: &Question<'_>) -> Self {
        DnsQuestion {
            name: q.qname.to_string(),
            qtype: format!("{:?}", q.qtype),
            qclass: format!("{:?}", q.qclass),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsResponse {
    pub transaction_id: u16,
    pub response_code: String,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_available: bool,
    pub num_answers: u16,
    /// Questions echoed by the server.
    pub queries: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    /// Authority section.
    pub nameservers: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl From<&Packet<'_>> for DnsResponse {
    fn from(pkt: &Packet<'_>) -> Self {
        let records = |section: &[ResourceRecord<'_>]| -> Vec<DnsRecord> {
            section.iter().map(DnsRecord::from).collect()
        };
        DnsResponse {
            transaction_id: pkt.header.id,
            response_code: format!("{:?}", pkt.header.response_code),
            authoritative: pkt.header.authoritative,
            truncated: pkt.header.truncated,
            recursion_available: pkt.header.recursion_available,
            num_answers: pkt.header.answers,
            queries: pkt.questions.iter().map(DnsQuestion::from).collect(),
            answers: records(&pkt.answers),
            nameservers: records(&pkt.nameservers),
            additionals: records(&pkt.additional),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl From<&ResourceRecord<'_>> for DnsRecord {
    fn from(rr: &ResourceRecord<'_>) -> Self {
        DnsRecord {
            name: rr.name.to_string(),
            ttl: rr.ttl,
            data: RecordData::from(&rr.data),
        }
    }
}

/// Record contents. Types without a dedicated variant keep only their type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum RecordData {
    A(String),
    Aaaa(String),
    Cname(String),
    Ns(String),
    Ptr(String),
    Txt(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Soa {
        primary_ns: String,
        mailbox: String,
        serial: u32,
        minimum_ttl: u32,
    },
    Other(String),
}

impl From<&RData<'_>> for RecordData {
    fn from(data: &RData<'_>) -> Self {
        match data {
            RData::A(addr) => RecordData::A(addr.0.to_string()),
            RData::AAAA(addr) => RecordData::Aaaa(addr.0.to_string()),
            RData::CNAME(name) => RecordData::Cname(name.0.to_string()),
            RData::NS(name) => RecordData::Ns(name.0.to_string()),
            RData::PTR(name) => RecordData::Ptr(name.0.to_string()),
            RData::TXT(txt) => RecordData::Txt(
                txt.iter()
                    .map(String::from_utf8_lossy)
                    .collect::<Vec<_>>()
                    .concat(),
            ),
            RData::MX(mx) => RecordData::Mx {
                preference: mx.preference,
                exchange: mx.exchange.to_string(),
            },
            RData::SRV(srv) => RecordData::Srv {
                priority: srv.priority,
                weight: srv.weight,
                port: srv.port,
                target: srv.target.to_string(),
            },
            RData::SOA(soa) => RecordData::Soa {
                primary_ns: soa.primary_ns.to_string(),
                mailbox: soa.mailbox.to_string(),
                serial: soa.serial,
                minimum_ttl: soa.minimum_ttl,
            },
            other => {
                let rendered = format!("{:?}", other);
                let kind = rendered.split('(').next().unwrap_or_default();
                RecordData::Other(kind.to_owned())
            }
        }
    }
}

impl std::fmt::Display for RecordData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordData::A(s)
            | RecordData::Aaaa(s)
            | RecordData::Cname(s)
            | RecordData::Ns(s)
            | RecordData::Ptr(s)
            | RecordData::Txt(s) => write!(f, "{}", s),
            RecordData::Mx {
                preference,
                exchange,
            } => write!(f, "{} {}", preference, exchange),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{} {} {} {}", priority, weight, port, target),
            RecordData::Soa {
                primary_ns,
                mailbox,
                serial,
                ..
            } => write!(f, "{} {} {}", primary_ns, mailbox, serial),
            RecordData::Other(kind) => write!(f, "<{}>", kind),
        }
    }
}
