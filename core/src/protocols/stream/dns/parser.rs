//! DNS over TCP.
//!
//! Every message is preceded by its two-byte big-endian length. Messages are decoded with the
//! [dns-parser](https://docs.rs/dns-parser/latest/dns_parser/) crate and correlated by transaction
//! id. Whether a message is a query or a response is read from its header, not from the direction
//! it travels in.

use super::transaction::{DnsQuery, DnsResponse};
use crate::output::{Message, MessageData};
use crate::protocols::stream::framer::Framer;
use crate::protocols::stream::{DissectError, ProtocolKind};
use crate::stream::reader::Reader;

use std::time::SystemTime;

use byteorder::{BigEndian, ByteOrder};
use dns_parser::Packet;

/// Size of a DNS header, the smallest valid message.
pub(crate) const DNS_HEADER_LEN: usize = 12;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DnsParser;

impl DnsParser {
    pub(crate) async fn dissect(&self, reader: &mut Reader) -> Result<(), DissectError> {
        let mut framer = Framer::new(reader);
        let mut identified = false;
        loop {
            let len = BigEndian::read_u16(&framer.take(2).await?) as usize;
            if len < DNS_HEADER_LEN {
                return Err(DissectError::malformed(
                    ProtocolKind::Dns,
                    format!("message of {} bytes", len),
                ));
            }
            let data = framer.take(len).await?;
            let seen = framer.reader().last_seen();
            let (key, message) = parse_message(&data, seen)
                .map_err(|error| DissectError::malformed(ProtocolKind::Dns, error))?;
            if !identified {
                if !framer.reader().identify(ProtocolKind::Dns) {
                    return Err(DissectError::Claimed(ProtocolKind::Dns));
                }
                identified = true;
            }
            framer.reader().register(ProtocolKind::Dns, &key, message);
        }
    }
}

/// Decodes one DNS message into its correlation key and contents. `data` excludes the length
/// prefix.
pub(crate) fn parse_message(
    data: &[u8],
    seen: SystemTime,
) -> Result<(String, Message), dns_parser::Error> {
    let pkt = Packet::parse(data)?;
    let key = pkt.header.id.to_string();
    let (is_request, payload) = if pkt.header.query {
        (true, MessageData::DnsQuery(DnsQuery::from(&pkt)))
    } else {
        (false, MessageData::DnsResponse(DnsResponse::from(&pkt)))
    };
    let message = Message {
        is_request,
        capture_time: seen,
        captured_size: data.len() + 2,
        payload,
    };
    Ok((key, message))
}

/// Encodes a minimal message with one question and, for responses, one A record answer.
#[cfg(test)]
pub(crate) fn test_message(id: u16, response: bool) -> Vec<u8> {
    let mut msg = vec![];
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(if response { &[0x81, 0x80] } else { &[0x01, 0x00] });
    msg.extend_from_slice(&[0, 1, 0, u8::from(response), 0, 0, 0, 0]);
    let qname = [7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0];
    msg.extend_from_slice(&qname);
    msg.extend_from_slice(&[0, 1, 0, 1]);
    if response {
        // compressed pointer to the question name, type A, class IN, ttl 60, 4 bytes
        msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 93, 184, 216, 34]);
    }
    msg
}

/// Prefixes `msg` with its two-byte length.
#[cfg(test)]
pub(crate) fn framed(msg: &[u8]) -> Vec<u8> {
    let mut out = (msg.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(msg);
    out
}
