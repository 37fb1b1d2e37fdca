//! Kafka wire protocol framing.
//!
//! Every request and response is a 4-byte big-endian size followed by that many bytes. Requests
//! travel client to server and responses server to client. Both carry the correlation id chosen by
//! the client, which pairs them. Only headers are decoded; a hex preview of each body is kept.

use super::transaction::{KafkaRequest, KafkaResponse, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};
use crate::output::{Message, MessageData};
use crate::protocols::stream::framer::Framer;
use crate::protocols::stream::{DissectError, ProtocolKind};
use crate::stream::reader::Reader;

use byteorder::{BigEndian, ByteOrder};

/// Largest frame accepted.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// Body bytes kept per message.
const PREVIEW_LEN: usize = 64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KafkaParser;

impl KafkaParser {
    pub(crate) async fn dissect(&self, reader: &mut Reader) -> Result<(), DissectError> {
        let mut framer = Framer::new(reader);
        let mut identified = false;
        loop {
            let message = if framer.reader().is_client() {
                read_request(&mut framer).await?
            } else {
                read_response(&mut framer).await?
            };
            // only a complete frame identifies the stream
            if !identified {
                if !framer.reader().identify(ProtocolKind::Kafka) {
                    return Err(DissectError::Claimed(ProtocolKind::Kafka));
                }
                identified = true;
            }
            let key = match &message.payload {
                MessageData::KafkaRequest(request) => request.correlation_id,
                MessageData::KafkaResponse(response) => response.correlation_id,
                _ => continue,
            };
            framer
                .reader()
                .register(ProtocolKind::Kafka, &key.to_string(), message);
        }
    }
}

fn malformed(reason: String) -> DissectError {
    DissectError::malformed(ProtocolKind::Kafka, reason)
}

async fn read_size(framer: &mut Framer<'_>, min: usize) -> Result<usize, DissectError> {
    let size = BigEndian::read_i32(&framer.take(4).await?);
    match usize::try_from(size) {
        Ok(size) if (min..=MAX_FRAME_SIZE).contains(&size) => Ok(size),
        _ => Err(malformed(format!("frame size {}", size))),
    }
}

async fn read_request(framer: &mut Framer<'_>) -> Result<Message, DissectError> {
    let size = read_size(framer, REQUEST_HEADER_LEN).await?;
    let header = framer.take(REQUEST_HEADER_LEN).await?;
    let seen = framer.reader().last_seen();
    let (mut request, client_id_len) = KafkaRequest::parse_header(size, &header).map_err(malformed)?;
    let mut remaining = size - REQUEST_HEADER_LEN;
    if let Ok(len) = usize::try_from(client_id_len) {
        let client_id = framer.take(len).await?;
        request.client_id = Some(String::from_utf8_lossy(&client_id).into_owned());
        remaining -= len;
    }
    let mut preview = vec![];
    framer.read_body(remaining, PREVIEW_LEN, &mut preview).await?;
    request.payload = hex::encode(preview);
    Ok(Message {
        is_request: true,
        capture_time: seen,
        captured_size: size + 4,
        payload: MessageData::KafkaRequest(request),
    })
}

async fn read_response(framer: &mut Framer<'_>) -> Result<Message, DissectError> {
    let size = read_size(framer, RESPONSE_HEADER_LEN).await?;
    let header = framer.take(RESPONSE_HEADER_LEN).await?;
    let seen = framer.reader().last_seen();
    let mut response = KafkaResponse::parse_header(size, &header).map_err(malformed)?;
    let mut preview = vec![];
    framer
        .read_body(size - RESPONSE_HEADER_LEN, PREVIEW_LEN, &mut preview)
        .await?;
    response.payload = hex::encode(preview);
    Ok(Message {
        is_request: false,
        capture_time: seen,
        captured_size: size + 4,
        payload: MessageData::KafkaResponse(response),
    })
}

/// Encodes a request frame with a client id and `body`.
#[cfg(test)]
pub(crate) fn request_frame(api_key: i16, correlation_id: i32, client_id: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![];
    frame.extend_from_slice(&api_key.to_be_bytes());
    frame.extend_from_slice(&1i16.to_be_bytes());
    frame.extend_from_slice(&correlation_id.to_be_bytes());
    frame.extend_from_slice(&(client_id.len() as i16).to_be_bytes());
    frame.extend_from_slice(client_id.as_bytes());
    frame.extend_from_slice(body);
    let mut out = (frame.len() as i32).to_be_bytes().to_vec();
    out.extend(frame);
    out
}

/// Encodes a response frame.
#[cfg(test)]
pub(crate) fn response_frame(correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 4) as i32).to_be_bytes().to_vec();
    out.extend_from_slice(&correlation_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}
