//! HTTP/1.x dissection loop.
//!
//! Heads are parsed with [httparse](https://docs.rs/httparse/latest/httparse/). Bodies are framed
//! by `Content-Length`, chunked transfer encoding or connection close, and captured up to
//! [MAX_BODY_CAPTURE] bytes. Pipelined requests are paired with responses by position: the n-th
//! request on a stream matches the n-th final response.

use super::transaction::{BodyFraming, HttpBody, HttpRequest, HttpResponse};
use crate::output::{Message, MessageData};
use crate::protocols::stream::framer::Framer;
use crate::protocols::stream::{DissectError, ProtocolKind};
use crate::stream::reader::Reader;

/// Largest head accepted.
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest chunk-size line accepted.
const MAX_CHUNK_LINE: usize = 1024;
/// Body bytes kept per message.
pub const MAX_BODY_CAPTURE: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HttpParser;

impl HttpParser {
    pub(crate) async fn dissect(&self, reader: &mut Reader) -> Result<(), DissectError> {
        let mut framer = Framer::new(reader);
        if framer.reader().is_client() {
            dissect_requests(&mut framer).await
        } else {
            dissect_responses(&mut framer).await
        }
    }
}

fn malformed(reason: &str) -> DissectError {
    DissectError::malformed(ProtocolKind::Http, reason)
}

async fn dissect_requests(framer: &mut Framer<'_>) -> Result<(), DissectError> {
    let mut identified = false;
    loop {
        let (mut request, head_len) = read_head(framer, HttpRequest::parse_head).await?;
        let seen = framer.reader().last_seen();
        if !identified {
            if !framer.reader().identify(ProtocolKind::Http) {
                return Err(DissectError::Claimed(ProtocolKind::Http));
            }
            identified = true;
        }
        request.body = read_body(framer, request.framing()).await?;
        let captured_size = head_len + request.body.size;

        let ordinal = match framer.reader().next_ordinal(ProtocolKind::Http) {
            Some(ordinal) => ordinal,
            None => return Ok(()),
        };
        framer.reader().register(
            ProtocolKind::Http,
            &ordinal.to_string(),
            Message {
                is_request: true,
                capture_time: seen,
                captured_size,
                payload: MessageData::HttpRequest(request),
            },
        );
    }
}

async fn dissect_responses(framer: &mut Framer<'_>) -> Result<(), DissectError> {
    let mut identified = false;
    loop {
        let (mut response, head_len) = read_head(framer, HttpResponse::parse_head).await?;
        let seen = framer.reader().last_seen();
        if !identified {
            if !framer.reader().identify(ProtocolKind::Http) {
                return Err(DissectError::Claimed(ProtocolKind::Http));
            }
            identified = true;
        }
        if response.is_interim() {
            log::trace!("Skipping interim response {}", response.status_code);
            continue;
        }
        let framing = response.framing();
        response.body = read_body(framer, framing).await?;
        let captured_size = head_len + response.body.size;
        let switching = response.status_code == 101;

        let ordinal = match framer.reader().next_ordinal(ProtocolKind::Http) {
            Some(ordinal) => ordinal,
            None => return Ok(()),
        };
        framer.reader().register(
            ProtocolKind::Http,
            &ordinal.to_string(),
            Message {
                is_request: false,
                capture_time: seen,
                captured_size,
                payload: MessageData::HttpResponse(response),
            },
        );
        if switching || framing == BodyFraming::UntilClose {
            // nothing after this is HTTP/1.x
            return Ok(());
        }
    }
}

type HeadParser<T> = fn(&[u8]) -> Result<Option<(T, usize)>, httparse::Error>;

/// Buffers and parses the next head, consuming it.
async fn read_head<T>(
    framer: &mut Framer<'_>,
    parse: HeadParser<T>,
) -> Result<(T, usize), DissectError> {
    loop {
        match parse(framer.buffered()) {
            Ok(Some((head, head_len))) => {
                framer.consume(head_len);
                return Ok((head, head_len));
            }
            Ok(None) => {
                if framer.buffered().len() > MAX_HEAD_SIZE {
                    return Err(malformed("head too large"));
                }
                framer.fill().await?;
            }
            Err(error) => return Err(malformed(&error.to_string())),
        }
    }
}

async fn read_body(framer: &mut Framer<'_>, framing: BodyFraming) -> Result<HttpBody, DissectError> {
    let mut captured = vec![];
    let size = match framing {
        BodyFraming::None => 0,
        BodyFraming::Length(length) => {
            framer
                .read_body(length, MAX_BODY_CAPTURE, &mut captured)
                .await?;
            length
        }
        BodyFraming::Chunked => read_chunked(framer, &mut captured).await?,
        BodyFraming::UntilClose => framer.read_to_end(MAX_BODY_CAPTURE, &mut captured).await,
    };
    Ok(HttpBody::new(&captured, size))
}

/// Reads a chunked body and its trailers. Returns the de-chunked body size.
async fn read_chunked(
    framer: &mut Framer<'_>,
    captured: &mut Vec<u8>,
) -> Result<usize, DissectError> {
    let mut total = 0;
    loop {
        let line = framer.read_line(MAX_CHUNK_LINE, malformed).await?;
        let size = chunk_size(&line).ok_or_else(|| malformed("invalid chunk size"))?;
        if size == 0 {
            loop {
                let trailer = framer.read_line(MAX_HEAD_SIZE, malformed).await?;
                if trailer.is_empty() {
                    return Ok(total);
                }
            }
        }
        framer.read_body(size, MAX_BODY_CAPTURE, captured).await?;
        total += size;
        if !framer.read_line(2, malformed).await?.is_empty() {
            return Err(malformed("missing chunk terminator"));
        }
    }
}

/// Parses a chunk-size line, ignoring chunk extensions.
fn chunk_size(line: &[u8]) -> Option<usize> {
    let digits = line.split(|b| *b == b';').next()?;
    let digits = std::str::from_utf8(digits).ok()?.trim();
    usize::from_str_radix(digits, 16).ok()
}
