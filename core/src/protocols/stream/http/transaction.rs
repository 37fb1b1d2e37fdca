//! HTTP transaction components.
//!
//! Heads are parsed with [httparse](https://docs.rs/httparse/latest/httparse/); bodies are framed
//! by the parser loop and attached afterwards.

use httparse::{Request, Response, Status, EMPTY_HEADER};
use serde::Serialize;

/// Number of headers parsed at once.
const NUM_OF_HEADERS: usize = 64;

/// A single HTTP header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Length(usize),
    Chunked,
    /// Body runs until the server closes the connection.
    UntilClose,
}

/// Captured body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpBody {
    /// Total body length on the wire, after de-chunking.
    pub size: usize,
    /// Leading body bytes, lossily decoded.
    pub content: String,
    /// `true` if `content` holds fewer than `size` bytes.
    pub truncated: bool,
}

impl HttpBody {
    pub(crate) fn new(captured: &[u8], size: usize) -> Self {
        HttpBody {
            size,
            content: String::from_utf8_lossy(captured).into_owned(),
            truncated: captured.len() < size,
        }
    }
}

/// An HTTP Request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub content_length: Option<usize>,
    pub content_type: Option<String>,
    pub transfer_encoding: Option<String>,
    pub headers: Vec<HttpHeader>,
    pub body: HttpBody,
}

impl HttpRequest {
    /// Parses a request head at the start of `data`.
    ///
    /// Returns `Ok(None)` if the head is not complete yet, and the head length otherwise.
    pub(crate) fn parse_head(data: &[u8]) -> Result<Option<(Self, usize)>, httparse::Error> {
        let mut headers = [EMPTY_HEADER; NUM_OF_HEADERS];
        let mut req = Request::new(&mut headers[..]);
        let head_len = match req.parse(data)? {
            Status::Complete(len) => len,
            Status::Partial => return Ok(None),
        };

        let mut request = HttpRequest {
            method: req.method.unwrap_or_default().to_owned(),
            uri: req.path.unwrap_or_default().to_owned(),
            version: format!("HTTP/1.{}", req.version.unwrap_or(1)),
            ..HttpRequest::default()
        };
        for hdr in req.headers.iter() {
            let value = String::from_utf8_lossy(hdr.value).into_owned();
            match hdr.name.to_lowercase().as_ref() {
                "host" => request.host = Some(value.clone()),
                "user-agent" => request.user_agent = Some(value.clone()),
                "content-length" => request.content_length = value.trim().parse().ok(),
                "content-type" => request.content_type = Some(value.clone()),
                "transfer-encoding" => request.transfer_encoding = Some(value.to_lowercase()),
                _ => (),
            }
            request.headers.push(HttpHeader {
                name: hdr.name.to_owned(),
                value,
            });
        }
        Ok(Some((request, head_len)))
    }

    pub(crate) fn framing(&self) -> BodyFraming {
        if is_chunked(self.transfer_encoding.as_deref()) {
            BodyFraming::Chunked
        } else {
            match self.content_length {
                Some(length) if length > 0 => BodyFraming::Length(length),
                _ => BodyFraming::None,
            }
        }
    }
}

/// An HTTP Response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub status_msg: String,
    pub content_length: Option<usize>,
    pub content_type: Option<String>,
    pub transfer_encoding: Option<String>,
    pub headers: Vec<HttpHeader>,
    pub body: HttpBody,
}

impl HttpResponse {
    /// Parses a response head at the start of `data`.
    ///
    /// Returns `Ok(None)` if the head is not complete yet, and the head length otherwise.
    pub(crate) fn parse_head(data: &[u8]) -> Result<Option<(Self, usize)>, httparse::Error> {
        let mut headers = [EMPTY_HEADER; NUM_OF_HEADERS];
        let mut resp = Response::new(&mut headers[..]);
        let head_len = match resp.parse(data)? {
            Status::Complete(len) => len,
            Status::Partial => return Ok(None),
        };

        let mut response = HttpResponse {
            version: format!("HTTP/1.{}", resp.version.unwrap_or(1)),
            status_code: resp.code.unwrap_or_default(),
            status_msg: resp.reason.unwrap_or_default().to_owned(),
            ..HttpResponse::default()
        };
        for hdr in resp.headers.iter() {
            let value = String::from_utf8_lossy(hdr.value).into_owned();
            match hdr.name.to_lowercase().as_ref() {
                "content-length" => response.content_length = value.trim().parse().ok(),
                "content-type" => response.content_type = Some(value.clone()),
                "transfer-encoding" => response.transfer_encoding = Some(value.to_lowercase()),
                _ => (),
            }
            response.headers.push(HttpHeader {
                name: hdr.name.to_owned(),
                value,
            });
        }
        Ok(Some((response, head_len)))
    }

    /// `true` for interim 1xx responses other than `101 Switching Protocols`.
    pub(crate) fn is_interim(&self) -> bool {
        (100..200).contains(&self.status_code) && self.status_code != 101
    }

    pub(crate) fn framing(&self) -> BodyFraming {
        if (100..200).contains(&self.status_code)
            || self.status_code == 204
            || self.status_code == 304
        {
            return BodyFraming::None;
        }
        if is_chunked(self.transfer_encoding.as_deref()) {
            return BodyFraming::Chunked;
        }
        match self.content_length {
            Some(0) => BodyFraming::None,
            Some(length) => BodyFraming::Length(length),
            None => BodyFraming::UntilClose,
        }
    }
}

fn is_chunked(transfer_encoding: Option<&str>) -> bool {
    transfer_encoding
        .map(|te| te.split(',').any(|coding| coding.trim() == "chunked"))
        .unwrap_or(false)
}
