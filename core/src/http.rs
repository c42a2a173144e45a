//! HTTP wire types exchanged with the injected transport.
//!
//! # Design
//! These types describe requests and responses as plain data. The core builds
//! `HttpRequest` values and interprets `ResponseHead` values without ever
//! touching the network; the transport (host) performs the actual I/O and
//! reports back through an `EventSink`.
//!
//! Headers are kept as ordered `(name, value)` pairs. Lookups are
//! case-insensitive, insertion order is what goes on the wire.

use std::any::Any;
use std::fmt;
use std::ops::RangeInclusive;

use bytes::Bytes;
use url::Url;

use crate::multipart::MultipartBody;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    /// Wire-level method token.
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }

    /// Methods whose semantics carry a request body.
    pub fn carries_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality of service requested for a request. Transports map it to their
/// own priority scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QualityOfService {
    #[default]
    Default,
    Background,
    Low,
    Normal,
    High,
    Interactive,
}

/// Set of HTTP status codes a request treats as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedStatusCodes {
    ranges: Vec<RangeInclusive<u16>>,
}

impl ExpectedStatusCodes {
    pub fn range(range: RangeInclusive<u16>) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    pub fn codes(codes: &[u16]) -> Self {
        Self {
            ranges: codes.iter().map(|&c| c..=c).collect(),
        }
    }

    /// Adds another accepted range to the set.
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn contains(&self, status: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&status))
    }
}

impl Default for ExpectedStatusCodes {
    fn default() -> Self {
        Self::range(200..=299)
    }
}

/// How the transport should run the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Regular request; the response body is delivered through data events.
    Data,
    /// Body is uploaded as a stream; eligible for background sending.
    Upload,
    /// Response body is written to a temporary file by the transport.
    Download,
}

/// Body of an outgoing request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Streamed body; `Content-Length` is already set on the request.
    Multipart(MultipartBody),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

/// A fully specified request handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub kind: TaskKind,
    pub quality_of_service: QualityOfService,
    pub allows_background: bool,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Status line and headers of a response, reported before the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// MIME type of the body without parameters, lowercased.
    /// Defaults to `application/octet-stream` when no `Content-Type` is present.
    pub fn mime_type(&self) -> String {
        self.header("content-type")
            .map(essence)
            .unwrap_or_else(|| crate::serializer::MIME_OCTET_STREAM.to_string())
    }
}

/// Deserialized response content handed to the completion callback.
pub enum Payload {
    /// Nothing to deserialize: empty body, HEAD, or a download (content is on disk).
    None,
    /// Raw bytes, for raw-data requests and passthrough MIME types.
    Data(Bytes),
    Text(String),
    Json(serde_json::Value),
    /// Instance produced by the request's deserialization target.
    Object(Box<dyn Any + Send>),
}

impl Payload {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Data(bytes) => Some(bytes),
            Payload::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Takes the typed object out of an `Object` payload.
    pub fn into_object<T: Any>(self) -> Option<T> {
        match self {
            Payload::Object(object) => object.downcast::<T>().ok().map(|b| *b),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => write!(f, "None"),
            Payload::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            Payload::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Payload::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Payload::Object(_) => write!(f, "Object(..)"),
        }
    }
}

/// Successful outcome of a request.
#[derive(Debug)]
pub struct Response {
    pub head: ResponseHead,
    pub payload: Payload,
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// `text/html; charset=utf-8` -> `text/html`
pub(crate) fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}
