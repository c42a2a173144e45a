//! Error types for the request core.
//!
//! # Design
//! Everything a caller can observe about a failed request arrives as a
//! `ServiceError` through the completion callback; nothing is thrown across the
//! asynchronous boundary. Each variant maps to a stable `ErrorCode` so callers
//! can branch without matching on message text. Unexpected statuses keep the
//! deserialized error body for inspection.

use thiserror::Error;

use crate::http::{HttpMethod, Payload, ResponseHead};
use crate::trust::TrustFailure;

/// Machine-readable error codes, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    DataParsing = 898,
    GenericParameter = 899,
    SerializationFailure = 1001,
    TrustFailure = 1002,
    RequestCancelled = 1003,
    SubmissionFailure = 1004,
    BuilderFailure = 1005,
    UnexpectedStatus = 1006,
    TransportFailure = 1007,
    DownloadFailure = 1008,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Terminal failure of a submitted request.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Builder state was rejected at submit time.
    #[error("request builder failure: {0}")]
    Builder(#[from] BuilderError),

    /// A programming error reported instead of panicking
    /// (see `ViolationPolicy::Report`).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] SerializationError),

    #[error("server trust rejected: {0}")]
    Trust(#[from] TrustFailure),

    /// The response status is outside the request's expected set. `content`
    /// holds the deserialized error body, if there was one.
    #[error("unexpected HTTP status {}", .head.status)]
    UnexpectedStatus { head: ResponseHead, content: Payload },

    #[error("request cancelled")]
    Cancelled,

    #[error("request submission failed: {0}")]
    Submission(#[source] TransportError),

    #[error("transport failure: {0}")]
    Transport(#[source] TransportError),

    /// The downloaded file could not be moved to its destination.
    #[error("download failed: {0}")]
    Download(#[source] std::io::Error),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Builder(_) => ErrorCode::BuilderFailure,
            ServiceError::InvalidRequest(_) => ErrorCode::GenericParameter,
            ServiceError::Serialization(SerializationError::InvalidPayload(_)) => {
                ErrorCode::DataParsing
            }
            ServiceError::Serialization(_) => ErrorCode::SerializationFailure,
            ServiceError::Trust(_) => ErrorCode::TrustFailure,
            ServiceError::UnexpectedStatus { .. } => ErrorCode::UnexpectedStatus,
            ServiceError::Cancelled => ErrorCode::RequestCancelled,
            ServiceError::Submission(_) => ErrorCode::SubmissionFailure,
            ServiceError::Transport(_) => ErrorCode::TransportFailure,
            ServiceError::Download(_) => ErrorCode::DownloadFailure,
        }
    }

    /// Status code of the response, when the failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::UnexpectedStatus { head, .. } => Some(head.status),
            _ => None,
        }
    }

    /// Deserialized error body attached to an unexpected-status failure.
    pub fn error_content(&self) -> Option<&Payload> {
        match self {
            ServiceError::UnexpectedStatus { content, .. } if !content.is_none() => Some(content),
            _ => None,
        }
    }
}

/// Builder state rejected at submit time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuilderError {
    #[error("a deserialization target and raw-data accept are mutually exclusive")]
    DeserializeAndRawData,

    #[error("body parameters and multipart parts are mutually exclusive")]
    BodyAndMultipart,

    #[error("a multipart request needs at least one part")]
    EmptyMultipart,

    #[error("{0} requests cannot be submitted as uploads")]
    UploadWithoutBody(HttpMethod),

    #[error("no serializer registered for content encoding {0}")]
    UnknownContentEncoding(String),

    #[error("cannot read multipart file {path}: {reason}")]
    UnreadablePart { path: String, reason: String },
}

/// Failure to translate between wire bytes and in-memory values.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} cannot represent this value")]
    Unsupported(&'static str),

    /// Well-formed content the deserialization target refused.
    #[error("payload rejected by deserialization target: {0}")]
    InvalidPayload(String),
}

/// Error reported by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport cancelled the task")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Invalid service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base URL: {0}")]
    BaseUrl(#[from] url::ParseError),

    #[error("base URL must be an absolute http(s) URL with a host: {0}")]
    BaseUrlScheme(String),

    #[error("invalid pin {pin}: {reason}")]
    Pin { pin: String, reason: String },

    #[error("{0} pinning requires at least one pin")]
    MissingPins(&'static str),

    #[error("malformed configuration: {0}")]
    Format(#[from] serde_json::Error),

    #[error("cannot start the completion queue: {0}")]
    CompletionQueue(#[from] std::io::Error),
}
