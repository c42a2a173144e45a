//! Request core for applications that talk to a single trusted API host.
//!
//! # Overview
//! Builds, submits, tracks and cancels HTTP requests while enforcing one
//! security, serialization and header policy. The core never touches the
//! network itself (host-does-IO pattern): finished `HttpRequest` values are
//! handed to an injected `Transport`, which reports back through an
//! `EventSink`.
//!
//! # Design
//! - `DataRequestService` is the entry point. `request_builder()` opens a
//!   `RequestCustomizer` per request; `submit` consumes it.
//! - The factory resolves paths against the base URL and layers builder,
//!   delegate and generic headers; the generic layer always wins.
//! - The tracker owns in-flight requests. Cancellation and completion race
//!   for a per-request lock and exactly one of them delivers the result.
//! - Results arrive as `Result<Response, ServiceError>` on a caller-chosen
//!   `CompletionQueue`.

pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod http;
pub mod multipart;
pub mod queue;
pub mod serializer;
pub mod token;
pub mod tracker;
pub mod transport;
pub mod trust;
pub mod types;

pub use builder::{RequestBuilder, RequestCustomizer};
pub use client::DataRequestService;
pub use config::{ServiceConfig, ViolationPolicy};
pub use error::{BuilderError, ConfigError, ErrorCode, SerializationError, ServiceError, TransportError};
pub use factory::PreparationDelegate;
pub use http::{
    ExpectedStatusCodes, HttpMethod, HttpRequest, Payload, QualityOfService, RequestBody, Response, ResponseHead,
    TaskKind,
};
pub use multipart::{MultipartBody, MultipartPart, MultipartStream};
pub use queue::{CompletionQueue, InlineQueue, SerialQueue};
pub use serializer::{DataSerializer, SerializerRegistry};
pub use token::{CancellableToken, RequestId};
pub use tracker::{DownloadProgress, EventSink, ProgressCallback, RequestResult};
pub use transport::{TaskHandle, Transport};
pub use trust::{Certificate, ChainEvaluation, PinningPolicy, ServerTrust, TrustDecision, TrustFailure};
pub use types::{DeserializeTarget, JsonDeserializable};
