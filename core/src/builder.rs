//! Fluent request builders.
//!
//! # Design
//! A `RequestCustomizer` accumulates state through chained setters and is
//! consumed by `submit`, so a submitted request can neither be submitted again
//! nor changed afterwards:
//!
//! ```compile_fail
//! # fn demo(service: &hostlink_core::DataRequestService) {
//! let request = service.request_builder().get("widgets");
//! let _token = request.submit(|_| {});
//! let _again = request.header("X-Late", "1");
//! # }
//! ```
//!
//! Setters never fail. Invalid combinations (and unreadable multipart files)
//! are detected at submit time and delivered through the completion callback,
//! like every other request failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::client::DataRequestService;
use crate::error::{BuilderError, ServiceError};
use crate::factory::RequestDraft;
use crate::http::{ExpectedStatusCodes, HttpMethod, QualityOfService};
use crate::multipart::MultipartPart;
use crate::queue::CompletionQueue;
use crate::token::CancellableToken;
use crate::tracker::{DownloadTarget, ProgressCallback, RequestResult};
use crate::types::{DeserializeTarget, JsonDeserializable};

/// Opens a customizer per HTTP method.
#[derive(Clone, Copy)]
pub struct RequestBuilder<'a> {
    service: &'a DataRequestService,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(service: &'a DataRequestService) -> Self {
        Self { service }
    }

    pub fn get(self, path: &str) -> RequestCustomizer<'a> {
        self.method(HttpMethod::Get, path)
    }

    pub fn post(self, path: &str) -> RequestCustomizer<'a> {
        self.method(HttpMethod::Post, path)
    }

    pub fn put(self, path: &str) -> RequestCustomizer<'a> {
        self.method(HttpMethod::Put, path)
    }

    pub fn delete(self, path: &str) -> RequestCustomizer<'a> {
        self.method(HttpMethod::Delete, path)
    }

    pub fn head(self, path: &str) -> RequestCustomizer<'a> {
        self.method(HttpMethod::Head, path)
    }

    pub fn method(self, method: HttpMethod, path: &str) -> RequestCustomizer<'a> {
        RequestCustomizer::new(self.service, RequestDraft::new(method, path))
    }
}

/// State of one request being assembled.
#[must_use = "a request is only sent once it is submitted"]
pub struct RequestCustomizer<'a> {
    service: &'a DataRequestService,
    draft: RequestDraft,
    deferred: Option<ServiceError>,
}

impl<'a> RequestCustomizer<'a> {
    pub(crate) fn new(service: &'a DataRequestService, mut draft: RequestDraft) -> Self {
        draft.allows_background = service.background_default();
        Self {
            service,
            draft,
            deferred: None,
        }
    }

    pub fn quality_of_service(mut self, quality_of_service: QualityOfService) -> Self {
        self.draft.quality_of_service = quality_of_service;
        self
    }

    /// Decodes a JSON response into `T` (or `Vec<T>` for arrays).
    pub fn deserialize_to<T: JsonDeserializable + Send + 'static>(mut self) -> Self {
        self.draft.target = Some(DeserializeTarget::of::<T>());
        self
    }

    pub fn deserialize_with_serde<T: DeserializeOwned + Send + 'static>(mut self) -> Self {
        self.draft.target = Some(DeserializeTarget::serde::<T>());
        self
    }

    /// Hands the response body over as `Payload::Data`, whatever its type.
    pub fn accept_raw_data(mut self) -> Self {
        self.draft.raw_data = true;
        self
    }

    /// MIME type used to serialize body parameters. Defaults to JSON.
    pub fn content_encoding(mut self, mime_type: &str) -> Self {
        self.draft.content_encoding = Some(mime_type.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.draft.set_header(name, value);
        self
    }

    pub fn expected_status_codes(mut self, codes: ExpectedStatusCodes) -> Self {
        self.draft.expected_codes = codes;
        self
    }

    /// Adds body (or, for GET/HEAD/DELETE, query) parameters. Later values
    /// replace earlier ones with the same key.
    pub fn body_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.draft
            .parameters
            .get_or_insert_with(Map::new)
            .extend(parameters);
        self
    }

    pub fn can_send_in_background(mut self, allowed: bool) -> Self {
        self.draft.allows_background = allowed;
        self
    }

    /// Where the completion callback runs. Defaults to the service queue.
    pub fn completion_queue(mut self, queue: Arc<dyn CompletionQueue>) -> Self {
        self.draft.queue = Some(queue);
        self
    }

    /// Marks the request as multipart even before any part is appended.
    pub fn multipart(mut self) -> Self {
        self.draft.multipart = true;
        self
    }

    pub fn append_part(mut self, part: MultipartPart) -> Self {
        self.draft.parts.push(part);
        self
    }

    pub fn append_part_with_data(
        self,
        data: impl Into<bytes::Bytes>,
        name: &str,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Self {
        self.append_part(MultipartPart::data(data, name, file_name, mime_type))
    }

    pub fn append_part_with_json(mut self, value: &Value, name: &str) -> Self {
        match MultipartPart::json(value, name) {
            Ok(part) => self.draft.parts.push(part),
            Err(error) => self.defer(error.into()),
        }
        self
    }

    /// Appends the file at `path`. Its length is taken now; the content is
    /// only read while the body streams.
    pub fn append_part_with_file(mut self, path: impl AsRef<Path>, name: &str) -> Self {
        let path = path.as_ref();
        match MultipartPart::file(path, name) {
            Ok(part) => self.draft.parts.push(part),
            Err(error) => self.defer(
                BuilderError::UnreadablePart {
                    path: path.display().to_string(),
                    reason: error.to_string(),
                }
                .into(),
            ),
        }
        self
    }

    pub(crate) fn download_to(mut self, destination: PathBuf, progress: Option<ProgressCallback>) -> Self {
        self.draft.download = Some(DownloadTarget {
            destination,
            progress,
        });
        self
    }

    pub(crate) fn absolute(mut self) -> Self {
        self.draft.absolute = true;
        self
    }

    fn defer(&mut self, error: ServiceError) {
        if self.deferred.is_none() {
            self.deferred = Some(error);
        }
    }

    /// Submits the request, as an upload when it has multipart parts.
    pub fn submit<F>(self, completion: F) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        let as_upload = self.draft.is_multipart();
        self.submit_as_upload(as_upload, completion)
    }

    /// Submits the request. Uploads are only valid for POST and PUT.
    pub fn submit_as_upload<F>(mut self, as_upload: bool, completion: F) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.draft.as_upload = as_upload;
        match self.deferred {
            Some(error) => self.service.reject(&self.draft, error, Box::new(completion)),
            None => self.service.submit_draft(self.draft, Box::new(completion)),
        }
    }

    /// Submits the request and returns a receiver for its result instead of
    /// taking a callback.
    pub fn submit_channel(self) -> (CancellableToken, oneshot::Receiver<RequestResult>) {
        let (sender, receiver) = oneshot::channel();
        let token = self.submit(move |result| {
            let _ = sender.send(result);
        });
        (token, receiver)
    }
}
