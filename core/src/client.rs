//! The service object applications talk to.
//!
//! # Design
//! `DataRequestService` ties together one base URL, one trust policy, one
//! serializer registry and one transport. It owns the request tracker; tokens
//! and transport event sinks only hold weak references to it, so dropping the
//! service makes them inert. Outstanding requests are cancelled (with
//! notification) when the service is dropped.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use url::Url;

use crate::builder::RequestBuilder;
use crate::config::ServiceConfig;
use crate::error::{ConfigError, ServiceError};
use crate::factory::{PreparationDelegate, RequestDraft, RequestFactory};
use crate::http::RequestBody;
use crate::queue::{CompletionQueue, SerialQueue};
use crate::serializer::{DataSerializer, SerializerRegistry};
use crate::token::{CancellableToken, RequestId};
use crate::tracker::{deliver, Completion, ProgressCallback, RequestResult, RequestPlan, ResponseMode, Tracker};
use crate::transport::Transport;
use crate::trust::{ServerTrust, TrustDecision};
use crate::types::JsonDeserializable;

const COMPLETION_QUEUE_NAME: &str = "hostlink-completion";

pub struct DataRequestService {
    factory: RequestFactory,
    tracker: Arc<Tracker>,
    authorization: RwLock<Option<String>>,
    background_default: bool,
}

impl DataRequestService {
    /// Creates a service whose callbacks run on its own serial queue.
    pub fn new(config: &ServiceConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        let queue = SerialQueue::new(COMPLETION_QUEUE_NAME)?;
        Self::with_queue(config, transport, Arc::new(queue))
    }

    /// Creates a service with an explicit default completion queue.
    pub fn with_queue(
        config: &ServiceConfig,
        transport: Arc<dyn Transport>,
        queue: Arc<dyn CompletionQueue>,
    ) -> Result<Self, ConfigError> {
        let (base_url, validator) = config.validate()?;
        tracing::info!(
            base_url = %base_url,
            pinning = ?validator.policy(),
            violations = ?config.violations,
            "data request service created"
        );
        Ok(Self {
            factory: RequestFactory::new(base_url, config.user_agent.clone(), config.violations),
            tracker: Tracker::new(transport, SerializerRegistry::default(), validator, queue),
            authorization: RwLock::new(None),
            background_default: config.background_default,
        })
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn PreparationDelegate>) -> Self {
        self.factory.set_delegate(delegate);
        self
    }

    /// Registers (or replaces) the serializer for `mime_type`.
    pub fn with_serializer(self, mime_type: &str, serializer: Arc<dyn DataSerializer>) -> Self {
        self.tracker.serializers_mut().register(mime_type, serializer);
        self
    }

    pub fn base_url(&self) -> &Url {
        self.factory.base_url()
    }

    /// Value of the `Authorization` header sent with every request to the
    /// service host.
    pub fn set_authorization_header(&self, value: &str) {
        *self.authorization.write().unwrap_or_else(PoisonError::into_inner) = Some(value.to_string());
    }

    pub fn clear_authorization(&self) {
        *self.authorization.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn request_builder(&self) -> RequestBuilder<'_> {
        RequestBuilder::new(self)
    }

    /// GET with the body deserialized by its MIME type.
    pub fn get<F>(&self, path: &str, completion: F) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder().get(path).submit(completion)
    }

    /// GET with the JSON body decoded into `T` (or `Vec<T>`).
    pub fn get_deserialized<T, F>(&self, path: &str, completion: F) -> CancellableToken
    where
        T: JsonDeserializable + Send + 'static,
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .get(path)
            .deserialize_to::<T>()
            .submit(completion)
    }

    /// POST with JSON-encoded parameters.
    pub fn post<F>(&self, path: &str, parameters: Map<String, Value>, completion: F) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .post(path)
            .body_parameters(parameters)
            .submit(completion)
    }

    /// POST with parameters encoded as `mime_type`.
    pub fn post_encoded<F>(
        &self,
        path: &str,
        parameters: Map<String, Value>,
        mime_type: &str,
        completion: F,
    ) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .post(path)
            .content_encoding(mime_type)
            .body_parameters(parameters)
            .submit(completion)
    }

    pub fn put<F>(&self, path: &str, parameters: Map<String, Value>, completion: F) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .put(path)
            .body_parameters(parameters)
            .submit(completion)
    }

    /// Downloads `path` into `destination`. The success payload is
    /// `Payload::None`; the content is on disk.
    pub fn download<F>(
        &self,
        path: &str,
        destination: impl Into<PathBuf>,
        progress: Option<ProgressCallback>,
        completion: F,
    ) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .get(path)
            .download_to(destination.into(), progress)
            .submit(completion)
    }

    /// GET of an arbitrary absolute URL, returning raw data. No authorization
    /// header or delegate contributions are attached, and trust is checked
    /// with the platform verdict only.
    pub fn url_get<F>(&self, url: &str, completion: F) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .get(url)
            .absolute()
            .accept_raw_data()
            .submit(completion)
    }

    /// Download counterpart of `url_get`.
    pub fn url_download<F>(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
        progress: Option<ProgressCallback>,
        completion: F,
    ) -> CancellableToken
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.request_builder()
            .get(url)
            .absolute()
            .download_to(destination.into(), progress)
            .submit(completion)
    }

    /// Evaluates a TLS challenge for the service host against the configured
    /// pinning policy. For transports that validate outside `EventSink`.
    pub fn validate_security_challenge(&self, trust: &ServerTrust) -> TrustDecision {
        self.tracker.validator().validate(trust)
    }

    /// Cancels every outstanding request. With `notify` false the completion
    /// callbacks are dropped instead of receiving `ServiceError::Cancelled`.
    pub fn cancel_all_requests(&self, notify: bool) {
        self.tracker.cancel_all(notify);
    }

    pub fn active_request_count(&self) -> usize {
        self.tracker.active_count()
    }

    pub(crate) fn background_default(&self) -> bool {
        self.background_default
    }

    pub(crate) fn submit_draft(&self, draft: RequestDraft, completion: Completion) -> CancellableToken {
        if let Err(error) = draft.validate() {
            return self.reject(&draft, error.into(), completion);
        }
        let authorization = self
            .authorization
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let built = self
            .factory
            .build(&draft, authorization.as_deref(), &self.tracker.serializers());
        let request = match built {
            Ok(request) => request,
            Err(error) => return self.reject(&draft, error, completion),
        };

        let multipart = match &request.body {
            RequestBody::Multipart(body) => Some(body.clone()),
            _ => None,
        };
        let plan = RequestPlan {
            response_mode: if draft.raw_data {
                ResponseMode::RawData
            } else {
                ResponseMode::Content(draft.target)
            },
            expected_codes: draft.expected_codes,
            multipart,
            download: draft.download,
            queue: draft.queue,
            quality_of_service: draft.quality_of_service,
            foreign_host: draft.absolute,
        };
        self.tracker.start(request, plan, completion)
    }

    /// Fails a request that never reached the tracker.
    pub(crate) fn reject(&self, draft: &RequestDraft, error: ServiceError, completion: Completion) -> CancellableToken {
        tracing::warn!(method = %draft.method, path = %draft.path, %error, "request rejected before submission");
        let queue = draft
            .queue
            .clone()
            .unwrap_or_else(|| self.tracker.default_queue().clone());
        deliver(&queue, completion, Err(error));
        CancellableToken::detached(RequestId::new())
    }
}

impl Drop for DataRequestService {
    fn drop(&mut self) {
        let outstanding = self.tracker.active_count();
        if outstanding > 0 {
            tracing::debug!(outstanding, "service dropped, cancelling outstanding requests");
            self.tracker.cancel_all(true);
        }
    }
}

impl std::fmt::Debug for DataRequestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRequestService")
            .field("base_url", &self.factory.base_url().as_str())
            .field("active_requests", &self.tracker.active_count())
            .finish()
    }
}
