//! In-flight request registry and lifecycle state machine.
//!
//! # Design
//! Every submitted request becomes an `InternalRequest` stored in the
//! tracker's registry under its `RequestId`. Transport events reach it through
//! an `EventSink`, which only holds a weak reference to the tracker.
//!
//! ```text
//! Submitted -> Active -> Completed | Cancelled | Failed
//! ```
//!
//! Locking: the registry sits behind an `RwLock`, each request's mutable
//! state behind its own `Mutex`. The registry lock is only held to look up,
//! insert or remove entries and is never taken while a request lock is held.
//! Whichever of cancellation or completion takes the request lock first and
//! finds it non-terminal settles the request; the other sees a terminal phase
//! and backs off. The winner alone removes the entry and delivers the single
//! terminal callback.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use bytes::{Bytes, BytesMut};

use crate::error::{SerializationError, ServiceError, TransportError};
use crate::http::{ExpectedStatusCodes, HttpRequest, Payload, QualityOfService, Response, ResponseHead};
use crate::multipart::{MultipartBody, MultipartStream};
use crate::queue::CompletionQueue;
use crate::serializer::SerializerRegistry;
use crate::token::{CancellableItemService, CancellableToken, RequestId};
use crate::transport::{TaskHandle, Transport};
use crate::trust::{ServerTrust, TrustDecision, TrustFailure, TrustValidator};
use crate::types::DeserializeTarget;

pub type RequestResult = Result<Response, ServiceError>;

/// Receives the single terminal outcome of a request.
pub type Completion = Box<dyn FnOnce(RequestResult) + Send + 'static>;

/// Download progress, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    pub total_bytes_written: u64,
    /// `None` when the server did not announce a length.
    pub total_bytes_expected: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync + 'static>;

/// Where a download ends up, and who hears about its progress.
#[derive(Clone)]
pub struct DownloadTarget {
    pub destination: PathBuf,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTarget")
            .field("destination", &self.destination)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// How a successful body becomes a payload.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResponseMode {
    /// Bytes are handed over untouched.
    RawData,
    /// Deserialized by the MIME-selected serializer, then optionally by a target.
    Content(Option<DeserializeTarget>),
}

/// Per-request settings the tracker needs once the wire request is built.
pub(crate) struct RequestPlan {
    pub response_mode: ResponseMode,
    pub expected_codes: ExpectedStatusCodes,
    pub multipart: Option<MultipartBody>,
    pub download: Option<DownloadTarget>,
    pub queue: Option<Arc<dyn CompletionQueue>>,
    pub quality_of_service: QualityOfService,
    /// Request addresses a host other than the service's (unsafe URL requests).
    pub foreign_host: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Submitted,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled | Phase::Failed)
    }
}

struct RequestState {
    phase: Phase,
    task: Option<TaskHandle>,
    head: Option<ResponseHead>,
    buffer: BytesMut,
    downloaded: bool,
    download_error: Option<io::Error>,
    trust_failure: Option<TrustFailure>,
    completion: Option<Completion>,
}

/// One outstanding request.
pub(crate) struct InternalRequest {
    id: RequestId,
    response_mode: ResponseMode,
    expected_codes: ExpectedStatusCodes,
    multipart: Option<MultipartBody>,
    download: Option<DownloadTarget>,
    queue: Arc<dyn CompletionQueue>,
    quality_of_service: QualityOfService,
    foreign_host: bool,
    state: Mutex<RequestState>,
}

impl InternalRequest {
    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything the completion path needs, taken out of the state under lock.
struct Settlement {
    completion: Option<Completion>,
    head: Option<ResponseHead>,
    body: Bytes,
    downloaded: bool,
    download_error: Option<io::Error>,
    trust_failure: Option<TrustFailure>,
}

pub(crate) struct Tracker {
    registry: RwLock<HashMap<RequestId, Arc<InternalRequest>>>,
    transport: Arc<dyn Transport>,
    serializers: RwLock<SerializerRegistry>,
    validator: TrustValidator,
    default_queue: Arc<dyn CompletionQueue>,
    this: Weak<Tracker>,
}

impl Tracker {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializers: SerializerRegistry,
        validator: TrustValidator,
        default_queue: Arc<dyn CompletionQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry: RwLock::new(HashMap::new()),
            transport,
            serializers: RwLock::new(serializers),
            validator,
            default_queue,
            this: this.clone(),
        })
    }

    pub fn serializers(&self) -> std::sync::RwLockReadGuard<'_, SerializerRegistry> {
        self.serializers.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn serializers_mut(&self) -> std::sync::RwLockWriteGuard<'_, SerializerRegistry> {
        self.serializers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn validator(&self) -> &TrustValidator {
        &self.validator
    }

    pub fn default_queue(&self) -> &Arc<dyn CompletionQueue> {
        &self.default_queue
    }

    pub fn active_count(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn token(&self, id: RequestId) -> CancellableToken {
        let service: Weak<dyn CancellableItemService> = self.this.clone();
        CancellableToken::new(id, service)
    }

    fn lookup(&self, id: RequestId) -> Option<Arc<InternalRequest>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn unregister(&self, id: RequestId) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Registers the request, hands it to the transport and returns its token.
    pub fn start(&self, request: HttpRequest, plan: RequestPlan, completion: Completion) -> CancellableToken {
        let id = RequestId::new();
        let internal = Arc::new(InternalRequest {
            id,
            response_mode: plan.response_mode,
            expected_codes: plan.expected_codes,
            multipart: plan.multipart,
            download: plan.download,
            queue: plan.queue.unwrap_or_else(|| self.default_queue.clone()),
            quality_of_service: plan.quality_of_service,
            foreign_host: plan.foreign_host,
            state: Mutex::new(RequestState {
                phase: Phase::Submitted,
                task: None,
                head: None,
                buffer: BytesMut::new(),
                downloaded: false,
                download_error: None,
                trust_failure: None,
                completion: Some(completion),
            }),
        });
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, internal.clone());
        tracing::debug!(
            request = %id,
            method = %request.method,
            url = %request.url,
            qos = ?internal.quality_of_service,
            "submitting request"
        );

        let events = EventSink {
            id,
            tracker: self.this.clone(),
        };
        match self.transport.submit(request, events) {
            Ok(handle) => {
                let cancelled_meanwhile = {
                    let mut state = internal.state();
                    if state.phase.is_terminal() {
                        state.phase == Phase::Cancelled
                    } else {
                        state.task = Some(handle);
                        state.phase = Phase::Active;
                        false
                    }
                };
                if cancelled_meanwhile {
                    self.transport.cancel(handle);
                }
            }
            Err(error) => {
                tracing::warn!(request = %id, %error, "transport refused request");
                self.settle_with(&internal, Err(ServiceError::Submission(error)));
            }
        }
        self.token(id)
    }

    /// Settles a request that was cancelled by its caller or the service.
    pub fn cancel(&self, id: RequestId, notify: bool) {
        let Some(request) = self.lookup(id) else {
            return;
        };
        let (completion, task) = {
            let mut state = request.state();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = Phase::Cancelled;
            (state.completion.take(), state.task.take())
        };
        tracing::debug!(request = %id, notify, "request cancelled");
        if let Some(task) = task {
            self.transport.cancel(task);
        }
        self.unregister(id);
        if let (true, Some(completion)) = (notify, completion) {
            deliver(&request.queue, completion, Err(ServiceError::Cancelled));
        }
    }

    pub fn cancel_all(&self, notify: bool) {
        let ids: Vec<RequestId> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.cancel(id, notify);
        }
    }

    /// Settles a request with an outcome decided outside the normal
    /// completion path (e.g. submission failure).
    fn settle_with(&self, request: &InternalRequest, result: RequestResult) {
        let completion = {
            let mut state = request.state();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = Phase::Failed;
            state.task = None;
            state.completion.take()
        };
        self.unregister(request.id);
        if let Some(completion) = completion {
            deliver(&request.queue, completion, result);
        }
    }

    fn response_received(&self, id: RequestId, head: ResponseHead) -> bool {
        let Some(request) = self.lookup(id) else {
            return false;
        };
        let mut state = request.state();
        if state.phase.is_terminal() {
            return false;
        }
        if !request.expected_codes.contains(head.status) {
            tracing::debug!(request = %id, status = head.status, "status outside expected codes");
        }
        state.phase = Phase::Active;
        state.head = Some(head);
        true
    }

    fn data_received(&self, id: RequestId, data: &[u8]) {
        let Some(request) = self.lookup(id) else {
            return;
        };
        let mut state = request.state();
        if state.phase.is_terminal() {
            tracing::debug!(request = %id, len = data.len(), "dropping data for settled request");
            return;
        }
        state.phase = Phase::Active;
        state.buffer.extend_from_slice(data);
    }

    fn download_progress(&self, id: RequestId, progress: DownloadProgress) {
        let Some(request) = self.lookup(id) else {
            return;
        };
        let callback = {
            let state = request.state();
            if state.phase.is_terminal() {
                return;
            }
            request.download.as_ref().and_then(|d| d.progress.clone())
        };
        let Some(callback) = callback else {
            return;
        };
        let queue = request.queue.clone();
        queue.dispatch(Box::new(move || {
            // A cancel accepted while this job waited on the queue wins.
            let terminal = request.state().phase.is_terminal();
            if !terminal {
                callback(progress);
            }
        }));
    }

    fn download_finished(&self, id: RequestId, location: &Path) {
        let Some(request) = self.lookup(id) else {
            return;
        };
        let Some(target) = request.download.as_ref() else {
            tracing::warn!(request = %id, "download event for a non-download request");
            return;
        };
        // Held across the file work so a concurrent cancel cannot slip in
        // between the phase check and the move.
        let mut state = request.state();
        if state.phase.is_terminal() {
            return;
        }
        let unexpected = state
            .head
            .as_ref()
            .is_some_and(|head| !request.expected_codes.contains(head.status));
        if unexpected {
            // The destination keeps its previous contents; the body becomes
            // the error content.
            match std::fs::read(location) {
                Ok(body) => state.buffer.extend_from_slice(&body),
                Err(error) => tracing::debug!(request = %id, %error, "cannot read error body"),
            }
            discard_file(id, location);
            return;
        }
        match move_file(location, &target.destination) {
            Ok(()) => state.downloaded = true,
            Err(error) => {
                tracing::warn!(request = %id, %error, "cannot move download into place");
                state.download_error = Some(error);
            }
        }
    }

    fn challenge(&self, id: RequestId, trust: &ServerTrust) -> bool {
        let Some(request) = self.lookup(id) else {
            return false;
        };
        let decision = if request.foreign_host {
            match crate::trust::default_evaluation(trust) {
                Ok(()) => TrustDecision::Accept,
                Err(reason) => TrustDecision::Reject(reason),
            }
        } else {
            self.validator.validate(trust)
        };
        match decision {
            TrustDecision::Accept => true,
            TrustDecision::Reject(reason) => {
                tracing::warn!(request = %id, host = %trust.host, %reason, "server trust rejected");
                request.state().trust_failure = Some(reason);
                false
            }
        }
    }

    fn completed(&self, id: RequestId, outcome: Result<(), TransportError>) {
        let Some(request) = self.lookup(id) else {
            return;
        };
        let settlement = {
            let mut state = request.state();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = Phase::Completed;
            state.task = None;
            Settlement {
                completion: state.completion.take(),
                head: state.head.take(),
                body: std::mem::take(&mut state.buffer).freeze(),
                downloaded: state.downloaded,
                download_error: state.download_error.take(),
                trust_failure: state.trust_failure.take(),
            }
        };
        self.unregister(id);

        let completion = settlement.completion;
        let result = self.resolve(
            &request,
            outcome,
            settlement.head,
            settlement.body,
            settlement.downloaded,
            settlement.download_error,
            settlement.trust_failure,
        );
        match &result {
            Ok(response) => {
                tracing::debug!(request = %id, status = response.head.status, "request completed")
            }
            Err(error) => {
                request.state().phase = Phase::Failed;
                tracing::debug!(request = %id, %error, "request failed");
            }
        }
        if let Some(completion) = completion {
            deliver(&request.queue, completion, result);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &self,
        request: &InternalRequest,
        outcome: Result<(), TransportError>,
        head: Option<ResponseHead>,
        body: Bytes,
        downloaded: bool,
        download_error: Option<io::Error>,
        trust_failure: Option<TrustFailure>,
    ) -> RequestResult {
        if let Some(reason) = trust_failure {
            return Err(ServiceError::Trust(reason));
        }
        outcome.map_err(ServiceError::Transport)?;
        let head = head.ok_or_else(|| {
            ServiceError::Transport(TransportError::Other(
                "transport finished without a response".into(),
            ))
        })?;

        if !request.expected_codes.contains(head.status) {
            let content = self.error_content(&head, &body);
            return Err(ServiceError::UnexpectedStatus { head, content });
        }

        if request.download.is_some() {
            if let Some(error) = download_error {
                return Err(ServiceError::Download(error));
            }
            if !downloaded {
                return Err(ServiceError::Download(io::Error::new(
                    io::ErrorKind::NotFound,
                    "transport finished without a downloaded file",
                )));
            }
            return Ok(Response {
                head,
                payload: Payload::None,
            });
        }

        let payload = match request.response_mode {
            ResponseMode::RawData if body.is_empty() => Payload::None,
            ResponseMode::RawData => Payload::Data(body),
            ResponseMode::Content(target) => {
                let mime_type = head.mime_type();
                let serializer = self.serializers().serializer_for(&mime_type);
                match (target, serializer.deserialize(&body, &mime_type)?) {
                    (Some(target), Payload::Json(value)) => target.decode(&value)?,
                    (_, Payload::None) => Payload::None,
                    (Some(target), _) => {
                        return Err(SerializationError::InvalidPayload(format!(
                            "{} needs a JSON response, got {mime_type}",
                            target.type_name()
                        ))
                        .into())
                    }
                    (None, payload) => payload,
                }
            }
        };
        Ok(Response { head, payload })
    }

    /// Best-effort deserialization of an error body. Undecodable bodies are
    /// attached as raw bytes.
    fn error_content(&self, head: &ResponseHead, body: &Bytes) -> Payload {
        if body.is_empty() {
            return Payload::None;
        }
        let mime_type = head.mime_type();
        let serializer = self.serializers().serializer_for(&mime_type);
        serializer
            .deserialize(body, &mime_type)
            .unwrap_or_else(|_| Payload::Data(body.clone()))
    }

    fn body_stream(&self, id: RequestId) -> Option<MultipartStream> {
        self.lookup(id)?.multipart.as_ref().map(MultipartBody::stream)
    }
}

impl CancellableItemService for Tracker {
    fn cancel_item(&self, id: RequestId) {
        self.cancel(id, true);
    }

    fn is_item_active(&self, id: RequestId) -> bool {
        match self.lookup(id) {
            Some(request) => {
                let terminal = request.state().phase.is_terminal();
                !terminal
            }
            None => false,
        }
    }
}

pub(crate) fn deliver(queue: &Arc<dyn CompletionQueue>, completion: Completion, result: RequestResult) {
    queue.dispatch(Box::new(move || completion(result)));
}

fn discard_file(id: RequestId, path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        tracing::debug!(request = %id, %error, "cannot remove transport file");
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if to.exists() {
        std::fs::remove_file(to)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Cross-device moves cannot rename.
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

/// Per-request event channel handed to the transport.
///
/// Every method is safe to call from any thread, and every method is a no-op
/// once the request has settled or the service is gone.
#[derive(Clone)]
pub struct EventSink {
    id: RequestId,
    tracker: Weak<Tracker>,
}

impl EventSink {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Status line and headers arrived. Returns `false` when the transport
    /// should stop the task because the request is already settled.
    pub fn response_received(&self, head: ResponseHead) -> bool {
        self.tracker
            .upgrade()
            .is_some_and(|t| t.response_received(self.id, head))
    }

    /// A chunk of the response body arrived. Chunks must be reported in order.
    pub fn data_received(&self, data: &[u8]) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.data_received(self.id, data);
        }
    }

    pub fn download_progress(&self, bytes_written: u64, total_bytes_written: u64, total_bytes_expected: Option<u64>) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.download_progress(
                self.id,
                DownloadProgress {
                    bytes_written,
                    total_bytes_written,
                    total_bytes_expected,
                },
            );
        }
    }

    /// The transport finished writing the body to `location`. The file is
    /// moved to the request's destination before this returns.
    pub fn download_finished(&self, location: &Path) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.download_finished(self.id, location);
        }
    }

    /// TLS trust challenge. Returns whether the connection may proceed.
    pub fn challenge(&self, trust: &ServerTrust) -> bool {
        self.tracker
            .upgrade()
            .is_some_and(|t| t.challenge(self.id, trust))
    }

    /// The task ended, successfully or not. Only the first call counts.
    pub fn completed(&self, outcome: Result<(), TransportError>) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.completed(self.id, outcome);
        }
    }

    /// Fresh body stream for streamed uploads, e.g. after a redirect.
    pub fn new_body_stream(&self) -> Option<MultipartStream> {
        self.tracker.upgrade()?.body_stream(self.id)
    }

    pub fn is_active(&self) -> bool {
        self.tracker
            .upgrade()
            .is_some_and(|t| t.is_item_active(self.id))
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("id", &self.id).finish()
    }
}
