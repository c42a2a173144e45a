//! Request lifecycle tests driven by a scripted transport.
//!
//! # Design
//! `ScriptedTransport` records submitted requests and their event sinks
//! instead of doing I/O. Tests play the transport's role by calling the sink
//! directly, which makes ordering and races fully controllable. Completions
//! run inline so results can be inspected as soon as the event returns.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use hostlink_core::queue::Job;
use hostlink_core::trust::pin_for;
use hostlink_core::{
    BuilderError, Certificate, ChainEvaluation, CompletionQueue, DataRequestService, DownloadProgress, ErrorCode, EventSink,
    ExpectedStatusCodes, HttpMethod, HttpRequest, InlineQueue, JsonDeserializable, Payload, PinningPolicy,
    RequestBody, RequestResult, ResponseHead, SerialQueue, SerializationError, ServerTrust, ServiceConfig,
    ServiceError, TaskHandle, TaskKind, Transport, TransportError, TrustFailure, ViolationPolicy,
};
use serde_json::{json, Map, Value};
use tracing_test::traced_test;

#[derive(Default)]
struct ScriptedTransport {
    submitted: Mutex<Vec<(HttpRequest, EventSink)>>,
    cancelled: Mutex<Vec<TaskHandle>>,
    next: AtomicU64,
    offline: AtomicBool,
}

impl ScriptedTransport {
    fn last(&self) -> (HttpRequest, EventSink) {
        self.submitted.lock().unwrap().last().cloned().expect("nothing submitted")
    }

    fn sink(&self) -> EventSink {
        self.last().1
    }

    fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    fn cancelled(&self) -> Vec<TaskHandle> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn submit(&self, request: HttpRequest, events: EventSink) -> Result<TaskHandle, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("offline".into()));
        }
        self.submitted.lock().unwrap().push((request, events));
        Ok(TaskHandle(self.next.fetch_add(1, Ordering::SeqCst)))
    }

    fn cancel(&self, handle: TaskHandle) {
        self.cancelled.lock().unwrap().push(handle);
    }
}

const HOST: &str = "api.example.com";

fn setup_with(config: ServiceConfig) -> (DataRequestService, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let service = DataRequestService::with_queue(&config, transport.clone(), Arc::new(InlineQueue)).unwrap();
    (service, transport)
}

fn setup() -> (DataRequestService, Arc<ScriptedTransport>) {
    setup_with(ServiceConfig::new(&format!("https://{HOST}/v1")))
}

type Results = Arc<Mutex<Vec<RequestResult>>>;

fn collector() -> (Results, impl FnOnce(RequestResult) + Send + 'static) {
    let results: Results = Arc::default();
    let sink = results.clone();
    (results, move |result: RequestResult| sink.lock().unwrap().push(result))
}

fn take_one(results: &Results) -> RequestResult {
    let mut results = results.lock().unwrap();
    assert_eq!(results.len(), 1, "expected exactly one terminal callback");
    results.pop().unwrap()
}

fn json_head(status: u16) -> ResponseHead {
    ResponseHead::new(status).with_header("Content-Type", "application/json; charset=utf-8")
}

fn respond(sink: &EventSink, head: ResponseHead, body: &[u8]) {
    assert!(sink.response_received(head));
    sink.data_received(body);
    sink.completed(Ok(()));
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[derive(Debug, PartialEq)]
struct Widget {
    id: u64,
    name: String,
}

impl JsonDeserializable for Widget {
    fn from_json(json: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            id: json.get("id")?.as_u64()?,
            name: json.get("name")?.as_str()?.to_string(),
        })
    }
}

// --- completion ---

#[test]
fn chunks_are_joined_and_decoded() {
    let (service, transport) = setup();
    let (results, done) = collector();
    let token = service.get("widgets", done);
    assert!(token.is_active());
    assert_eq!(service.active_request_count(), 1);

    let sink = transport.sink();
    assert!(sink.response_received(json_head(200)));
    sink.data_received(br#"{"id": 1, "#);
    sink.data_received(br#""name": "bolt"}"#);
    assert!(results.lock().unwrap().is_empty());
    sink.completed(Ok(()));

    let response = take_one(&results).unwrap();
    assert_eq!(response.payload.as_json(), Some(&json!({"id": 1, "name": "bolt"})));
    assert!(!token.is_active());
    assert_eq!(service.active_request_count(), 0);
}

#[test]
fn typed_target_builds_objects() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service
        .request_builder()
        .get("widgets/1")
        .deserialize_to::<Widget>()
        .submit(done);
    respond(&transport.sink(), json_head(200), br#"{"id": 1, "name": "bolt"}"#);

    let widget = take_one(&results).unwrap().payload.into_object::<Widget>().unwrap();
    assert_eq!(widget, Widget { id: 1, name: "bolt".into() });
}

#[test]
fn target_refusal_is_a_data_parsing_failure() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get_deserialized::<Widget, _>("widgets/1", done);
    respond(&transport.sink(), json_head(200), br#"{"id": 1}"#);

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::Serialization(SerializationError::InvalidPayload(_))));
    assert_eq!(err.code(), ErrorCode::DataParsing);
}

#[test]
fn malformed_json_is_a_serialization_failure() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get("widgets", done);
    respond(&transport.sink(), json_head(200), b"{not json");

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::Serialization(SerializationError::Json(_))));
    assert_eq!(err.code(), ErrorCode::SerializationFailure);
}

#[test]
fn raw_data_is_passed_through() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.request_builder().get("blob").accept_raw_data().submit(done);
    assert_eq!(transport.last().0.header("Accept"), Some("*/*"));
    respond(&transport.sink(), json_head(200), b"{\"raw\": true}");

    let response = take_one(&results).unwrap();
    assert_eq!(response.payload.as_bytes(), Some(&b"{\"raw\": true}"[..]));
}

#[test]
fn unexpected_status_carries_error_body() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get_deserialized::<Widget, _>("widgets/9", done);
    // The body would decode fine; the status alone fails the request.
    respond(&transport.sink(), json_head(404), br#"{"id": 9, "name": "ghost"}"#);

    let err = take_one(&results).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnexpectedStatus);
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.error_content().and_then(Payload::as_json).unwrap()["name"], "ghost");
}

#[test]
fn undecodable_error_body_is_kept_as_bytes() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get("widgets/9", done);
    respond(&transport.sink(), json_head(500), b"<html>oops");

    let err = take_one(&results).unwrap_err();
    assert_eq!(err.error_content().and_then(Payload::as_bytes), Some(&b"<html>oops"[..]));
}

#[test]
fn custom_expected_codes() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service
        .request_builder()
        .head("widgets/9")
        .expected_status_codes(ExpectedStatusCodes::codes(&[404]).with_range(200..=204))
        .submit(done);
    respond(&transport.sink(), ResponseHead::new(404), b"");

    let response = take_one(&results).unwrap();
    assert_eq!(response.head.status, 404);
    assert!(response.payload.is_none());
}

#[test]
fn transport_failure_is_wrapped() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get("widgets", done);
    transport.sink().completed(Err(TransportError::Connection("reset".into())));

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::Transport(TransportError::Connection(_))));
    assert_eq!(err.code(), ErrorCode::TransportFailure);
}

#[test]
fn completion_without_response_fails() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get("widgets", done);
    transport.sink().completed(Ok(()));
    assert!(matches!(take_one(&results), Err(ServiceError::Transport(_))));
}

#[test]
fn refused_submission_is_reported() {
    let (service, transport) = setup();
    transport.offline.store(true, Ordering::SeqCst);
    let (results, done) = collector();
    let token = service.get("widgets", done);

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::Submission(_)));
    assert_eq!(err.code(), ErrorCode::SubmissionFailure);
    assert!(!token.is_active());
    assert_eq!(service.active_request_count(), 0);
}

// --- cancellation ---

#[test]
fn cancel_notifies_once_and_aborts_task() {
    let (service, transport) = setup();
    let (results, done) = collector();
    let token = service.get("widgets", done);
    let sink = transport.sink();

    token.cancel();
    token.cancel();
    assert!(!token.is_active());
    assert_eq!(transport.cancelled().len(), 1);

    // Late transport events are ignored.
    assert!(!sink.response_received(json_head(200)));
    sink.data_received(b"{}");
    sink.completed(Ok(()));

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled));
    assert_eq!(err.code(), ErrorCode::RequestCancelled);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let (service, transport) = setup();
    let (results, done) = collector();
    let token = service.get("widgets", done);
    respond(&transport.sink(), json_head(200), b"[]");

    token.cancel();
    assert!(take_one(&results).is_ok());
    assert!(transport.cancelled().is_empty());
}

#[test]
fn cancel_all_without_notification_is_silent() {
    let (service, transport) = setup();
    let (results, first) = collector();
    service.get("a", first);
    let (_, second) = collector();
    service.get("b", second);
    assert_eq!(service.active_request_count(), 2);

    service.cancel_all_requests(false);
    assert_eq!(service.active_request_count(), 0);
    assert_eq!(transport.cancelled().len(), 2);
    assert!(results.lock().unwrap().is_empty());
}

#[test]
fn clones_share_identity() {
    let (service, _) = setup();
    let token = service.get("widgets", |_| {});
    let copy = token.clone();
    assert_eq!(token, copy);
    copy.cancel();
    assert!(!token.is_active());
}

#[test]
fn cancel_and_complete_race_yields_one_callback() {
    let (service, transport) = setup();
    for _ in 0..200 {
        let (results, done) = collector();
        let token = service.get("widgets", done);
        let sink = transport.sink();
        let barrier = Arc::new(Barrier::new(2));

        let canceller = {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                token.cancel();
            })
        };
        let completer = thread::spawn(move || {
            barrier.wait();
            sink.response_received(json_head(200));
            sink.data_received(b"{}");
            sink.completed(Ok(()));
        });
        canceller.join().unwrap();
        completer.join().unwrap();

        match take_one(&results) {
            Ok(response) => assert_eq!(response.head.status, 200),
            Err(err) => assert!(matches!(err, ServiceError::Cancelled)),
        }
    }
    assert_eq!(service.active_request_count(), 0);
}

#[test]
fn dropping_the_service_cancels_outstanding_requests() {
    let (service, transport) = setup();
    let (results, done) = collector();
    let token = service.get("widgets", done);
    let sink = transport.sink();

    drop(service);
    assert!(matches!(take_one(&results), Err(ServiceError::Cancelled)));
    assert!(!token.is_active());
    sink.completed(Ok(()));
    token.cancel();
}

// --- builder validation ---

fn builder_error(result: RequestResult) -> BuilderError {
    match result {
        Err(ServiceError::Builder(error)) => error,
        other => panic!("expected a builder error, got {other:?}"),
    }
}

#[test]
fn invalid_builders_fail_through_the_callback() {
    let (service, transport) = setup();

    let (results, done) = collector();
    let token = service
        .request_builder()
        .get("widgets")
        .deserialize_to::<Widget>()
        .accept_raw_data()
        .submit(done);
    assert!(!token.is_active());
    assert_eq!(builder_error(take_one(&results)), BuilderError::DeserializeAndRawData);

    let (results, done) = collector();
    service.request_builder().get("widgets").submit_as_upload(true, done);
    assert_eq!(
        builder_error(take_one(&results)),
        BuilderError::UploadWithoutBody(HttpMethod::Get)
    );

    let (results, done) = collector();
    service.request_builder().post("upload").multipart().submit(done);
    assert_eq!(builder_error(take_one(&results)), BuilderError::EmptyMultipart);

    let (results, done) = collector();
    service
        .request_builder()
        .post("upload")
        .body_parameters(object(json!({"a": 1})))
        .append_part_with_data(&b"x"[..], "x", None, None)
        .submit(done);
    assert_eq!(builder_error(take_one(&results)), BuilderError::BodyAndMultipart);

    let (results, done) = collector();
    service
        .request_builder()
        .post("upload")
        .append_part_with_file("/definitely/not/here.bin", "doc")
        .submit(done);
    assert!(matches!(
        builder_error(take_one(&results)),
        BuilderError::UnreadablePart { .. }
    ));

    assert_eq!(transport.submitted_count(), 0);
    assert_eq!(service.active_request_count(), 0);
}

#[test]
#[traced_test]
fn cross_host_path_is_reported_in_report_mode() {
    let (service, transport) = setup();
    let (results, done) = collector();
    service.get("https://evil.example.org/steal", done);

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)));
    assert_eq!(err.code(), ErrorCode::GenericParameter);
    assert_eq!(transport.submitted_count(), 0);
    assert!(logs_contain("escapes the service host"));
}

#[test]
#[should_panic(expected = "escapes the service host")]
fn cross_host_path_panics_in_panic_mode() {
    let (service, _) =
        setup_with(ServiceConfig::new(&format!("https://{HOST}/")).with_violations(ViolationPolicy::Panic));
    service.get("https://evil.example.org/steal", |_| {});
}

// --- request shape ---

#[test]
fn requests_carry_service_settings() {
    let config = ServiceConfig {
        background_default: true,
        ..ServiceConfig::new(&format!("https://{HOST}/v1")).with_user_agent("agent/2")
    };
    let (service, transport) = setup_with(config);
    service.set_authorization_header("Bearer one");
    service.get("/widgets?active=true", |_| {});

    let (request, _) = transport.last();
    assert_eq!(request.url.as_str(), "https://api.example.com/v1/widgets?active=true");
    assert_eq!(request.header("authorization"), Some("Bearer one"));
    assert_eq!(request.header("user-agent"), Some("agent/2"));
    assert!(request.allows_background);

    service.clear_authorization();
    service
        .request_builder()
        .get("widgets")
        .can_send_in_background(false)
        .submit(|_| {});
    let (request, _) = transport.last();
    assert_eq!(request.header("authorization"), None);
    assert!(!request.allows_background);
}

#[test]
fn multipart_upload_streams_declared_length() {
    let (service, transport) = setup();
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(br#"{"k": "v"}"#).unwrap();

    service
        .request_builder()
        .post("upload")
        .append_part_with_data(&b"0123456789"[..], "file", Some("digits.bin"), None)
        .append_part_with_file(file.path(), "doc")
        .submit(|_| {});

    let (request, sink) = transport.last();
    assert_eq!(request.kind, TaskKind::Upload);
    let RequestBody::Multipart(body) = &request.body else {
        panic!("expected multipart body");
    };
    assert_eq!(body.parts()[1].mime_type(), Some("application/json"));

    // The transport may ask for a fresh stream, e.g. after a redirect.
    for _ in 0..2 {
        let mut bytes = Vec::new();
        sink.new_body_stream().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, body.content_length());
        assert_eq!(
            request.header("Content-Length"),
            Some(bytes.len().to_string().as_str())
        );
    }
}

#[test]
fn callbacks_run_on_the_requested_queue() {
    let (service, transport) = setup();
    let queue = Arc::new(SerialQueue::new("widgets-callbacks").unwrap());
    let (tx, rx) = std::sync::mpsc::channel();
    service
        .request_builder()
        .get("widgets")
        .completion_queue(queue)
        .submit(move |result| {
            let name = thread::current().name().map(str::to_string);
            tx.send((result.is_ok(), name)).unwrap();
        });
    respond(&transport.sink(), json_head(200), b"{}");

    let (ok, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ok);
    assert_eq!(name.as_deref(), Some("widgets-callbacks"));
}

#[test]
fn channel_submission_delivers_result() {
    let (service, transport) = setup();
    let (token, receiver) = service.request_builder().get("widgets").submit_channel();
    respond(&transport.sink(), json_head(200), b"[1, 2]");

    let response = receiver.blocking_recv().unwrap().unwrap();
    assert_eq!(response.payload.as_json(), Some(&json!([1, 2])));
    assert!(!token.is_active());
}

// --- downloads ---

#[test]
fn download_moves_file_and_reports_progress() {
    let (service, transport) = setup();
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("out").join("report.bin");
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let (results, done) = collector();
    service.download(
        "files/report.bin",
        &destination,
        Some(Arc::new(move |p: DownloadProgress| seen.lock().unwrap().push(p))),
        done,
    );

    let (request, sink) = transport.last();
    assert_eq!(request.kind, TaskKind::Download);
    let temp = dir.path().join("partial");
    std::fs::write(&temp, b"downloaded bytes").unwrap();

    assert!(sink.response_received(ResponseHead::new(200)));
    sink.download_progress(10, 10, Some(16));
    sink.download_progress(6, 16, Some(16));
    sink.download_finished(&temp);
    sink.completed(Ok(()));

    let response = take_one(&results).unwrap();
    assert!(response.payload.is_none());
    assert_eq!(std::fs::read(&destination).unwrap(), b"downloaded bytes");
    assert!(!temp.exists());
    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 2);
    assert_eq!(progress[1].total_bytes_written, 16);
    assert_eq!(progress[1].total_bytes_expected, Some(16));
}

#[test]
fn download_without_file_fails() {
    let (service, transport) = setup();
    let dir = tempfile::tempdir().unwrap();
    let (results, done) = collector();
    service.download("files/x", dir.path().join("x"), None, done);
    let sink = transport.sink();
    sink.response_received(ResponseHead::new(200));
    sink.completed(Ok(()));

    let err = take_one(&results).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DownloadFailure);
}

#[test]
fn error_status_download_leaves_destination_untouched() {
    let (service, transport) = setup();
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("report.bin");
    std::fs::write(&destination, b"previous good copy").unwrap();
    let (results, done) = collector();
    service.download("files/report.bin", &destination, None, done);

    let sink = transport.sink();
    let temp = dir.path().join("partial");
    std::fs::write(&temp, b"<html>404 not found</html>").unwrap();
    assert!(sink.response_received(ResponseHead::new(404).with_header("Content-Type", "text/html")));
    sink.download_finished(&temp);
    sink.completed(Ok(()));

    let err = take_one(&results).unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(std::fs::read(&destination).unwrap(), b"previous good copy");
    assert!(!temp.exists());
    assert!(err.error_content().is_some());
}

/// Holds jobs until the test drains them.
#[derive(Default)]
struct HeldQueue {
    jobs: Mutex<Vec<Job>>,
}

impl HeldQueue {
    fn drain(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
        for job in jobs {
            job();
        }
    }
}

impl CompletionQueue for HeldQueue {
    fn dispatch(&self, job: Job) {
        self.jobs.lock().unwrap().push(job);
    }
}

#[test]
fn queued_progress_is_dropped_once_cancelled() {
    let transport = Arc::new(ScriptedTransport::default());
    let queue = Arc::new(HeldQueue::default());
    let config = ServiceConfig::new(&format!("https://{HOST}/v1"));
    let service = DataRequestService::with_queue(&config, transport.clone(), queue.clone()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let progress_order = order.clone();
    let done_order = order.clone();
    let token = service.download(
        "files/report.bin",
        dir.path().join("report.bin"),
        Some(Arc::new(move |p: DownloadProgress| {
            progress_order.lock().unwrap().push(format!("progress {}", p.bytes_written))
        })),
        move |result: RequestResult| done_order.lock().unwrap().push(format!("terminal ok={}", result.is_ok())),
    );

    let sink = transport.sink();
    assert!(sink.response_received(ResponseHead::new(200)));
    sink.download_progress(4, 4, Some(8));
    token.cancel();
    queue.drain();

    assert_eq!(*order.lock().unwrap(), vec!["terminal ok=false".to_string()]);
}

// --- trust ---

fn certificate() -> Certificate {
    Certificate::new(&b"leaf-der"[..], &b"leaf-spki"[..])
}

fn trust(host: &str, evaluation: ChainEvaluation) -> ServerTrust {
    ServerTrust {
        host: host.to_string(),
        chain: vec![certificate()],
        evaluation,
    }
}

#[test]
fn pinned_service_accepts_matching_certificate() {
    let config = ServiceConfig::new(&format!("https://{HOST}/"))
        .with_pinning(PinningPolicy::Certificate, vec![pin_for(b"leaf-der")]);
    let (service, transport) = setup_with(config);

    assert!(service
        .validate_security_challenge(&trust(HOST, ChainEvaluation::Trusted))
        .is_accepted());

    let (results, done) = collector();
    service.get("widgets", done);
    let sink = transport.sink();
    assert!(sink.challenge(&trust(HOST, ChainEvaluation::Trusted)));
    respond(&sink, json_head(200), b"{}");
    assert!(take_one(&results).is_ok());
}

#[test]
fn trust_rejection_becomes_the_failure_reason() {
    let config = ServiceConfig::new(&format!("https://{HOST}/"))
        .with_pinning(PinningPolicy::PublicKey, vec![pin_for(b"some-other-key")]);
    let (service, transport) = setup_with(config);
    let (results, done) = collector();
    service.get("widgets", done);

    let sink = transport.sink();
    assert!(!sink.challenge(&trust(HOST, ChainEvaluation::Trusted)));
    sink.completed(Err(TransportError::Connection("handshake aborted".into())));

    let err = take_one(&results).unwrap_err();
    assert!(matches!(err, ServiceError::Trust(TrustFailure::PinMismatch)));
    assert_eq!(err.code(), ErrorCode::TrustFailure);
}

#[test]
fn other_hosts_are_rejected() {
    let (service, _) = setup();
    let decision = service.validate_security_challenge(&trust("evil.example.org", ChainEvaluation::Trusted));
    assert!(matches!(
        decision.into_result(),
        Err(TrustFailure::DomainMismatch { .. })
    ));
}

#[test]
fn url_get_uses_platform_trust_only() {
    let config = ServiceConfig::new(&format!("https://{HOST}/"))
        .with_pinning(PinningPolicy::Certificate, vec![pin_for(b"pinned")]);
    let (service, transport) = setup_with(config);
    service.set_authorization_header("Bearer one");

    let (results, done) = collector();
    service.url_get("https://cdn.example.net/logo.png", done);
    let (request, sink) = transport.last();
    assert_eq!(request.url.host_str(), Some("cdn.example.net"));
    assert_eq!(request.header("authorization"), None);

    assert!(sink.challenge(&trust("cdn.example.net", ChainEvaluation::Trusted)));
    assert!(!sink.challenge(&trust(
        "cdn.example.net",
        ChainEvaluation::Failed(TrustFailure::Expired)
    )));
    respond(&sink, ResponseHead::new(200).with_header("Content-Type", "image/png"), b"\x89PNG");
    // The failed challenge above was recorded against the request.
    assert!(matches!(
        take_one(&results),
        Err(ServiceError::Trust(TrustFailure::Expired))
    ));
}

#[test]
fn submitted_requests_are_counted_until_terminal() {
    let (service, transport) = setup();
    let counter = Arc::new(AtomicUsize::new(0));
    for path in ["a", "b", "c"] {
        let counter = counter.clone();
        service.get(path, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(service.active_request_count(), 3);
    respond(&transport.sink(), json_head(200), b"{}");
    assert_eq!(service.active_request_count(), 2);
    service.cancel_all_requests(true);
    assert_eq!(service.active_request_count(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}
