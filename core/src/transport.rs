//! The boundary to whatever actually moves bytes.
//!
//! # Design
//! The core never opens sockets. A `Transport` receives fully specified
//! `HttpRequest` values together with an `EventSink`, runs them however it
//! likes (thread pool, async runtime, platform networking stack) and reports
//! progress back through the sink from any thread. The handle it returns is
//! what the core later passes to `cancel`.

use crate::error::TransportError;
use crate::http::HttpRequest;
use crate::tracker::EventSink;

/// Transport-assigned identifier of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

pub trait Transport: Send + Sync {
    /// Starts `request`. Events for it must be reported through `events`;
    /// they may be reported before this call returns.
    fn submit(&self, request: HttpRequest, events: EventSink) -> Result<TaskHandle, TransportError>;

    /// Aborts a running task. Called at most once per task, only after the
    /// core has already settled the request as cancelled.
    fn cancel(&self, handle: TaskHandle);
}
