//! Execution contexts that completion callbacks are dispatched onto.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use tokio::sync::mpsc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a request's completion (and progress) callbacks run.
pub trait CompletionQueue: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs jobs on whichever thread dispatches them.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl CompletionQueue for InlineQueue {
    fn dispatch(&self, job: Job) {
        job();
    }
}

/// Runs jobs one at a time, in dispatch order, on a dedicated thread.
///
/// The worker exits once the queue is dropped and the backlog is drained. A
/// panicking job is logged and does not take the worker down.
#[derive(Debug)]
pub struct SerialQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new(name: &str) -> io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("completion callback panicked");
                }
            }
        })?;
        Ok(Self { sender })
    }
}

impl CompletionQueue for SerialQueue {
    fn dispatch(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job) {
            tracing::warn!("serial queue worker is gone, running callback inline");
            job();
        }
    }
}

/// Jobs run on the runtime's blocking pool.
impl CompletionQueue for tokio::runtime::Handle {
    fn dispatch(&self, job: Job) {
        drop(self.spawn_blocking(job));
    }
}
