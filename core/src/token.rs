//! Cancellation handles returned to callers.
//!
//! A token never owns the request it refers to. It holds the request's
//! identity and a weak reference to whichever service tracks it, so dropping
//! the service (or the request finishing) leaves the token inert.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Weak;

use uuid::Uuid;

/// Identity of one submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Something that can cancel the items it hands out tokens for.
pub trait CancellableItemService: Send + Sync {
    fn cancel_item(&self, id: RequestId);
    fn is_item_active(&self, id: RequestId) -> bool;
}

/// Handle that cancels exactly one in-flight request.
///
/// Clones refer to the same request. Cancelling after the request finished
/// is a no-op.
#[derive(Clone)]
pub struct CancellableToken {
    id: RequestId,
    service: Option<Weak<dyn CancellableItemService>>,
}

impl CancellableToken {
    pub(crate) fn new(id: RequestId, service: Weak<dyn CancellableItemService>) -> Self {
        Self {
            id,
            service: Some(service),
        }
    }

    /// A token that is not attached to any request. Returned when a request
    /// is rejected before it could be registered.
    pub fn detached(id: RequestId) -> Self {
        Self { id, service: None }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn cancel(&self) {
        if let Some(service) = self.service.as_ref().and_then(Weak::upgrade) {
            service.cancel_item(self.id);
        }
    }

    /// Whether the request is still in flight.
    pub fn is_active(&self) -> bool {
        self.service
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|service| service.is_item_active(self.id))
    }
}

impl PartialEq for CancellableToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CancellableToken {}

impl Hash for CancellableToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for CancellableToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableToken")
            .field("id", &self.id)
            .field("attached", &self.service.is_some())
            .finish()
    }
}
