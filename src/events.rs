use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::session::SessionState;

/// Notifications towards whatever UI drives the segmenter.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentationEvent {
    /// Overall progress in percent, 0 to 100.
    Progress { percent: f32, message: String },
    StateChanged(SessionState),
    Error(String),
}

pub type EventHandler = Arc<dyn Fn(&SegmentationEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of subscribers.
///
/// Delivery is synchronous and in registration order. A handler that returns
/// an error or panics is logged and skipped; the rest still receive the event.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<(SubscriptionId, EventHandler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SegmentationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn emit(&self, event: &SegmentationEvent) {
        // Snapshot so a handler may subscribe or unsubscribe without deadlocking.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(?event, error = %e, "event handler failed"),
                Err(_) => warn!(?event, "event handler panicked"),
            }
        }
    }

    pub fn progress(&self, percent: f32, message: impl Into<String>) {
        self.emit(&SegmentationEvent::Progress {
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        });
    }

    pub fn state_changed(&self, state: SessionState) {
        self.emit(&SegmentationEvent::StateChanged(state));
    }

    pub fn error(&self, error: &crate::errors::MapSegError) {
        self.emit(&SegmentationEvent::Error(error.to_string()));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
