//! In-process event bus.
//!
//! Two broadcast channels: one for raw [`EntityEvent`]s fired by writers,
//! one for coarse [`ChangeNotification`]s published by the coalescer.
//! Delivery is best-effort: slow receivers may lag and lose messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{EventError, EventResult};
use crate::event::{ChangeNotification, EntityEvent};

/// Destination of coarse change notifications.
pub trait NotificationSink: Send + Sync {
    /// Publish one notification, returning how many receivers got it.
    fn publish(&self, notification: ChangeNotification) -> EventResult<usize>;
}

#[derive(Clone)]
pub struct EventBus {
    entities: broadcast::Sender<EntityEvent>,
    changes: broadcast::Sender<ChangeNotification>,
    closed: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (entities, _) = broadcast::channel(capacity);
        let (changes, _) = broadcast::channel(capacity);
        Self {
            entities,
            changes,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire a raw entity event. Having no listener is not an error: writers
    /// never depend on anyone observing their events.
    pub fn fire(&self, event: EntityEvent) {
        if self.is_closed() {
            return;
        }
        let delivered = self.entities.send(event).unwrap_or(0);
        trace!(delivered, "entity event fired");
    }

    pub fn subscribe_entities(&self) -> broadcast::Receiver<EntityEvent> {
        self.entities.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    /// Stop accepting messages. Subsequent publishes fail with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NotificationSink for EventBus {
    fn publish(&self, notification: ChangeNotification) -> EventResult<usize> {
        if self.is_closed() {
            return Err(EventError::Closed);
        }
        self.changes
            .send(notification)
            .map_err(|_| EventError::NoSubscribers("change notifications"))
    }
}
