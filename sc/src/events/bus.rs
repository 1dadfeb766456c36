//! Event Bus - pub/sub for safety center events
//!
//! Uses a tokio broadcast channel: emitting never blocks, slow subscribers
//! lag and lose the oldest events.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::ScEvent;
use crate::domain::UserId;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Central event bus
pub struct EventBus {
    tx: broadcast::Sender<ScEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped.
    pub fn emit(&self, event: ScEvent) {
        debug!(event_type = event.event_type(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ScEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Bus events addressed to one source package and user
pub struct SourceFeed {
    rx: broadcast::Receiver<ScEvent>,
    package_name: String,
    user_id: UserId,
}

impl SourceFeed {
    pub fn new(bus: &EventBus, package_name: impl Into<String>, user_id: UserId) -> Self {
        Self {
            rx: bus.subscribe(),
            package_name: package_name.into(),
            user_id,
        }
    }

    /// Next event for this source; `None` once the bus closes
    ///
    /// Cancel safe, so it can sit in a `select!`.
    pub async fn next(&mut self) -> Option<ScEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.is_for(&self.package_name, self.user_id) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, package = %self.package_name, "Source feed lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Log every event on the bus until it closes
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event_type = event.event_type(), %json, "Event"),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("spawn_event_logger: bus closed");
    })
}
