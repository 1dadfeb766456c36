//! Listener handles and the notification interface

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{AggregatedView, ErrorDetails};

/// Payload delivered to a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ListenerUpdate {
    /// New aggregated view for the listener's profile group
    Data { view: AggregatedView },
    /// A source reported an error
    Error { details: ErrorDetails },
}

/// Why a single delivery failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    #[error("Listener endpoint disconnected")]
    Disconnected,

    #[error("Listener delivery timed out")]
    TimedOut,

    #[error("Listener delivery failed: {0}")]
    Failed(String),
}

/// A subscriber's remote endpoint
#[async_trait]
pub trait DataChangedListener: Send + Sync {
    /// One-way notification; an `Err` means this endpoint is unreachable
    async fn on_update(&self, update: ListenerUpdate) -> Result<(), ListenerError>;
}

/// Identity of a registered listener
pub type ListenerId = Uuid;

/// Opaque, cloneable reference to a subscriber
///
/// Clones share an id, so registering a clone is registering the same listener.
#[derive(Clone)]
pub struct ListenerHandle {
    id: ListenerId,
    sink: Arc<dyn DataChangedListener>,
}

impl ListenerHandle {
    pub fn new(sink: Arc<dyn DataChangedListener>) -> Self {
        Self {
            id: Uuid::now_v7(),
            sink,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub async fn notify(&self, update: ListenerUpdate) -> Result<(), ListenerError> {
        self.sink.on_update(update).await
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ListenerHandle {}

impl Hash for ListenerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}
