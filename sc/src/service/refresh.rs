//! Refresher - asks sources to push fresh data
//!
//! Invoked only while the slow lock is held. A refresher may take a long
//! time and may cause sources to call back into the core; those calls only
//! need the fast lock, so they proceed while a refresh is running.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{ProfileGroup, RefreshReason, SourceCatalog, UserId};
use crate::events::{EventBus, ScEvent};

/// Result of one refresh round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTicket {
    pub broadcast_id: String,
    pub reason: RefreshReason,
    /// Number of sources asked to refresh
    pub sources: usize,
    pub at: DateTime<Utc>,
}

/// Long-running refresh orchestration
#[async_trait]
pub trait Refresher: Send {
    async fn refresh(
        &mut self,
        catalog: &SourceCatalog,
        reason: RefreshReason,
        group: &ProfileGroup,
    ) -> eyre::Result<RefreshTicket>;
}

/// Refresher that publishes one `RefreshRequested` event per refreshable source
pub struct BroadcastRefresher {
    bus: Arc<EventBus>,
    /// Latest ticket per profile-group parent
    last: HashMap<UserId, RefreshTicket>,
}

impl BroadcastRefresher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            last: HashMap::new(),
        }
    }

    /// The most recent refresh issued for the group headed by `parent`
    pub fn last_ticket(&self, parent: UserId) -> Option<&RefreshTicket> {
        self.last.get(&parent)
    }
}

#[async_trait]
impl Refresher for BroadcastRefresher {
    async fn refresh(
        &mut self,
        catalog: &SourceCatalog,
        reason: RefreshReason,
        group: &ProfileGroup,
    ) -> eyre::Result<RefreshTicket> {
        let broadcast_id = Uuid::now_v7().to_string();
        let at = Utc::now();
        debug!(%broadcast_id, %reason, parent = group.parent(), "BroadcastRefresher::refresh: called");

        let mut sources = 0;
        for source in catalog.sources().filter(|s| s.is_refreshable()) {
            let Some(package_name) = source.package_name.clone() else {
                continue;
            };
            self.bus.emit(ScEvent::RefreshRequested {
                broadcast_id: broadcast_id.clone(),
                reason,
                source_id: source.id.clone(),
                package_name,
                user_ids: group.user_ids(),
                at,
            });
            sources += 1;
        }

        info!(%broadcast_id, %reason, sources, "Refresh broadcast sent");
        let ticket = RefreshTicket {
            broadcast_id,
            reason,
            sources,
            at,
        };
        self.last.insert(group.parent(), ticket.clone());
        Ok(ticket)
    }
}
