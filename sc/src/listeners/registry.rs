//! ListenerRegistry - user id to listener set, plus best-effort fan-out

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tracing::{debug, warn};

use super::handle::{ListenerHandle, ListenerId, ListenerUpdate};
use crate::domain::{ProfileGroup, UserId};

/// Listeners registered under one user id, as snapshotted for delivery
pub type ListenerSet = Vec<ListenerHandle>;

/// Tally of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registered listeners, keyed by the user each was registered under
///
/// Owned by the fast-lock state; every method runs with that lock held.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    by_user: HashMap<UserId, HashMap<ListenerId, ListenerHandle>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under `user_id`; true if it was not already registered there
    pub fn add(&mut self, handle: ListenerHandle, user_id: UserId) -> bool {
        let id = handle.id();
        let added = self.by_user.entry(user_id).or_default().insert(id, handle).is_none();
        debug!(%id, user_id, added, "ListenerRegistry::add");
        added
    }

    /// Unregister; removing an unknown handle is a no-op
    pub fn remove(&mut self, handle: &ListenerHandle, user_id: UserId) -> bool {
        let Some(set) = self.by_user.get_mut(&user_id) else {
            return false;
        };
        let removed = set.remove(&handle.id()).is_some();
        if set.is_empty() {
            self.by_user.remove(&user_id);
        }
        debug!(id = %handle.id(), user_id, removed, "ListenerRegistry::remove");
        removed
    }

    /// Snapshot the listener sets of every user in `group`
    pub fn listeners_for(&self, group: &ProfileGroup) -> Vec<ListenerSet> {
        group
            .user_ids()
            .into_iter()
            .filter_map(|user_id| self.by_user.get(&user_id))
            .map(|set| set.values().cloned().collect())
            .collect()
    }

    pub fn count_for(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map_or(0, |s| s.len())
    }

    pub fn len(&self) -> usize {
        self.by_user.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

/// Notify every handle in `listener_sets` once, concurrently
///
/// Must be called without any lock held. A handle present in more than one
/// set is notified once. Failures are logged and counted; the handle stays
/// registered.
pub async fn deliver(listener_sets: &[ListenerSet], update: &ListenerUpdate) -> DeliveryReport {
    let mut seen = HashSet::new();
    let targets: Vec<&ListenerHandle> = listener_sets
        .iter()
        .flatten()
        .filter(|handle| seen.insert(handle.id()))
        .collect();
    debug!(targets = targets.len(), "deliver: called");

    let results = join_all(targets.iter().map(|handle| async move {
        let outcome = handle.notify(update.clone()).await;
        (handle.id(), outcome)
    }))
    .await;

    let mut report = DeliveryReport::default();
    for (id, outcome) in results {
        match outcome {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(%id, error = %e, "Failed to deliver update to listener");
                report.failed += 1;
            }
        }
    }
    report
}

/// Notify a single handle
pub async fn deliver_to(handle: &ListenerHandle, update: &ListenerUpdate) -> DeliveryReport {
    deliver(&[vec![handle.clone()]], update).await
}
