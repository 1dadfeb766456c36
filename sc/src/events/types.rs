//! Event types published on the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{RefreshReason, UserId};

/// Events published by the safety center
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScEvent {
    /// A source is asked to push fresh data
    RefreshRequested {
        broadcast_id: String,
        reason: RefreshReason,
        source_id: String,
        package_name: String,
        user_ids: Vec<UserId>,
        at: DateTime<Utc>,
    },

    /// A user picked an action on an issue
    IssueActionRequested {
        issue_key: String,
        action_id: String,
        source_id: String,
        /// Package of the owning source, if the catalog names one
        package_name: Option<String>,
        user_id: UserId,
        at: DateTime<Utc>,
    },
}

impl ScEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            ScEvent::RefreshRequested { .. } => "RefreshRequested",
            ScEvent::IssueActionRequested { .. } => "IssueActionRequested",
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            ScEvent::RefreshRequested { at, .. } | ScEvent::IssueActionRequested { at, .. } => *at,
        }
    }

    /// Whether the event is addressed to `package_name` running as `user_id`
    pub fn is_for(&self, package: &str, user: UserId) -> bool {
        match self {
            ScEvent::RefreshRequested {
                package_name, user_ids, ..
            } => package_name == package && user_ids.contains(&user),
            ScEvent::IssueActionRequested {
                package_name, user_id, ..
            } => package_name.as_deref() == Some(package) && *user_id == user,
        }
    }
}
