//! IPC message types
//!
//! Newline-delimited JSON. Each message is a single line of JSON followed by `\n`.
//! The caller's uid is never part of a request; the server takes it from the
//! socket's peer credentials. `user_id` defaults to the caller's own user.

use serde::{Deserialize, Serialize};

use crate::domain::{AggregatedView, ErrorDetails, RefreshReason, SafetyEvent, SourceCatalog, SourceReport, UserId};
use crate::error::ServiceError;
use crate::events::ScEvent;
use crate::listeners::ListenerUpdate;
use crate::service::RefreshTicket;

/// Requests from clients to the service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Request {
    /// Check the service is alive
    Ping,

    IsEnabled,

    PushReport {
        source_id: String,
        #[serde(default)]
        package_name: Option<String>,
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        report: Option<SourceReport>,
        event: SafetyEvent,
    },

    ReadReport {
        source_id: String,
        #[serde(default)]
        package_name: Option<String>,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    ReportError {
        source_id: String,
        #[serde(default)]
        package_name: Option<String>,
        #[serde(default)]
        user_id: Option<UserId>,
        details: ErrorDetails,
    },

    Refresh {
        reason: RefreshReason,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    GetConfig,

    GetView {
        #[serde(default)]
        user_id: Option<UserId>,
    },

    /// Keep the connection open and stream `Update` responses
    Subscribe {
        #[serde(default)]
        user_id: Option<UserId>,
    },

    /// Keep the connection open and stream `SourceRequest` responses
    /// addressed to the caller's package
    WatchRequests {
        #[serde(default)]
        package_name: Option<String>,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    DismissIssue {
        issue_id: String,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    ExecuteAction {
        issue_id: String,
        action_id: String,
        #[serde(default)]
        user_id: Option<UserId>,
    },

    ClearAll,

    SetConfigOverride { catalog: SourceCatalog },

    ClearConfigOverride,
}

/// Category of an error response
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Denied,
    PackageMismatch,
    InvalidArgument,
    /// Malformed or oversized request
    Protocol,
}

/// Responses from the service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Response {
    /// Acknowledgment
    Ok,

    Pong { version: String },

    Enabled { enabled: bool },

    Report { report: Option<SourceReport> },

    Refreshed { ticket: Option<RefreshTicket> },

    Config { catalog: Option<SourceCatalog> },

    View { view: AggregatedView },

    /// Subscription is live; updates follow on the same connection
    Subscribed,

    Update { update: ListenerUpdate },

    /// A refresh or issue action the watching source should act on
    SourceRequest { event: ScEvent },

    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Response::Error {
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for Response {
    fn from(e: ServiceError) -> Self {
        let kind = match &e {
            ServiceError::Denied { .. } => ErrorKind::Denied,
            ServiceError::PackageMismatch { .. } => ErrorKind::PackageMismatch,
            ServiceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        };
        Response::Error {
            kind,
            message: e.to_string(),
        }
    }
}
