//! Data exchanged with sources and listeners
//!
//! Sources push [`SourceReport`]s tagged with a [`SafetyEvent`]; observers
//! receive [`AggregatedView`]s computed by the tracker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::UserId;
use crate::error::{ServiceError, ServiceResult};

/// Severity of a source status or issue, ordered from least to most severe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeverityLevel {
    #[default]
    Unspecified,
    Information,
    Recommendation,
    CriticalWarning,
}

impl FromStr for SeverityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unspecified" => Ok(SeverityLevel::Unspecified),
            "information" | "info" => Ok(SeverityLevel::Information),
            "recommendation" => Ok(SeverityLevel::Recommendation),
            "critical-warning" | "critical" => Ok(SeverityLevel::CriticalWarning),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SeverityLevel::Unspecified => "unspecified",
            SeverityLevel::Information => "information",
            SeverityLevel::Recommendation => "recommendation",
            SeverityLevel::CriticalWarning => "critical-warning",
        };
        f.write_str(s)
    }
}

/// Overall status a source reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
}

/// An action a user can take to resolve an issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueAction {
    pub id: String,
    pub label: String,
}

/// A single issue raised by a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIssue {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
    #[serde(default)]
    pub actions: Vec<IssueAction>,
}

/// Raw report pushed by one source for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    #[serde(default)]
    pub status: Option<SourceStatus>,
    #[serde(default)]
    pub issues: Vec<SourceIssue>,
}

impl SourceReport {
    /// Report carrying only a status
    pub fn with_status(title: impl Into<String>, summary: impl Into<String>, severity: SeverityLevel) -> Self {
        Self {
            status: Some(SourceStatus {
                title: title.into(),
                summary: summary.into(),
                severity,
            }),
            issues: Vec::new(),
        }
    }

    pub fn push_issue(mut self, issue: SourceIssue) -> Self {
        self.issues.push(issue);
        self
    }

    /// Highest severity across the status and all issues
    pub fn max_severity(&self) -> SeverityLevel {
        self.issues
            .iter()
            .map(|i| i.severity)
            .chain(self.status.iter().map(|s| s.severity))
            .max()
            .unwrap_or_default()
    }
}

/// Why a source pushed its report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyEventType {
    SourceStateChanged,
    RefreshRequested,
    ResolvingActionSucceeded,
    ResolvingActionFailed,
    DeviceLocaleChanged,
    DeviceRebooted,
}

impl FromStr for SafetyEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "source-state-changed" => Ok(SafetyEventType::SourceStateChanged),
            "refresh-requested" => Ok(SafetyEventType::RefreshRequested),
            "resolving-action-succeeded" => Ok(SafetyEventType::ResolvingActionSucceeded),
            "resolving-action-failed" => Ok(SafetyEventType::ResolvingActionFailed),
            "device-locale-changed" => Ok(SafetyEventType::DeviceLocaleChanged),
            "device-rebooted" => Ok(SafetyEventType::DeviceRebooted),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// Event accompanying a source report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyEvent {
    #[serde(rename = "type")]
    pub kind: SafetyEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_broadcast_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_issue_action_id: Option<String>,
}

impl SafetyEvent {
    pub fn new(kind: SafetyEventType) -> Self {
        Self {
            kind,
            refresh_broadcast_id: None,
            source_issue_id: None,
            source_issue_action_id: None,
        }
    }

    pub fn state_changed() -> Self {
        Self::new(SafetyEventType::SourceStateChanged)
    }

    /// Event answering the refresh broadcast with the given id
    pub fn refresh_requested(broadcast_id: impl Into<String>) -> Self {
        Self {
            refresh_broadcast_id: Some(broadcast_id.into()),
            ..Self::new(SafetyEventType::RefreshRequested)
        }
    }

    pub fn resolving_action(succeeded: bool, issue_id: impl Into<String>, action_id: impl Into<String>) -> Self {
        let kind = if succeeded {
            SafetyEventType::ResolvingActionSucceeded
        } else {
            SafetyEventType::ResolvingActionFailed
        };
        Self {
            source_issue_id: Some(issue_id.into()),
            source_issue_action_id: Some(action_id.into()),
            ..Self::new(kind)
        }
    }

    /// Check that the fields required by the event type are present
    pub fn validate(&self) -> ServiceResult<()> {
        fn present(field: &Option<String>) -> bool {
            field.as_deref().is_some_and(|s| !s.trim().is_empty())
        }

        match self.kind {
            SafetyEventType::RefreshRequested if !present(&self.refresh_broadcast_id) => Err(ServiceError::invalid(
                "refresh-requested event requires a refresh broadcast id",
            )),
            SafetyEventType::ResolvingActionSucceeded | SafetyEventType::ResolvingActionFailed
                if !present(&self.source_issue_id) || !present(&self.source_issue_action_id) =>
            {
                Err(ServiceError::invalid(
                    "resolving-action event requires a source issue id and action id",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Why a refresh was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshReason {
    PageOpen,
    ButtonClick,
    Reboot,
    LocaleChange,
    SafetyCenterEnabled,
    Other,
}

impl FromStr for RefreshReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "page-open" => Ok(RefreshReason::PageOpen),
            "button-click" => Ok(RefreshReason::ButtonClick),
            "reboot" => Ok(RefreshReason::Reboot),
            "locale-change" => Ok(RefreshReason::LocaleChange),
            "safety-center-enabled" => Ok(RefreshReason::SafetyCenterEnabled),
            "other" => Ok(RefreshReason::Other),
            other => Err(format!("unknown refresh reason: {}", other)),
        }
    }
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefreshReason::PageOpen => "page-open",
            RefreshReason::ButtonClick => "button-click",
            RefreshReason::Reboot => "reboot",
            RefreshReason::LocaleChange => "locale-change",
            RefreshReason::SafetyCenterEnabled => "safety-center-enabled",
            RefreshReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// Structured error delivered to listeners or reported by a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
}

impl ErrorDetails {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Headline status of an aggregated view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStatus {
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
}

/// One source's contribution for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEntry {
    pub source_id: String,
    pub user_id: UserId,
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
}

/// An issue surfaced in the aggregated view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewIssue {
    /// Key used to dismiss the issue: `source/issue/user`
    pub key: String,
    pub source_id: String,
    pub user_id: UserId,
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
    #[serde(default)]
    pub actions: Vec<IssueAction>,
}

/// Dataset returned to callers and delivered to listeners for one profile group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedView {
    pub status: ViewStatus,
    #[serde(default)]
    pub entries: Vec<ViewEntry>,
    #[serde(default)]
    pub issues: Vec<ViewIssue>,
}

impl Default for AggregatedView {
    /// View returned when the service is disabled or the user is absent
    fn default() -> Self {
        Self {
            status: ViewStatus {
                title: "Unknown".to_string(),
                summary: String::new(),
                severity: SeverityLevel::Unspecified,
            },
            entries: Vec::new(),
            issues: Vec::new(),
        }
    }
}
