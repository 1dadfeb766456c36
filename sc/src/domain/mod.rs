//! Domain types for the safety center
//!
//! Identities and permissions (`types`), the data flowing through the
//! service (`data`), and the active source catalog (`catalog`).

mod catalog;
mod data;
mod types;

pub use catalog::{CatalogError, ConfigReader, ProfileScope, SourceCatalog, SourceConfig, SourceGroup, SourceKind};
pub use data::{
    AggregatedView, ErrorDetails, IssueAction, RefreshReason, SafetyEvent, SafetyEventType, SeverityLevel,
    SourceIssue, SourceReport, SourceStatus, ViewEntry, ViewIssue, ViewStatus,
};
pub use types::{CallerContext, PER_USER_RANGE, Permission, ProfileGroup, Uid, UserId, user_id_of};
