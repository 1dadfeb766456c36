//! Tracker - holds source reports and computes aggregated views
//!
//! Only touched while the fast lock is held.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::domain::{
    AggregatedView, ProfileGroup, ProfileScope, SeverityLevel, SourceCatalog, SourceReport, UserId, ViewEntry,
    ViewIssue, ViewStatus,
};

/// Store of per-source reports and producer of aggregated views
pub trait Tracker: Send {
    /// Store (or with `None`, drop) a source's report; true if the stored state changed
    fn set_source_data(
        &mut self,
        catalog: &SourceCatalog,
        source_id: &str,
        report: Option<SourceReport>,
        package_name: &str,
        user_id: UserId,
    ) -> bool;

    /// The stored report, if the source and package match the catalog
    fn source_data(
        &self,
        catalog: &SourceCatalog,
        source_id: &str,
        package_name: &str,
        user_id: UserId,
    ) -> Option<SourceReport>;

    /// Hide an issue from the group's view; true if the view changed
    fn dismiss_issue(&mut self, catalog: &SourceCatalog, issue_key: &str, group: &ProfileGroup) -> bool;

    fn aggregated_view(&self, catalog: &SourceCatalog, group: &ProfileGroup) -> AggregatedView;

    /// Drop all reports and dismissals
    fn clear(&mut self);
}

/// Build the key that identifies an issue across sources and users
pub fn issue_key(source_id: &str, issue_id: &str, user_id: UserId) -> String {
    format!("{}/{}/{}", source_id, issue_id, user_id)
}

/// In-memory tracker
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    reports: HashMap<(String, UserId), SourceReport>,
    dismissed: HashSet<String>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn users_for(scope: ProfileScope, group: &ProfileGroup) -> Vec<UserId> {
        match scope {
            ProfileScope::Primary => vec![group.parent()],
            ProfileScope::All => group.user_ids(),
        }
    }

    fn headline(severity: SeverityLevel, has_data: bool, issue_count: usize) -> ViewStatus {
        let (title, summary) = match severity {
            _ if !has_data => ("Unknown", String::new()),
            SeverityLevel::Unspecified | SeverityLevel::Information => ("Looks good", String::new()),
            SeverityLevel::Recommendation => ("Check recommendations", format!("{} issue(s)", issue_count)),
            SeverityLevel::CriticalWarning => ("Device at risk", format!("{} issue(s)", issue_count)),
        };
        ViewStatus {
            title: title.to_string(),
            summary,
            severity,
        }
    }
}

impl Tracker for InMemoryTracker {
    fn set_source_data(
        &mut self,
        catalog: &SourceCatalog,
        source_id: &str,
        report: Option<SourceReport>,
        package_name: &str,
        user_id: UserId,
    ) -> bool {
        debug!(%source_id, %package_name, user_id, has_report = report.is_some(), "set_source_data: called");
        let Some(source) = catalog.source(source_id) else {
            warn!(%source_id, "Data pushed for a source that is not in the catalog");
            return false;
        };
        if !source.accepts_package(package_name) {
            warn!(%source_id, %package_name, "Data pushed from a package the source does not accept");
            return false;
        }

        let key = (source_id.to_string(), user_id);
        match report {
            Some(report) => {
                if self.reports.get(&key) == Some(&report) {
                    return false;
                }
                self.reports.insert(key, report);
                true
            }
            None => self.reports.remove(&key).is_some(),
        }
    }

    fn source_data(
        &self,
        catalog: &SourceCatalog,
        source_id: &str,
        package_name: &str,
        user_id: UserId,
    ) -> Option<SourceReport> {
        let source = catalog.source(source_id)?;
        if !source.accepts_package(package_name) {
            warn!(%source_id, %package_name, "Data read from a package the source does not accept");
            return None;
        }
        self.reports.get(&(source_id.to_string(), user_id)).cloned()
    }

    fn dismiss_issue(&mut self, catalog: &SourceCatalog, issue_key: &str, group: &ProfileGroup) -> bool {
        let visible = self
            .aggregated_view(catalog, group)
            .issues
            .iter()
            .any(|i| i.key == issue_key);
        if !visible {
            debug!(%issue_key, "dismiss_issue: issue not in view");
            return false;
        }
        self.dismissed.insert(issue_key.to_string())
    }

    fn aggregated_view(&self, catalog: &SourceCatalog, group: &ProfileGroup) -> AggregatedView {
        let mut entries = Vec::new();
        let mut issues = Vec::new();

        for source in catalog.sources() {
            for user_id in Self::users_for(source.profile, group) {
                let Some(report) = self.reports.get(&(source.id.clone(), user_id)) else {
                    continue;
                };
                if let Some(status) = &report.status {
                    entries.push(ViewEntry {
                        source_id: source.id.clone(),
                        user_id,
                        title: status.title.clone(),
                        summary: status.summary.clone(),
                        severity: status.severity,
                    });
                }
                for issue in &report.issues {
                    let key = issue_key(&source.id, &issue.id, user_id);
                    if self.dismissed.contains(&key) {
                        continue;
                    }
                    issues.push(ViewIssue {
                        key,
                        source_id: source.id.clone(),
                        user_id,
                        title: issue.title.clone(),
                        summary: issue.summary.clone(),
                        severity: issue.severity,
                        actions: issue.actions.clone(),
                    });
                }
            }
        }

        // Most severe issues first
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));

        let severity = entries
            .iter()
            .map(|e| e.severity)
            .chain(issues.iter().map(|i| i.severity))
            .max()
            .unwrap_or_default();
        let has_data = !entries.is_empty() || !issues.is_empty();

        AggregatedView {
            status: Self::headline(severity, has_data, issues.len()),
            entries,
            issues,
        }
    }

    fn clear(&mut self) {
        debug!(reports = self.reports.len(), "InMemoryTracker::clear: called");
        self.reports.clear();
        self.dismissed.clear();
    }
}
