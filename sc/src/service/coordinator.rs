//! CoordinationCore - gated dispatch over two lock domains
//!
//! Every operation runs the gates first (permission, then arguments and
//! package, then cross-user, then enablement), then takes the fast lock to
//! read or mutate the tracker and snapshot listeners, and finally delivers
//! notifications with no lock held. Refresh additionally takes the slow
//! lock, strictly after the fast lock has been released.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::refresh::{RefreshTicket, Refresher};
use super::tracker::Tracker;
use crate::access::{AccessGate, EnabledGate, GroupResolver, UserCheck};
use crate::domain::{
    AggregatedView, CallerContext, ConfigReader, ErrorDetails, Permission, RefreshReason, SafetyEvent,
    SourceCatalog, SourceReport, UserId,
};
use crate::error::{ServiceError, ServiceResult, require_non_blank};
use crate::events::{EventBus, ScEvent, SourceFeed};
use crate::listeners::{ListenerHandle, ListenerRegistry, ListenerUpdate, deliver, deliver_to};

/// Everything the core is assembled from
pub struct CoreComponents {
    pub access: AccessGate,
    pub enabled: EnabledGate,
    pub groups: Arc<dyn GroupResolver>,
    pub config: ConfigReader,
    pub tracker: Box<dyn Tracker>,
    pub refresher: Box<dyn Refresher>,
    pub bus: Arc<EventBus>,
}

/// State guarded by the fast lock
struct ApiState {
    config: ConfigReader,
    tracker: Box<dyn Tracker>,
    listeners: ListenerRegistry,
}

/// The request dispatcher
pub struct CoordinationCore {
    access: AccessGate,
    enabled: EnabledGate,
    groups: Arc<dyn GroupResolver>,
    bus: Arc<EventBus>,
    /// Fast lock: config, tracker and listener registry. Never held across remote calls.
    api: Mutex<ApiState>,
    /// Slow lock: refresh orchestration. Only taken with the fast lock released.
    refresh: Mutex<Box<dyn Refresher>>,
}

impl CoordinationCore {
    pub fn new(components: CoreComponents) -> Self {
        let CoreComponents {
            access,
            enabled,
            groups,
            config,
            tracker,
            refresher,
            bus,
        } = components;
        Self {
            access,
            enabled,
            groups,
            bus,
            api: Mutex::new(ApiState {
                config,
                tracker,
                listeners: ListenerRegistry::new(),
            }),
            refresh: Mutex::new(refresher),
        }
    }

    /// Load the startup catalog and fix the config-loaded flag from the outcome
    ///
    /// Called once, before the core serves requests.
    pub async fn load_catalog(&self, path: &Path) -> bool {
        let catalog = read_catalog(path).await;
        let loaded = catalog.is_some();
        self.api.lock().await.config.install_startup(catalog);
        self.enabled.config_loaded().set(loaded);
        loaded
    }

    /// Re-read the catalog file and swap it in; a failed read keeps the current one
    ///
    /// The config-loaded flag keeps its startup value either way.
    pub async fn reload_catalog(&self, path: &Path) -> bool {
        let Some(catalog) = read_catalog(path).await else {
            return false;
        };
        self.api.lock().await.config.replace_loaded(catalog);
        true
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Listeners registered under `user_id`
    pub async fn listener_count(&self, user_id: UserId) -> usize {
        self.api.lock().await.listeners.count_for(user_id)
    }

    /// Cross-user check then enablement; false means the call degrades to a no-op
    fn admit(&self, operation: &str, caller: &CallerContext) -> ServiceResult<bool> {
        if self.access.check_cross_user(operation, caller)? == UserCheck::Absent {
            return Ok(false);
        }
        Ok(self.enabled.require_enabled(operation))
    }

    /// Whether the service is enabled
    pub fn is_enabled(&self, caller: &CallerContext) -> ServiceResult<bool> {
        self.access.authorize_any(
            "is_enabled",
            &[Permission::ReadSafetyCenterStatus, Permission::SendSafetyCenterUpdate],
            caller,
        )?;
        Ok(self.enabled.is_enabled())
    }

    /// Store a source's report (or clear it with `None`) and notify the group if the view changed
    pub async fn push_source_report(
        &self,
        caller: &CallerContext,
        source_id: &str,
        report: Option<SourceReport>,
        event: &SafetyEvent,
    ) -> ServiceResult<()> {
        const OP: &str = "push_source_report";
        debug!(%source_id, uid = caller.uid, user_id = caller.user_id, event = ?event.kind, "push_source_report: called");
        self.access.authorize(OP, Permission::SendSafetyCenterUpdate, caller)?;
        require_non_blank(OP, "source_id", source_id)?;
        event.validate()?;
        let package = self.access.check_package(OP, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(());
        }
        let group = self.groups.resolve(caller.user_id);

        let (listener_sets, view) = {
            let mut state = self.api.lock().await;
            let catalog = state.config.current();
            if !state
                .tracker
                .set_source_data(&catalog, source_id, report, package, caller.user_id)
            {
                debug!(%source_id, "push_source_report: no change");
                return Ok(());
            }
            let view = state.tracker.aggregated_view(&catalog, &group);
            (state.listeners.listeners_for(&group), view)
        };

        deliver(&listener_sets, &ListenerUpdate::Data { view }).await;
        Ok(())
    }

    /// The last report a source pushed for the target user
    pub async fn read_source_report(
        &self,
        caller: &CallerContext,
        source_id: &str,
    ) -> ServiceResult<Option<SourceReport>> {
        const OP: &str = "read_source_report";
        debug!(%source_id, uid = caller.uid, user_id = caller.user_id, "read_source_report: called");
        self.access.authorize(OP, Permission::SendSafetyCenterUpdate, caller)?;
        require_non_blank(OP, "source_id", source_id)?;
        let package = self.access.check_package(OP, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(None);
        }

        let state = self.api.lock().await;
        let catalog = state.config.current();
        Ok(state.tracker.source_data(&catalog, source_id, package, caller.user_id))
    }

    /// Tell the group's listeners a source failed
    pub async fn report_source_error(
        &self,
        caller: &CallerContext,
        source_id: &str,
        details: ErrorDetails,
    ) -> ServiceResult<()> {
        const OP: &str = "report_source_error";
        debug!(%source_id, uid = caller.uid, user_id = caller.user_id, "report_source_error: called");
        self.access.authorize(OP, Permission::SendSafetyCenterUpdate, caller)?;
        require_non_blank(OP, "source_id", source_id)?;
        self.access.check_package(OP, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(());
        }
        let group = self.groups.resolve(caller.user_id);

        let listener_sets = self.api.lock().await.listeners.listeners_for(&group);
        deliver(&listener_sets, &ListenerUpdate::Error { details }).await;
        Ok(())
    }

    /// Ask every refreshable source to push fresh data
    ///
    /// The catalog is copied out under the fast lock; the refresher then runs
    /// under the slow lock alone, so sources may push while it is working.
    /// Returns `None` when the call degrades or the refresher fails.
    pub async fn refresh(
        &self,
        caller: &CallerContext,
        reason: RefreshReason,
    ) -> ServiceResult<Option<RefreshTicket>> {
        const OP: &str = "refresh";
        debug!(%reason, uid = caller.uid, user_id = caller.user_id, "refresh: called");
        self.access
            .authorize_calling(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(None);
        }
        let group = self.groups.resolve(caller.user_id);

        let catalog = self.api.lock().await.config.current();

        let mut refresher = self.refresh.lock().await;
        match refresher.refresh(&catalog, reason, &group).await {
            Ok(ticket) => Ok(Some(ticket)),
            Err(e) => {
                warn!(%reason, error = %e, "Refresh failed");
                Ok(None)
            }
        }
    }

    /// The active source catalog, if any is loaded
    pub async fn get_config(&self, caller: &CallerContext) -> ServiceResult<Option<SourceCatalog>> {
        self.access
            .authorize("get_config", Permission::ManageSafetyCenter, caller)?;
        let state = self.api.lock().await;
        Ok(state.config.active().map(|catalog| catalog.as_ref().clone()))
    }

    /// The aggregated view of the target user's profile group
    pub async fn get_aggregated_view(&self, caller: &CallerContext) -> ServiceResult<AggregatedView> {
        const OP: &str = "get_aggregated_view";
        debug!(uid = caller.uid, user_id = caller.user_id, "get_aggregated_view: called");
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(AggregatedView::default());
        }
        let group = self.groups.resolve(caller.user_id);

        let state = self.api.lock().await;
        let catalog = state.config.current();
        Ok(state.tracker.aggregated_view(&catalog, &group))
    }

    /// Register `handle` under the target user and send it the current view
    ///
    /// The snapshot goes only to the new subscriber, and only if it was not
    /// already registered.
    pub async fn subscribe(&self, caller: &CallerContext, handle: ListenerHandle) -> ServiceResult<()> {
        const OP: &str = "subscribe";
        debug!(id = %handle.id(), uid = caller.uid, user_id = caller.user_id, "subscribe: called");
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(());
        }
        let group = self.groups.resolve(caller.user_id);

        let view = {
            let mut state = self.api.lock().await;
            if !state.listeners.add(handle.clone(), caller.user_id) {
                return Ok(());
            }
            let catalog = state.config.current();
            state.tracker.aggregated_view(&catalog, &group)
        };

        deliver_to(&handle, &ListenerUpdate::Data { view }).await;
        Ok(())
    }

    pub async fn unsubscribe(&self, caller: &CallerContext, handle: &ListenerHandle) -> ServiceResult<()> {
        const OP: &str = "unsubscribe";
        debug!(id = %handle.id(), uid = caller.uid, user_id = caller.user_id, "unsubscribe: called");
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(());
        }
        self.api.lock().await.listeners.remove(handle, caller.user_id);
        Ok(())
    }

    /// Remove a handle whose connection has closed; true if it was registered
    ///
    /// Ungated, so a handle subscribed before the service was disabled or the
    /// user removed is still released.
    pub async fn drop_listener(&self, handle: &ListenerHandle, user_id: UserId) -> bool {
        let removed = self.api.lock().await.listeners.remove(handle, user_id);
        debug!(id = %handle.id(), user_id, removed, "drop_listener: called");
        removed
    }

    /// Open a feed of refresh and issue-action requests for the caller's package
    ///
    /// `None` when the call degrades to a no-op.
    pub fn watch_requests(&self, caller: &CallerContext) -> ServiceResult<Option<SourceFeed>> {
        const OP: &str = "watch_requests";
        debug!(uid = caller.uid, user_id = caller.user_id, "watch_requests: called");
        self.access.authorize(OP, Permission::SendSafetyCenterUpdate, caller)?;
        let package = self.access.check_package(OP, caller)?;
        if !self.admit(OP, caller)? {
            return Ok(None);
        }
        Ok(Some(SourceFeed::new(&self.bus, package, caller.user_id)))
    }

    /// Hide an issue from the group's view
    pub async fn dismiss_issue(&self, caller: &CallerContext, issue_key: &str) -> ServiceResult<()> {
        const OP: &str = "dismiss_issue";
        debug!(%issue_key, uid = caller.uid, user_id = caller.user_id, "dismiss_issue: called");
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        require_non_blank(OP, "issue_id", issue_key)?;
        if !self.admit(OP, caller)? {
            return Ok(());
        }
        let group = self.groups.resolve(caller.user_id);

        let (listener_sets, view) = {
            let mut state = self.api.lock().await;
            let catalog = state.config.current();
            if !state.tracker.dismiss_issue(&catalog, issue_key, &group) {
                return Ok(());
            }
            let view = state.tracker.aggregated_view(&catalog, &group);
            (state.listeners.listeners_for(&group), view)
        };

        deliver(&listener_sets, &ListenerUpdate::Data { view }).await;
        Ok(())
    }

    /// Forward a user's choice of issue action to the owning source
    pub async fn execute_issue_action(
        &self,
        caller: &CallerContext,
        issue_key: &str,
        action_id: &str,
    ) -> ServiceResult<()> {
        const OP: &str = "execute_issue_action";
        debug!(%issue_key, %action_id, uid = caller.uid, "execute_issue_action: called");
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        require_non_blank(OP, "issue_id", issue_key)?;
        require_non_blank(OP, "action_id", action_id)?;
        if !self.admit(OP, caller)? {
            return Ok(());
        }
        let group = self.groups.resolve(caller.user_id);

        let found = {
            let state = self.api.lock().await;
            let catalog = state.config.current();
            state
                .tracker
                .aggregated_view(&catalog, &group)
                .issues
                .into_iter()
                .find(|issue| issue.key == issue_key)
                .map(|issue| {
                    let package_name = catalog.source(&issue.source_id).and_then(|s| s.package_name.clone());
                    (issue, package_name)
                })
        };
        let Some((issue, package_name)) = found else {
            warn!(%issue_key, "Issue action requested for an issue not in view");
            return Ok(());
        };
        if !issue.actions.iter().any(|a| a.id == action_id) {
            warn!(%issue_key, %action_id, "Unknown action for issue");
            return Ok(());
        }

        self.bus.emit(ScEvent::IssueActionRequested {
            issue_key: issue.key,
            action_id: action_id.to_string(),
            source_id: issue.source_id,
            package_name,
            user_id: issue.user_id,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Drop all tracked data
    pub async fn clear_all(&self, caller: &CallerContext) -> ServiceResult<()> {
        const OP: &str = "clear_all";
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.enabled.require_enabled(OP) {
            return Ok(());
        }
        self.api.lock().await.tracker.clear();
        info!("Cleared all safety center data");
        Ok(())
    }

    /// Replace the active catalog until cleared; drops all tracked data
    pub async fn set_config_override(&self, caller: &CallerContext, catalog: SourceCatalog) -> ServiceResult<()> {
        const OP: &str = "set_config_override";
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.enabled.require_enabled(OP) {
            return Ok(());
        }
        catalog
            .check()
            .map_err(|e| ServiceError::invalid(format!("{}: {}", OP, e)))?;

        let mut state = self.api.lock().await;
        state.config.set_override(catalog);
        state.tracker.clear();
        self.enabled.config_loaded().set(true);
        info!("Source catalog override set");
        Ok(())
    }

    /// Return to the startup catalog; drops all tracked data
    pub async fn clear_config_override(&self, caller: &CallerContext) -> ServiceResult<()> {
        const OP: &str = "clear_config_override";
        self.access.authorize(OP, Permission::ManageSafetyCenter, caller)?;
        if !self.enabled.require_enabled(OP) {
            return Ok(());
        }

        let mut state = self.api.lock().await;
        state.config.clear_override();
        state.tracker.clear();
        self.enabled.config_loaded().set(state.config.loaded_at_startup());
        info!("Source catalog override cleared");
        Ok(())
    }
}

async fn read_catalog(path: &Path) -> Option<SourceCatalog> {
    match SourceCatalog::read(path).await {
        Ok(catalog) => {
            info!(path = %path.display(), sources = catalog.sources().count(), "Loaded source catalog");
            Some(catalog)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load source catalog");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock, Weak};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::access::{ConfigLoadedFlag, StaticFlag, StaticPolicy};
    use crate::domain::{IssueAction, ProfileGroup, SeverityLevel, SourceIssue, Uid};
    use crate::listeners::{DataChangedListener, ListenerError};
    use crate::service::{BroadcastRefresher, InMemoryTracker};

    const SERVICE_UID: Uid = 1000;
    const SOURCE_UID: Uid = 10_050;
    const MANAGER_UID: Uid = 10_060;
    const NOBODY_UID: Uid = 10_070;
    /// The lock app installed for user 30, which does not exist
    const ABSENT_SOURCE_UID: Uid = 3_010_050;
    const PACKAGE: &str = "com.example.lock";

    const CATALOG: &str = r#"
groups:
  - id: device
    sources:
      - id: lock
        package-name: com.example.lock
        profile: all
"#;

    #[derive(Default)]
    struct Recording {
        updates: StdMutex<Vec<ListenerUpdate>>,
    }

    impl Recording {
        fn count(&self) -> usize {
            self.updates.lock().unwrap().len()
        }

        fn last(&self) -> Option<ListenerUpdate> {
            self.updates.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl DataChangedListener for Recording {
        async fn on_update(&self, update: ListenerUpdate) -> Result<(), ListenerError> {
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    fn policy() -> Arc<StaticPolicy> {
        Arc::new(
            StaticPolicy::default()
                .with_user(0)
                .with_profile(10, 0)
                .with_user(20)
                .grant(SOURCE_UID, &[Permission::SendSafetyCenterUpdate])
                .with_package(SOURCE_UID, PACKAGE)
                .grant(MANAGER_UID, &[Permission::ManageSafetyCenter, Permission::InteractAcrossUsersFull])
                .grant(ABSENT_SOURCE_UID, &[Permission::SendSafetyCenterUpdate])
                .with_package(ABSENT_SOURCE_UID, PACKAGE),
        )
    }

    fn assemble(enabled: EnabledGate, config: ConfigReader, tracker: Box<dyn Tracker>) -> Arc<CoordinationCore> {
        let policy = policy();
        let bus = Arc::new(EventBus::new(16));
        Arc::new(CoordinationCore::new(CoreComponents {
            access: AccessGate::new(SERVICE_UID, policy.clone(), policy.clone(), policy.clone()),
            enabled,
            groups: policy,
            config,
            tracker,
            refresher: Box::new(BroadcastRefresher::new(bus.clone())),
            bus,
        }))
    }

    fn build(enabled: bool, refresher: Box<dyn Refresher>, bus: Arc<EventBus>) -> Arc<CoordinationCore> {
        let policy = policy();
        Arc::new(CoordinationCore::new(CoreComponents {
            access: AccessGate::new(SERVICE_UID, policy.clone(), policy.clone(), policy.clone()),
            enabled: EnabledGate::fixed(enabled, true, true),
            groups: policy,
            config: ConfigReader::with_catalog(SourceCatalog::from_yaml(CATALOG).unwrap()),
            tracker: Box::new(InMemoryTracker::new()),
            refresher,
            bus,
        }))
    }

    /// Tracker that counts the mutating calls reaching it
    struct Counting {
        inner: InMemoryTracker,
        writes: Arc<AtomicUsize>,
    }

    impl Tracker for Counting {
        fn set_source_data(
            &mut self,
            catalog: &SourceCatalog,
            source_id: &str,
            report: Option<SourceReport>,
            package_name: &str,
            user_id: UserId,
        ) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_source_data(catalog, source_id, report, package_name, user_id)
        }

        fn source_data(
            &self,
            catalog: &SourceCatalog,
            source_id: &str,
            package_name: &str,
            user_id: UserId,
        ) -> Option<SourceReport> {
            self.inner.source_data(catalog, source_id, package_name, user_id)
        }

        fn dismiss_issue(&mut self, catalog: &SourceCatalog, issue_key: &str, group: &ProfileGroup) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.dismiss_issue(catalog, issue_key, group)
        }

        fn aggregated_view(&self, catalog: &SourceCatalog, group: &ProfileGroup) -> AggregatedView {
            self.inner.aggregated_view(catalog, group)
        }

        fn clear(&mut self) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.clear();
        }
    }

    fn core(enabled: bool) -> Arc<CoordinationCore> {
        let bus = Arc::new(EventBus::new(16));
        build(enabled, Box::new(BroadcastRefresher::new(bus.clone())), bus)
    }

    fn source() -> CallerContext {
        CallerContext::for_own_user(SOURCE_UID).with_package(PACKAGE)
    }

    fn manager(user_id: UserId) -> CallerContext {
        CallerContext::new(MANAGER_UID, user_id)
    }

    fn report(title: &str) -> SourceReport {
        SourceReport::with_status(title, "", SeverityLevel::Information)
    }

    #[tokio::test]
    async fn test_push_then_view_reflects_data() {
        let core = core(true);
        core.push_source_report(&source(), "lock", Some(report("Locked")), &SafetyEvent::state_changed())
            .await
            .unwrap();

        let view = core.get_aggregated_view(&manager(0)).await.unwrap();
        assert_eq!(view.entries.len(), 1);
        assert_eq!(view.entries[0].title, "Locked");
        assert_eq!(
            core.read_source_report(&source(), "lock").await.unwrap(),
            Some(report("Locked"))
        );
    }

    #[tokio::test]
    async fn test_disabled_degrades_to_defaults() {
        let core = core(false);
        core.push_source_report(&source(), "lock", Some(report("Locked")), &SafetyEvent::state_changed())
            .await
            .unwrap();
        assert_eq!(
            core.get_aggregated_view(&manager(0)).await.unwrap(),
            AggregatedView::default()
        );
        assert_eq!(core.read_source_report(&source(), "lock").await.unwrap(), None);
        assert_eq!(core.refresh(&manager(0), RefreshReason::PageOpen).await.unwrap(), None);
        assert!(!core.is_enabled(&source()).unwrap());
    }

    #[tokio::test]
    async fn test_missing_permission_is_denied_without_side_effects() {
        let core = core(true);
        let sink = Arc::new(Recording::default());
        core.subscribe(&manager(0), ListenerHandle::new(sink.clone())).await.unwrap();

        let intruder = CallerContext::for_own_user(NOBODY_UID).with_package(PACKAGE);
        let err = core
            .push_source_report(&intruder, "lock", Some(report("x")), &SafetyEvent::state_changed())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Denied { .. }));
        assert!(core.get_aggregated_view(&manager(0)).await.unwrap().entries.is_empty());
        assert_eq!(sink.count(), 1);

        let err = core.is_enabled(&CallerContext::for_own_user(NOBODY_UID)).unwrap_err();
        assert_eq!(
            err,
            ServiceError::denied(
                "is_enabled",
                &[Permission::ReadSafetyCenterStatus, Permission::SendSafetyCenterUpdate]
            )
        );
    }

    #[tokio::test]
    async fn test_refresh_denies_the_service_itself() {
        let core = core(true);
        let service = CallerContext::for_own_user(SERVICE_UID);
        assert!(matches!(
            core.refresh(&service, RefreshReason::PageOpen).await,
            Err(ServiceError::Denied { .. })
        ));
        // but the service passes the ordinary checks
        assert!(core.get_aggregated_view(&service).await.is_ok());
    }

    #[tokio::test]
    async fn test_package_and_argument_checks() {
        let core = core(true);
        let wrong_pkg = CallerContext::for_own_user(SOURCE_UID).with_package("com.example.other");
        assert!(matches!(
            core.push_source_report(&wrong_pkg, "lock", None, &SafetyEvent::state_changed())
                .await,
            Err(ServiceError::PackageMismatch { .. })
        ));
        assert!(matches!(
            core.push_source_report(&source(), " ", None, &SafetyEvent::state_changed())
                .await,
            Err(ServiceError::InvalidArgument(_))
        ));
        let bad_event = SafetyEvent::new(crate::domain::SafetyEventType::RefreshRequested);
        assert!(matches!(
            core.push_source_report(&source(), "lock", None, &bad_event).await,
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(matches!(
            core.get_aggregated_view(&manager(-1)).await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_absent_user_is_a_noop() {
        let core = core(true);
        assert_eq!(
            core.get_aggregated_view(&manager(30)).await.unwrap(),
            AggregatedView::default()
        );
        let sink = Arc::new(Recording::default());
        core.subscribe(&manager(30), ListenerHandle::new(sink.clone())).await.unwrap();
        assert_eq!(core.listener_count(30).await, 0);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_absent_user_mutations_leave_state_untouched() {
        let writes = Arc::new(AtomicUsize::new(0));
        let core = assemble(
            EnabledGate::fixed(true, true, true),
            ConfigReader::with_catalog(SourceCatalog::from_yaml(CATALOG).unwrap()),
            Box::new(Counting {
                inner: InMemoryTracker::new(),
                writes: writes.clone(),
            }),
        );
        let sink = Arc::new(Recording::default());
        core.subscribe(&manager(0), ListenerHandle::new(sink.clone())).await.unwrap();
        let mut events = core.bus().subscribe();

        let ghost = CallerContext::for_own_user(ABSENT_SOURCE_UID).with_package(PACKAGE);
        assert_eq!(ghost.user_id, 30);
        core.push_source_report(&ghost, "lock", Some(report("Ghost")), &SafetyEvent::state_changed())
            .await
            .unwrap();
        core.report_source_error(&ghost, "lock", ErrorDetails::new("ghost"))
            .await
            .unwrap();
        assert_eq!(core.read_source_report(&ghost, "lock").await.unwrap(), None);
        core.dismiss_issue(&manager(30), "lock/weak-pin/30").await.unwrap();
        core.execute_issue_action(&manager(30), "lock/weak-pin/30", "change")
            .await
            .unwrap();
        assert!(core.refresh(&manager(30), RefreshReason::PageOpen).await.unwrap().is_none());
        assert!(core.watch_requests(&ghost).unwrap().is_none());

        assert_eq!(writes.load(Ordering::SeqCst), 0);
        assert_eq!(sink.count(), 1);
        assert!(events.try_recv().is_err());
        assert!(core.get_aggregated_view(&manager(0)).await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_failed_startup_load_survives_reload() {
        let temp = TempDir::new().unwrap();
        let catalog_path = temp.path().join("catalog.yml");
        let core = assemble(
            EnabledGate::new(
                Arc::new(StaticFlag(true)),
                Arc::new(StaticFlag(true)),
                ConfigLoadedFlag::new(false),
            ),
            ConfigReader::new(),
            Box::new(InMemoryTracker::new()),
        );

        assert!(!core.load_catalog(&catalog_path).await);
        assert!(!core.is_enabled(&source()).unwrap());

        std::fs::write(&catalog_path, CATALOG).unwrap();
        assert!(core.reload_catalog(&catalog_path).await);
        assert!(!core.is_enabled(&source()).unwrap());
        let service = CallerContext::for_own_user(SERVICE_UID);
        assert!(core.get_config(&service).await.unwrap().unwrap().source("lock").is_some());

        // overrides are refused while disabled, so nothing turns the flag back on
        core.set_config_override(&service, SourceCatalog::from_yaml(CATALOG).unwrap())
            .await
            .unwrap();
        assert!(!core.is_enabled(&source()).unwrap());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_catalog_and_flag() {
        let temp = TempDir::new().unwrap();
        let catalog_path = temp.path().join("catalog.yml");
        std::fs::write(&catalog_path, CATALOG).unwrap();
        let core = assemble(
            EnabledGate::new(
                Arc::new(StaticFlag(true)),
                Arc::new(StaticFlag(true)),
                ConfigLoadedFlag::new(false),
            ),
            ConfigReader::new(),
            Box::new(InMemoryTracker::new()),
        );

        assert!(core.load_catalog(&catalog_path).await);
        assert!(core.is_enabled(&source()).unwrap());

        std::fs::write(&catalog_path, "not: [valid").unwrap();
        assert!(!core.reload_catalog(&catalog_path).await);
        assert!(core.is_enabled(&source()).unwrap());
        let mgr = manager(0);
        assert!(core.get_config(&mgr).await.unwrap().unwrap().source("lock").is_some());

        core.set_config_override(&mgr, SourceCatalog::default()).await.unwrap();
        core.clear_config_override(&mgr).await.unwrap();
        assert!(core.is_enabled(&source()).unwrap());
    }

    #[tokio::test]
    async fn test_drop_listener_ignores_gates() {
        let loaded = ConfigLoadedFlag::new(true);
        let core = assemble(
            EnabledGate::new(Arc::new(StaticFlag(true)), Arc::new(StaticFlag(true)), loaded.clone()),
            ConfigReader::with_catalog(SourceCatalog::from_yaml(CATALOG).unwrap()),
            Box::new(InMemoryTracker::new()),
        );
        let handle = ListenerHandle::new(Arc::new(Recording::default()));
        core.subscribe(&manager(0), handle.clone()).await.unwrap();
        assert_eq!(core.listener_count(0).await, 1);

        loaded.set(false);
        core.unsubscribe(&manager(0), &handle).await.unwrap();
        assert_eq!(core.listener_count(0).await, 1);

        assert!(core.drop_listener(&handle, 0).await);
        assert_eq!(core.listener_count(0).await, 0);
        assert!(!core.drop_listener(&handle, 0).await);
    }

    #[tokio::test]
    async fn test_watch_requests_checks_caller_and_filters() {
        let core = core(true);
        let intruder = CallerContext::for_own_user(SOURCE_UID).with_package("com.example.other");
        assert!(matches!(
            core.watch_requests(&intruder),
            Err(ServiceError::PackageMismatch { .. })
        ));
        assert!(matches!(
            core.watch_requests(&manager(0).with_package(PACKAGE)),
            Err(ServiceError::Denied { .. })
        ));

        let mut feed = core.watch_requests(&source()).unwrap().unwrap();
        core.refresh(&manager(0), RefreshReason::ButtonClick).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(1), feed.next()).await.unwrap() {
            Some(ScEvent::RefreshRequested {
                source_id, package_name, ..
            }) => {
                assert_eq!(source_id, "lock");
                assert_eq!(package_name, PACKAGE);
            }
            other => panic!("Expected RefreshRequested, got {:?}", other),
        }
        assert!(self::core(false).watch_requests(&source()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_only_once() {
        let core = core(true);
        let sink = Arc::new(Recording::default());
        let handle = ListenerHandle::new(sink.clone());
        core.subscribe(&manager(0), handle.clone()).await.unwrap();
        core.subscribe(&manager(0), handle.clone()).await.unwrap();
        assert_eq!(sink.count(), 1);
        assert_eq!(core.listener_count(0).await, 1);

        core.unsubscribe(&manager(0), &handle).await.unwrap();
        core.unsubscribe(&manager(0), &handle).await.unwrap();
        assert_eq!(core.listener_count(0).await, 0);
    }

    #[tokio::test]
    async fn test_change_notifies_group_once_and_no_change_stays_quiet() {
        let core = core(true);
        let parent = Arc::new(Recording::default());
        let profile = Arc::new(Recording::default());
        let outsider = Arc::new(Recording::default());
        core.subscribe(&manager(0), ListenerHandle::new(parent.clone())).await.unwrap();
        core.subscribe(&manager(10), ListenerHandle::new(profile.clone())).await.unwrap();
        core.subscribe(&manager(20), ListenerHandle::new(outsider.clone())).await.unwrap();

        let event = SafetyEvent::state_changed();
        core.push_source_report(&source(), "lock", Some(report("Locked")), &event)
            .await
            .unwrap();
        core.push_source_report(&source(), "lock", Some(report("Locked")), &event)
            .await
            .unwrap();

        assert_eq!(parent.count(), 2);
        assert_eq!(profile.count(), 2);
        assert_eq!(outsider.count(), 1);
        match parent.last() {
            Some(ListenerUpdate::Data { view }) => assert_eq!(view.entries[0].title, "Locked"),
            other => panic!("Expected data update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_source_error_always_notifies() {
        let core = core(true);
        let sink = Arc::new(Recording::default());
        core.subscribe(&manager(0), ListenerHandle::new(sink.clone())).await.unwrap();
        core.report_source_error(&source(), "lock", ErrorDetails::new("sensor offline"))
            .await
            .unwrap();
        assert_eq!(
            sink.last(),
            Some(ListenerUpdate::Error {
                details: ErrorDetails::new("sensor offline")
            })
        );
    }

    #[tokio::test]
    async fn test_dismiss_and_execute_issue_action() {
        let bus = Arc::new(EventBus::new(16));
        let core = build(true, Box::new(BroadcastRefresher::new(bus.clone())), bus.clone());
        let mut rx = bus.subscribe();
        let data = report("Locked").push_issue(SourceIssue {
            id: "weak-pin".to_string(),
            title: "Weak PIN".to_string(),
            summary: String::new(),
            severity: SeverityLevel::Recommendation,
            actions: vec![IssueAction {
                id: "change".to_string(),
                label: "Change PIN".to_string(),
            }],
        });
        core.push_source_report(&source(), "lock", Some(data), &SafetyEvent::state_changed())
            .await
            .unwrap();

        core.execute_issue_action(&manager(0), "lock/weak-pin/0", "missing").await.unwrap();
        core.execute_issue_action(&manager(0), "lock/weak-pin/0", "change").await.unwrap();
        match rx.try_recv().unwrap() {
            ScEvent::IssueActionRequested {
                issue_key,
                action_id,
                source_id,
                package_name,
                ..
            } => {
                assert_eq!(issue_key, "lock/weak-pin/0");
                assert_eq!(action_id, "change");
                assert_eq!(source_id, "lock");
                assert_eq!(package_name.as_deref(), Some(PACKAGE));
            }
            other => panic!("Expected IssueActionRequested, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        let sink = Arc::new(Recording::default());
        core.subscribe(&manager(0), ListenerHandle::new(sink.clone())).await.unwrap();
        core.dismiss_issue(&manager(0), "lock/weak-pin/0").await.unwrap();
        assert_eq!(sink.count(), 2);
        assert!(core.get_aggregated_view(&manager(0)).await.unwrap().issues.is_empty());
        assert!(matches!(
            core.dismiss_issue(&manager(0), "").await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_config_override_and_clear() {
        let core = core(true);
        let mgr = manager(0);
        core.push_source_report(&source(), "lock", Some(report("Locked")), &SafetyEvent::state_changed())
            .await
            .unwrap();

        let other = SourceCatalog::from_yaml(
            "groups:\n  - id: g\n    sources:\n      - id: other\n        package-name: com.example.other\n",
        )
        .unwrap();
        core.set_config_override(&mgr, other.clone()).await.unwrap();
        assert_eq!(core.get_config(&mgr).await.unwrap(), Some(other));
        assert_eq!(core.get_aggregated_view(&mgr).await.unwrap(), AggregatedView::default());

        core.clear_config_override(&mgr).await.unwrap();
        let active = core.get_config(&mgr).await.unwrap().unwrap();
        assert!(active.source("lock").is_some());
        assert!(core.is_enabled(&source()).unwrap());

        core.push_source_report(&source(), "lock", Some(report("Locked")), &SafetyEvent::state_changed())
            .await
            .unwrap();
        core.clear_all(&mgr).await.unwrap();
        assert_eq!(core.get_aggregated_view(&mgr).await.unwrap(), AggregatedView::default());
    }

    /// Refresher that pushes data back through the core while the slow lock is held
    struct Reentrant {
        core: Arc<OnceLock<Weak<CoordinationCore>>>,
    }

    #[async_trait]
    impl Refresher for Reentrant {
        async fn refresh(
            &mut self,
            _catalog: &SourceCatalog,
            reason: RefreshReason,
            _group: &crate::domain::ProfileGroup,
        ) -> eyre::Result<RefreshTicket> {
            let core = self
                .core
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| eyre::eyre!("core dropped"))?;
            core.push_source_report(
                &source(),
                "lock",
                Some(report("Refreshed")),
                &SafetyEvent::refresh_requested("b-1"),
            )
            .await
            .map_err(|e| eyre::eyre!(e))?;
            Ok(RefreshTicket {
                broadcast_id: "b-1".to_string(),
                reason,
                sources: 1,
                at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_refresh_reentering_fast_lock_does_not_deadlock() {
        let slot = Arc::new(OnceLock::new());
        let core = build(
            true,
            Box::new(Reentrant { core: slot.clone() }),
            Arc::new(EventBus::new(4)),
        );
        let _ = slot.set(Arc::downgrade(&core));

        let ticket = tokio::time::timeout(Duration::from_secs(5), core.refresh(&manager(0), RefreshReason::ButtonClick))
            .await
            .expect("refresh deadlocked")
            .unwrap();
        assert_eq!(ticket.map(|t| t.sources), Some(1));
        let view = core.get_aggregated_view(&manager(0)).await.unwrap();
        assert_eq!(view.entries[0].title, "Refreshed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_and_push() {
        let core = core(true);
        let refresh = {
            let core = core.clone();
            tokio::spawn(async move { core.refresh(&manager(0), RefreshReason::PageOpen).await })
        };
        let push = {
            let core = core.clone();
            tokio::spawn(async move {
                core.push_source_report(&source(), "lock", Some(report("Pushed")), &SafetyEvent::state_changed())
                    .await
            })
        };

        let (refresh, push) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(refresh, push) })
            .await
            .expect("deadlock");
        assert!(refresh.unwrap().unwrap().is_some());
        push.unwrap().unwrap();
        let view = core.get_aggregated_view(&manager(0)).await.unwrap();
        assert_eq!(view.entries[0].title, "Pushed");
    }
}
