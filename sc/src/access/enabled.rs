//! EnabledGate - whether the service accepts calls at all
//!
//! Enablement is the AND of three independently sourced flags: a remote
//! dynamic property, a static build flag, and whether the source catalog
//! loaded at startup. The gate is evaluated on every call; the remote
//! property is cached and re-read from disk by a poller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Namespace holding the remote enablement property
pub const PRIVACY_NAMESPACE: &str = "privacy";

/// Remote property that turns the service on
pub const ENABLED_PROPERTY: &str = "safety_center_is_enabled";

/// A boolean input to the gate
pub trait FlagSource: Send + Sync {
    fn is_set(&self) -> bool;
}

/// Flag fixed at construction (build-time switches, tests)
#[derive(Debug, Clone, Copy)]
pub struct StaticFlag(pub bool);

impl FlagSource for StaticFlag {
    fn is_set(&self) -> bool {
        self.0
    }
}

/// Remote dynamic flag backed by a YAML property file
///
/// The file maps namespaces to property tables:
///
/// ```yaml
/// privacy:
///   safety_center_is_enabled: true
/// ```
///
/// A missing file, namespace or property, or an unparseable file, reads as
/// `false`. The value is cached: [`reload`](Self::reload) re-reads the file
/// and [`spawn_poller`](Self::spawn_poller) does so periodically.
#[derive(Debug)]
pub struct PropertyFlag {
    path: PathBuf,
    namespace: String,
    name: String,
    value: AtomicBool,
}

impl PropertyFlag {
    pub fn new(path: impl Into<PathBuf>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            namespace: namespace.into(),
            name: name.into(),
            value: AtomicBool::new(false),
        }
    }

    /// The safety center enablement property in `path`
    pub fn enablement(path: impl Into<PathBuf>) -> Self {
        Self::new(path, PRIVACY_NAMESPACE, ENABLED_PROPERTY)
    }

    /// Re-read the property file and cache the result
    pub async fn reload(&self) -> bool {
        let value = self.read().await.unwrap_or(false);
        if self.value.swap(value, Ordering::SeqCst) != value {
            info!(namespace = %self.namespace, name = %self.name, value, "Remote flag changed");
        }
        value
    }

    /// Reload every `period` until the returned task is aborted
    pub fn spawn_poller(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        debug!(path = %self.path.display(), ?period, "PropertyFlag::spawn_poller: called");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.reload().await;
            }
        })
    }

    async fn read(&self) -> Option<bool> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        let table: HashMap<String, HashMap<String, bool>> = match serde_yaml::from_str(&content) {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unparseable property file");
                return None;
            }
        };
        table.get(&self.namespace)?.get(&self.name).copied()
    }
}

impl FlagSource for PropertyFlag {
    fn is_set(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }
}

/// Whether the source catalog is available
///
/// Set once at startup, and again by the test override operations.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoadedFlag(Arc<AtomicBool>);

impl ConfigLoadedFlag {
    pub fn new(loaded: bool) -> Self {
        Self(Arc::new(AtomicBool::new(loaded)))
    }

    pub fn set(&self, loaded: bool) {
        self.0.store(loaded, Ordering::SeqCst);
    }
}

impl FlagSource for ConfigLoadedFlag {
    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tri-state enablement combinator
pub struct EnabledGate {
    remote: Arc<dyn FlagSource>,
    build: Arc<dyn FlagSource>,
    config_loaded: ConfigLoadedFlag,
}

impl EnabledGate {
    pub fn new(remote: Arc<dyn FlagSource>, build: Arc<dyn FlagSource>, config_loaded: ConfigLoadedFlag) -> Self {
        Self {
            remote,
            build,
            config_loaded,
        }
    }

    /// Gate with fixed remote and build flags
    pub fn fixed(remote: bool, build: bool, config_loaded: bool) -> Self {
        Self::new(
            Arc::new(StaticFlag(remote)),
            Arc::new(StaticFlag(build)),
            ConfigLoadedFlag::new(config_loaded),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.build.is_set() && self.remote.is_set() && self.config_loaded.is_set()
    }

    /// Log and return false when disabled; callers then no-op the request
    pub fn require_enabled(&self, operation: &str) -> bool {
        if !self.is_enabled() {
            warn!(%operation, "Called, but the safety center is disabled");
            return false;
        }
        true
    }

    pub fn config_loaded(&self) -> &ConfigLoadedFlag {
        &self.config_loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_all_three_flags_required() {
        assert!(EnabledGate::fixed(true, true, true).is_enabled());
        assert!(!EnabledGate::fixed(false, true, true).is_enabled());
        assert!(!EnabledGate::fixed(true, false, true).is_enabled());
        assert!(!EnabledGate::fixed(true, true, false).is_enabled());
        assert!(!EnabledGate::fixed(true, true, false).require_enabled("op"));
    }

    #[test]
    fn test_config_loaded_flag_is_shared() {
        let gate = EnabledGate::fixed(true, true, false);
        let flag = gate.config_loaded().clone();
        flag.set(true);
        assert!(gate.is_enabled());
    }

    #[tokio::test]
    async fn test_property_flag_follows_reloads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flags.yml");
        let flag = PropertyFlag::enablement(&path);

        // Missing file defaults to false
        assert!(!flag.reload().await);

        std::fs::write(&path, "privacy:\n  safety_center_is_enabled: true\n").unwrap();
        // cached until the next reload
        assert!(!flag.is_set());
        assert!(flag.reload().await);
        assert!(flag.is_set());

        std::fs::write(&path, "privacy:\n  safety_center_is_enabled: false\n").unwrap();
        assert!(!flag.reload().await);

        std::fs::write(&path, "other:\n  safety_center_is_enabled: true\n").unwrap();
        assert!(!flag.reload().await);

        std::fs::write(&path, "not: [valid").unwrap();
        assert!(!flag.reload().await);
        assert!(!flag.is_set());
    }

    #[tokio::test]
    async fn test_property_flag_poller_picks_up_changes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flags.yml");
        let flag = Arc::new(PropertyFlag::enablement(&path));
        let poller = flag.clone().spawn_poller(Duration::from_millis(10));

        std::fs::write(&path, "privacy:\n  safety_center_is_enabled: true\n").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !flag.is_set() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poller never saw the flag");
        poller.abort();
    }
}
