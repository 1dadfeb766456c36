//! Service assembly
//!
//! Wires a [`CoordinationCore`] from [`Config`]: the static policy answers
//! identity questions, the enabled gate reads its three flags (the remote
//! one kept fresh by a poller), and the startup catalog is loaded.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::{AccessGate, ConfigLoadedFlag, EnabledGate, FlagSource, PropertyFlag, StaticFlag, StaticPolicy};
use crate::config::Config;
use crate::domain::ConfigReader;
use crate::events::EventBus;
use crate::ipc::get_socket_path;
use crate::service::{BroadcastRefresher, CoordinationCore, CoreComponents, InMemoryTracker};

/// Socket path from config, else the default
pub fn socket_path(config: &Config) -> PathBuf {
    config.service.socket_path.clone().unwrap_or_else(get_socket_path)
}

/// An assembled core and the task keeping its remote flag current
pub struct Service {
    pub core: Arc<CoordinationCore>,
    flag_poller: Option<JoinHandle<()>>,
}

impl Service {
    /// Stop background work; the core stays usable with its last flag values
    pub fn shutdown(self) {
        if let Some(poller) = self.flag_poller {
            poller.abort();
        }
    }
}

/// Build the core from `config`, load the startup catalog and start the flag poller
pub async fn build_service(config: &Config) -> Service {
    debug!(uid = config.service.uid, "build_service: called");
    let policy = Arc::new(StaticPolicy::new(&config.policy));
    let bus = Arc::new(EventBus::new(config.service.event_capacity));

    let (remote, flag_poller): (Arc<dyn FlagSource>, _) = match &config.service.flags_path {
        Some(path) => {
            let flag = Arc::new(PropertyFlag::enablement(path));
            flag.reload().await;
            let poller = flag.clone().spawn_poller(config.service.flags_poll_interval());
            (flag, Some(poller))
        }
        None => {
            warn!("No flags-path configured; the remote enablement flag reads as false");
            (Arc::new(StaticFlag(false)), None)
        }
    };
    let enabled = EnabledGate::new(
        remote,
        Arc::new(StaticFlag(config.service.build_enabled)),
        ConfigLoadedFlag::new(false),
    );

    let core = Arc::new(CoordinationCore::new(CoreComponents {
        access: AccessGate::new(config.service.uid, policy.clone(), policy.clone(), policy.clone()),
        enabled,
        groups: policy,
        config: ConfigReader::new(),
        tracker: Box::new(InMemoryTracker::new()),
        refresher: Box::new(BroadcastRefresher::new(bus.clone())),
        bus,
    }));

    match &config.service.catalog_path {
        Some(path) => {
            let loaded = core.load_catalog(path).await;
            info!(path = %path.display(), loaded, "Startup catalog");
        }
        None => warn!("No catalog-path configured; the service stays disabled"),
    }
    Service { core, flag_poller }
}
