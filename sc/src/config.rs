//! Safety center configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::PolicyConfig;
use crate::domain::Uid;
use crate::events::DEFAULT_CHANNEL_CAPACITY;

/// Project-local config file name
const LOCAL_CONFIG: &str = ".safetycenter.yml";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Service process settings
    pub service: ServiceConfig,

    /// Users, profiles and per-uid grants
    pub policy: PolicyConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.safetycenter.yml`, then
    /// `<config_dir>/safetycenter/safetycenter.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::fallback_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => warn!("Failed to load config from {}: {}", candidate.display(), e),
                }
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Never fails: any problem yields `None`.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        #[derive(Deserialize)]
        struct LogLevelOnly {
            #[serde(rename = "log-level")]
            log_level: Option<String>,
        }

        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::fallback_paths().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        serde_yaml::from_str::<LogLevelOnly>(&content).ok()?.log_level
    }

    fn fallback_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("safetycenter").join("safetycenter.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        info!("Loaded config from: {}", path.as_ref().display());
        debug!(?config, "load_from_file: parsed");
        Ok(config)
    }
}

/// Service process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Uid the service runs as; it passes its own permission checks
    pub uid: Uid,

    /// Socket to listen on; defaults to the runtime dir
    #[serde(rename = "socket-path")]
    pub socket_path: Option<PathBuf>,

    /// Source catalog loaded at startup
    #[serde(rename = "catalog-path")]
    pub catalog_path: Option<PathBuf>,

    /// Build-time enablement switch
    #[serde(rename = "build-enabled")]
    pub build_enabled: bool,

    /// Property file holding the remote enablement flag
    #[serde(rename = "flags-path")]
    pub flags_path: Option<PathBuf>,

    /// How often the property file is re-read, in milliseconds
    #[serde(rename = "flags-poll-ms")]
    pub flags_poll_ms: u64,

    /// Event bus capacity
    #[serde(rename = "event-capacity")]
    pub event_capacity: usize,
}

impl ServiceConfig {
    /// Property file poll period; never shorter than 10ms
    pub fn flags_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flags_poll_ms.max(10))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            uid: 1000,
            socket_path: None,
            catalog_path: None,
            build_enabled: true,
            flags_path: None,
            flags_poll_ms: 1000,
            event_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Permission;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
log-level: DEBUG
service:
  uid: 1000
  catalog-path: /etc/safetycenter/catalog.yml
  build-enabled: false
  flags-poll-ms: 250
policy:
  users:
    - id: 0
    - id: 10
      profile-parent: 0
  grants:
    - uid: 10050
      permissions: [SEND_SAFETY_CENTER_UPDATE]
      packages: [com.example.lock]
"#;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, None);
        assert_eq!(config.service.uid, 1000);
        assert!(config.service.build_enabled);
        assert_eq!(config.service.event_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.service.flags_poll_interval(), Duration::from_secs(1));
        assert!(config.policy.users.is_empty());
    }

    #[test]
    fn test_load_explicit_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sc.yml");
        fs::write(&path, CONFIG).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("DEBUG"));
        assert!(!config.service.build_enabled);
        assert_eq!(config.service.flags_poll_interval(), Duration::from_millis(250));
        assert_eq!(
            config.service.catalog_path,
            Some(PathBuf::from("/etc/safetycenter/catalog.yml"))
        );
        // unspecified keys keep defaults
        assert_eq!(config.service.event_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.policy.users[1].profile_parent, Some(0));
        assert_eq!(
            config.policy.grants[0].permissions,
            vec![Permission::SendSafetyCenterUpdate]
        );
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        assert!(Config::load(Some(&temp.path().join("missing.yml"))).is_err());
    }

    #[test]
    fn test_load_log_level() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sc.yml");
        fs::write(&path, CONFIG).unwrap();
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("DEBUG"));

        fs::write(&path, ": not yaml [").unwrap();
        assert_eq!(Config::load_log_level(Some(&path)), None);
    }
}
