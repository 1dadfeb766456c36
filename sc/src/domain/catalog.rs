//! Source catalog and the reader that tracks the active one
//!
//! The catalog lists every source allowed to report, grouped for display.
//! It is loaded once at startup; tests may swap in an override.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from loading a source catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid catalog: {0}")]
    Invalid(String),
}

/// Which users of a profile group a source reports for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileScope {
    /// Only the parent user
    #[default]
    Primary,
    /// The parent and every managed profile
    All,
}

/// How a source participates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Fixed entry, never pushes data
    Static,
    /// Pushes data and answers refresh broadcasts
    #[default]
    Dynamic,
    /// Pushes issues only
    IssueOnly,
}

/// One source in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default, rename = "package-name")]
    pub package_name: Option<String>,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub profile: ProfileScope,
    #[serde(default)]
    pub title: Option<String>,
}

impl SourceConfig {
    /// Whether this source may push data from `package_name`
    pub fn accepts_package(&self, package_name: &str) -> bool {
        self.kind != SourceKind::Static && self.package_name.as_deref() == Some(package_name)
    }

    /// Whether refresh broadcasts go to this source
    pub fn is_refreshable(&self) -> bool {
        self.kind != SourceKind::Static && self.package_name.is_some()
    }
}

/// Display group of sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// The active source catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCatalog {
    #[serde(default)]
    pub groups: Vec<SourceGroup>,
}

impl SourceCatalog {
    /// Load and check a catalog from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SourceCatalog::load: called");
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Like [`load`](Self::load) but reads the file on the runtime's blocking pool
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SourceCatalog::read: called");
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_yaml::from_str(content)?;
        catalog.check()?;
        Ok(catalog)
    }

    /// Reject blank or duplicate source ids
    pub fn check(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for source in self.sources() {
            if source.id.trim().is_empty() {
                return Err(CatalogError::Invalid("source with blank id".to_string()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(CatalogError::Invalid(format!("duplicate source id: {}", source.id)));
            }
        }
        Ok(())
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.groups.iter().flat_map(|g| g.sources.iter())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources().find(|s| s.id == source_id)
    }
}

/// Tracks the catalog loaded at startup and any test override
///
/// Lives under the fast lock together with the tracker. Whether the startup
/// load succeeded is recorded once; later reloads only swap the catalog.
#[derive(Debug, Default)]
pub struct ConfigReader {
    loaded: Option<Arc<SourceCatalog>>,
    override_catalog: Option<Arc<SourceCatalog>>,
    loaded_at_startup: bool,
}

impl ConfigReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reader with an already loaded catalog
    pub fn with_catalog(catalog: SourceCatalog) -> Self {
        Self {
            loaded: Some(Arc::new(catalog)),
            override_catalog: None,
            loaded_at_startup: true,
        }
    }

    /// Record the outcome of the startup load (`None` if it failed)
    pub fn install_startup(&mut self, catalog: Option<SourceCatalog>) {
        self.loaded_at_startup = catalog.is_some();
        if let Some(catalog) = catalog {
            self.loaded = Some(Arc::new(catalog));
        }
    }

    /// Swap in a reloaded catalog; the startup outcome is left as it was
    pub fn replace_loaded(&mut self, catalog: SourceCatalog) {
        debug!(sources = catalog.sources().count(), "ConfigReader::replace_loaded: called");
        self.loaded = Some(Arc::new(catalog));
    }

    pub fn loaded_at_startup(&self) -> bool {
        self.loaded_at_startup
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn has_override(&self) -> bool {
        self.override_catalog.is_some()
    }

    /// The override if set, else the loaded catalog
    pub fn active(&self) -> Option<Arc<SourceCatalog>> {
        self.override_catalog.clone().or_else(|| self.loaded.clone())
    }

    /// Like [`active`](Self::active) but an empty catalog when nothing is loaded
    pub fn current(&self) -> Arc<SourceCatalog> {
        self.active().unwrap_or_default()
    }

    pub fn set_override(&mut self, catalog: SourceCatalog) {
        debug!(sources = catalog.sources().count(), "ConfigReader::set_override: called");
        self.override_catalog = Some(Arc::new(catalog));
    }

    pub fn clear_override(&mut self) {
        debug!("ConfigReader::clear_override: called");
        self.override_catalog = None;
    }
}
