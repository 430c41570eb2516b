//! Scraper plugin registry: version string → plugin instance.
//!
//! Populated once at startup and read-only afterwards. A tenant pinned to an
//! unregistered version is a fatal configuration error for any run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::sei_v4::SeiV4_2_0;
use super::ScraperPlugin;
use crate::error::{Result, ScrapeError};

/// Process-wide mapping from upstream version strings to plugins.
pub struct ScraperRegistry {
    plugins: HashMap<String, Arc<dyn ScraperPlugin>>,
}

impl ScraperRegistry {
    /// Empty registry, mainly for tests.
    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry with every built-in plugin registered.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SeiV4_2_0::new()));
        registry
    }

    /// Register a plugin under its reported version. Later registrations for
    /// the same version replace earlier ones.
    pub fn register(&mut self, plugin: Arc<dyn ScraperPlugin>) {
        let info = plugin.version_info();
        if self.plugins.insert(info.version.to_string(), plugin).is_some() {
            info!(version = info.version, "replacing registered scraper plugin");
        } else {
            info!(
                version = info.version,
                family = info.family,
                "registered scraper plugin"
            );
        }
    }

    /// Exact-version lookup. Missing versions are fatal to the caller's run.
    pub fn get(&self, version: &str) -> Result<Arc<dyn ScraperPlugin>> {
        self.plugins.get(version).cloned().ok_or_else(|| {
            ScrapeError::Config(format!("no scraper plugin registered for version {version}"))
        })
    }

    pub fn contains(&self, version: &str) -> bool {
        self.plugins.contains_key(version)
    }

    /// Registered versions, sorted.
    pub fn versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.plugins.keys().cloned().collect();
        versions.sort();
        versions
    }
}

impl Default for ScraperRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
