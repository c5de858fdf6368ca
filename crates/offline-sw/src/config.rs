//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use url::Url;

use crate::{ServiceWorkerError, SwResult};

/// App name used in the cache name.
pub const DEFAULT_APP_NAME: &str = "period-tracker";

/// Bump whenever any static resource changes; it is the only way to push
/// an update to installed clients.
pub const DEFAULT_VERSION: &str = "v1";

/// Default scope the worker controls.
pub const DEFAULT_SCOPE: &str = "http://localhost/";

/// App shell precached on install.
pub const DEFAULT_STATIC_RESOURCES: &[&str] = &[
    "/",
    "/cycle.html",
    "/style.css",
    "/app.js",
    "/android-chrome-512x512.png",
    "site.webmanifest",
];

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Application name, first half of the cache name
    pub app_name: String,

    /// Release tag of the asset set, second half of the cache name
    pub version: String,

    /// Base URL of the controlled pages; relative paths resolve against it
    pub scope: Url,

    /// Paths stored on install, in order
    pub static_resources: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            version: DEFAULT_VERSION.to_string(),
            scope: Url::parse(DEFAULT_SCOPE).expect("default scope is a valid URL"),
            static_resources: DEFAULT_STATIC_RESOURCES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl WorkerConfig {
    /// Default resources and names under a different scope.
    pub fn with_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Name of the cache holding this version's assets.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.app_name, self.version)
    }

    /// Resolve a path against the scope.
    pub fn resolve(&self, path: &str) -> SwResult<Url> {
        self.scope
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("cannot resolve '{path}': {e}")))
    }

    /// URL of the root document served for every navigation.
    pub fn root_url(&self) -> SwResult<Url> {
        self.resolve("/")
    }

    /// Absolute URLs of the static resources, in order.
    pub fn resource_urls(&self) -> SwResult<Vec<Url>> {
        self.static_resources
            .iter()
            .map(|path| self.resolve(path))
            .collect()
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> SwResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "app_name must not be empty".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "version must not be empty".to_string(),
            ));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ServiceWorkerError::ConfigError(format!(
                "scope '{}' cannot be a base URL",
                self.scope
            )));
        }
        self.resource_urls()?;
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub async fn load(path: &Path) -> SwResult<Self> {
        debug!(path = %path.display(), "Loading worker config");
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}
