//! # Offline Service Worker
//!
//! Offline-first service worker for the period-tracker web app.
//!
//! ## Features
//!
//! - **Install**: precache the static app shell under a versioned cache name
//! - **Activate**: delete every cache from older versions, claim open pages
//! - **Fetch**: serve navigations with the cached root document and every
//!   other request from the current cache, never from the network
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker (Parsed → Installing → Installed → Activating → Activated)
//!     │
//!     ├── WorkerConfig (app name, version, scope, static resources)
//!     ├── Fetcher (network, install only)
//!     ├── CacheStorage (caches)
//!     │       └── cache name → Request URL → CacheEntry
//!     └── Clients (controlled pages)
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod fs_cache;
pub mod worker;

pub use cache::{CacheEntry, CacheStorage, MemoryCacheStorage};
pub use clients::{Client, ClientType, Clients};
pub use config::WorkerConfig;
pub use fs_cache::FsCacheStorage;
pub use worker::{
    ActivationSummary, EventOutcome, LifecycleEvent, OfflineWorker, ServiceWorkerState,
    WorkerEvent, WorkerId,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: expected {expected}, found {actual}")]
    StateError {
        expected: ServiceWorkerState,
        actual: ServiceWorkerState,
    },

    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for service worker operations.
pub type SwResult<T> = Result<T, ServiceWorkerError>;
