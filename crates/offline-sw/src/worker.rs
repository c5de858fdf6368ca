//! The offline worker and its lifecycle.
//!
//! Each transition has one entry point: [`OfflineWorker::install`] moves
//! Parsed → Installed, [`OfflineWorker::activate`] moves Installed →
//! Activated, and [`OfflineWorker::handle_fetch`] only runs once Activated.
//! A failed transition leaves the worker Redundant; the host is expected
//! to build a fresh worker and try again on the next load.

use futures::future::join_all;
use offline_net::{Fetcher, Request, Response};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::{ServiceWorkerError, SwResult};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceWorkerState {
    /// Created, no lifecycle event handled yet.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install or activation failed.
    Redundant,
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Notifications published to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// State changed.
    StateChange {
        worker_id: WorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by this worker.
    ControllerChange {
        client_id: String,
        worker_id: WorkerId,
    },
}

/// Lifecycle events the host dispatches to the worker.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(Request),
}

/// Result of handling a [`LifecycleEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Installed,
    Activated(ActivationSummary),
    /// `None` when a navigation found no cached root document.
    Responded(Option<Response>),
}

/// What an activation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationSummary {
    /// Obsolete caches removed.
    pub deleted: Vec<String>,
    /// Clients that switched to this worker.
    pub claimed: Vec<String>,
}

/// Offline-first service worker.
pub struct OfflineWorker {
    id: WorkerId,
    config: WorkerConfig,
    cache_name: String,
    root_url: Url,
    resource_urls: Vec<Url>,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    state: RwLock<ServiceWorkerState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl OfflineWorker {
    /// Create a worker in the Parsed state.
    pub fn new(
        config: WorkerConfig,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<RwLock<Clients>>,
    ) -> SwResult<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = Self {
            id: WorkerId::new(),
            cache_name: config.cache_name(),
            root_url: config.root_url()?,
            resource_urls: config.resource_urls()?,
            config,
            caches,
            fetcher,
            clients,
            state: RwLock::new(ServiceWorkerState::Parsed),
            event_tx,
        };
        debug!(worker = worker.id.raw(), cache = %worker.cache_name, "Worker created");

        Ok((worker, event_rx))
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the cache this worker populates and serves from.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    /// Get the current state.
    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Route a lifecycle event to its handler.
    pub async fn dispatch(&self, event: LifecycleEvent) -> SwResult<EventOutcome> {
        match event {
            LifecycleEvent::Install => {
                self.install().await?;
                Ok(EventOutcome::Installed)
            }
            LifecycleEvent::Activate => Ok(EventOutcome::Activated(self.activate().await?)),
            LifecycleEvent::Fetch(request) => {
                Ok(EventOutcome::Responded(self.handle_fetch(&request).await?))
            }
        }
    }

    /// Precache every static resource into the versioned cache.
    pub async fn install(&self) -> SwResult<()> {
        self.begin(ServiceWorkerState::Parsed, ServiceWorkerState::Installing)
            .await?;

        match self.populate().await {
            Ok(()) => {
                info!(cache = %self.cache_name, count = self.resource_urls.len(), "Install complete");
                self.set_state(ServiceWorkerState::Installed).await;
                Ok(())
            }
            Err(e) => {
                warn!(cache = %self.cache_name, error = %e, "Install failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn populate(&self) -> SwResult<()> {
        self.caches.open(&self.cache_name).await?;

        let fetches = self.resource_urls.iter().map(|url| {
            let fetcher = &self.fetcher;
            async move {
                let response = fetcher.fetch(Request::get(url.clone())).await.map_err(|e| {
                    ServiceWorkerError::InstallFailed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                if !response.ok() {
                    return Err(ServiceWorkerError::InstallFailed {
                        url: url.to_string(),
                        reason: format!("status {}", response.status),
                    });
                }
                trace!(url = %url, bytes = response.body.len(), "Fetched static resource");
                Ok::<_, ServiceWorkerError>(CacheEntry::from_response(
                    url.as_str(),
                    "GET",
                    &response,
                ))
            }
        });

        let entries = join_all(fetches)
            .await
            .into_iter()
            .collect::<SwResult<Vec<_>>>()?;

        self.caches.put_all(&self.cache_name, entries).await
    }

    /// Delete caches from other versions, then claim open clients.
    pub async fn activate(&self) -> SwResult<ActivationSummary> {
        self.begin(ServiceWorkerState::Installed, ServiceWorkerState::Activating)
            .await?;

        match self.purge_and_claim().await {
            Ok(summary) => {
                info!(
                    cache = %self.cache_name,
                    deleted = summary.deleted.len(),
                    claimed = summary.claimed.len(),
                    "Activation complete"
                );
                self.set_state(ServiceWorkerState::Activated).await;
                Ok(summary)
            }
            Err(e) => {
                warn!(cache = %self.cache_name, error = %e, "Activation failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn purge_and_claim(&self) -> SwResult<ActivationSummary> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .await?
            .into_iter()
            .filter(|name| *name != self.cache_name)
            .collect();

        // Every deletion runs to completion; the first failure is reported.
        let results = join_all(stale.iter().map(|name| self.caches.delete(name))).await;

        let mut summary = ActivationSummary::default();
        let mut first_error = None;
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    debug!(cache = %name, "Deleted obsolete cache");
                    summary.deleted.push(name);
                }
                Ok(false) => debug!(cache = %name, "Obsolete cache already gone"),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete obsolete cache");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        summary.claimed = self
            .clients
            .write()
            .await
            .claim(self.id, &self.config.scope);
        for client_id in &summary.claimed {
            let _ = self.event_tx.send(WorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: self.id,
            });
        }

        Ok(summary)
    }

    /// Answer a request from cache, never from the network.
    ///
    /// Navigations always get the root document, searched across all
    /// caches; `None` means it was never stored. Other requests get their
    /// exact-URL entry (fragment ignored) from the current cache or an
    /// empty 404.
    pub async fn handle_fetch(&self, request: &Request) -> SwResult<Option<Response>> {
        let state = self.state().await;
        if state != ServiceWorkerState::Activated {
            return Err(ServiceWorkerError::StateError {
                expected: ServiceWorkerState::Activated,
                actual: state,
            });
        }

        if request.is_navigation() {
            trace!(url = %request.url, root = %self.root_url, "Navigation served from root");
            return match self.caches.match_any(self.root_url.as_str()).await? {
                Some(entry) => Ok(Some(entry.to_response()?)),
                None => {
                    warn!(root = %self.root_url, "Root document missing from cache");
                    Ok(None)
                }
            };
        }

        // Fragments never reach the network, so they never key an entry.
        let mut key = request.url.clone();
        key.set_fragment(None);
        let url = key.as_str();
        match self.caches.match_in(&self.cache_name, url).await? {
            Some(entry) => {
                trace!(url, "Cache hit");
                Ok(Some(entry.to_response()?))
            }
            None => {
                trace!(url, "Cache miss");
                Ok(Some(Response::not_found()))
            }
        }
    }

    async fn begin(&self, expected: ServiceWorkerState, next: ServiceWorkerState) -> SwResult<()> {
        let mut state = self.state.write().await;
        if *state != expected {
            return Err(ServiceWorkerError::StateError {
                expected,
                actual: *state,
            });
        }
        *state = next;
        drop(state);

        self.notify(next);
        Ok(())
    }

    async fn set_state(&self, next: ServiceWorkerState) {
        *self.state.write().await = next;
        self.notify(next);
    }

    fn notify(&self, new_state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), state = %new_state, "State change");
        // The host may have dropped its receiver; events are advisory.
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }
}
