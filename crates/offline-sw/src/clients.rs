//! Open pages and the worker controlling them.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

use crate::worker::WorkerId;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// A client (page or worker) that a service worker may control.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker currently controlling this client.
    pub controller: Option<WorkerId>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// All clients of a type.
    pub fn match_all(&self, client_type: ClientType) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.client_type == client_type)
            .collect()
    }

    /// Track a newly opened page with no controller.
    pub fn open_window(&mut self, url: Url) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            controller: None,
        };
        self.add(client.clone());
        client
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Make `worker` the controller of every window client inside `scope`.
    /// Worker and shared worker clients are left alone.
    ///
    /// Returns the ids of clients whose controller changed.
    pub fn claim(&mut self, worker: WorkerId, scope: &Url) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.client_type == ClientType::Window)
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();

        debug!(worker = worker.raw(), count = changed.len(), "Claimed clients");
        changed
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
