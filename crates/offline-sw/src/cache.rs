//! Named caches of request URL → response.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use offline_net::Response;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::{ServiceWorkerError, SwResult};

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in received order; repeated names appear once per
    /// value. Values are raw bytes since they need not be UTF-8.
    #[serde(with = "headers_base64")]
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage under `url`.
    pub fn from_response(url: &str, method: &str, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: url.to_string(),
            method: method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> SwResult<Response> {
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            ServiceWorkerError::CacheError(format!("bad status for {}: {e}", self.url))
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| {
                ServiceWorkerError::CacheError(format!("bad header name for {}: {e}", self.url))
            })?;
            let value = HeaderValue::from_bytes(value).map_err(|e| {
                ServiceWorkerError::CacheError(format!("bad value for {name} on {}: {e}", self.url))
            })?;
            headers.append(name, value);
        }

        Ok(Response {
            url: url::Url::parse(&self.url).ok(),
            status,
            headers,
            body: self.body.clone().into(),
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod headers_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &[(String, Vec<u8>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            headers
                .iter()
                .map(|(name, value)| (name, STANDARD.encode(value))),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Vec<u8>)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|value| (name, value))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Host-owned storage of named caches (the `caches` global).
///
/// Cache names are listed in creation order. Lookups on a cache that does
/// not exist behave like a miss.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> SwResult<()>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> SwResult<bool>;

    /// Store entries keyed by their URL. The cache must already be open.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> SwResult<()>;

    /// Look up a URL in one cache.
    async fn match_in(&self, name: &str, url: &str) -> SwResult<Option<CacheEntry>>;

    /// Look up a URL across all caches, oldest first.
    async fn match_any(&self, url: &str) -> SwResult<Option<CacheEntry>>;

    /// Get all cache names.
    async fn keys(&self) -> SwResult<Vec<String>>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> SwResult<bool>;
}

/// A cache instance.
#[derive(Debug)]
struct Cache {
    name: String,
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }
}

/// In-process [`CacheStorage`].
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a cache, if it exists.
    pub async fn entry_count(&self, name: &str) -> Option<usize> {
        self.caches
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.entries.len())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        let mut caches = self.caches.write().await;
        if !caches.iter().any(|c| c.name == name) {
            debug!(cache = name, "Creating cache");
            caches.push(Cache::new(name));
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(self.caches.read().await.iter().any(|c| c.name == name))
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> SwResult<()> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ServiceWorkerError::CacheError(format!("cache '{name}' is not open")))?;

        debug!(cache = name, count = entries.len(), "Storing entries");
        for entry in entries {
            cache.entries.insert(entry.url.clone(), entry);
        }
        Ok(())
    }

    async fn match_in(&self, name: &str, url: &str) -> SwResult<Option<CacheEntry>> {
        let caches = self.caches.read().await;
        let hit = caches
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.entries.get(url))
            .cloned();
        trace!(cache = name, url, hit = hit.is_some(), "Cache match");
        Ok(hit)
    }

    async fn match_any(&self, url: &str) -> SwResult<Option<CacheEntry>> {
        let caches = self.caches.read().await;
        Ok(caches.iter().find_map(|c| c.entries.get(url)).cloned())
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != name);
        let removed = caches.len() != before;
        if removed {
            debug!(cache = name, "Deleted cache");
        }
        Ok(removed)
    }
}
