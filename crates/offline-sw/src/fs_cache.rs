//! [`CacheStorage`] persisted on disk.
//!
//! ```text
//! <root>/
//!     caches.json              cache names, creation order
//!     <sha256(cache name)>/
//!         <sha256(request url)>.json   one CacheEntry per file
//! ```
//!
//! File names are fixed-length digests, so arbitrarily long URLs and cache
//! names map to valid paths. The URL itself lives inside the entry.

use async_trait::async_trait;
use hashbrown::HashSet;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStorage};
use crate::{ServiceWorkerError, SwResult};

const MANIFEST: &str = "caches.json";

/// Cache storage rooted at a directory; survives worker restarts.
pub struct FsCacheStorage {
    root: PathBuf,
    // Serializes manifest read-modify-write cycles and cache directory swaps.
    manifest_lock: Mutex<()>,
}

fn digest(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

fn entry_file(url: &str) -> String {
    format!("{}.json", digest(url))
}

fn is_missing(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

async fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if !is_missing(&e) => Err(e),
        _ => Ok(()),
    }
}

impl FsCacheStorage {
    /// Open (creating if needed) storage under `root`.
    pub async fn new(root: impl Into<PathBuf>) -> SwResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened filesystem cache storage");
        Ok(Self {
            root,
            manifest_lock: Mutex::new(()),
        })
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        self.root.join(digest(name))
    }

    // Hex digests never contain '.', so these cannot collide with a cache.
    fn scratch_dir(&self, name: &str, tag: &str) -> PathBuf {
        self.root.join(format!(".{tag}-{}", digest(name)))
    }

    fn entry_path(&self, name: &str, url: &str) -> PathBuf {
        self.cache_dir(name).join(entry_file(url))
    }

    async fn read_manifest(&self) -> SwResult<Vec<String>> {
        match fs::read(self.root.join(MANIFEST)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, names: &[String]) -> SwResult<()> {
        let json = serde_json::to_vec_pretty(names)?;
        let tmp = self.root.join(format!("{MANIFEST}.tmp"));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, self.root.join(MANIFEST)).await?;
        Ok(())
    }

    async fn read_entry(&self, name: &str, url: &str) -> SwResult<Option<CacheEntry>> {
        match fs::read(self.entry_path(name, url)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Build the next version of a cache directory in `staging`: the new
    /// entries plus every current entry they do not replace.
    async fn stage(
        &self,
        current: &Path,
        staging: &Path,
        entries: &[CacheEntry],
    ) -> SwResult<()> {
        let mut staged = HashSet::new();
        for entry in entries {
            let file = entry_file(&entry.url);
            fs::write(staging.join(&file), serde_json::to_vec(entry)?).await?;
            staged.insert(OsString::from(file));
        }

        let mut existing = match fs::read_dir(current).await {
            Ok(dir) => dir,
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = existing.next_entry().await? {
            let file = item.file_name();
            if !staged.contains(&file) {
                fs::copy(item.path(), staging.join(&file)).await?;
            }
        }
        Ok(())
    }

    /// Replace `current` with `staging`, restoring `current` if the second
    /// rename fails.
    async fn swap_in(&self, name: &str, current: &Path, staging: &Path) -> SwResult<()> {
        let retired = self.scratch_dir(name, "retired");
        remove_dir_if_present(&retired).await?;

        let had_current = match fs::rename(current, &retired).await {
            Ok(()) => true,
            Err(e) if is_missing(&e) => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fs::rename(staging, current).await {
            if had_current {
                fs::rename(&retired, current).await?;
            }
            return Err(e.into());
        }

        if had_current {
            if let Err(e) = fs::remove_dir_all(&retired).await {
                warn!(cache = name, error = %e, "Failed to remove retired cache directory");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for FsCacheStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut names = self.read_manifest().await?;
        fs::create_dir_all(self.cache_dir(name)).await?;
        if !names.iter().any(|n| n == name) {
            debug!(cache = name, "Creating cache");
            names.push(name.to_string());
            self.write_manifest(&names).await?;
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        Ok(self.read_manifest().await?.iter().any(|n| n == name))
    }

    /// All-or-nothing: entries are staged in a scratch directory that
    /// replaces the cache directory only once every write succeeded.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> SwResult<()> {
        let _guard = self.manifest_lock.lock().await;
        if !self.read_manifest().await?.iter().any(|n| n == name) {
            return Err(ServiceWorkerError::CacheError(format!(
                "cache '{name}' is not open"
            )));
        }

        debug!(cache = name, count = entries.len(), "Storing entries");
        let current = self.cache_dir(name);
        let staging = self.scratch_dir(name, "staging");
        remove_dir_if_present(&staging).await?;
        fs::create_dir_all(&staging).await?;

        if let Err(e) = self.stage(&current, &staging, &entries).await {
            warn!(cache = name, error = %e, "Discarding staged entries");
            if let Err(cleanup) = fs::remove_dir_all(&staging).await {
                warn!(cache = name, error = %cleanup, "Failed to remove staging directory");
            }
            return Err(e);
        }

        self.swap_in(name, &current, &staging).await
    }

    async fn match_in(&self, name: &str, url: &str) -> SwResult<Option<CacheEntry>> {
        let hit = self.read_entry(name, url).await?;
        trace!(cache = name, url, hit = hit.is_some(), "Cache match");
        Ok(hit)
    }

    async fn match_any(&self, url: &str) -> SwResult<Option<CacheEntry>> {
        for name in self.read_manifest().await? {
            if let Some(entry) = self.read_entry(&name, url).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        self.read_manifest().await
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        let _guard = self.manifest_lock.lock().await;
        let mut names = self.read_manifest().await?;
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() == before {
            return Ok(false);
        }

        self.write_manifest(&names).await?;
        remove_dir_if_present(&self.cache_dir(name)).await?;
        debug!(cache = name, "Deleted cache");
        Ok(true)
    }
}
