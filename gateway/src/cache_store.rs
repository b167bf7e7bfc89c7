//! Persisted cache of normalized records, keyed by `(domain, dedup_key)`.
//!
//! Stores return entries regardless of freshness; whether an entry is still a
//! hit is decided by the gateway via [`CacheEntry::is_fresh`]. Entries are
//! never deleted, only replaced by a later `put` for the same key.
use crate::config::CacheStoreConfig;
use crate::errors::CacheError;
use crate::types::{DedupKey, Domain, NormalizedRecord};
use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub dedup_key: DedupKey,
    pub domain: Domain,
    pub payload: Vec<NormalizedRecord>,
    pub created_at: SystemTime,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    pub fn new(
        domain: Domain,
        dedup_key: DedupKey,
        payload: Vec<NormalizedRecord>,
        ttl: Duration,
        created_at: SystemTime,
    ) -> Self {
        CacheEntry {
            dedup_key,
            domain,
            payload,
            created_at,
            ttl_seconds: ttl.as_secs(),
        }
    }

    /// `None` when the expiry lies beyond what `SystemTime` can represent.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.created_at
            .checked_add(Duration::from_secs(self.ttl_seconds))
    }

    /// An entry is fresh strictly before its expiry instant. An entry whose
    /// expiry cannot be represented never expires.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at().is_none_or(|expires_at| now < expires_at)
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, domain: Domain, key: &DedupKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Upserts the entry. Readers observe either the previous entry or the
    /// complete new one.
    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
}

pub fn store_from_config(config: &CacheStoreConfig) -> Arc<dyn CacheStore> {
    match config {
        CacheStoreConfig::Memory { max_capacity } => {
            Arc::new(InMemoryCacheStore::new(*max_capacity))
        }
        CacheStoreConfig::Filesystem { base_dir } => {
            Arc::new(FilesystemCacheStore::new(base_dir.clone()))
        }
    }
}

/// Process-local store backed by a bounded moka cache. Moka's own expiry is
/// not used, entries only leave when capacity forces it.
pub struct InMemoryCacheStore {
    cache: Cache<(Domain, DedupKey), Arc<CacheEntry>>,
}

impl InMemoryCacheStore {
    pub fn new(max_capacity: u64) -> Self {
        InMemoryCacheStore {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, domain: Domain, key: &DedupKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .cache
            .get(&(domain, key.clone()))
            .map(|entry| (*entry).clone()))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.cache.insert(
            (entry.domain, entry.dedup_key.clone()),
            Arc::new(entry.clone()),
        );
        Ok(())
    }
}

/// Keys longer than this are stored under their digest to stay within file
/// name limits.
const MAX_PLAIN_FILENAME: usize = 128;

/// One JSON document per key under `<base_dir>/<domain>/`. Writes go to a
/// temporary file in the same directory which is then renamed over the target.
pub struct FilesystemCacheStore {
    base_dir: PathBuf,
}

impl FilesystemCacheStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilesystemCacheStore {
            base_dir: base_dir.into(),
        }
    }

    fn entry_path(&self, domain: Domain, key: &DedupKey) -> PathBuf {
        // Key segments are percent-encoded when the key is built, so a key
        // never contains a path separator.
        let key = key.as_str();
        let filename = if key.len() <= MAX_PLAIN_FILENAME {
            key.to_string()
        } else {
            format!("sha256-{:x}", Sha256::digest(key.as_bytes()))
        };
        self.base_dir
            .join(domain.as_str())
            .join(format!("{filename}.json"))
    }
}

#[async_trait]
impl CacheStore for FilesystemCacheStore {
    async fn get(&self, domain: Domain, key: &DedupKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(domain, key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Read(e)),
        };

        let entry = serde_json::from_slice(&bytes).map_err(CacheError::Decode)?;
        Ok(Some(entry))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entry).map_err(CacheError::Encode)?;
        let path = self.entry_path(entry.domain, &entry.dedup_key);

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| CacheError::Write(io::Error::other(e)))?
            .map_err(CacheError::Write)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("cache entry path has no parent directory"))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
