//! In-memory response cache with session ownership.
//!
//! Entries are addressed two ways: by the deterministic [`cache_key`] of the
//! request fields, and by a random opaque id issued on every `set`. Callers
//! only ever see the opaque id. Lookups from a session that does not own
//! an entry behave exactly like lookups of an unknown id.

pub mod key;
pub mod page;

pub use key::{cache_key, fields, is_opaque_id, new_opaque_id, IGNORED_FIELDS};
pub use page::{paginate, Page};

use crate::errors::CacheError;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const MB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub max_total_bytes: usize,
    pub max_entry_bytes: usize,
    pub compression_threshold: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(24 * 3600),
            max_total_bytes: 100 * MB,
            max_entry_bytes: 10 * MB,
            compression_threshold: MB,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Who may read an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum Owner {
    /// Readable by every requester.
    Anonymous,
    Session(String),
}

impl Owner {
    pub fn from_session(session: Option<&str>) -> Self {
        match session {
            Some(id) => Owner::Session(id.to_string()),
            None => Owner::Anonymous,
        }
    }

    pub fn permits(&self, requester: Option<&str>) -> bool {
        match self {
            Owner::Anonymous => true,
            Owner::Session(owner) => requester == Some(owner.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    data: Vec<u8>,
    pub created: Instant,
    pub created_at: DateTime<Utc>,
    /// Size of the original content in bytes.
    pub size: usize,
    pub compressed: bool,
    pub owner: Owner,
    pub opaque_id: String,
    pub metadata: Value,
}

impl CacheEntry {
    fn stored_size(&self) -> usize {
        self.data.len()
    }

    fn content(&self) -> Result<String, CacheError> {
        if self.compressed {
            let mut decoder = GzDecoder::new(self.data.as_slice());
            let mut out = String::with_capacity(self.size);
            decoder
                .read_to_string(&mut out)
                .map_err(CacheError::Decompression)?;
            Ok(out)
        } else {
            String::from_utf8(self.data.clone()).map_err(|e| {
                CacheError::Decompression(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })
        }
    }
}

#[derive(Debug, Clone)]
struct OpaqueRecord {
    key: String,
    owner: Owner,
    created: Instant,
}

/// Returned by a successful `set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredResponse {
    pub opaque_id: String,
    pub cache_key: String,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub opaque_ids: usize,
    pub total_bytes: usize,
    pub compressed_entries: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    /// LRU order: front is least recently used.
    entries: IndexMap<String, CacheEntry>,
    ids: HashMap<String, OpaqueRecord>,
    total_bytes: usize,
}

impl CacheState {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.shift_remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.stored_size());
        self.ids.retain(|_, record| record.key != key);
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        if let Some(index) = self.entries.get_index_of(key) {
            let last = self.entries.len() - 1;
            self.entries.move_index(index, last);
        }
    }

    fn evict_to_fit(&mut self, config: &CacheConfig, keep: &str) -> usize {
        let mut evicted = 0;
        while (self.total_bytes > config.max_total_bytes || self.entries.len() > config.max_entries)
            && self.entries.len() > 1
        {
            let Some(oldest) = self
                .entries
                .keys()
                .find(|k| k.as_str() != keep)
                .cloned()
            else {
                break;
            };
            self.remove_entry(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn sweep(&mut self, ttl: Duration, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.created) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        self.ids
            .retain(|_, record| now.saturating_duration_since(record.created) <= ttl);
        expired.len()
    }
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct ResponseCache {
    inner: Arc<CacheInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState::default()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Store `content` for the request described by `fields`.
    pub fn set(&self, fields: &Value, content: &str, owner: Owner) -> Result<StoredResponse, CacheError> {
        let config = &self.inner.config;
        let size = content.len();
        if size > config.max_entry_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                limit: config.max_entry_bytes,
            });
        }

        let compressed = size > config.compression_threshold;
        let data = if compressed {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(content.as_bytes())
                .map_err(CacheError::Compression)?;
            encoder.finish().map_err(CacheError::Compression)?
        } else {
            content.as_bytes().to_vec()
        };

        let key = cache_key(fields);
        let opaque_id = new_opaque_id();
        let now = Instant::now();
        let entry = CacheEntry {
            data,
            created: now,
            created_at: Utc::now(),
            size,
            compressed,
            owner: owner.clone(),
            opaque_id: opaque_id.clone(),
            metadata: fields.clone(),
        };

        let mut state = self.inner.lock();
        // Overwrite keeps earlier opaque ids pointing at the key.
        if let Some(previous) = state.entries.shift_remove(&key) {
            state.total_bytes = state.total_bytes.saturating_sub(previous.stored_size());
        }
        state.total_bytes += entry.stored_size();
        state.entries.insert(key.clone(), entry);
        state.ids.insert(
            opaque_id.clone(),
            OpaqueRecord {
                key: key.clone(),
                owner,
                created: now,
            },
        );
        let evicted = state.evict_to_fit(config, &key);
        if evicted > 0 {
            info!(evicted, total_bytes = state.total_bytes, "evicted cache entries");
        }
        debug!(cache_key = %key, size, compressed, "cached response");

        Ok(StoredResponse {
            opaque_id,
            cache_key: key,
            compressed,
        })
    }

    /// Resolve an opaque id or cache key that `requester` may read.
    ///
    /// An opaque id is authorized by the owner recorded when it was issued,
    /// so a later `set` of the same key by another session does not revoke
    /// it. A raw key is authorized by the entry's current owner.
    fn resolve(&self, state: &mut CacheState, id_or_key: &str, requester: Option<&str>) -> Option<String> {
        let key = if is_opaque_id(id_or_key) {
            let record = state.ids.get(id_or_key)?;
            if !record.owner.permits(requester) {
                return None;
            }
            record.key.clone()
        } else {
            if !state.entries.get(id_or_key)?.owner.permits(requester) {
                return None;
            }
            id_or_key.to_string()
        };
        let now = Instant::now();
        let entry = state.entries.get(&key)?;
        if now.saturating_duration_since(entry.created) > self.inner.config.ttl {
            debug!(cache_key = %key, "cache entry expired");
            state.remove_entry(&key);
            return None;
        }
        Some(key)
    }

    /// Content for an opaque id or key, or `None` when absent, expired, or
    /// owned by another session.
    pub fn get(&self, id_or_key: &str, requester: Option<&str>) -> Result<Option<String>, CacheError> {
        let mut state = self.inner.lock();
        let Some(key) = self.resolve(&mut state, id_or_key, requester) else {
            return Ok(None);
        };
        state.touch(&key);
        match state.entries.get(&key) {
            Some(entry) => entry.content().map(Some),
            None => Ok(None),
        }
    }

    /// One page of the content behind an opaque id or key.
    pub fn get_page(
        &self,
        id_or_key: &str,
        requester: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Option<Page>, CacheError> {
        Ok(self
            .get(id_or_key, requester)?
            .map(|content| paginate(&content, offset, limit)))
    }

    /// Opaque id of a live entry for `fields` that `requester` may read.
    pub fn lookup(&self, fields: &Value, requester: Option<&str>) -> Option<String> {
        let key = cache_key(fields);
        let mut state = self.inner.lock();
        let key = self.resolve(&mut state, &key, requester)?;
        state.entries.get(&key).map(|e| e.opaque_id.clone())
    }

    /// Whether an unexpired entry exists for the id or key, regardless of owner.
    pub fn has(&self, id_or_key: &str) -> bool {
        let state = self.inner.lock();
        let key = state
            .ids
            .get(id_or_key)
            .map(|r| r.key.as_str())
            .unwrap_or(id_or_key);
        state.entries.get(key).is_some_and(|entry| {
            Instant::now().saturating_duration_since(entry.created) <= self.inner.config.ttl
        })
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        *state = CacheState::default();
    }

    /// Remove expired entries and ids. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let removed = self.inner.lock().sweep(self.inner.config.ttl, Instant::now());
        if removed > 0 {
            info!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Spawn the periodic expiry sweep. Idempotent.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_some() {
            return;
        }
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval.max(Duration::from_secs(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.lock().sweep(inner.config.ttl, Instant::now());
                if removed > 0 {
                    info!(removed, "swept expired cache entries");
                }
            }
        }));
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        CacheStats {
            entries: state.entries.len(),
            opaque_ids: state.ids.len(),
            total_bytes: state.total_bytes,
            compressed_entries: state.entries.values().filter(|e| e.compressed).count(),
        }
    }
}
