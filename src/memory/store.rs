use crate::errors::{AppError, AppResult};
use crate::memory::cache::SnapshotCache;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const MAX_VALUE_BYTES: usize = 200_000;
pub const DEFAULT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub key: String,
    pub size: usize,
    pub updated_at: DateTime<Utc>,
}

/// Keeps the newest `max_bytes` of `value`, moving the cut forward to the
/// next character boundary. Returns whether anything was dropped.
pub fn trim_to_max(value: &str, max_bytes: usize) -> (String, bool) {
    if value.len() <= max_bytes {
        return (value.to_string(), false);
    }
    let mut start = value.len() - max_bytes;
    while !value.is_char_boundary(start) {
        start += 1;
    }
    (value[start..].to_string(), true)
}

pub fn normalize_key(key: &str) -> AppResult<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(AppError::InvalidInput("memory key is required".to_string()));
    }
    Ok(key.to_string())
}

/// Shared key/value memory passed between agent invocations.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    cache: Option<Arc<SnapshotCache>>,
    // bumped under the write lock so snapshots carry mutation order
    generation: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MemoryStore {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache: None,
            generation: AtomicU64::new(0),
        }
    }

    /// Store seeded from `cache`, which also receives every mutation.
    pub fn with_cache(cache: Arc<SnapshotCache>) -> Self {
        let entries = cache.load();
        tracing::debug!(entries = entries.len(), path = %cache.path().display(), "memory store loaded");
        Self {
            entries: RwLock::new(entries),
            cache: Some(cache),
            generation: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::warn!("memory store lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::warn!("memory store lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Call with the write guard held; the returned number orders snapshots.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn persist(&self, generation: u64, snapshot: HashMap<String, MemoryEntry>, force: bool) {
        if let Some(cache) = self.cache.as_ref() {
            cache.persist(generation, snapshot, force);
        }
    }

    /// Rejects values over the size limit so callers notice data loss.
    pub fn set(&self, key: &str, value: &str) -> AppResult<MemoryEntry> {
        self.store(key, None, value, false)
    }

    /// Never fails on size; drops the oldest bytes instead.
    pub fn set_auto(&self, key: &str, value: &str) -> AppResult<MemoryEntry> {
        self.store(key, None, value, true)
    }

    pub fn append(&self, key: &str, value: &str, separator: Option<&str>) -> AppResult<MemoryEntry> {
        self.store(key, Some(separator_or_default(separator)), value, false)
    }

    pub fn append_auto(&self, key: &str, value: &str, separator: Option<&str>) -> AppResult<MemoryEntry> {
        self.store(key, Some(separator_or_default(separator)), value, true)
    }

    fn store(
        &self,
        key: &str,
        append_with: Option<&str>,
        value: &str,
        truncate: bool,
    ) -> AppResult<MemoryEntry> {
        let key = normalize_key(key)?;
        let (entry, generation, snapshot) = {
            let mut entries = self.write();
            let combined = match (append_with, entries.get(&key)) {
                (Some(separator), Some(existing)) if !existing.value.is_empty() => {
                    format!("{}{}{}", existing.value, separator, value)
                }
                _ => value.to_string(),
            };
            let (value, trimmed) = trim_to_max(&combined, MAX_VALUE_BYTES);
            if trimmed && !truncate {
                return Err(AppError::InvalidInput(format!(
                    "memory value exceeds {} bytes",
                    MAX_VALUE_BYTES
                )));
            }
            let entry = MemoryEntry {
                value,
                updated_at: Utc::now(),
            };
            entries.insert(key, entry.clone());
            (entry, self.next_generation(), entries.clone())
        };
        self.persist(generation, snapshot, false);
        Ok(entry)
    }

    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.read().get(key.trim()).cloned()
    }

    /// Sorted by key.
    pub fn list(&self) -> Vec<MemoryItem> {
        let mut items = self
            .read()
            .iter()
            .map(|(key, entry)| MemoryItem {
                key: key.clone(),
                size: entry.value.len(),
                updated_at: entry.updated_at,
            })
            .collect::<Vec<_>>();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    pub fn clear(&self, key: &str) -> bool {
        let (generation, snapshot) = {
            let mut entries = self.write();
            if entries.remove(key.trim()).is_none() {
                return false;
            }
            (self.next_generation(), entries.clone())
        };
        self.persist(generation, snapshot, true);
        true
    }

    pub fn clear_all(&self) -> usize {
        let (count, generation) = {
            let mut entries = self.write();
            let count = entries.len();
            entries.clear();
            (count, self.next_generation())
        };
        self.persist(generation, HashMap::new(), true);
        count
    }

    /// Writes any snapshot held back by the persist throttle.
    pub fn flush(&self) {
        if let Some(cache) = self.cache.as_ref() {
            cache.flush();
        }
    }
}

fn separator_or_default(separator: Option<&str>) -> &str {
    match separator {
        Some(value) if !value.is_empty() => value,
        _ => DEFAULT_SEPARATOR,
    }
}
