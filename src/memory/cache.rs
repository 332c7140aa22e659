use crate::errors::AppResult;
use crate::fingerprint::sha256_hex;
use crate::memory::store::{trim_to_max, MemoryEntry, MAX_VALUE_BYTES};
use crate::memory::vcs::VcsContext;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const PERSIST_THROTTLE: Duration = Duration::from_secs(2);
pub const SNAPSHOT_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: u32,
    pub project_root: String,
    pub git_head: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub entries: HashMap<String, MemoryEntry>,
}

#[derive(Default)]
struct PersistState {
    last_persist: Option<Instant>,
    pending: Option<HashMap<String, MemoryEntry>>,
    // newest store generation seen; older maps arrive late and are dropped
    generation: u64,
}

/// Gzipped snapshot of the memory store, keyed by the project root.
pub struct SnapshotCache {
    path: PathBuf,
    context: VcsContext,
    state: Mutex<PersistState>,
}

impl SnapshotCache {
    pub fn new(memory_dir: &Path, context: VcsContext) -> Self {
        let path = memory_dir.join(format!("{}.json.gz", sha256_hex(context.root_key())));
        Self {
            path,
            context,
            state: Mutex::new(PersistState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries from a snapshot that still matches this project; anything
    /// stale or unreadable is deleted.
    pub fn load(&self) -> HashMap<String, MemoryEntry> {
        if !self.path.exists() {
            return HashMap::new();
        }
        let snapshot = match read_snapshot(&self.path) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), error = %error, "discarding unreadable memory snapshot");
                self.discard();
                return HashMap::new();
            }
        };
        if let Some(reason) = self.rejection_reason(&snapshot, Utc::now()) {
            tracing::info!(path = %self.path.display(), reason, "discarding stale memory snapshot");
            self.discard();
            return HashMap::new();
        }
        snapshot
            .entries
            .into_iter()
            .map(|(key, mut entry)| {
                entry.value = trim_to_max(&entry.value, MAX_VALUE_BYTES).0;
                (key, entry)
            })
            .collect()
    }

    fn rejection_reason(&self, snapshot: &MemorySnapshot, now: DateTime<Utc>) -> Option<&'static str> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Some("version");
        }
        if snapshot.project_root != self.context.root_key() {
            return Some("project_root");
        }
        if snapshot.git_head != self.context.head {
            return Some("git_head");
        }
        if now - snapshot.updated_at > ChronoDuration::hours(SNAPSHOT_TTL_HOURS) {
            return Some("ttl");
        }
        None
    }

    fn discard(&self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %error, "memory snapshot removal failed");
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PersistState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes `entries` unless a write happened within the throttle window;
    /// throttled state is kept for `flush`. An empty map removes the file.
    ///
    /// `generation` orders maps taken from the store. A map older than one
    /// already seen is ignored, so a late write can never undo a clear.
    pub fn persist(&self, generation: u64, entries: HashMap<String, MemoryEntry>, force: bool) {
        let mut state = self.lock_state();
        if generation < state.generation {
            tracing::debug!(generation, latest = state.generation, "dropping superseded memory snapshot");
            return;
        }
        state.generation = generation;
        if entries.is_empty() {
            self.discard();
            state.pending = None;
            state.last_persist = Some(Instant::now());
            return;
        }
        let throttled = state
            .last_persist
            .map(|at| at.elapsed() < PERSIST_THROTTLE)
            .unwrap_or(false);
        if throttled && !force {
            state.pending = Some(entries);
            return;
        }
        self.commit(&mut state, entries);
    }

    /// Writes the snapshot held back by the throttle, if any.
    pub fn flush(&self) {
        let mut state = self.lock_state();
        if let Some(entries) = state.pending.take() {
            self.commit(&mut state, entries);
        }
    }

    fn commit(&self, state: &mut PersistState, entries: HashMap<String, MemoryEntry>) {
        match self.write(entries) {
            Ok(()) => {
                state.pending = None;
                state.last_persist = Some(Instant::now());
            }
            Err(error) => {
                tracing::warn!(path = %self.path.display(), error = %error, "memory snapshot write failed");
            }
        }
    }

    fn write(&self, entries: HashMap<String, MemoryEntry>) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = MemorySnapshot {
            version: SNAPSHOT_VERSION,
            project_root: self.context.root_key(),
            git_head: self.context.head.clone(),
            updated_at: Utc::now(),
            entries,
        };
        write_snapshot(&self.path, &snapshot)
    }
}

fn read_snapshot(path: &Path) -> AppResult<MemorySnapshot> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    Ok(serde_json::from_reader(decoder)?)
}

fn write_snapshot(path: &Path, snapshot: &MemorySnapshot) -> AppResult<()> {
    let tmp = path.with_extension("gz.tmp");
    let result = (|| -> AppResult<()> {
        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, snapshot)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        Ok(())
    })();
    if let Err(error) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(error);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
