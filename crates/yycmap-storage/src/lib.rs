//! Artifact persistence + the bounded details cache for the YYC license map.
//!
//! The light aggregate is one file written via temp-file + atomic rename; the
//! heavy tree is staged in full and swapped into place, so readers observe
//! the previous cycle or the new one, never a mix.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;
use yycmap_core::{HeavyRecord, LightCollection};

pub const CRATE_NAME: &str = "yycmap-storage";

/// On-disk names kept compatible with the map UI's data layout.
pub const LIGHT_FILE: &str = "properties-light.json";
pub const HEAVY_DIR: &str = "properties-heavy";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact id {0:?} contains characters outside [A-Za-z0-9_-]")]
    InvalidId(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ids become file names under the heavy directory, so anything outside this
/// alphabet is rejected before a path is ever built.
pub fn is_valid_artifact_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceReport {
    pub heavy_files: usize,
    pub heavy_bytes: u64,
    pub light_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn light_path(&self) -> PathBuf {
        self.root.join(LIGHT_FILE)
    }

    pub fn heavy_dir(&self) -> PathBuf {
        self.root.join(HEAVY_DIR)
    }

    /// `Ok(None)` means the artifact has not been generated yet; an
    /// unreadable or unparsable artifact is an error.
    pub async fn read_light(&self) -> Result<Option<LightCollection>, StorageError> {
        let path = self.light_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Rejects malformed ids before touching the filesystem; `Ok(None)` means
    /// no artifact exists for a well-formed id.
    pub async fn read_heavy(&self, id: &str) -> Result<Option<HeavyRecord>, StorageError> {
        if !is_valid_artifact_id(id) {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        let path = self.heavy_dir().join(format!("{id}.json"));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Replaces both artifacts with a new cycle's output. The heavy tree is
    /// written to a staging directory and swapped in; the light file is
    /// renamed into place last, after the details it points at exist.
    pub async fn replace_all(
        &self,
        light: &LightCollection,
        heavies: &[HeavyRecord],
    ) -> Result<ReplaceReport, StorageError> {
        fs::create_dir_all(&self.root).await?;

        let staging = self.root.join(format!(".{HEAVY_DIR}.{}.tmp", Uuid::new_v4()));
        let mut report = ReplaceReport::default();
        if let Err(err) = self.write_heavy_tree(&staging, heavies, &mut report).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        self.swap_heavy_dir(&staging).await?;
        report.light_bytes = self.write_light(light).await?;
        Ok(report)
    }

    async fn write_heavy_tree(
        &self,
        staging: &Path,
        heavies: &[HeavyRecord],
        report: &mut ReplaceReport,
    ) -> Result<(), StorageError> {
        fs::create_dir_all(staging).await?;
        for heavy in heavies {
            if !is_valid_artifact_id(&heavy.id) {
                return Err(StorageError::InvalidId(heavy.id.clone()));
            }
            let bytes = serde_json::to_vec_pretty(heavy)?;
            fs::write(staging.join(format!("{}.json", heavy.id)), &bytes).await?;
            report.heavy_files += 1;
            report.heavy_bytes += bytes.len() as u64;
        }
        Ok(())
    }

    async fn swap_heavy_dir(&self, staging: &Path) -> Result<(), StorageError> {
        let live = self.heavy_dir();
        let retired = self.root.join(format!(".{HEAVY_DIR}.{}.old", Uuid::new_v4()));

        let had_previous = match fs::rename(&live, &retired).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                let _ = fs::remove_dir_all(staging).await;
                return Err(err.into());
            }
        };

        if let Err(err) = fs::rename(staging, &live).await {
            // Put the previous tree back so readers keep a consistent view.
            if had_previous {
                let _ = fs::rename(&retired, &live).await;
            }
            let _ = fs::remove_dir_all(staging).await;
            return Err(err.into());
        }

        if had_previous {
            if let Err(err) = fs::remove_dir_all(&retired).await {
                warn!(path = %retired.display(), error = %err, "failed to remove retired heavy tree");
            }
        }
        Ok(())
    }

    async fn write_light(&self, light: &LightCollection) -> Result<u64, StorageError> {
        let bytes = serde_json::to_vec_pretty(light)?;
        let temp = self.root.join(format!(".{LIGHT_FILE}.{}.tmp", Uuid::new_v4()));
        fs::write(&temp, &bytes).await?;
        match fs::rename(&temp, self.light_path()).await {
            Ok(()) => Ok(bytes.len() as u64),
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                Err(err.into())
            }
        }
    }
}

pub const DEFAULT_CACHE_CAPACITY: usize = 50;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct CacheEntry {
    record: HeavyRecord,
    inserted_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl: Duration,
    pub entries: Vec<String>,
}

/// Bounded, time-expiring store of heavy records keyed by id.
///
/// Eviction is by insertion order, not access recency: overflow removes the
/// entry that has been in the cache longest, regardless of how recently it
/// was read. Expiry is lazy — an entry past its TTL stays in the structure
/// (and in `len`) until the next `get` for that id removes it. There is no
/// background sweep.
///
/// Every operation completes without yielding, so callers can share the
/// cache behind a plain `std::sync::Mutex`.
#[derive(Debug)]
pub struct DetailsCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl Default for DetailsCache {
    fn default() -> Self {
        Self::with_limits(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl DetailsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns the cached record if present and younger than the TTL. An
    /// expired entry is removed as a side effect of the lookup.
    pub fn get(&mut self, id: &str) -> Option<HeavyRecord> {
        let entry = self.entries.get(id)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            self.entries.remove(id);
            self.order.retain(|key| key != id);
            debug!(id, "cache entry expired");
            return None;
        }
        Some(self.entries[id].record.clone())
    }

    /// Inserts or refreshes an entry, always resetting its timestamp. At
    /// capacity the insertion-order-oldest entry is evicted first, even when
    /// the id being set is already present.
    pub fn set(&mut self, id: &str, record: HeavyRecord) {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!(id = %oldest, "evicted oldest cache entry");
            }
        }

        let entry = CacheEntry {
            record,
            inserted_at: Instant::now(),
        };
        if self.entries.insert(id.to_string(), entry).is_none() {
            self.order.push_back(id.to_string());
        }
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.order.retain(|key| key != id);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Counts stored entries, including ones past their TTL that no lookup
    /// has expired yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            capacity: self.capacity,
            ttl: self.ttl,
            entries: self.order.iter().cloned().collect(),
        }
    }
}
