use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{Snapshot, Storage, StorageError};
use crate::metric::MetricValue;

/// Names recast to counters when restoring an untagged snapshot.
pub const DEFAULT_COUNTER_NAMES: &[&str] = &["PollCount"];

/// How a file-backed [`MemStorage`] keeps its snapshot current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Every mutation rewrites the file before returning.
    Sync,
    /// A background loop dumps the map on this period.
    Interval(Duration),
}

impl SnapshotMode {
    /// `0` selects synchronous write-through.
    pub fn from_interval(every: Duration) -> Self {
        if every.is_zero() {
            Self::Sync
        } else {
            Self::Interval(every)
        }
    }
}

/// Snapshot entry as written to disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DumpValue {
    Gauge { value: f64 },
    Counter { delta: i64 },
}

/// Snapshot entry as read from disk: tagged, or a bare number from the
/// older untagged format.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LoadedValue {
    Tagged(DumpValue),
    Legacy(f64),
}

impl From<MetricValue> for DumpValue {
    fn from(v: MetricValue) -> Self {
        match v {
            MetricValue::Gauge(value) => Self::Gauge { value },
            MetricValue::Counter(delta) => Self::Counter { delta },
        }
    }
}

impl From<DumpValue> for MetricValue {
    fn from(v: DumpValue) -> Self {
        match v {
            DumpValue::Gauge { value } => Self::Gauge(value),
            DumpValue::Counter { delta } => Self::Counter(delta),
        }
    }
}

/// The snapshot file and the generation of the map last written to it.
#[derive(Debug)]
struct DumpFile {
    path: PathBuf,
    mode: SnapshotMode,
    written: Arc<Mutex<u64>>,
}

/// Mutex-guarded in-memory backend with an optional JSON snapshot file.
///
/// In [`SnapshotMode::Sync`] the map is encoded under the lock and the file
/// is written on the blocking pool afterwards. Writes carry the map
/// generation, so a slow writer never replaces a newer snapshot. A failed
/// write is reported to the caller but the update stays applied in memory;
/// the next successful write persists it.
#[derive(Debug)]
pub struct MemStorage {
    metrics: Mutex<HashMap<String, MetricValue>>,
    /// Bumped on every mutation, while the map lock is held.
    generation: AtomicU64,
    file: Option<DumpFile>,
    counter_names: HashSet<String>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    /// Volatile store, nothing is persisted.
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            file: None,
            counter_names: DEFAULT_COUNTER_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Store backed by a snapshot file at `path`.
    pub fn with_snapshot(path: impl Into<PathBuf>, mode: SnapshotMode) -> Self {
        Self {
            file: Some(DumpFile {
                path: path.into(),
                mode,
                written: Arc::new(Mutex::new(0)),
            }),
            ..Self::new()
        }
    }

    /// Override the names treated as counters when loading untagged snapshots.
    pub fn with_counter_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.counter_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn snapshot_mode(&self) -> Option<SnapshotMode> {
        self.file.as_ref().map(|f| f.mode)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MetricValue>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the map under the lock, then write through in sync mode.
    async fn mutate<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut HashMap<String, MetricValue>) -> R + Send,
        R: Send,
    {
        let (result, pending) = {
            let mut metrics = self.lock();
            let result = f(&mut metrics);
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let pending = match &self.file {
                Some(file) if file.mode == SnapshotMode::Sync => Some((generation, encode(&metrics)?)),
                _ => None,
            };
            (result, pending)
        };
        if let Some((generation, json)) = pending {
            self.persist(generation, json).await?;
        }
        Ok(result)
    }

    async fn persist(&self, generation: u64, json: Vec<u8>) -> Result<(), StorageError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let path = file.path.clone();
        let written = file.written.clone();
        tokio::task::spawn_blocking(move || write_if_newer(&path, &written, generation, &json))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    fn decode_loaded(&self, key: String, value: LoadedValue) -> (String, MetricValue) {
        let value = match value {
            LoadedValue::Tagged(v) => v.into(),
            LoadedValue::Legacy(n) if self.counter_names.contains(&key) => {
                MetricValue::Counter(n as i64)
            }
            LoadedValue::Legacy(n) => MetricValue::Gauge(n),
        };
        (key, value)
    }
}

fn encode(metrics: &HashMap<String, MetricValue>) -> Result<Vec<u8>, StorageError> {
    let sorted: BTreeMap<&str, DumpValue> = metrics
        .iter()
        .map(|(k, v)| (k.as_str(), DumpValue::from(*v)))
        .collect();
    Ok(serde_json::to_vec(&sorted)?)
}

/// Atomically replace the file at `path`, unless a newer generation is
/// already on disk.
fn write_if_newer(
    path: &Path,
    written: &Mutex<u64>,
    generation: u64,
    json: &[u8],
) -> Result<(), StorageError> {
    let mut last = written.lock().unwrap_or_else(PoisonError::into_inner);
    if generation < *last {
        return Ok(());
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    *last = generation;
    Ok(())
}

fn check_keys<'a>(mut keys: impl Iterator<Item = &'a String>) -> Result<(), StorageError> {
    if keys.any(|k| k.is_empty()) {
        return Err(StorageError::InvalidKey(String::new()));
    }
    Ok(())
}

#[async_trait]
impl Storage for MemStorage {
    async fn set(&self, key: &str, value: MetricValue) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.mutate(|metrics| {
            metrics.insert(key.to_string(), value);
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<MetricValue, StorageError> {
        self.lock()
            .get(key)
            .copied()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn mset(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError> {
        check_keys(values.keys())?;
        self.mutate(|metrics| metrics.extend(values)).await
    }

    async fn accumulate(&self, key: &str, value: MetricValue) -> Result<MetricValue, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.mutate(|metrics| {
            let stored = value.accumulate(metrics.get(key).copied());
            metrics.insert(key.to_string(), stored);
            stored
        })
        .await
    }

    async fn accumulate_all(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError> {
        check_keys(values.keys())?;
        self.mutate(|metrics| {
            let resolved: Vec<(String, MetricValue)> = values
                .into_iter()
                .map(|(key, value)| {
                    let stored = value.accumulate(metrics.get(&key).copied());
                    (key, stored)
                })
                .collect();
            metrics.extend(resolved);
        })
        .await
    }

    fn snapshots(&self) -> Option<&dyn Snapshot> {
        self.file.as_ref().map(|_| self as &dyn Snapshot)
    }

    /// Flushes a final snapshot when file-backed.
    async fn close(&self) -> Result<(), StorageError> {
        if self.file.is_some() {
            self.save_dump()?;
            info!("final snapshot written");
        }
        Ok(())
    }
}

impl Snapshot for MemStorage {
    fn save_dump(&self) -> Result<(), StorageError> {
        let Some(file) = &self.file else {
            return Err(StorageError::Unsupported("snapshot"));
        };
        let (generation, json) = {
            let metrics = self.lock();
            (self.generation.load(Ordering::Relaxed), encode(&metrics)?)
        };
        write_if_newer(&file.path, &file.written, generation, &json)
    }

    fn load_dump(&self) -> Result<usize, StorageError> {
        let Some(file) = &self.file else {
            return Err(StorageError::Unsupported("snapshot"));
        };
        let raw = match std::fs::read(&file.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no snapshot at {}", file.path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let loaded: HashMap<String, LoadedValue> = serde_json::from_slice(&raw)?;
        let restored: HashMap<String, MetricValue> = loaded
            .into_iter()
            .map(|(k, v)| self.decode_loaded(k, v))
            .collect();
        let count = restored.len();
        let mut metrics = self.lock();
        *metrics = restored;
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }
}
