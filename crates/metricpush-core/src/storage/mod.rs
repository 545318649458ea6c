//! Backend-agnostic metric storage.
//!
//! Every backend implements [`Storage`]. Backend-specific abilities are
//! exposed as capability methods instead of downcasts: [`Storage::ping`]
//! answers only for backends with a remote connection, and
//! [`Storage::snapshots`] hands out a [`Snapshot`] only for backends that can
//! dump themselves to a file.

mod memory;
mod postgres;

pub use memory::{DEFAULT_COUNTER_NAMES, MemStorage, SnapshotMode};
pub use postgres::PgStorage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metric::MetricValue;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Missing key; callers decide whether this is a 404 or a zero default.
    #[error("metric {0} not found")]
    NotFound(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid metric key {0:?}")]
    InvalidKey(String),
    #[error("{0} is not supported by this storage backend")]
    Unsupported(&'static str),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Key-value contract shared by every backend.
///
/// All methods are atomic with respect to each other. `mset` is
/// all-or-nothing: either every entry is written or none is.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn set(&self, key: &str, value: MetricValue) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<MetricValue, StorageError>;

    /// All stored keys in lexicographic order.
    async fn list(&self) -> Result<Vec<String>, StorageError>;

    async fn mset(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError>;

    /// Apply one update in a single atomic step and return the stored value.
    ///
    /// Gauges overwrite; counters add onto the stored total (zero when new).
    /// Concurrent calls on the same key never lose a delta.
    async fn accumulate(&self, key: &str, value: MetricValue) -> Result<MetricValue, StorageError>;

    /// [`Storage::accumulate`] for a whole batch, all-or-nothing. Every
    /// counter resolves against the value stored before the batch.
    async fn accumulate_all(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError>;

    /// Connectivity check for the health endpoint.
    async fn ping(&self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("ping"))
    }

    /// Snapshot capability, if the backend has one.
    fn snapshots(&self) -> Option<&dyn Snapshot> {
        None
    }

    async fn close(&self) -> Result<(), StorageError>;
}

/// File snapshot capability of the in-memory backend.
pub trait Snapshot: Send + Sync {
    /// Serialize the whole map and atomically replace the snapshot file.
    fn save_dump(&self) -> Result<(), StorageError>;

    /// Replace the map with the snapshot file contents. A missing file loads
    /// nothing. Returns the number of restored entries.
    fn load_dump(&self) -> Result<usize, StorageError>;
}

/// Periodically dump `storage` until `token` is cancelled.
///
/// Backends without a snapshot capability make this a no-op loop. Failures
/// are logged and retried on the next tick.
pub fn spawn_snapshot_loop(
    storage: Arc<dyn Storage>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let storage = storage.clone();
                    let written = tokio::task::spawn_blocking(move || {
                        storage.snapshots().map(|snapshot| snapshot.save_dump())
                    })
                    .await;
                    match written {
                        Ok(Some(Ok(()))) => debug!("snapshot written"),
                        Ok(Some(Err(e))) => error!("snapshot failed: {e}"),
                        Ok(None) => {}
                        Err(e) => error!("snapshot task failed: {e}"),
                    }
                }
            }
        }
        debug!("snapshot loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct() {
        assert!(StorageError::NotFound("x".into()).is_not_found());
        assert!(!StorageError::InvalidKey(String::new()).is_not_found());
        assert!(
            !StorageError::Io(std::io::Error::other("disk")).is_not_found()
        );
    }

    #[tokio::test]
    async fn test_snapshot_loop_writes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let mem = Arc::new(MemStorage::with_snapshot(
            &path,
            SnapshotMode::Interval(Duration::from_millis(20)),
        ));
        mem.set("Alloc", MetricValue::Gauge(1.5)).await.unwrap();

        let token = CancellationToken::new();
        let handle = spawn_snapshot_loop(mem.clone(), Duration::from_millis(20), token.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        handle.await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("Alloc"));
    }

    #[tokio::test]
    async fn test_default_capabilities_are_absent() {
        let mem = MemStorage::new();
        assert!(matches!(mem.ping().await, Err(StorageError::Unsupported("ping"))));
        assert!(mem.snapshots().is_none());
    }
}
