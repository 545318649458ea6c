//! Validation and write semantics shared by the HTTP and gRPC front ends.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};

use metricpush_core::{Metric, MetricError, MetricValue, Storage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid signature for metric {0}")]
    InvalidSignature(String),
    #[error("invalid metric: {0}")]
    InvalidMetric(#[from] MetricError),
    #[error("metric {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for IngestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => Self::NotFound(key),
            other => {
                error!("storage failure: {other}");
                Self::Storage(other)
            }
        }
    }
}

/// Applies incoming metrics to storage.
///
/// Gauges overwrite. Counters add their delta to the stored total, or to
/// zero when the key is new.
#[derive(Clone)]
pub struct Ingest {
    storage: Arc<dyn Storage>,
    key: Option<String>,
}

impl Ingest {
    /// An empty `key` disables signature checks and response signing.
    pub fn new(storage: Arc<dyn Storage>, key: Option<String>) -> Self {
        Self {
            storage,
            key: key.filter(|k| !k.is_empty()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn check_signature(&self, metric: &Metric) -> Result<(), IngestError> {
        match &self.key {
            Some(key) if !metric.verify(key) => {
                debug!("invalid HMAC for {}", metric.id);
                Err(IngestError::InvalidSignature(metric.id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Single update.
    pub async fn update(&self, metric: &Metric) -> Result<MetricValue, IngestError> {
        self.check_signature(metric)?;
        let incoming = metric.value()?;

        let stored = self.storage.accumulate(&metric.id, incoming).await?;
        debug!("stored {} = {stored}", metric.id);
        Ok(stored)
    }

    /// Batch update, committed atomically.
    ///
    /// Every signature and every record is checked before anything is
    /// written. Each counter resolves against its pre-batch stored value; if
    /// an id repeats inside the batch, the last occurrence wins.
    pub async fn update_batch(&self, metrics: &[Metric]) -> Result<usize, IngestError> {
        let mut incoming = Vec::with_capacity(metrics.len());
        for metric in metrics {
            self.check_signature(metric)?;
            incoming.push((metric.id.as_str(), metric.value()?));
        }

        let batch: HashMap<String, MetricValue> = incoming
            .into_iter()
            .map(|(id, value)| (id.to_string(), value))
            .collect();

        let count = batch.len();
        self.storage.accumulate_all(batch).await?;
        debug!("stored batch of {count} metrics");
        Ok(count)
    }

    /// Read back the stored value for `query.id`, signed when a key is set.
    ///
    /// A stored value of a different kind than requested counts as missing.
    pub async fn value(&self, query: &Metric) -> Result<Metric, IngestError> {
        let not_found = || IngestError::NotFound(query.id.clone());
        let kind = query.kind.ok_or_else(not_found)?;

        let stored = self.storage.get(&query.id).await?;
        if stored.kind() != kind {
            return Err(not_found());
        }

        let mut metric = Metric::from_value(query.id.clone(), stored);
        if let Some(key) = &self.key {
            metric.sign(key)?;
        }
        Ok(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metricpush_core::{MemStorage, MetricKind};

    fn ingest(key: Option<&str>) -> Ingest {
        Ingest::new(Arc::new(MemStorage::new()), key.map(str::to_string))
    }

    fn signed(mut m: Metric, key: &str) -> Metric {
        m.sign(key).unwrap();
        m
    }

    // -----------------------------------------------------------------------
    // Single update
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_counter_accumulates() {
        let ingest = ingest(None);
        ingest.update(&Metric::counter("PollCount", 1)).await.unwrap();
        let stored = ingest.update(&Metric::counter("PollCount", 1)).await.unwrap();
        assert_eq!(stored, MetricValue::Counter(2));
    }

    #[tokio::test]
    async fn test_gauge_overwrites() {
        let ingest = ingest(None);
        ingest.update(&Metric::gauge("Alloc", 1.0)).await.unwrap();
        ingest.update(&Metric::gauge("Alloc", 7.5)).await.unwrap();
        let read = ingest
            .value(&Metric::query("Alloc", MetricKind::Gauge))
            .await
            .unwrap();
        assert_eq!(read.value, Some(7.5));
    }

    #[tokio::test]
    async fn test_signature_required_when_key_set() {
        let ingest = ingest(Some("secret"));
        assert!(matches!(
            ingest.update(&Metric::counter("PollCount", 1)).await,
            Err(IngestError::InvalidSignature(_))
        ));
        ingest
            .update(&signed(Metric::counter("PollCount", 1), "secret"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signature_ignored_without_key() {
        let ingest = ingest(Some(""));
        let mut m = Metric::gauge("Alloc", 1.0);
        m.hash = Some("deadbeef".into());
        ingest.update(&m).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_metric_rejected() {
        let ingest = ingest(None);
        let bad = Metric {
            delta: Some(1),
            ..Metric::gauge("Alloc", 1.0)
        };
        assert!(matches!(
            ingest.update(&bad).await,
            Err(IngestError::InvalidMetric(_))
        ));
        assert!(ingest.storage().list().await.unwrap().is_empty());
    }

    /// Yields to the scheduler before every call so concurrent updates
    /// interleave between awaits.
    struct YieldingStorage(MemStorage);

    #[async_trait]
    impl Storage for YieldingStorage {
        async fn set(&self, key: &str, value: MetricValue) -> Result<(), StorageError> {
            tokio::task::yield_now().await;
            self.0.set(key, value).await
        }

        async fn get(&self, key: &str) -> Result<MetricValue, StorageError> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn list(&self) -> Result<Vec<String>, StorageError> {
            self.0.list().await
        }

        async fn mset(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError> {
            tokio::task::yield_now().await;
            self.0.mset(values).await
        }

        async fn accumulate(&self, key: &str, value: MetricValue) -> Result<MetricValue, StorageError> {
            tokio::task::yield_now().await;
            self.0.accumulate(key, value).await
        }

        async fn accumulate_all(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError> {
            tokio::task::yield_now().await;
            self.0.accumulate_all(values).await
        }

        async fn close(&self) -> Result<(), StorageError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_interleaved_counter_updates_keep_both_deltas() {
        let ingest = Ingest::new(Arc::new(YieldingStorage(MemStorage::new())), None);
        let one = Metric::counter("PollCount", 1);
        let (a, b) = tokio::join!(ingest.update(&one), ingest.update(&one));
        a.unwrap();
        b.unwrap();
        assert_eq!(
            ingest.storage().get("PollCount").await.unwrap(),
            MetricValue::Counter(2)
        );

        let batch = [Metric::counter("PollCount", 3), Metric::gauge("Alloc", 1.0)];
        let (a, b) = tokio::join!(ingest.update_batch(&batch), ingest.update(&one));
        a.unwrap();
        b.unwrap();
        assert_eq!(
            ingest.storage().get("PollCount").await.unwrap(),
            MetricValue::Counter(6)
        );
    }

    // -----------------------------------------------------------------------
    // Batch update
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_batch_against_empty_store() {
        let ingest = ingest(None);
        let n = ingest
            .update_batch(&[Metric::gauge("A", 1.0), Metric::counter("B", 5)])
            .await
            .unwrap();
        assert_eq!(n, 2);
        let storage = ingest.storage();
        assert_eq!(storage.get("A").await.unwrap(), MetricValue::Gauge(1.0));
        assert_eq!(storage.get("B").await.unwrap(), MetricValue::Counter(5));
    }

    #[tokio::test]
    async fn test_batch_counters_use_pre_batch_value() {
        let ingest = ingest(None);
        ingest.update(&Metric::counter("B", 10)).await.unwrap();
        ingest
            .update_batch(&[Metric::counter("B", 1), Metric::counter("B", 2)])
            .await
            .unwrap();
        assert_eq!(
            ingest.storage().get("B").await.unwrap(),
            MetricValue::Counter(12)
        );
    }

    #[tokio::test]
    async fn test_batch_with_bad_signature_writes_nothing() {
        let ingest = ingest(Some("secret"));
        let mut tampered = signed(Metric::counter("B", 5), "secret");
        tampered.delta = Some(6);
        let result = ingest
            .update_batch(&[signed(Metric::gauge("A", 1.0), "secret"), tampered])
            .await;
        assert!(matches!(result, Err(IngestError::InvalidSignature(id)) if id == "B"));
        assert!(ingest.storage().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_with_invalid_metric_writes_nothing() {
        let ingest = ingest(None);
        let result = ingest
            .update_batch(&[Metric::gauge("A", 1.0), Metric::default()])
            .await;
        assert!(matches!(result, Err(IngestError::InvalidMetric(_))));
        assert!(ingest.storage().list().await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Value read
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_value_missing_or_wrong_kind() {
        let ingest = ingest(None);
        ingest.update(&Metric::gauge("Alloc", 1.0)).await.unwrap();
        assert!(matches!(
            ingest.value(&Metric::query("Nope", MetricKind::Gauge)).await,
            Err(IngestError::NotFound(_))
        ));
        assert!(matches!(
            ingest.value(&Metric::query("Alloc", MetricKind::Counter)).await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_value_is_signed_when_key_set() {
        let ingest = ingest(Some("secret"));
        ingest
            .update(&signed(Metric::gauge("Alloc", 226640.0), "secret"))
            .await
            .unwrap();
        let read = ingest
            .value(&Metric::query("Alloc", MetricKind::Gauge))
            .await
            .unwrap();
        assert_eq!(
            read.hash.as_deref(),
            Some("3544777d62d524efaacb5eae93073cb716251bff20490e6e5c266376dc002f3e")
        );
    }
}
