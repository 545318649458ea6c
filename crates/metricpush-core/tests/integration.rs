//! End-to-end checks of the wire pipeline through the public API.

use std::collections::HashMap;

use metricpush_core::storage::Snapshot;
use metricpush_core::{
    Metric, MetricValue, MemStorage, PrivateKey, PublicKey, SnapshotMode, Storage, compress,
    decompress,
};

const PRIVATE_PEM: &str = include_str!("../testdata/private.pem");
const PUBLIC_PEM: &str = include_str!("../testdata/public.pem");

#[test]
fn signed_batch_survives_full_wire_pipeline() {
    let public = PublicKey::from_pem(PUBLIC_PEM).unwrap();
    let private = PrivateKey::from_pem(PRIVATE_PEM).unwrap();

    let mut batch = vec![
        Metric::gauge("Alloc", 226640.0),
        Metric::counter("PollCount", 1),
    ];
    for m in &mut batch {
        m.sign("secret").unwrap();
    }

    // agent side
    let json = serde_json::to_vec(&batch).unwrap();
    let wire = public.encrypt(&compress(&json).unwrap()).unwrap();

    // server side
    let opened = decompress(&private.decrypt(&wire).unwrap()).unwrap();
    let received: Vec<Metric> = serde_json::from_slice(&opened).unwrap();

    assert_eq!(received, batch);
    assert!(received.iter().all(|m| m.verify("secret")));
    assert_eq!(
        received[0].hash.as_deref(),
        Some("3544777d62d524efaacb5eae93073cb716251bff20490e6e5c266376dc002f3e")
    );
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devops-metrics-db.json");

    let first = MemStorage::with_snapshot(&path, SnapshotMode::Sync);
    let mut batch = HashMap::new();
    batch.insert("A".to_string(), MetricValue::Gauge(1.0));
    batch.insert("B".to_string(), MetricValue::Counter(5));
    first.mset(batch).await.unwrap();
    first.close().await.unwrap();

    let second = MemStorage::with_snapshot(&path, SnapshotMode::Sync);
    assert_eq!(second.load_dump().unwrap(), 2);
    assert_eq!(second.list().await.unwrap(), vec!["A", "B"]);
    assert_eq!(second.get("B").await.unwrap(), MetricValue::Counter(5));
}
