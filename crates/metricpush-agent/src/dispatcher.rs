//! Report cycle: snapshot, sign, frame, enqueue, and fan out to a worker
//! pool.
//!
//! ```text
//! tick ─▶ snapshot ─▶ sign ─▶ seal ─▶ bounded queue ─▶ N workers ─▶ transport
//! ```
//!
//! The queue holds at most one envelope per worker, so a slow server
//! throttles the cycle. Failed sends are logged and dropped; the next tick
//! sends current values again.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use metricpush_core::PublicKey;

use crate::collector::Collector;
use crate::sampler::timer_period;
use crate::transport::{Envelope, Transport, TransportError};

/// Time allowed for queued and in-flight sends after cancellation.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Per-metric requests or one array per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Batch,
}

pub struct Dispatcher {
    collector: Arc<Collector>,
    transport: Arc<dyn Transport>,
    mode: Mode,
    key: Option<String>,
    public_key: Option<PublicKey>,
    workers: usize,
    report_interval: Duration,
}

impl Dispatcher {
    /// A `report_interval` below [`crate::sampler::MIN_PERIOD`] is raised to it.
    pub fn new(collector: Arc<Collector>, transport: Arc<dyn Transport>, report_interval: Duration) -> Self {
        Self {
            collector,
            transport,
            mode: Mode::Single,
            key: None,
            public_key: None,
            workers: 1,
            report_interval: timer_period("report", report_interval),
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// HMAC key; an empty key disables signing.
    pub fn key(mut self, key: Option<String>) -> Self {
        self.key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn public_key(mut self, key: Option<PublicKey>) -> Self {
        self.public_key = key;
        self
    }

    /// Worker pool size, at least one.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    /// Snapshot the collector and frame the cycle's envelopes.
    pub fn build(&self) -> Vec<Envelope> {
        let mut metrics = self.collector.snapshot();
        if let Some(key) = &self.key {
            metrics.retain_mut(|m| match m.sign(key) {
                Ok(()) => true,
                Err(e) => {
                    warn!("cannot sign {}: {e}", m.id);
                    false
                }
            });
        }

        let sealed: Result<Vec<Envelope>, TransportError> = match self.mode {
            Mode::Single => metrics.iter().map(|m| self.seal(m, false)).collect(),
            Mode::Batch if metrics.is_empty() => Ok(Vec::new()),
            Mode::Batch => self.seal(&metrics, true).map(|e| vec![e]),
        };
        sealed.unwrap_or_else(|e| {
            error!("cannot frame report: {e}");
            Vec::new()
        })
    }

    fn seal<T: serde::Serialize + ?Sized>(&self, value: &T, batch: bool) -> Result<Envelope, TransportError> {
        let json = serde_json::to_vec(value)?;
        Envelope::seal(&json, batch, self.public_key.as_ref())
    }

    /// Run report cycles until `token` is cancelled, then drain the queue.
    pub async fn run(self, token: CancellationToken) {
        let (tx, rx) = mpsc::channel::<Envelope>(self.workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut pool = JoinSet::new();
        for id in 0..self.workers {
            pool.spawn(worker(id, rx.clone(), self.transport.clone()));
        }
        info!(
            "reporting {} metrics every {:?} with {} workers",
            self.collector.len(),
            self.report_interval,
            self.workers
        );

        let mut ticker = tokio::time::interval(self.report_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; report only after samples exist
        ticker.tick().await;

        'cycles: loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let envelopes = self.build();
            debug!("report cycle: {} envelopes", envelopes.len());
            for envelope in envelopes {
                tokio::select! {
                    _ = token.cancelled() => break 'cycles,
                    sent = tx.send(envelope) => if sent.is_err() { break 'cycles },
                }
            }
        }

        drop(tx);
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while pool.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("workers did not drain within {DRAIN_GRACE:?}, aborting");
            pool.abort_all();
        }
        info!("dispatcher stopped");
    }
}

async fn worker(id: usize, queue: Arc<Mutex<mpsc::Receiver<Envelope>>>, transport: Arc<dyn Transport>) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(envelope) = next else { break };
        match transport.send(envelope).await {
            Ok(()) => debug!("worker {id}: sent"),
            Err(e) => error!("worker {id}: send failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metricpush_core::{Metric, PrivateKey, decompress};

    use crate::sampler::{CounterCell, GaugeCell};

    const PRIVATE_PEM: &str = include_str!("../../metricpush-core/testdata/private.pem");

    // -----------------------------------------------------------------------
    // Mock transport
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        sent: std::sync::Mutex<Vec<Envelope>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(envelope);
            if self.fail {
                Err(TransportError::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR))
            } else {
                Ok(())
            }
        }
    }

    fn collector() -> Arc<Collector> {
        let gauge = GaugeCell::new();
        gauge.set(226640.0);
        let counter = CounterCell::new();
        counter.add(1);
        let mut c = Collector::new();
        c.register("Alloc", gauge.into()).unwrap();
        c.register("PollCount", counter.into()).unwrap();
        Arc::new(c)
    }

    fn open(envelope: &Envelope) -> Vec<u8> {
        decompress(&envelope.body).unwrap()
    }

    // -----------------------------------------------------------------------
    // Cycle building
    // -----------------------------------------------------------------------

    #[test]
    fn test_single_mode_one_envelope_per_metric() {
        let d = Dispatcher::new(collector(), Arc::new(Recorder::default()), Duration::from_secs(1));
        let envelopes = d.build();
        assert_eq!(envelopes.len(), 2);
        let first: Metric = serde_json::from_slice(&open(&envelopes[0])).unwrap();
        assert_eq!(first, Metric::gauge("Alloc", 226640.0));
        assert!(envelopes.iter().all(|e| !e.batch && !e.encrypted));
    }

    #[test]
    fn test_batch_mode_signs_every_metric() {
        let d = Dispatcher::new(collector(), Arc::new(Recorder::default()), Duration::from_secs(1))
            .mode(Mode::Batch)
            .key(Some("secret".into()));
        let envelopes = d.build();
        assert_eq!(envelopes.len(), 1);
        assert!(envelopes[0].batch);

        let batch: Vec<Metric> = serde_json::from_slice(&open(&envelopes[0])).unwrap();
        assert_eq!(
            batch[0].hash.as_deref(),
            Some("3544777d62d524efaacb5eae93073cb716251bff20490e6e5c266376dc002f3e")
        );
        assert_eq!(
            batch[1].hash.as_deref(),
            Some("ce97c6062da4477a5fad4cfdd24f0f24e474d309b1f054928dd138683d1cab12")
        );
    }

    #[test]
    fn test_empty_key_sends_unsigned() {
        let d = Dispatcher::new(collector(), Arc::new(Recorder::default()), Duration::from_secs(1))
            .key(Some(String::new()));
        let first: Metric = serde_json::from_slice(&open(&d.build()[0])).unwrap();
        assert!(first.hash.is_none());
    }

    #[test]
    fn test_encrypted_envelopes() {
        let private = PrivateKey::from_pem(PRIVATE_PEM).unwrap();
        let d = Dispatcher::new(collector(), Arc::new(Recorder::default()), Duration::from_secs(1))
            .mode(Mode::Batch)
            .public_key(Some(private.public_key()));
        let envelope = &d.build()[0];
        assert!(envelope.encrypted);
        let json = decompress(&private.decrypt(&envelope.body).unwrap()).unwrap();
        let batch: Vec<Metric> = serde_json::from_slice(&json).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_batch_of_nothing_sends_nothing() {
        let d = Dispatcher::new(
            Arc::new(Collector::new()),
            Arc::new(Recorder::default()),
            Duration::from_secs(1),
        )
        .mode(Mode::Batch);
        assert!(d.build().is_empty());
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_sends_each_cycle_and_stops() {
        let recorder = Arc::new(Recorder::default());
        let d = Dispatcher::new(collector(), recorder.clone(), Duration::from_millis(20)).workers(3);
        let token = CancellationToken::new();
        let handle = tokio::spawn(d.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(110)).await;
        token.cancel();
        handle.await.unwrap();

        let sent = recorder.sent.lock().unwrap().len();
        assert!(sent >= 2, "expected at least one full cycle, got {sent}");
    }

    #[tokio::test]
    async fn test_failed_sends_do_not_stop_cycles() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let d = Dispatcher::new(collector(), recorder.clone(), Duration::from_millis(20));
        let token = CancellationToken::new();
        let handle = tokio::spawn(d.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(110)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(recorder.sent.lock().unwrap().len() >= 4);
    }

    #[tokio::test]
    async fn test_zero_report_interval_does_not_panic() {
        let recorder = Arc::new(Recorder::default());
        let d = Dispatcher::new(collector(), recorder.clone(), Duration::ZERO);
        let token = CancellationToken::new();
        let handle = tokio::spawn(d.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(!recorder.sent.lock().unwrap().is_empty());
    }
}
