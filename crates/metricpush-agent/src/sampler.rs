//! Periodic metric samplers and the atomic cells they write into.
//!
//! Each sampler owns its cells and is the only writer. The collector holds
//! clones of the cell handles and only reads them, so no lock is shared
//! between samplers and the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use metricpush_core::MetricValue;

use crate::alloc;

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// Shared `f64` slot stored as bits in an `AtomicU64`.
#[derive(Debug, Clone, Default)]
pub struct GaugeCell(Arc<AtomicU64>);

impl GaugeCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Shared running counter.
#[derive(Debug, Clone, Default)]
pub struct CounterCell(Arc<AtomicI64>);

impl CounterCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Read handle to a sampled value.
#[derive(Debug, Clone)]
pub enum Cell {
    Gauge(GaugeCell),
    Counter(CounterCell),
}

impl Cell {
    pub fn read(&self) -> MetricValue {
        match self {
            Self::Gauge(c) => MetricValue::Gauge(c.get()),
            Self::Counter(c) => MetricValue::Counter(c.get()),
        }
    }
}

impl From<GaugeCell> for Cell {
    fn from(c: GaugeCell) -> Self {
        Self::Gauge(c)
    }
}

impl From<CounterCell> for Cell {
    fn from(c: CounterCell) -> Self {
        Self::Counter(c)
    }
}

// ---------------------------------------------------------------------------
// Sampler trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("process {0} is not visible to the system sampler")]
    ProcessMissing(Pid),
}

/// A self-contained metric source polled on its own timer.
pub trait Sampler: Send {
    fn name(&self) -> &'static str;

    /// Named cells this sampler writes. Called once at registration.
    fn cells(&self) -> Vec<(String, Cell)>;

    /// Take one sample, updating the cells in place.
    fn sample(&mut self) -> Result<(), SamplerError>;
}

/// Shortest timer period accepted by samplers and the dispatcher.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// `every`, raised to [`MIN_PERIOD`] with a warning when shorter.
pub(crate) fn timer_period(what: &str, every: Duration) -> Duration {
    if every < MIN_PERIOD {
        warn!("{what} interval {every:?} is below {MIN_PERIOD:?}, using {MIN_PERIOD:?}");
        MIN_PERIOD
    } else {
        every
    }
}

/// Poll `sampler` every `every` until `token` is cancelled.
pub fn spawn_sampler(
    mut sampler: Box<dyn Sampler>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let every = timer_period(sampler.name(), every);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sampler.sample() {
                        warn!("{} sampler failed: {e}", sampler.name());
                    }
                }
            }
        }
        debug!("{} sampler stopped", sampler.name());
    })
}

// ---------------------------------------------------------------------------
// Process memory
// ---------------------------------------------------------------------------

/// Allocation counters, process memory, poll count and a random liveness
/// value.
pub struct MemStatsSampler {
    system: System,
    pid: Pid,
    alloc: GaugeCell,
    total_alloc: GaugeCell,
    mallocs: GaugeCell,
    frees: GaugeCell,
    heap_objects: GaugeCell,
    sys: GaugeCell,
    virtual_sys: GaugeCell,
    random_value: GaugeCell,
    poll_count: CounterCell,
}

impl MemStatsSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from(std::process::id() as usize),
            alloc: GaugeCell::new(),
            total_alloc: GaugeCell::new(),
            mallocs: GaugeCell::new(),
            frees: GaugeCell::new(),
            heap_objects: GaugeCell::new(),
            sys: GaugeCell::new(),
            virtual_sys: GaugeCell::new(),
            random_value: GaugeCell::new(),
            poll_count: CounterCell::new(),
        }
    }
}

impl Default for MemStatsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for MemStatsSampler {
    fn name(&self) -> &'static str {
        "memstats"
    }

    fn cells(&self) -> Vec<(String, Cell)> {
        vec![
            ("Alloc".into(), self.alloc.clone().into()),
            ("TotalAlloc".into(), self.total_alloc.clone().into()),
            ("Mallocs".into(), self.mallocs.clone().into()),
            ("Frees".into(), self.frees.clone().into()),
            ("HeapObjects".into(), self.heap_objects.clone().into()),
            ("Sys".into(), self.sys.clone().into()),
            ("VirtualSys".into(), self.virtual_sys.clone().into()),
            ("RandomValue".into(), self.random_value.clone().into()),
            ("PollCount".into(), self.poll_count.clone().into()),
        ]
    }

    fn sample(&mut self) -> Result<(), SamplerError> {
        let stats = alloc::stats();
        self.alloc.set(stats.alloc as f64);
        self.total_alloc.set(stats.total_alloc as f64);
        self.mallocs.set(stats.mallocs as f64);
        self.frees.set(stats.frees as f64);
        self.heap_objects.set(stats.heap_objects() as f64);
        self.random_value.set(rand::random::<f64>());
        self.poll_count.add(1);

        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self
            .system
            .process(self.pid)
            .ok_or(SamplerError::ProcessMissing(self.pid))?;
        self.sys.set(process.memory() as f64);
        self.virtual_sys.set(process.virtual_memory() as f64);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host memory
// ---------------------------------------------------------------------------

/// Host virtual memory totals.
pub struct HostMemSampler {
    system: System,
    total: GaugeCell,
    free: GaugeCell,
}

impl HostMemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            ),
            total: GaugeCell::new(),
            free: GaugeCell::new(),
        }
    }
}

impl Default for HostMemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for HostMemSampler {
    fn name(&self) -> &'static str {
        "hostmem"
    }

    fn cells(&self) -> Vec<(String, Cell)> {
        vec![
            ("TotalMemory".into(), self.total.clone().into()),
            ("FreeMemory".into(), self.free.clone().into()),
        ]
    }

    fn sample(&mut self) -> Result<(), SamplerError> {
        self.system.refresh_memory();
        self.total.set(self.system.total_memory() as f64);
        self.free.set(self.system.free_memory() as f64);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CPU
// ---------------------------------------------------------------------------

/// Per-core utilization in percent. The core count is fixed at construction.
pub struct CpuSampler {
    system: System,
    cores: Vec<GaugeCell>,
}

impl CpuSampler {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        let cores = (0..system.cpus().len()).map(|_| GaugeCell::new()).collect();
        Self { system, cores }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for CpuSampler {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn cells(&self) -> Vec<(String, Cell)> {
        self.cores
            .iter()
            .enumerate()
            .map(|(i, cell)| (format!("CPUutilization{}", i + 1), cell.clone().into()))
            .collect()
    }

    fn sample(&mut self) -> Result<(), SamplerError> {
        self.system.refresh_cpu_usage();
        for (cell, cpu) in self.cores.iter().zip(self.system.cpus()) {
            cell.set(f64::from(cpu.cpu_usage()));
        }
        Ok(())
    }
}
