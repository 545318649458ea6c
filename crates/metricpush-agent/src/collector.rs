//! Flat, ordered registry of metric bindings read by the dispatcher.

use std::collections::HashSet;

use log::debug;

use metricpush_core::Metric;

use crate::sampler::{Cell, Sampler};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectorError {
    #[error("metric {0} is already registered")]
    Duplicate(String),
}

/// Name-to-cell bindings established once at startup.
///
/// The collector never writes to a cell; it only snapshots current values
/// into wire records.
#[derive(Debug, Default)]
pub struct Collector {
    bindings: Vec<(String, Cell)>,
    names: HashSet<String>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, cell: Cell) -> Result<(), CollectorError> {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(CollectorError::Duplicate(name));
        }
        debug!("registered metric {name}");
        self.bindings.push((name, cell));
        Ok(())
    }

    /// Register every cell of `sampler`. Stops at the first duplicate.
    pub fn register_sampler(&mut self, sampler: &dyn Sampler) -> Result<(), CollectorError> {
        for (name, cell) in sampler.cells() {
            self.register(name, cell)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Current values as unsigned wire records, in registration order.
    pub fn snapshot(&self) -> Vec<Metric> {
        self.bindings
            .iter()
            .map(|(name, cell)| Metric::from_value(name.clone(), cell.read()))
            .collect()
    }
}
