//! # metricpush-agent
//!
//! Samples process, host and CPU metrics and pushes them to a collector.
//!
//! Architecture:
//! 1. Each [`sampler::Sampler`] runs on its own timer and writes atomic cells
//! 2. The [`collector::Collector`] holds read handles to every cell by name
//! 3. The [`dispatcher::Dispatcher`] snapshots, signs and frames on each
//!    report tick, then hands envelopes to a bounded worker pool
//! 4. Workers send over the configured [`transport::Transport`] (HTTP or gRPC)

pub mod alloc;
pub mod collector;
pub mod dispatcher;
pub mod sampler;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio_util::sync::CancellationToken;

use metricpush_core::{CodecError, PublicKey};

use collector::{Collector, CollectorError};
use dispatcher::{Dispatcher, Mode};
use sampler::{CpuSampler, HostMemSampler, MemStatsSampler, Sampler, spawn_sampler};
use transport::{GrpcTransport, HttpTransport, Transport, TransportError};

/// Fully resolved agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server `host:port`.
    pub address: String,
    pub grpc: bool,
    /// Send one JSON array per cycle instead of one request per metric.
    pub batch: bool,
    pub report_interval: Duration,
    pub poll_interval: Duration,
    pub key: Option<String>,
    /// RSA public key PEM path.
    pub crypto_key: Option<PathBuf>,
    /// Worker pool size.
    pub rate_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            grpc: false,
            batch: false,
            report_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            key: None,
            crypto_key: None,
            rate_limit: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error("cannot load public key: {0}")]
    Key(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0} interval must be greater than zero")]
    ZeroInterval(&'static str),
}

/// The default sampler set: process memory, host memory, per-core CPU.
pub fn default_samplers() -> Vec<Box<dyn Sampler>> {
    vec![
        Box::new(MemStatsSampler::new()),
        Box::new(HostMemSampler::new()),
        Box::new(CpuSampler::new()),
    ]
}

/// Build the transport selected by `config`.
pub async fn make_transport(config: &AgentConfig) -> Result<Arc<dyn Transport>, AgentError> {
    // a request may take at most one report interval
    let timeout = config.report_interval;
    Ok(if config.grpc {
        Arc::new(GrpcTransport::new(&config.address, timeout).await?)
    } else {
        Arc::new(HttpTransport::new(&config.address, timeout).await?)
    })
}

impl AgentConfig {
    /// Reject settings the timers cannot run with.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.report_interval.is_zero() {
            return Err(AgentError::ZeroInterval("report"));
        }
        if self.poll_interval.is_zero() {
            return Err(AgentError::ZeroInterval("poll"));
        }
        Ok(())
    }
}

/// Sample and report until `token` is cancelled, then drain in-flight sends.
pub async fn run_agent(config: AgentConfig, token: CancellationToken) -> Result<(), AgentError> {
    config.validate()?;
    let public_key = config.crypto_key.as_ref().map(PublicKey::load).transpose()?;
    let transport = make_transport(&config).await?;

    let samplers = default_samplers();
    let mut collector = Collector::new();
    for sampler in &samplers {
        collector.register_sampler(sampler.as_ref())?;
    }
    let collector = Arc::new(collector);

    let sampler_tasks: Vec<_> = samplers
        .into_iter()
        .map(|s| spawn_sampler(s, config.poll_interval, token.clone()))
        .collect();

    info!(
        "agent reporting to {} over {}{}{}",
        config.address,
        if config.grpc { "gRPC" } else { "HTTP" },
        if config.batch { ", batched" } else { "" },
        if public_key.is_some() { ", encrypted" } else { "" },
    );

    Dispatcher::new(collector, transport, config.report_interval)
        .mode(if config.batch { Mode::Batch } else { Mode::Single })
        .key(config.key.clone())
        .public_key(public_key)
        .workers(config.rate_limit)
        .run(token)
        .await;

    for task in sampler_tasks {
        let _ = task.await;
    }
    info!("agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[tokio::test]
    async fn test_zero_intervals_are_rejected() {
        let config = AgentConfig {
            report_interval: Duration::ZERO,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::ZeroInterval("report"))));

        let config = AgentConfig {
            poll_interval: Duration::ZERO,
            ..AgentConfig::default()
        };
        let result = run_agent(config, CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::ZeroInterval("poll"))));
    }
}
