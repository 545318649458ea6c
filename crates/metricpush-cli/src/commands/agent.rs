use std::path::Path;

use log::info;

use metricpush_agent::run_agent;

use super::{CommandResult, shutdown_token};
use crate::AgentArgs;
use crate::config::{AgentFile, AgentOverrides, resolve_agent};

pub fn run(args: AgentArgs, config_path: Option<&Path>) -> CommandResult {
    let file = config_path.map(AgentFile::load).transpose()?.unwrap_or_default();
    let config = resolve_agent(
        AgentOverrides {
            address: args.address,
            grpc: args.grpc,
            batch: args.batch,
            report_interval: args.report_interval,
            poll_interval: args.poll_interval,
            key: args.key,
            crypto_key: args.crypto_key,
            rate_limit: args.rate_limit,
        },
        file,
    )?;
    info!(
        "metricpush agent v{}: poll every {:?}, report every {:?}",
        metricpush_core::VERSION,
        config.poll_interval,
        config.report_interval
    );

    let token = shutdown_token()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_agent(config, token))?;
    Ok(())
}
