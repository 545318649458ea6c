use std::path::Path;

use log::info;

use metricpush_server::run_server;

use super::{CommandResult, shutdown_token};
use crate::ServerArgs;
use crate::config::{ServerFile, ServerOverrides, resolve_server};

pub fn run(args: ServerArgs, config_path: Option<&Path>) -> CommandResult {
    let file = config_path.map(ServerFile::load).transpose()?.unwrap_or_default();
    let config = resolve_server(
        ServerOverrides {
            address: args.address,
            grpc_address: args.grpc_address,
            restore: args.restore,
            store_interval: args.store_interval,
            store_file: args.store_file,
            database_dsn: args.database_dsn,
            key: args.key,
            crypto_key: args.crypto_key,
            trusted_subnet: args.trusted_subnet,
        },
        file,
    )?;
    info!(
        "metricpush server v{} on {}{}",
        metricpush_core::VERSION,
        config.address,
        config
            .grpc_address
            .as_deref()
            .map(|a| format!(", gRPC on {a}"))
            .unwrap_or_default()
    );

    let token = shutdown_token()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_server(config, token))?;
    Ok(())
}
