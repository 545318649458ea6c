//! CLI for metricpush: run the sampling agent or the collector server.

mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};

use metricpush_agent::alloc::CountingAllocator;

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator;

#[derive(Parser)]
#[command(name = "metricpush")]
#[command(about = "metricpush: push-based metrics agent and collector")]
#[command(version = metricpush_core::VERSION)]
struct Cli {
    /// Log filter, e.g. "info" or "metricpush_server=debug,warn"
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    /// JSON config file; flags and environment variables take precedence
    #[arg(short = 'c', long, env = "CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample runtime metrics and push them to a server
    Agent(AgentArgs),

    /// Accept metrics over HTTP (and optionally gRPC) and store them
    Server(ServerArgs),
}

#[derive(Args)]
pub struct AgentArgs {
    /// Server address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Send over gRPC instead of HTTP
    #[arg(long, env = "GRPC", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub grpc: Option<bool>,

    /// Send one JSON array per cycle to the batch endpoint
    #[arg(long, env = "BATCH", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub batch: Option<bool>,

    /// Seconds between report cycles
    #[arg(short = 'r', long, env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,

    /// Seconds between samples
    #[arg(short = 'p', long, env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// HMAC-SHA256 signing key
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// RSA public key (PEM) used to encrypt payloads
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Concurrent outbound requests
    #[arg(short = 'l', long, env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,
}

#[derive(Args)]
pub struct ServerArgs {
    /// HTTP listen address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// gRPC listen address; gRPC is disabled when unset
    #[arg(long, env = "GRPC_ADDRESS")]
    pub grpc_address: Option<String>,

    /// Seconds between snapshots; 0 writes through on every update
    #[arg(short = 'i', long, env = "STORE_INTERVAL")]
    pub store_interval: Option<u64>,

    /// Snapshot file; empty disables snapshots
    #[arg(short = 'f', long, env = "STORE_FILE")]
    pub store_file: Option<String>,

    /// Load the snapshot file on startup
    #[arg(short = 'r', long, env = "RESTORE", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub restore: Option<bool>,

    /// HMAC-SHA256 key; signatures are checked and responses signed when set
    #[arg(short = 'k', long, env = "KEY")]
    pub key: Option<String>,

    /// PostgreSQL DSN; selects the relational backend
    #[arg(short = 'd', long, env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,

    /// RSA private key (PEM) used to decrypt payloads
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Only accept agents from this CIDR
    #[arg(short = 't', long, env = "TRUSTED_SUBNET")]
    pub trusted_subnet: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level, cli.log_file.as_deref()) {
        eprintln!("Error: cannot open log file: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Agent(args) => commands::agent::run(args, cli.config.as_deref()),
        Commands::Server(args) => commands::server::run(args, cli.config.as_deref()),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
