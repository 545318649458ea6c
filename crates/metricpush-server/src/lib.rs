//! Metric collector server.
//!
//! Accepts signed, gzip-framed and optionally RSA-encrypted metrics over HTTP
//! and gRPC and writes them into the configured storage backend:
//!
//! | config                    | backend                          |
//! |---------------------------|----------------------------------|
//! | `database_dsn` set        | PostgreSQL                       |
//! | `store_file` set          | memory + JSON snapshot file      |
//! | neither                   | volatile memory                  |

pub mod grpc;
pub mod http;
pub mod ingest;
pub mod subnet;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use metricpush_core::storage::{Snapshot, spawn_snapshot_loop};
use metricpush_core::{
    CodecError, MemStorage, PgStorage, PrivateKey, SnapshotMode, Storage, StorageError,
};

pub use http::build_router;
pub use ingest::{Ingest, IngestError};
pub use subnet::{Subnet, SubnetError};

/// How long in-flight requests may take to finish after shutdown begins.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub grpc_address: Option<String>,
    /// `0` writes the snapshot through on every mutation.
    pub store_interval: Duration,
    pub store_file: Option<PathBuf>,
    pub restore: bool,
    pub key: Option<String>,
    pub database_dsn: Option<String>,
    /// RSA private key PEM path.
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            grpc_address: None,
            store_interval: Duration::from_secs(300),
            store_file: Some(PathBuf::from("/tmp/devops-metrics-db.json")),
            restore: false,
            key: None,
            database_dsn: None,
            crypto_key: None,
            trusted_subnet: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cannot load private key: {0}")]
    Key(#[from] CodecError),
    #[error(transparent)]
    Subnet(#[from] SubnetError),
    #[error("invalid listen address {0:?}")]
    Address(String),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server failed: {0}")]
    Http(#[source] std::io::Error),
    #[error("gRPC server failed: {0}")]
    Grpc(#[from] tonic::transport::Error),
}

/// Shared server state.
pub struct AppState {
    pub ingest: Ingest,
    pub private_key: Option<PrivateKey>,
    pub subnet: Option<Subnet>,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, key: Option<String>) -> Self {
        Self {
            ingest: Ingest::new(storage, key),
            private_key: None,
            subnet: None,
        }
    }

    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn with_subnet(mut self, subnet: Subnet) -> Self {
        self.subnet = Some(subnet);
        self
    }

    /// Build state from config: load the private key and parse the subnet.
    pub fn from_config(storage: Arc<dyn Storage>, config: &ServerConfig) -> Result<Self, ServerError> {
        let mut state = Self::new(storage, config.key.clone());
        if let Some(path) = &config.crypto_key {
            state = state.with_private_key(PrivateKey::load(path)?);
            info!("RSA decryption enabled");
        }
        if let Some(cidr) = config.trusted_subnet.as_deref().filter(|s| !s.is_empty()) {
            let subnet: Subnet = cidr.parse()?;
            info!("accepting agents from {subnet}");
            state = state.with_subnet(subnet);
        }
        Ok(state)
    }
}

/// An opened backend plus the period of its background snapshot loop, if any.
pub struct OpenedStorage {
    pub storage: Arc<dyn Storage>,
    pub snapshot_every: Option<Duration>,
}

/// Select and open the storage backend.
pub async fn open_storage(config: &ServerConfig) -> Result<OpenedStorage, ServerError> {
    if let Some(dsn) = config.database_dsn.as_deref().filter(|s| !s.is_empty()) {
        let storage = PgStorage::connect(dsn).await?;
        return Ok(OpenedStorage {
            storage: Arc::new(storage),
            snapshot_every: None,
        });
    }

    let Some(path) = config.store_file.as_ref().filter(|p| !p.as_os_str().is_empty()) else {
        info!("using volatile in-memory storage");
        return Ok(OpenedStorage {
            storage: Arc::new(MemStorage::new()),
            snapshot_every: None,
        });
    };

    let mode = SnapshotMode::from_interval(config.store_interval);
    let storage = MemStorage::with_snapshot(path, mode);
    if config.restore {
        let restored = storage.load_dump()?;
        info!("restored {restored} metrics from {}", path.display());
    }
    info!("using in-memory storage with snapshot {} ({mode:?})", path.display());

    let snapshot_every = match mode {
        SnapshotMode::Interval(every) => Some(every),
        SnapshotMode::Sync => None,
    };
    Ok(OpenedStorage {
        storage: Arc::new(storage),
        snapshot_every,
    })
}

/// Run the HTTP (and optional gRPC) server until `token` is cancelled, then
/// stop the snapshot loop and close storage.
pub async fn run_server(config: ServerConfig, token: CancellationToken) -> Result<(), ServerError> {
    let OpenedStorage {
        storage,
        snapshot_every,
    } = open_storage(&config).await?;
    let state = Arc::new(AppState::from_config(storage.clone(), &config)?);

    let snapshots = snapshot_every.map(|every| spawn_snapshot_loop(storage.clone(), every, token.clone()));

    let grpc_addr: Option<SocketAddr> = match config.grpc_address.as_deref().filter(|s| !s.is_empty()) {
        Some(addr) => Some(addr.parse().map_err(|_| ServerError::Address(addr.to_string()))?),
        None => None,
    };

    let listener = tokio::net::TcpListener::bind(&config.address)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.address.clone(),
            source,
        })?;
    info!("HTTP listening on {}", config.address);

    let http = {
        let token = token.clone();
        let app = build_router(state.clone());
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .map_err(ServerError::Http)
        }
    };
    let grpc = {
        let token = token.clone();
        let state = state.clone();
        async move {
            match grpc_addr {
                Some(addr) => grpc::serve(addr, state, token).await.map_err(ServerError::from),
                None => Ok(()),
            }
        }
    };

    let servers = async { tokio::try_join!(http, grpc).map(|_| ()) };
    tokio::pin!(servers);
    let grace = async {
        token.cancelled().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    };

    let served = tokio::select! {
        result = &mut servers => result,
        _ = grace => {
            warn!("in-flight requests did not finish within {SHUTDOWN_GRACE:?}");
            Ok(())
        }
    };
    // a failed listener must still stop the snapshot loop
    token.cancel();

    if let Some(handle) = snapshots {
        let _ = handle.await;
    }
    storage.close().await?;
    info!("storage closed, server stopped");
    served
}
