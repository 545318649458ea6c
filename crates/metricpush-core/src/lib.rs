//! # metricpush-core
//!
//! Shared building blocks for the metricpush agent and collector server.
//!
//! ## Pipeline
//!
//! ```text
//! agent:  sign → serialize → gzip → [RSA-OAEP] ──▶ wire
//! server: wire ──▶ [RSA-OAEP] → gunzip → deserialize → verify → storage
//! ```
//!
//! - [`metric`]: the wire record ([`Metric`]), the typed value ([`MetricValue`])
//!   and HMAC-SHA256 signing over a canonical `id:kind:value` message.
//! - [`codec`]: gzip framing and the optional RSA-OAEP (SHA-512) envelope.
//! - [`storage`]: the backend-agnostic [`Storage`] trait with an in-memory
//!   backend (optionally snapshotted to a JSON file) and a PostgreSQL backend.
//! - [`api`]: gRPC messages and the generated `metricpush.v1.Metrics` service.
//!
//! ## Quick Start
//!
//! ```
//! use metricpush_core::{Metric, MetricValue};
//!
//! let mut m = Metric::counter("PollCount", 1);
//! m.sign("secret").unwrap();
//! assert!(m.verify("secret"));
//! assert_eq!(m.value().unwrap(), MetricValue::Counter(1));
//! ```

pub mod api;
pub mod codec;
pub mod metric;
pub mod storage;

pub use codec::{CodecError, PrivateKey, PublicKey, compress, decompress};
pub use metric::{Metric, MetricError, MetricKind, MetricValue};
pub use storage::{MemStorage, PgStorage, Snapshot, SnapshotMode, Storage, StorageError};

/// HTTP header / gRPC metadata key announcing gzip framing.
pub const CONTENT_ENCODING: &str = "content-encoding";
/// HTTP header / gRPC metadata key announcing the RSA envelope.
pub const CONTENT_ENCRYPT: &str = "content-encrypt";
/// HTTP header / gRPC metadata key carrying the agent address.
pub const REAL_IP: &str = "x-real-ip";
/// Marker value for [`CONTENT_ENCODING`].
pub const GZIP: &str = "gzip";
/// Marker value for [`CONTENT_ENCRYPT`].
pub const RSA: &str = "rsa";

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
