//! Outbound transports. Both carry the same framed payload; only the way
//! framing and the agent address are announced differs (HTTP headers vs.
//! gRPC metadata).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tokio::net::UdpSocket;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};

use metricpush_core::api::MetricRequest;
use metricpush_core::api::metrics_client::MetricsClient;
use metricpush_core::{CodecError, CONTENT_ENCRYPT, GZIP, PublicKey, REAL_IP, RSA, compress};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid gRPC endpoint: {0}")]
    Endpoint(#[from] tonic::transport::Error),
    #[error("gRPC call failed: {0}")]
    Grpc(#[from] tonic::Status),
}

/// A framed request body: JSON, gzipped, optionally RSA-sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub encrypted: bool,
    /// Body is a JSON array for the batch endpoint.
    pub batch: bool,
}

impl Envelope {
    /// Frame `json`: gzip, then seal with `key` if one is given.
    pub fn seal(json: &[u8], batch: bool, key: Option<&PublicKey>) -> Result<Self, TransportError> {
        let packed = compress(json)?;
        Ok(match key {
            Some(key) => Self {
                body: key.encrypt(&packed)?,
                encrypted: true,
                batch,
            },
            None => Self {
                body: packed,
                encrypted: false,
                batch,
            },
        })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Address of the local interface that routes towards `server`, found by
/// connecting a UDP socket (no packet is sent).
pub async fn outbound_ip(server: &str) -> Option<IpAddr> {
    let target: SocketAddr = tokio::net::lookup_host(server).await.ok()?.next()?;
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Strip a scheme so `host:port` is usable for socket resolution.
fn host_port(address: &str) -> &str {
    address
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
}

fn base_url(address: &str) -> String {
    format!("http://{}", host_port(address))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// POSTs to `/update/` or `/updates/`.
pub struct HttpTransport {
    client: Client,
    base: String,
    real_ip: Option<IpAddr>,
}

impl HttpTransport {
    pub async fn new(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base_url(address),
            real_ip: outbound_ip(host_port(address)).await,
        })
    }

    pub fn url(&self, batch: bool) -> String {
        if batch {
            format!("{}/updates/", self.base)
        } else {
            format!("{}/update/", self.base)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(self.url(envelope.batch))
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, GZIP);
        if envelope.encrypted {
            request = request.header(CONTENT_ENCRYPT, RSA);
        }
        if let Some(ip) = self.real_ip {
            request = request.header(REAL_IP, ip.to_string());
        }

        let response = request.body(envelope.body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// gRPC
// ---------------------------------------------------------------------------

/// Calls `UpdateMetric` or `UpdateMetrics` over one lazily connected channel.
pub struct GrpcTransport {
    client: MetricsClient<Channel>,
    real_ip: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl GrpcTransport {
    pub async fn new(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let channel = Endpoint::from_shared(base_url(address))?
            .timeout(timeout)
            .connect_lazy();
        let real_ip = outbound_ip(host_port(address))
            .await
            .and_then(|ip| ip.to_string().parse().ok());
        Ok(Self {
            client: MetricsClient::new(channel),
            real_ip,
        })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut request = tonic::Request::new(MetricRequest {
            metric: envelope.body,
        });
        let metadata = request.metadata_mut();
        metadata.insert(metricpush_core::CONTENT_ENCODING, MetadataValue::from_static(GZIP));
        if envelope.encrypted {
            metadata.insert(CONTENT_ENCRYPT, MetadataValue::from_static(RSA));
        }
        if let Some(ip) = &self.real_ip {
            metadata.insert(REAL_IP, ip.clone());
        }

        let mut client = self.client.clone();
        if envelope.batch {
            client.update_metrics(request).await?;
        } else {
            client.update_metric(request).await?;
        }
        Ok(())
    }
}
