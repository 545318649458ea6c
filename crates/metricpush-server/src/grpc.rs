//! gRPC front end for `metricpush.v1.Metrics`.
//!
//! The request payload is the same framed JSON the HTTP endpoints accept.
//! tonic interceptors only see metadata, so the subnet/decrypt/unzip chain
//! is applied by the service itself before decoding, in the same order as
//! the HTTP middleware.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use metricpush_core::api::metrics_server::{Metrics, MetricsServer};
use metricpush_core::api::{Empty, MetricRequest, MetricResponse};
use metricpush_core::{CONTENT_ENCODING, CONTENT_ENCRYPT, GZIP, Metric, PrivateKey, REAL_IP, RSA};

use crate::AppState;
use crate::ingest::IngestError;
use crate::subnet::Subnet;

impl From<IngestError> for Status {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InvalidSignature(_) => Status::permission_denied(e.to_string()),
            IngestError::InvalidMetric(_) => Status::invalid_argument(e.to_string()),
            IngestError::NotFound(_) => Status::not_found(e.to_string()),
            IngestError::Storage(_) => Status::internal(e.to_string()),
        }
    }
}

fn metadata_has(metadata: &MetadataMap, key: &str, marker: &str) -> bool {
    metadata
        .get_all(key)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.trim().eq_ignore_ascii_case(marker))
}

/// One step of the unary request chain. Each step may inspect the call
/// metadata and rewrite or reject the payload.
pub trait UnaryInterceptor: Send + Sync {
    fn intercept(&self, metadata: &MetadataMap, payload: Vec<u8>) -> Result<Vec<u8>, Status>;
}

struct TrustedSubnet(Subnet);

impl UnaryInterceptor for TrustedSubnet {
    fn intercept(&self, metadata: &MetadataMap, payload: Vec<u8>) -> Result<Vec<u8>, Status> {
        let ip = metadata
            .get(REAL_IP)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        match ip {
            Some(ip) if self.0.contains(ip) => Ok(payload),
            ip => {
                debug!("grpc client {ip:?} is outside trusted subnet {}", self.0);
                Err(Status::permission_denied("client is outside the trusted subnet"))
            }
        }
    }
}

struct DecryptPayload(Option<PrivateKey>);

impl UnaryInterceptor for DecryptPayload {
    fn intercept(&self, metadata: &MetadataMap, payload: Vec<u8>) -> Result<Vec<u8>, Status> {
        if !metadata_has(metadata, CONTENT_ENCRYPT, RSA) {
            return Ok(payload);
        }
        let key = self
            .0
            .as_ref()
            .ok_or_else(|| Status::permission_denied("encrypted payload but no private key configured"))?;
        key.decrypt(&payload).map_err(|e| {
            debug!("grpc payload decryption failed: {e}");
            Status::permission_denied("payload decryption failed")
        })
    }
}

struct UnzipPayload;

impl UnaryInterceptor for UnzipPayload {
    fn intercept(&self, metadata: &MetadataMap, payload: Vec<u8>) -> Result<Vec<u8>, Status> {
        if !metadata_has(metadata, CONTENT_ENCODING, GZIP) {
            return Ok(payload);
        }
        metricpush_core::decompress(&payload)
            .map_err(|e| Status::invalid_argument(format!("payload decompression failed: {e}")))
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Status> {
    serde_json::from_slice(payload)
        .map_err(|e| Status::invalid_argument(format!("malformed metric payload: {e}")))
}

pub struct MetricsService {
    state: Arc<AppState>,
    chain: Vec<Box<dyn UnaryInterceptor>>,
}

impl MetricsService {
    pub fn new(state: Arc<AppState>) -> Self {
        let mut chain: Vec<Box<dyn UnaryInterceptor>> = Vec::with_capacity(3);
        if let Some(subnet) = state.subnet {
            chain.push(Box::new(TrustedSubnet(subnet)));
        }
        chain.push(Box::new(DecryptPayload(state.private_key.clone())));
        chain.push(Box::new(UnzipPayload));
        Self { state, chain }
    }

    /// Run the chain over the request payload.
    fn open(&self, request: Request<MetricRequest>) -> Result<Vec<u8>, Status> {
        let (metadata, _, message) = request.into_parts();
        self.chain
            .iter()
            .try_fold(message.metric, |payload, step| step.intercept(&metadata, payload))
    }

    pub fn into_server(self) -> MetricsServer<Self> {
        MetricsServer::new(self)
    }
}

#[tonic::async_trait]
impl Metrics for MetricsService {
    async fn update_metric(
        &self,
        request: Request<MetricRequest>,
    ) -> Result<Response<Empty>, Status> {
        let metric: Metric = decode(&self.open(request)?)?;
        self.state.ingest.update(&metric).await?;
        Ok(Response::new(Empty {}))
    }

    async fn update_metrics(
        &self,
        request: Request<MetricRequest>,
    ) -> Result<Response<Empty>, Status> {
        let metrics: Vec<Metric> = decode(&self.open(request)?)?;
        self.state.ingest.update_batch(&metrics).await?;
        Ok(Response::new(Empty {}))
    }

    async fn get_metric(
        &self,
        request: Request<MetricRequest>,
    ) -> Result<Response<MetricResponse>, Status> {
        let query: Metric = decode(&self.open(request)?)?;
        let metric = self.state.ingest.value(&query).await?;
        let body = serde_json::to_vec(&metric).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(MetricResponse { metric: body }))
    }
}

/// Serve the gRPC endpoint until `token` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    token: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    info!("gRPC listening on {addr}");
    Server::builder()
        .add_service(MetricsService::new(state).into_server())
        .serve_with_shutdown(addr, token.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricpush_core::{MemStorage, MetricKind, MetricValue, Storage, compress};
    use tonic::Code;
    use tonic::metadata::MetadataValue;

    const PRIVATE_PEM: &str = include_str!("../../metricpush-core/testdata/private.pem");

    fn service(state: AppState) -> MetricsService {
        MetricsService::new(Arc::new(state))
    }

    fn request(payload: &[u8]) -> Request<MetricRequest> {
        Request::new(MetricRequest {
            metric: payload.to_vec(),
        })
    }

    fn gzip_request(json: &[u8]) -> Request<MetricRequest> {
        let mut req = request(&compress(json).unwrap());
        req.metadata_mut()
            .insert(CONTENT_ENCODING, MetadataValue::from_static(GZIP));
        req
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let svc = service(AppState::new(Arc::new(MemStorage::new()), None));
        svc.update_metric(gzip_request(br#"{"id":"PollCount","type":"counter","delta":1}"#))
            .await
            .unwrap();
        svc.update_metric(request(br#"{"id":"PollCount","type":"counter","delta":1}"#))
            .await
            .unwrap();

        let query = serde_json::to_vec(&Metric::query("PollCount", MetricKind::Counter)).unwrap();
        let response = svc.get_metric(request(&query)).await.unwrap().into_inner();
        let read: Metric = serde_json::from_slice(&response.metric).unwrap();
        assert_eq!(read, Metric::counter("PollCount", 2));
    }

    #[tokio::test]
    async fn test_batch_over_encrypted_gzip() {
        let private = PrivateKey::from_pem(PRIVATE_PEM).unwrap();
        let public = private.public_key();
        let svc = service(AppState::new(Arc::new(MemStorage::new()), None).with_private_key(private));

        let body = br#"[{"id":"A","type":"gauge","value":1},{"id":"B","type":"counter","delta":5}]"#;
        let mut req = request(&public.encrypt(&compress(body).unwrap()).unwrap());
        req.metadata_mut()
            .insert(CONTENT_ENCODING, MetadataValue::from_static(GZIP));
        req.metadata_mut()
            .insert(CONTENT_ENCRYPT, MetadataValue::from_static(RSA));
        svc.update_metrics(req).await.unwrap();

        let storage = svc.state.ingest.storage();
        assert_eq!(storage.get("A").await.unwrap(), MetricValue::Gauge(1.0));
        assert_eq!(storage.get("B").await.unwrap(), MetricValue::Counter(5));
    }

    #[tokio::test]
    async fn test_status_codes() {
        let svc = service(AppState::new(
            Arc::new(MemStorage::new()),
            Some("secret".into()),
        ));

        let unsigned = svc
            .update_metric(request(br#"{"id":"PollCount","type":"counter","delta":1}"#))
            .await
            .unwrap_err();
        assert_eq!(unsigned.code(), Code::PermissionDenied);

        let malformed = svc.update_metric(request(b"{nope")).await.unwrap_err();
        assert_eq!(malformed.code(), Code::InvalidArgument);

        let query = serde_json::to_vec(&Metric::query("Missing", MetricKind::Gauge)).unwrap();
        let missing = svc.get_metric(request(&query)).await.unwrap_err();
        assert_eq!(missing.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_trusted_subnet_metadata() {
        let subnet: Subnet = "192.168.0.0/24".parse().unwrap();
        let svc = service(AppState::new(Arc::new(MemStorage::new()), None).with_subnet(subnet));
        let body = br#"{"id":"Alloc","type":"gauge","value":3}"#;

        let mut inside = request(body);
        inside
            .metadata_mut()
            .insert(REAL_IP, MetadataValue::from_static("192.168.0.1"));
        svc.update_metric(inside).await.unwrap();

        let mut outside = request(body);
        outside
            .metadata_mut()
            .insert(REAL_IP, MetadataValue::from_static("192.168.1.1"));
        let err = svc.update_metric(outside).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);

        let err = svc.update_metric(request(body)).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[derive(Debug, Clone, Copy)]
    enum Rpc {
        UpdateMetric,
        UpdateMetrics,
        GetMetric,
    }

    async fn call(svc: &MetricsService, rpc: Rpc, req: Request<MetricRequest>) -> Result<(), Status> {
        match rpc {
            Rpc::UpdateMetric => svc.update_metric(req).await.map(drop),
            Rpc::UpdateMetrics => svc.update_metrics(req).await.map(drop),
            Rpc::GetMetric => svc.get_metric(req).await.map(drop),
        }
    }

    #[tokio::test]
    async fn test_trusted_subnet_guards_every_rpc() {
        let subnet: Subnet = "192.168.0.0/24".parse().unwrap();
        let storage = Arc::new(MemStorage::new());
        storage.set("PollCount", MetricValue::Counter(5)).await.unwrap();
        let svc = service(AppState::new(storage.clone(), None).with_subnet(subnet));

        let update = br#"{"id":"PollCount","type":"counter","delta":1}"#.to_vec();
        let batch = br#"[{"id":"PollCount","type":"counter","delta":1},{"id":"Alloc","type":"gauge","value":1}]"#.to_vec();
        let query = serde_json::to_vec(&Metric::query("PollCount", MetricKind::Counter)).unwrap();
        let cases = [
            (Rpc::UpdateMetric, update),
            (Rpc::UpdateMetrics, batch),
            (Rpc::GetMetric, query),
        ];
        for (rpc, body) in cases {
            for ip in [Some("10.0.0.1"), Some("192.168.1.1"), Some("garbage"), None] {
                let mut req = gzip_request(&body);
                if let Some(ip) = ip {
                    req.metadata_mut().insert(REAL_IP, MetadataValue::from_static(ip));
                }
                let err = call(&svc, rpc, req).await.unwrap_err();
                assert_eq!(err.code(), Code::PermissionDenied, "{rpc:?} from {ip:?}");
            }
        }

        assert_eq!(storage.list().await.unwrap(), vec!["PollCount"]);
        assert_eq!(storage.get("PollCount").await.unwrap(), MetricValue::Counter(5));

        // the same requests pass from inside the subnet
        let mut req = gzip_request(br#"{"id":"PollCount","type":"counter","delta":1}"#);
        req.metadata_mut()
            .insert(REAL_IP, MetadataValue::from_static("192.168.0.7"));
        call(&svc, Rpc::UpdateMetric, req).await.unwrap();
        assert_eq!(storage.get("PollCount").await.unwrap(), MetricValue::Counter(6));
    }
}
