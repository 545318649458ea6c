//! HTTP front end: router, request middleware and handlers.
//!
//! Middleware runs outermost first: trusted subnet, RSA decryption, gzip
//! decompression, then optional gzip compression of the response. `/ping`
//! sits outside the chain.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use log::{debug, error};
use tower::ServiceBuilder;

use metricpush_core::codec::MAX_DECOMPRESSED;
use metricpush_core::{
    CONTENT_ENCRYPT, GZIP, Metric, MetricValue, RSA, Storage, compress, decompress,
};

use crate::AppState;
use crate::ingest::IngestError;
use crate::subnet::real_ip;

impl IngestError {
    /// Single updates answer a bad signature with 400, batches with 403.
    pub fn http_status(&self, batch: bool) -> StatusCode {
        match self {
            Self::InvalidSignature(_) if batch => StatusCode::FORBIDDEN,
            Self::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            Self::InvalidMetric(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn reject(e: IngestError, batch: bool) -> Response {
    debug!("request rejected: {e}");
    e.http_status(batch).into_response()
}

/// True when a comma-separated header lists `marker`. An entry weighted
/// `;q=0` is a refusal and does not count.
fn has_marker(headers: &HeaderMap, name: &str, marker: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|entry| {
            let mut parts = entry.split(';');
            let token = parts.next().unwrap_or_default().trim();
            token.eq_ignore_ascii_case(marker) && parts.all(|param| !is_zero_weight(param))
        })
}

fn is_zero_weight(param: &str) -> bool {
    match param.trim().split_once('=') {
        Some((key, q)) if key.trim().eq_ignore_ascii_case("q") => {
            q.trim().parse::<f32>().is_ok_and(|q| q <= 0.0)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn trusted_subnet(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(subnet) = &state.subnet {
        match real_ip(request.headers()) {
            Some(ip) if subnet.contains(ip) => {}
            ip => {
                debug!("client {ip:?} is outside trusted subnet {subnet}");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }
    next.run(request).await
}

async fn decrypt_body(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if !has_marker(request.headers(), CONTENT_ENCRYPT, RSA) {
        return next.run(request).await;
    }
    let Some(key) = &state.private_key else {
        debug!("encrypted request but no private key configured");
        return StatusCode::FORBIDDEN.into_response();
    };

    let (mut parts, body) = request.into_parts();
    let sealed = match to_bytes(body, MAX_DECOMPRESSED).await {
        Ok(b) => b,
        Err(e) => {
            debug!("cannot read encrypted body: {e}");
            return StatusCode::FORBIDDEN.into_response();
        }
    };
    match key.decrypt(&sealed) {
        Ok(plain) => {
            parts.headers.remove(CONTENT_ENCRYPT);
            parts.headers.remove(header::CONTENT_LENGTH);
            next.run(Request::from_parts(parts, Body::from(plain))).await
        }
        Err(e) => {
            debug!("request decryption failed: {e}");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn decompress_body(request: Request, next: Next) -> Response {
    if !has_marker(request.headers(), header::CONTENT_ENCODING.as_str(), GZIP) {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let packed = match to_bytes(body, MAX_DECOMPRESSED).await {
        Ok(b) => b,
        Err(e) => {
            debug!("cannot read compressed body: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    match decompress(&packed) {
        Ok(plain) => {
            parts.headers.remove(header::CONTENT_ENCODING);
            parts.headers.remove(header::CONTENT_LENGTH);
            next.run(Request::from_parts(parts, Body::from(plain))).await
        }
        Err(e) => {
            debug!("request decompression failed: {e}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn compress_response(request: Request, next: Next) -> Response {
    let accepts_gzip = has_marker(request.headers(), header::ACCEPT_ENCODING.as_str(), GZIP);
    let response = next.run(request).await;
    if !accepts_gzip || response.headers().contains_key(header::CONTENT_ENCODING) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let plain = match to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            error!("cannot buffer response body: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if plain.is_empty() {
        return Response::from_parts(parts, Body::empty());
    }
    match compress(&plain) {
        Ok(packed) => {
            parts
                .headers
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static(GZIP));
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(packed))
        }
        Err(e) => {
            error!("response compression failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_update(State(state): State<Arc<AppState>>, Json(metric): Json<Metric>) -> Response {
    match state.ingest.update(&metric).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => reject(e, false),
    }
}

async fn handle_updates(
    State(state): State<Arc<AppState>>,
    Json(metrics): Json<Vec<Metric>>,
) -> Response {
    match state.ingest.update_batch(&metrics).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => reject(e, true),
    }
}

async fn handle_value(State(state): State<Arc<AppState>>, Json(query): Json<Metric>) -> Response {
    match state.ingest.value(&query).await {
        Ok(metric) => Json(metric).into_response(),
        Err(e) => reject(e, false),
    }
}

async fn handle_list(State(state): State<Arc<AppState>>) -> Response {
    let storage = state.ingest.storage();
    let names = match storage.list().await {
        Ok(names) => names,
        Err(e) => {
            error!("cannot list metrics: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut lines = String::new();
    for name in names {
        match storage.get(&name).await {
            Ok(MetricValue::Gauge(v)) => {
                lines.push_str(&format!("{name} (type: gauge): {v:.6}<br>\n"));
            }
            Ok(MetricValue::Counter(d)) => {
                lines.push_str(&format!("{name} (type: counter): {d}<br>\n"));
            }
            Err(e) => debug!("skipping {name}: {e}"),
        }
    }

    Html(format!(
        "<html>\n<title>Metric Dump</title>\n<body>\n<h2>Metric Dump</h2>\n{lines}\n</body>\n</html>"
    ))
    .into_response()
}

async fn handle_default() -> StatusCode {
    StatusCode::FORBIDDEN
}

async fn handle_ping(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.ingest.storage().ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            debug!("storage ping failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let pipeline = ServiceBuilder::new()
        .layer(middleware::from_fn_with_state(state.clone(), trusted_subnet))
        .layer(middleware::from_fn_with_state(state.clone(), decrypt_body))
        .layer(middleware::from_fn(decompress_body))
        .layer(middleware::from_fn(compress_response));

    Router::new()
        .route("/", get(handle_list).post(handle_default))
        .route("/update/", post(handle_update))
        .route("/updates/", post(handle_updates))
        .route("/value/", post(handle_value))
        .layer(pipeline)
        .route("/ping", get(handle_ping))
        .with_state(state)
}
