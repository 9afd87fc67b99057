//! HTTP ingest front: chunk POSTs, dashboard, health, CORS.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{constant_time_compare, extract_bearer};
use crate::error::Error;
use crate::wire::DataChunk;

use super::control::ControlManager;
use super::offsets::OffsetTracker;
use super::store::{ChunkStore, IngestResult};

/// Caller-supplied aggregation behind `GET /v1/dashboard`.
pub type DashboardProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Shared state behind the ingest routes.
pub struct IngestService {
    store: Arc<ChunkStore>,
    control: Arc<ControlManager>,
    offsets: Arc<OffsetTracker>,
    sensor_tokens: HashMap<String, String>,
    snapshot_tx: Option<mpsc::Sender<IngestResult>>,
    dashboard: Option<DashboardProvider>,
    allowed_origins: Vec<String>,
}

impl IngestService {
    pub fn new(
        store: Arc<ChunkStore>,
        control: Arc<ControlManager>,
        offsets: Arc<OffsetTracker>,
        sensor_tokens: HashMap<String, String>,
        snapshot_tx: Option<mpsc::Sender<IngestResult>>,
        dashboard: Option<DashboardProvider>,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            store,
            control,
            offsets,
            sensor_tokens,
            snapshot_tx,
            dashboard,
            allowed_origins,
        }
    }

    fn resolve_cors_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.is_empty() {
            return None;
        }
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }
        origin
            .filter(|o| self.allowed_origins.iter().any(|allowed| allowed == o))
            .map(str::to_string)
    }
}

/// Body of the 200 response to a chunk POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub stored: bool,
    pub duplicate: bool,
    pub sequence: i64,
    pub event_id: String,
    pub sensor_id: String,
    pub event_complete: bool,
    pub last_committed_sequence: i64,
}

pub fn router(service: Arc<IngestService>) -> Router {
    Router::new()
        .route("/v1/ingest/chunk", post(ingest_chunk).options(preflight))
        .route("/v1/dashboard", get(dashboard).options(preflight))
        .route("/healthz", get(healthz).options(preflight))
        .route("/", get(healthz).options(preflight))
        .fallback(fallback)
        .with_state(service)
}

/// Serve the ingest API until shutdown.
pub async fn run_ingest_server(
    bind: &str,
    port: u16,
    service: Arc<IngestService>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind((bind, port)).await?;
    info!(bind = %bind, port, "HTTP ingest listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn ingest_chunk(
    State(service): State<Arc<IngestService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = request_origin(&headers);

    let chunk: DataChunk = match serde_json::from_slice(&body) {
        Ok(chunk) => chunk,
        Err(e) => {
            return with_cors(
                error_response(StatusCode::BAD_REQUEST, format!("malformed chunk: {e}")),
                &service,
                origin.as_deref(),
                false,
            );
        }
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| extract_bearer(Some(v)).to_string());
    let expected = service.sensor_tokens.get(&chunk.sensor_id);
    if !constant_time_compare(expected.map(String::as_str), token.as_deref()) {
        warn!(sensor_id = %chunk.sensor_id, "unauthorized chunk POST");
        return with_cors(
            error_response(StatusCode::UNAUTHORIZED, "unauthorized sensor".to_string()),
            &service,
            origin.as_deref(),
            false,
        );
    }

    let result = match service.store.ingest(&chunk) {
        Ok(result) => result,
        Err(e) => {
            warn!(sensor_id = %chunk.sensor_id, sequence = chunk.sequence, "ingest rejected: {e}");
            return with_cors(
                error_response(
                    StatusCode::BAD_REQUEST,
                    format!("failed to ingest chunk: {e}"),
                ),
                &service,
                origin.as_deref(),
                false,
            );
        }
    };

    service.offsets.update(&chunk.sensor_id, chunk.sequence);

    // Ack on the control channel, best effort: an offline sensor simply
    // re-requests via its next heartbeat window.
    let control = service.control.clone();
    let sensor_id = chunk.sensor_id.clone();
    let sequence = chunk.sequence;
    let window_id = chunk
        .attributes
        .get("window_id")
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    tokio::spawn(async move {
        if !control.send_ack(&sensor_id, vec![sequence], window_id, false).await {
            debug!(sensor_id = %sensor_id, sequence, "ack dropped; sensor offline");
        }
    });

    if result.event_complete && result.assembled_payload.is_some() {
        if let Some(tx) = &service.snapshot_tx {
            let tx = tx.clone();
            let result = result.clone();
            tokio::spawn(async move {
                if tx.send(result).await.is_err() {
                    debug!("snapshot consumer gone");
                }
            });
        }
    }

    let response = IngestResponse {
        stored: result.stored,
        duplicate: result.duplicate,
        sequence: result.sequence,
        event_id: result.event_id,
        sensor_id: result.sensor_id.clone(),
        event_complete: result.event_complete,
        last_committed_sequence: service.offsets.get(&result.sensor_id),
    };
    with_cors(
        (StatusCode::OK, Json(response)).into_response(),
        &service,
        origin.as_deref(),
        false,
    )
}

async fn dashboard(State(service): State<Arc<IngestService>>, headers: HeaderMap) -> Response {
    let origin = request_origin(&headers);
    let Some(provider) = &service.dashboard else {
        return with_cors(
            error_response(StatusCode::NOT_FOUND, "dashboard not enabled".to_string()),
            &service,
            origin.as_deref(),
            false,
        );
    };
    let payload = provider();
    with_cors(
        (StatusCode::OK, Json(payload)).into_response(),
        &service,
        origin.as_deref(),
        false,
    )
}

async fn healthz(State(service): State<Arc<IngestService>>, headers: HeaderMap) -> Response {
    let origin = request_origin(&headers);
    with_cors(
        StatusCode::NO_CONTENT.into_response(),
        &service,
        origin.as_deref(),
        false,
    )
}

async fn preflight(State(service): State<Arc<IngestService>>, headers: HeaderMap) -> Response {
    let origin = request_origin(&headers);
    with_cors(
        StatusCode::NO_CONTENT.into_response(),
        &service,
        origin.as_deref(),
        true,
    )
}

async fn fallback(
    State(service): State<Arc<IngestService>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let origin = request_origin(&headers);
    if method == Method::OPTIONS {
        return preflight(State(service), headers).await;
    }
    with_cors(
        error_response(StatusCode::NOT_FOUND, "unknown path".to_string()),
        &service,
        origin.as_deref(),
        false,
    )
}

fn request_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn with_cors(
    mut response: Response,
    service: &IngestService,
    origin: Option<&str>,
    preflight: bool,
) -> Response {
    let Some(allowed) = service.resolve_cors_origin(origin) else {
        return response;
    };
    let Ok(allowed_value) = HeaderValue::from_str(&allowed) else {
        return response;
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allowed_value);
    if allowed != "*" {
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    if preflight {
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("600"),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_payload, random_event_id, ChunkOptions};
    use crate::server::control::ControlSession;
    use crate::wire::{ControlBody, ControlEnvelope, SCHEMA_VERSION};
    use tempfile::tempdir;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn build_chunks(sensor_id: &str, payload: &[u8]) -> Vec<DataChunk> {
        let event_id = random_event_id();
        chunk_payload(payload, &event_id, ChunkOptions::default())
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(offset, chunk)| DataChunk {
                schema_version: SCHEMA_VERSION.to_string(),
                sensor_id: sensor_id.to_string(),
                event_id: chunk.event_id,
                sequence: 1 + offset as i64,
                chunk_index: chunk.chunk_index,
                chunk_count: chunk.chunk_count,
                compression: chunk.compression,
                payload: chunk.payload,
                chunk_sha256: chunk.chunk_hash,
                event_sha256: chunk.event_hash,
                created_at: crate::wire::utc_now_rfc3339(),
                logical_timestamp_ms: chunk.logical_timestamp_ms,
                clock_skew_ms: chunk.clock_skew_ms,
                attributes: HashMap::from([("window_id".to_string(), "w1".to_string())]),
            })
            .collect()
    }

    struct Fixture {
        service: Arc<IngestService>,
        store: Arc<ChunkStore>,
        control: Arc<ControlManager>,
        offsets: Arc<OffsetTracker>,
        snapshot_rx: mpsc::Receiver<IngestResult>,
        _dir: tempfile::TempDir,
    }

    fn fixture(allowed_origins: Vec<String>) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(&dir.path().join("server.db"), 3600.0).unwrap());
        let control = Arc::new(ControlManager::new());
        let offsets = Arc::new(OffsetTracker::new());
        let (snapshot_tx, snapshot_rx) = mpsc::channel(8);
        let service = Arc::new(IngestService::new(
            store.clone(),
            control.clone(),
            offsets.clone(),
            HashMap::from([("sensor-1".to_string(), "secret".to_string())]),
            Some(snapshot_tx),
            None,
            allowed_origins,
        ));
        Fixture {
            service,
            store,
            control,
            offsets,
            snapshot_rx,
            _dir: dir,
        }
    }

    fn auth_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_ingest_acks_and_snapshots() {
        let mut fx = fixture(vec![]);
        let (tx, mut control_rx) = mpsc::unbounded_channel();
        fx.control
            .register(ControlSession::new("sensor-1", tx))
            .await;

        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let chunks = build_chunks("sensor-1", &payload);
        assert_eq!(chunks.len(), 2);

        for chunk in &chunks {
            let body = Bytes::from(serde_json::to_vec(chunk).unwrap());
            let response =
                ingest_chunk(State(fx.service.clone()), auth_headers("secret"), body).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        // Both sequences acked on the control channel under window w1.
        for expected_seq in [1i64, 2] {
            let Message::Text(raw) = control_rx.recv().await.unwrap() else { panic!() };
            let envelope = ControlEnvelope::decode(&raw).unwrap();
            let ControlBody::ChunkAck(ack) = envelope.body else { panic!("expected ack") };
            assert_eq!(ack.window_id, "w1");
            assert_eq!(ack.committed_sequences, vec![expected_seq]);
        }

        // Completion handed the assembled payload to the snapshot channel.
        let result = fx.snapshot_rx.recv().await.unwrap();
        assert!(result.event_complete);
        assert_eq!(result.assembled_payload.as_deref(), Some(payload.as_slice()));
        assert_eq!(fx.offsets.get("sensor-1"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_reports_without_mutation() {
        let fx = fixture(vec![]);
        let chunks = build_chunks("sensor-1", b"single chunk payload");
        let body = Bytes::from(serde_json::to_vec(&chunks[0]).unwrap());

        let first =
            ingest_chunk(State(fx.service.clone()), auth_headers("secret"), body.clone()).await;
        let first = body_json(first).await;
        assert_eq!(first["stored"], true);
        assert_eq!(first["duplicate"], false);

        let second = ingest_chunk(State(fx.service.clone()), auth_headers("secret"), body).await;
        let second = body_json(second).await;
        assert_eq!(second["stored"], false);
        assert_eq!(second["duplicate"], true);
        assert_eq!(fx.store.chunk_count("sensor-1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_auth_and_parse_failures() {
        let fx = fixture(vec![]);
        let chunks = build_chunks("sensor-1", b"payload");
        let body = Bytes::from(serde_json::to_vec(&chunks[0]).unwrap());

        let response =
            ingest_chunk(State(fx.service.clone()), auth_headers("wrong"), body.clone()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response =
            ingest_chunk(State(fx.service.clone()), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = ingest_chunk(
            State(fx.service.clone()),
            auth_headers("secret"),
            Bytes::from_static(b"not json"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(fx.store.chunk_count("sensor-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_rejected_and_not_acked() {
        let fx = fixture(vec![]);
        let (tx, mut control_rx) = mpsc::unbounded_channel();
        fx.control
            .register(ControlSession::new("sensor-1", tx))
            .await;

        let mut chunks = build_chunks("sensor-1", b"payload bytes");
        chunks[0].payload[0] ^= 0xff;
        let body = Bytes::from(serde_json::to_vec(&chunks[0]).unwrap());
        let response = ingest_chunk(State(fx.service.clone()), auth_headers("secret"), body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(fx.store.chunk_count("sensor-1").unwrap(), 0);
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_health_dashboard_and_cors_routes() {
        let fx = fixture(vec!["https://ui.example".to_string()]);

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://ui.example"));
        let response = healthz(State(fx.service.clone()), headers.clone()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://ui.example"
        );
        assert_eq!(response.headers().get(header::VARY).unwrap(), "Origin");

        // Preflight carries the max-age; disallowed origins get nothing.
        let response =
            fallback(State(fx.service.clone()), Method::OPTIONS, headers.clone()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_MAX_AGE).unwrap(),
            "600"
        );
        let mut other = HeaderMap::new();
        other.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        let response = fallback(State(fx.service.clone()), Method::OPTIONS, other).await;
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        // No provider configured.
        let response = dashboard(State(fx.service.clone()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = fallback(State(fx.service.clone()), Method::GET, HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
