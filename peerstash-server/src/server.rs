use crate::config::Config;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use peerstash_core::{
    ApplyOutcome, BlobStore, FsBlobStore, HealthMap, HealthPoller, PeerHealthOracle, HttpTransport, JobRecord, LocationRecord, Op,
    OpLog, OpOptions, OpStore, PeerSet, RepairScheduler, StashError, TypeRegistry, compute_hash,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub oplog: Arc<OpLog>,
    pub blobs: Arc<dyn BlobStore>,
    pub peers: Arc<PeerSet>,
    pub health: Arc<HealthMap>,
    pub liveness_window: Duration,
}

impl AppState {
    /// Swap in a freshly discovered fleet. Placement, health polling and the
    /// op log's push and sweep workers all follow the new list.
    pub fn refresh_peers(&self, hosts: &[String]) -> peerstash_core::Result<bool> {
        self.peers.refresh(&self.oplog, hosts)
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(body)).into_response()
}

fn status_for(error: &StashError) -> StatusCode {
    match error {
        StashError::UnknownType(_) => StatusCode::NOT_ACCEPTABLE,
        StashError::InvalidPayload(_) | StashError::InvalidKey(_) | StashError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        StashError::BlobNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct SweepQuery {
    #[serde(default)]
    after: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PushResponse {
    id: String,
    duplicate: bool,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    key: String,
    size: usize,
    host: String,
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let peers = Arc::new(PeerSet::new(
        config.host.clone(),
        config.peers.clone(),
        config.decommissioned.clone(),
    ));
    let self_host = peers.self_host().to_string();

    let registry = TypeRegistry::builder()
        .register::<LocationRecord>()
        .register::<JobRecord>()
        .build();
    let store = Arc::new(OpStore::open(config.oplog_path())?);
    let transport = Arc::new(HttpTransport::from_config(&config.oplog, &config.repair)?);
    let oplog = Arc::new(OpLog::new(
        self_host.clone(),
        config.oplog.clone(),
        store,
        registry,
        transport.clone(),
    )?);

    oplog.subscribe(|op, batch| {
        if let Some(records) = batch.downcast::<LocationRecord>() {
            for record in records {
                tracing::debug!("{} {} on {} (op {})", op.action, record.key, record.host, op.id);
            }
        }
    });

    oplog.start()?;

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.data_dir.clone())?);

    let health = Arc::new(HealthMap::new());
    health.mark_alive(&self_host);
    let poller = Arc::new(HealthPoller::new(health.clone(), peers.clone(), config.health.clone())?);
    tokio::spawn(poller.run());

    let repair = Arc::new(RepairScheduler::new(
        oplog.clone(),
        blobs.clone(),
        transport,
        health.clone(),
        peers.clone(),
        config.repair.clone(),
        config.health.liveness_window(),
    ));
    tokio::spawn(repair.run());

    let state = Arc::new(AppState {
        oplog: oplog.clone(),
        blobs,
        peers,
        health,
        liveness_window: config.health.liveness_window(),
    });
    state.refresh_peers(&config.peers)?;

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {} as {}", config.bind_addr, self_host);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    oplog.stop();
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/internal/crud/push", post(push_op))
        .route("/internal/crud/sweep", get(sweep_ops))
        .route("/internal/crud/peers", get(peer_stats))
        .route("/internal/blobs", post(ingest_blob))
        .route("/internal/blobs/info/:key", get(blob_info))
        .route("/internal/blobs/:key", get(get_blob))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "host": state.oplog.host(),
        "peers": state.peers.peers().len(),
        "healthy_peers": state.health.healthy_hosts(&state.peers.peers(), state.liveness_window).len(),
        "op_log_running": state.oplog.is_running(),
    });

    (StatusCode::OK, Json(response))
}

async fn push_op(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let op: Op = match serde_json::from_slice(&body) {
        Ok(op) => op,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, format!("malformed op: {}", error)),
    };

    match state.oplog.apply_op(&op) {
        Ok(outcome) => {
            let response = PushResponse {
                id: op.id,
                duplicate: outcome == ApplyOutcome::Duplicate,
            };
            (StatusCode::OK, ApiResponse::ok(response)).into_response()
        }
        Err(error) => {
            if error.is_rejection() {
                tracing::warn!("Rejected pushed op {} from {}: {}", op.id, op.host, error);
            } else {
                tracing::error!("Failed to apply pushed op {}: {}", op.id, error);
            }
            error_response(status_for(&error), error)
        }
    }
}

async fn sweep_ops(State(state): State<Arc<AppState>>, Query(query): Query<SweepQuery>) -> Response {
    let limit = query.limit.unwrap_or(state.oplog.config().pull_limit);

    match state.oplog.ops_after(&query.after, limit) {
        Ok(ops) => (StatusCode::OK, Json(ops)).into_response(),
        Err(error) => {
            tracing::error!("Failed to serve sweep after '{}': {}", query.after, error);
            error_response(status_for(&error), error)
        }
    }
}

async fn peer_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::ok(state.oplog.peer_stats()))
}

async fn get_blob(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.blobs.get(&key).await {
        Ok(data) => (StatusCode::OK, data).into_response(),
        Err(error) => error_response(status_for(&error), error),
    }
}

async fn blob_info(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.blobs.attributes(&key).await {
        Ok(Some(attributes)) => (StatusCode::OK, Json(attributes)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, StashError::BlobNotFound(key)),
        Err(error) => error_response(status_for(&error), error),
    }
}

async fn ingest_blob(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty blob");
    }

    let key = compute_hash(&body);
    if let Err(error) = state.blobs.put(&key, body.clone()).await {
        tracing::error!("Failed to store blob {}: {}", key, error);
        return error_response(status_for(&error), error);
    }

    let host = state.oplog.host().to_string();
    if let Err(error) = state
        .oplog
        .create(&LocationRecord::new(&key, &host), OpOptions::default())
    {
        tracing::error!("Stored blob {} but failed to record location: {}", key, error);
        return error_response(status_for(&error), error);
    }

    tracing::info!("Ingested blob {} ({} bytes)", key, body.len());
    let response = IngestResponse {
        key,
        size: body.len(),
        host,
    };
    (StatusCode::CREATED, ApiResponse::ok(response)).into_response()
}
