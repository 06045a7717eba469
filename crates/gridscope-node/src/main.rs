//! Gridscope node binary providing a minimal HTTP API over the map engine.
//!
//! This wires together the demo region source, the R-tree hub index, and the
//! viewport cache engine. The API is intentionally minimal and intended for
//! local development and as the backend for a thin map client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Extension, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use gridscope_core::{BoundingBox, Cluster, Viewport};
use gridscope_engine::{EngineConfig, EngineStats, IngestOutcome, MapEngine, MapSnapshot};
use gridscope_index_rstar::RstarHubIndex;
use gridscope_source_demo::{DemoConfig, DemoSource};
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

type NodeEngine = MapEngine<DemoSource, RstarHubIndex>;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NodeConfig {
    listen: Option<String>,
    /// Seconds between periodic cull passes.
    cull_interval_secs: u64,
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    source: DemoConfig,
    #[serde(default)]
    health: HealthConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: Some("127.0.0.1:8080".into()),
            cull_interval_secs: 5,
            engine: EngineConfig::default(),
            source: DemoConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<NodeEngine>,
    health: HealthConfig,
    #[cfg(feature = "metrics")]
    metrics_handle: PrometheusHandle,
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    Engine(String),
    #[error("{0}")]
    BadRequest(String),
}

#[derive(Clone)]
struct CorrelationId(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ConfigWrapper {
    #[serde(default)]
    node: NodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct HealthConfig {
    /// Mark degraded when resident assets reach this fraction of the active
    /// cap; sustained residency that close to the cap means culling is not
    /// keeping up with ingest.
    #[serde(default = "HealthConfig::default_resident_threshold")]
    resident_degraded: f32,
}

impl HealthConfig {
    const fn default_resident_threshold() -> f32 {
        0.95
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            resident_degraded: Self::default_resident_threshold(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    applied_epoch: u64,
    resident_assets: usize,
    asset_cap: usize,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ViewportRequest {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
    zoom: u8,
}

#[derive(Debug, Serialize)]
struct ViewportResponse {
    /// False when the throttle suppressed the update; resident data is
    /// unchanged in that case.
    accepted: bool,
    outcome: Option<IngestOutcome>,
}

async fn correlation_layer(mut req: Request<Body>, next: Next) -> impl IntoResponse {
    let header_key = axum::http::header::HeaderName::from_static("x-request-id");
    let cid = req
        .headers()
        .get(&header_key)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(|s: &str| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&cid) {
        req.headers_mut().insert(&header_key, value);
    }
    req.extensions_mut().insert(CorrelationId(cid.clone()));
    let span = info_span!(
        "http.request",
        request_id = %cid,
        method = %req.method(),
        path = %req.uri().path()
    );
    next.run(req).instrument(span).await
}

async fn viewport_handler(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(req): Json<ViewportRequest>,
) -> std::result::Result<Json<ViewportResponse>, ApiError> {
    let bounds = BoundingBox::new(req.min_lon, req.min_lat, req.max_lon, req.max_lat)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let viewport = Viewport::new(bounds, req.zoom);

    let Some(changed) = state.engine.update_viewport(viewport) else {
        return Ok(Json(ViewportResponse {
            accepted: false,
            outcome: None,
        }));
    };

    let span = info_span!(
        "viewport.request",
        request_id = %correlation.0,
        zoom = req.zoom
    );
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();
    let outcome = state
        .engine
        .request(&changed)
        .instrument(span)
        .await
        .map_err(|e| ApiError::Engine(e.to_string()))?;
    #[cfg(feature = "metrics")]
    gridscope_metrics::record_request_latency(started.elapsed());

    Ok(Json(ViewportResponse {
        accepted: true,
        outcome: Some(outcome),
    }))
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<MapSnapshot> {
    Json(state.engine.current_snapshot().as_ref().clone())
}

async fn clusters_handler(State(state): State<AppState>) -> Json<Vec<Cluster>> {
    Json(state.engine.current_snapshot().clusters.clone())
}

async fn stats_handler(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.engine.stats();
    let mut status = "ready".to_string();
    let mut message = None;

    if stats.applied_epoch == 0 {
        status = "starting".into();
        message = Some("no region batch applied yet".into());
    } else {
        let watermark =
            ((stats.asset_cap as f32 * state.health.resident_degraded) as usize).max(1);
        if stats.resident_assets >= watermark {
            status = "degraded".into();
            message = Some(format!(
                "resident assets {} at or above watermark {watermark}",
                stats.resident_assets
            ));
        }
    }

    let code = if status == "ready" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let resp = HealthResponse {
        status,
        applied_epoch: stats.applied_epoch,
        resident_assets: stats.resident_assets,
        asset_cap: stats.asset_cap,
        message,
    };
    (code, Json(resp))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        body,
    )
}

fn load_config(path: &str) -> anyhow::Result<NodeConfig> {
    let text = std::fs::read_to_string(path)?;
    let cfg: ConfigWrapper = toml::from_str(&text)?;
    Ok(cfg.node)
}

fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    let _ = INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

#[cfg(feature = "metrics")]
fn init_metrics_recorder() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

fn spawn_cull_task(engine: Arc<NodeEngine>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(report) = engine.cull_periodic() {
                if report.assets_removed + report.edges_removed > 0 {
                    info!(
                        assets = report.assets_removed,
                        edges = report.edges_removed,
                        "periodic cull removed stale residents"
                    );
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let cfg_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|idx| args.get(idx + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");
    let cfg = load_config(cfg_path)?;

    let source = DemoSource::new(cfg.source.clone())?;
    let engine = Arc::new(MapEngine::new(
        source,
        RstarHubIndex::new(),
        cfg.engine.clone(),
    )?);
    #[cfg(feature = "metrics")]
    let metrics_handle = init_metrics_recorder();

    let state = AppState {
        engine: engine.clone(),
        health: cfg.health.clone(),
        #[cfg(feature = "metrics")]
        metrics_handle,
    };
    spawn_cull_task(engine, Duration::from_secs(cfg.cull_interval_secs.max(1)));

    let app = Router::new()
        .route("/viewport", post(viewport_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/clusters", get(clusters_handler))
        .route("/stats", get(stats_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route_layer(middleware::from_fn(correlation_layer));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));
    let app = app.with_state(state);

    let addr: SocketAddr = cfg
        .listen
        .as_deref()
        .unwrap_or("127.0.0.1:8080")
        .parse()?;

    println!("gridscope-node listening on {addr}");
    info!(%addr, "gridscope-node listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
