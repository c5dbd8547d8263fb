//! Control RPC
//!
//! Administrative endpoints of the scan daemon, plus health and Prometheus
//! metrics. Failures are returned as structured exception payloads.

use super::scan::ScanDaemon;
use crate::error::{Error, Result};
use crate::manager::ResourceManager;
use crate::metamodel::{AttrMap, AttrValue};
use crate::store::RecordId;
use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const METRIC_PREFIX: &str = "srm";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResourceRequest {
    pub resource_id: RecordId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyResourceRequest {
    pub resource_id: RecordId,
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionBody {
    pub class: String,
    pub message: String,
}

/// Error payload of every failed call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionResponse {
    pub exception: ExceptionBody,
}

struct ControlError(Error);

impl From<Error> for ControlError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::RecordNotFound { .. } | Error::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(error = %self.0, "Control request failed");
        let body = ExceptionResponse {
            exception: ExceptionBody {
                class: self.0.exception_name().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Prometheus gauges mirroring the manager counters
struct ControlMetrics {
    registry: Registry,
    counters: Vec<(&'static str, IntGauge)>,
    active_sessions: IntGauge,
    records: IntGauge,
}

impl ControlMetrics {
    fn new(manager: &ResourceManager) -> Result<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(format!("{}_{}", METRIC_PREFIX, name), help))
                .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
            Ok(gauge)
        };

        let mut counters = Vec::new();
        for (name, _) in manager.metrics().counters() {
            counters.push((name, gauge(name, "Resource manager counter")?));
        }
        let active_sessions = gauge("active_scan_sessions", "Scan sessions running")?;
        let records = gauge("records", "Stored resource records")?;
        Ok(Self {
            registry,
            counters,
            active_sessions,
            records,
        })
    }

    fn render(&self, manager: &ResourceManager, scan: &ScanDaemon) -> Result<(String, Vec<u8>)> {
        let snapshot = manager.metrics().counters();
        for ((_, gauge), (_, value)) in self.counters.iter().zip(snapshot.iter()) {
            gauge.set(*value as i64);
        }
        self.active_sessions.set(scan.active_sessions() as i64);
        self.records
            .set(manager.store().read(|t| t.records.len()) as i64);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

// =============================================================================
// Router
// =============================================================================

#[derive(Clone)]
struct ControlState {
    scan: Arc<ScanDaemon>,
    manager: Arc<ResourceManager>,
    metrics: Arc<ControlMetrics>,
}

/// Build the control router
pub fn control_router(scan: Arc<ScanDaemon>, manager: Arc<ResourceManager>) -> Result<Router> {
    let metrics = Arc::new(ControlMetrics::new(&manager)?);
    let state = ControlState {
        scan,
        manager,
        metrics,
    };
    Ok(Router::new()
        .route("/remove_resource", post(remove_resource))
        .route("/modify_resource", post(modify_resource))
        .route("/metrics", get(export_metrics))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Serve the control router until cancelled
pub async fn serve_control(addr: SocketAddr, router: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind control server: {}", e)))?;
    info!(%addr, "Control RPC listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Control server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Control server error: {}", e)))
}

// =============================================================================
// Handlers
// =============================================================================

async fn remove_resource(
    State(state): State<ControlState>,
    Json(request): Json<RemoveResourceRequest>,
) -> std::result::Result<Json<serde_json::Value>, ControlError> {
    state.scan.remove_resource(request.resource_id).await?;
    Ok(Json(serde_json::json!({ "result": null })))
}

async fn modify_resource(
    State(state): State<ControlState>,
    Json(request): Json<ModifyResourceRequest>,
) -> std::result::Result<Json<serde_json::Value>, ControlError> {
    // Unknown records are reported before any session is stopped
    state.manager.get_resource(request.resource_id)?;
    let attrs: AttrMap = request
        .attrs
        .iter()
        .map(|(k, v)| (k.clone(), AttrValue::from_json(v)))
        .collect();
    state.scan.modify_resource(request.resource_id, &attrs).await?;
    Ok(Json(serde_json::json!({ "result": null })))
}

async fn export_metrics(State(state): State<ControlState>) -> std::result::Result<Response, ControlError> {
    let (content_type, body) = state.metrics.render(&state.manager, &state.scan)?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::testing::Harness;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn router(h: &Harness) -> Router {
        let scan = ScanDaemon::new(h.plugins.clone(), h.manager.clone(), DaemonConfig::default());
        control_router(scan, h.manager.clone()).unwrap()
    }

    async fn call(router: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn exception(body: &[u8]) -> ExceptionResponse {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let (status, body) = call(router(&h), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_remove_resource() {
        let h = Harness::new();
        let controller = h.controller("alert_plugin", "ctrl-x");
        let (status, _) = call(
            router(&h),
            "POST",
            "/remove_resource",
            Some(json!({ "resource_id": controller.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!h.record_ids().contains(&controller));
    }

    #[tokio::test]
    async fn test_modify_resource() {
        let h = Harness::new();
        let controller = h.controller("alert_plugin", "ctrl-y");
        let app = router(&h);

        let (status, _) = call(
            app.clone(),
            "POST",
            "/modify_resource",
            Some(json!({ "resource_id": controller.0, "attrs": { "temperature": 42 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let stored = h.manager.get_resource(controller).unwrap();
        assert_eq!(stored.attributes.get("temperature"), Some(&AttrValue::Integer(42)));

        let (status, body) = call(
            app.clone(),
            "POST",
            "/modify_resource",
            Some(json!({ "resource_id": controller.0, "attrs": { "colour": "red" } })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(exception(&body).exception.class, "UnknownAttribute");

        let (status, body) = call(
            app,
            "POST",
            "/modify_resource",
            Some(json!({ "resource_id": 9999, "attrs": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(exception(&body).exception.class, "DoesNotExist");
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let h = Harness::new();
        let host = h.host(1);
        h.open(host, vec![]);

        let (status, body) = call(router(&h), "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("srm_sessions_opened 1"));
        assert!(text.contains("srm_records 1"));
        assert!(text.contains("srm_active_scan_sessions 0"));
    }
}
