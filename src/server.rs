use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::reconcile::PassReport;
use crate::runtime::WatchRuntime;
use crate::scheduler::{ReconcileScheduler, WatchEvent};
use crate::store::{MetricKind, OrganizationDirectory};

#[derive(Clone)]
pub struct ServerState {
    pub scheduler: Arc<ReconcileScheduler>,
    pub directory: Arc<dyn OrganizationDirectory>,
    pub metrics_organization: String,
    pub last_report: Arc<RwLock<Option<PassReport>>>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IngestResponse {
    status: &'static str,
    message: &'static str,
}

type IngestReply = (StatusCode, Json<IngestResponse>);

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clicks", post(record_click))
        .route("/delivery", get(record_delivery))
        .route("/reconcile", post(run_reconcile))
        .route("/reconcile/last", get(last_report))
        .with_state(state)
}

fn bind_addr() -> Result<SocketAddr> {
    let raw = match std::env::var("STALLWATCH_BIND") {
        Ok(addr) if !addr.trim().is_empty() => addr.trim().to_string(),
        _ => match std::env::var("PORT") {
            Ok(port) if !port.trim().is_empty() => format!("0.0.0.0:{}", port.trim()),
            _ => "127.0.0.1:5000".to_string(),
        },
    };
    raw.parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}' (expected host:port)", raw))
}

/// Start the scheduler and serve HTTP until ctrl-c.
pub async fn serve(runtime: WatchRuntime, event_rx: flume::Receiver<WatchEvent>) -> Result<()> {
    let bind_addr = bind_addr()?;

    let state = Arc::new(ServerState {
        scheduler: runtime.scheduler.clone(),
        directory: runtime.directory.clone(),
        metrics_organization: runtime.config.metrics_organization_name.clone(),
        last_report: Arc::new(RwLock::new(None)),
    });

    spawn_event_bridge(event_rx, state.last_report.clone());
    let scheduler = runtime.scheduler.clone().start();

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Server running on http://{}", bind_addr);

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Server failed");

    scheduler.stop().await?;
    served
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<WatchEvent>,
    last_report: Arc<RwLock<Option<PassReport>>>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                WatchEvent::PassStarted => tracing::debug!("Reconciliation pass started"),
                WatchEvent::PassCompleted(report) => {
                    *last_report.write().await = Some(report);
                }
                WatchEvent::PassFailed(error) => {
                    tracing::warn!("Reconciliation pass failed: {}", error)
                }
            }
        }
    });
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn record_click(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<serde_json::Value>,
) -> IngestReply {
    tracing::info!("Received click data: {}", body);
    append_metric(&state, MetricKind::Clicks, body).await
}

async fn record_delivery(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
) -> IngestReply {
    let payload = serde_json::to_value(query).unwrap_or_else(|_| serde_json::json!({}));
    tracing::info!("Received delivery data: {}", payload);
    append_metric(&state, MetricKind::Deliveries, payload).await
}

async fn append_metric(
    state: &ServerState,
    kind: MetricKind,
    payload: serde_json::Value,
) -> IngestReply {
    match state
        .directory
        .append_metric(&state.metrics_organization, kind, payload)
        .await
    {
        Ok(true) => (
            StatusCode::OK,
            Json(IngestResponse {
                status: "success",
                message: "Data received",
            }),
        ),
        Ok(false) => {
            tracing::warn!(
                "Metrics organization '{}' does not exist",
                state.metrics_organization
            );
            (
                StatusCode::NOT_FOUND,
                Json(IngestResponse {
                    status: "error",
                    message: "Document not found",
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to record {:?} event: {:#}", kind, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngestResponse {
                    status: "error",
                    message: "Failed to store data",
                }),
            )
        }
    }
}

async fn run_reconcile(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<PassReport>, (StatusCode, String)> {
    match state.scheduler.tick().await {
        Ok(report) => {
            *state.last_report.write().await = Some(report.clone());
            Ok(Json(report))
        }
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Reconciliation pass aborted: {:#}", e),
        )),
    }
}

async fn last_report(State(state): State<Arc<ServerState>>) -> Json<Option<PassReport>> {
    Json(state.last_report.read().await.clone())
}
