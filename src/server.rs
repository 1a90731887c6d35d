use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ledger::JobStore;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::queue::TaskBroker;
use crate::runtime::Runtime;
use crate::tools::{ToolInfo, WorkerToolRegistry};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = json!({ "code": self.code(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkerToolRegistry>,
    pub broker: Arc<TaskBroker>,
    pub store: Arc<dyn JobStore>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn from_runtime(runtime: &Runtime) -> Self {
        Self {
            registry: runtime.registry.clone(),
            broker: runtime.broker.clone(),
            store: runtime.store.clone(),
            metrics: runtime.metrics.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    pending_tasks: usize,
    metrics: MetricsSnapshot,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(tools))
        .route("/jobs/{object_id}", get(job))
        .with_state(state)
}

pub async fn run(
    address: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(%address, "Status endpoint listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let pending_tasks = state
        .broker
        .pending()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(Health {
        status: "ok",
        pending_tasks,
        metrics: state.metrics.snapshot(),
    }))
}

async fn tools(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    Json(state.registry.tool_info())
}

async fn job(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get(&object_id) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(ApiError::NotFound(object_id)),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
