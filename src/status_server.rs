use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::GenerationId;
use crate::session::cancelled;
use crate::supervisor::{GroupStatus, StatusHandle};

#[derive(Clone)]
struct AppState {
    members: Arc<Vec<StatusHandle>>,
}

async fn health_check() -> impl IntoResponse {
    "OK"
}

/// 200 once every member of this process is Stable.
async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Vec<Option<GenerationId>>>) {
    let generations: Vec<Option<GenerationId>> = state
        .members
        .iter()
        .map(StatusHandle::ready_generation)
        .collect();

    let ready = !generations.is_empty() && generations.iter().all(Option::is_some);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(generations))
}

async fn status(State(state): State<AppState>) -> Json<Vec<GroupStatus>> {
    Json(state.members.iter().map(StatusHandle::status).collect())
}

pub fn router(members: Vec<StatusHandle>) -> Router {
    let state = AppState {
        members: Arc::new(members),
    };

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the status endpoints until `shutdown` flips.
pub async fn serve(
    port: &str,
    members: Vec<StatusHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🚀 Status server ready on {}", addr);

    axum::serve(listener, router(members))
        .with_graceful_shutdown(async move { cancelled(&mut shutdown).await })
        .await
        .context("Status server failed")?;

    info!("Status server stopped");
    Ok(())
}
