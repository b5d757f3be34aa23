//! Chatmux HTTP REST API
//!
//! Axum-based HTTP server exposing the session-registry surface. Runs
//! alongside the unix-socket IPC server.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a
//! pure inner function. The inner functions are directly testable without
//! axum dispatch machinery.
//!
//! Endpoints:
//! - GET    /health               — health check with DB status
//! - GET    /version              — server version info
//! - GET    /connections          — live session snapshots (optional company filter)
//! - GET    /connections/:id      — one session's state (live or persisted)
//! - POST   /whatsapp/:id/restart — atomically restart a session
//! - DELETE /whatsapp/:id         — stop the session and delete its record

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chatmux_core::{ChatmuxConfig, SessionError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::router::{connection_state, AppContext};

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub ctx: AppContext,
    pub config: ChatmuxConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/connections", get(list_connections_handler))
        .route("/connections/:id", get(get_connection_handler))
        .route("/whatsapp/:id/restart", post(restart_handler))
        .route("/whatsapp/:id", delete(delete_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Chatmux HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize, Default)]
pub struct ListParams {
    pub company_id: Option<i32>,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(ctx: &AppContext) -> (StatusCode, serde_json::Value) {
    let database = match &ctx.pool {
        Some(pool) => match chatmux_core::db::health_check(pool).await {
            Ok(version) => version,
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "status": "unhealthy",
                        "error": e.to_string(),
                    }),
                );
            }
        },
        None => "memory".to_string(),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "sessions_running": ctx.registry.running_count().await,
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "chatmux/1",
    })
}

pub async fn list_connections_inner(
    ctx: &AppContext,
    company_id: Option<i32>,
) -> (StatusCode, serde_json::Value) {
    let mut snapshots = ctx.registry.snapshots().await;
    if let Some(company_id) = company_id {
        snapshots.retain(|s| s.company_id == company_id);
    }
    match serde_json::to_value(&snapshots) {
        Ok(connections) => (
            StatusCode::OK,
            serde_json::json!({ "connections": connections }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "status": "error", "error": e.to_string() }),
        ),
    }
}

pub async fn get_connection_inner(ctx: &AppContext, id: i32) -> (StatusCode, serde_json::Value) {
    match connection_state(id, ctx).await {
        Ok(Some(data)) => (StatusCode::OK, data),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "status": "error", "error": format!("no session with id {id}") }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "status": "error", "error": e.to_string() }),
        ),
    }
}

pub async fn restart_inner(ctx: &AppContext, id: i32) -> (StatusCode, serde_json::Value) {
    match ctx.registry.restart(id).await {
        Ok(snapshot) => match serde_json::to_value(&snapshot) {
            Ok(data) => (StatusCode::OK, data),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "status": "error", "error": e.to_string() }),
            ),
        },
        Err(SessionError::NotFound(id)) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "status": "error", "error": format!("no session with id {id}") }),
        ),
        Err(SessionError::AlreadyStarting(_)) => (
            StatusCode::CONFLICT,
            serde_json::json!({ "status": "error", "error": "a start is already in progress" }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "status": "error", "error": e.to_string() }),
        ),
    }
}

pub async fn delete_inner(ctx: &AppContext, id: i32) -> (StatusCode, serde_json::Value) {
    match ctx.registry.delete(id).await {
        Ok(()) => (
            StatusCode::OK,
            serde_json::json!({ "deleted": true, "id": id }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "status": "error", "error": e.to_string() }),
        ),
    }
}

// ============================================================================
// Axum handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.ctx).await;
    (status, Json(body))
}

async fn version_handler() -> impl IntoResponse {
    Json(version_inner())
}

async fn list_connections_handler(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let (status, body) = list_connections_inner(&state.ctx, params.company_id).await;
    (status, Json(body))
}

async fn get_connection_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i32>,
) -> impl IntoResponse {
    let (status, body) = get_connection_inner(&state.ctx, id).await;
    (status, Json(body))
}

async fn restart_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i32>,
) -> impl IntoResponse {
    let (status, body) = restart_inner(&state.ctx, id).await;
    (status, Json(body))
}

async fn delete_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i32>,
) -> impl IntoResponse {
    let (status, body) = delete_inner(&state.ctx, id).await;
    (status, Json(body))
}
