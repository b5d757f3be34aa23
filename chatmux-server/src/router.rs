use crate::subsystems::registry::SessionRegistry;
use chatmux_core::ipc::{ChatmuxRequest, ChatmuxResponse};
use chatmux_core::{ChatmuxError, SessionError, SessionStore};
use sqlx::PgPool;
use std::sync::Arc;

/// Everything a request handler needs, shared by the IPC and HTTP surfaces.
#[derive(Clone)]
pub struct AppContext {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn SessionStore>,
    /// Present when running against Postgres; `None` in memory mode.
    pub pool: Option<PgPool>,
}

pub async fn handle_request(request: ChatmuxRequest, ctx: &AppContext) -> ChatmuxResponse {
    match request {
        ChatmuxRequest::Ping => ChatmuxResponse::pong(),
        ChatmuxRequest::Health => {
            let database = match &ctx.pool {
                Some(pool) => match chatmux_core::db::health_check(pool).await {
                    Ok(version) => version,
                    Err(e) => return ChatmuxResponse::err(format!("DB health check failed: {}", e)),
                },
                None => "memory".to_string(),
            };
            ChatmuxResponse::ok(serde_json::json!({
                "status": "healthy",
                "database": database,
                "sessions_running": ctx.registry.running_count().await,
            }))
        }
        ChatmuxRequest::ListConnections { company_id } => {
            let mut snapshots = ctx.registry.snapshots().await;
            if let Some(company_id) = company_id {
                snapshots.retain(|s| s.company_id == company_id);
            }
            match serde_json::to_value(&snapshots) {
                Ok(data) => ChatmuxResponse::ok(serde_json::json!({ "connections": data })),
                Err(e) => ChatmuxResponse::err(e.to_string()),
            }
        }
        ChatmuxRequest::GetConnection { id } => match connection_state(id, ctx).await {
            Ok(Some(data)) => ChatmuxResponse::ok(data),
            Ok(None) => ChatmuxResponse::err(format!("no session with id {}", id)),
            Err(e) => ChatmuxResponse::err(e.to_string()),
        },
        ChatmuxRequest::Restart { id } => match ctx.registry.restart(id).await {
            Ok(snapshot) => match serde_json::to_value(&snapshot) {
                Ok(data) => ChatmuxResponse::ok(data),
                Err(e) => ChatmuxResponse::err(e.to_string()),
            },
            Err(e) => ChatmuxResponse::err(e.to_string()),
        },
        ChatmuxRequest::Delete { id } => match ctx.registry.delete(id).await {
            Ok(()) => ChatmuxResponse::ok(serde_json::json!({ "deleted": true, "id": id })),
            Err(e) => ChatmuxResponse::err(e.to_string()),
        },
    }
}

/// Live snapshot if the session is running, otherwise its persisted record
/// marked `running: false`, otherwise `None`.
pub async fn connection_state(
    id: i32,
    ctx: &AppContext,
) -> Result<Option<serde_json::Value>, ChatmuxError> {
    if let Some(snapshot) = ctx.registry.get(id).await {
        let data = serde_json::to_value(&snapshot)
            .map_err(|e| ChatmuxError::Other(e.to_string()))?;
        return Ok(Some(mark_running(data, true)));
    }

    match ctx.store.load(id).await.map_err(SessionError::from)? {
        Some(record) => {
            let data = serde_json::to_value(&record)
                .map_err(|e| ChatmuxError::Other(e.to_string()))?;
            Ok(Some(mark_running(data, false)))
        }
        None => Ok(None),
    }
}

fn mark_running(mut data: serde_json::Value, running: bool) -> serde_json::Value {
    if let Some(map) = data.as_object_mut() {
        map.insert("running".to_string(), serde_json::Value::Bool(running));
    }
    data
}
