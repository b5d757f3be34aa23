//! Boot-time bring-up of every persisted session.
//!
//! Starts each record through the registry with a bounded worker pool so a
//! fleet of sessions does not stampede the remote network, and so one bad
//! record (corrupt credential, immediate handshake failure) never delays or
//! blocks the others. Startup always completes.

use super::registry::SessionRegistry;
use chatmux_core::SessionStore;
use futures::StreamExt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct StartupReport {
    pub started: usize,
    pub failed: usize,
}

pub async fn start_all_sessions(
    registry: Arc<SessionRegistry>,
    store: Arc<dyn SessionStore>,
    concurrency: usize,
) -> anyhow::Result<StartupReport> {
    let records = store.load_all().await?;
    let total = records.len();
    tracing::info!(total, concurrency, "bringing persisted sessions up");

    let results: Vec<bool> = futures::stream::iter(records)
        .map(|record| {
            let registry = Arc::clone(&registry);
            async move {
                match registry.start(record.id).await {
                    Ok(snapshot) => {
                        tracing::debug!(
                            session_id = record.id,
                            status = %snapshot.status,
                            "session started"
                        );
                        true
                    }
                    Err(err) => {
                        tracing::error!(
                            session_id = record.id,
                            error = %err,
                            "failed to start session; continuing with the rest"
                        );
                        false
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let started = results.iter().filter(|ok| **ok).count();
    let report = StartupReport {
        started,
        failed: total - started,
    };
    tracing::info!(started = report.started, failed = report.failed, "startup complete");
    Ok(report)
}
