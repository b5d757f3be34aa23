//! Auto-close sweep: transitions idle open conversations to closed.
//!
//! Runs on a fixed interval. The sweep executes inline in the select loop,
//! so two runs can never overlap; missed ticks are skipped rather than
//! bursted. Closing is conditional on the ticket still being open, so a
//! ticket is closed at most once even across process restarts.

use chatmux_core::config::AutoCloseConfig;
use chatmux_core::{StoreError, TicketStore};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub closed: usize,
}

pub async fn run_autoclose_loop(
    tickets: Arc<dyn TicketStore>,
    config: AutoCloseConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(config.interval_seconds);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_seconds = config.interval_seconds,
        idle_threshold_minutes = config.idle_threshold_minutes,
        "auto-close loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_sweep(tickets.as_ref(), &config).await {
                    Ok(report) if report.closed > 0 => {
                        tracing::info!(
                            scanned = report.scanned,
                            closed = report.closed,
                            "auto-close sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "auto-close sweep failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("auto-close loop shutting down");
                break;
            }
        }
    }
}

/// One sweep over the ticket store. A ticket idle for exactly the threshold
/// is closed; one second less is not (the store's cutoff is inclusive).
pub async fn run_sweep(
    tickets: &dyn TicketStore,
    config: &AutoCloseConfig,
) -> Result<SweepReport, StoreError> {
    let threshold = ChronoDuration::minutes(config.idle_threshold_minutes);
    let idle = tickets.find_open_idle(threshold).await?;

    let mut report = SweepReport {
        scanned: idle.len(),
        closed: 0,
    };
    for ticket in &idle {
        if tickets.close(ticket.id).await? {
            report.closed += 1;
            tracing::debug!(ticket_id = ticket.id, company_id = ticket.company_id, "ticket closed");
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmux_core::models::{Ticket, TicketStatus};
    use chatmux_core::MemoryTicketStore;
    use chrono::Utc;

    fn idle_ticket(id: i32, idle_minutes: i64) -> Ticket {
        Ticket {
            id,
            company_id: 1,
            status: TicketStatus::Open,
            last_message_at: Utc::now() - ChronoDuration::minutes(idle_minutes),
        }
    }

    #[tokio::test]
    async fn sweep_closes_only_tickets_past_the_threshold() {
        let store = MemoryTicketStore::new();
        store.insert(idle_ticket(1, 45));
        store.insert(idle_ticket(2, 10));

        let config = AutoCloseConfig {
            idle_threshold_minutes: 30,
            ..AutoCloseConfig::default()
        };
        let report = run_sweep(&store, &config).await.unwrap();

        assert_eq!(report.closed, 1);
        assert_eq!(store.status_of(1), Some(TicketStatus::Closed));
        assert_eq!(store.status_of(2), Some(TicketStatus::Open));
    }

    #[tokio::test]
    async fn repeated_sweeps_never_double_close() {
        let store = MemoryTicketStore::new();
        store.insert(idle_ticket(7, 120));
        let config = AutoCloseConfig {
            idle_threshold_minutes: 30,
            ..AutoCloseConfig::default()
        };

        let first = run_sweep(&store, &config).await.unwrap();
        let second = run_sweep(&store, &config).await.unwrap();
        assert_eq!(first.closed, 1);
        assert_eq!(second.closed, 0);
    }

    #[tokio::test]
    async fn loop_sweeps_immediately_and_honors_shutdown() {
        let store = Arc::new(MemoryTicketStore::new());
        store.insert(idle_ticket(1, 90));
        let config = AutoCloseConfig {
            idle_threshold_minutes: 30,
            interval_seconds: 3600,
            ..AutoCloseConfig::default()
        };

        let (tx, rx) = broadcast::channel(1);
        let tickets: Arc<dyn TicketStore> = store.clone();
        let task = tokio::spawn(run_autoclose_loop(tickets, config, rx));

        // The first tick fires immediately; the idle ticket is closed.
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        while store.status_of(1) != Some(TicketStatus::Closed) {
            assert!(tokio::time::Instant::now() < deadline, "first sweep never ran");
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }

        tx.send(()).unwrap();
        tokio::time::timeout(tokio::time::Duration::from_secs(2), task)
            .await
            .expect("loop ignored shutdown")
            .unwrap();
    }
}
