//! Connection client: one long-lived task driving the lifecycle of a single
//! WhatsApp session.
//!
//! State machine: `DISCONNECTED → CONNECTING → {PAIRING, CONNECTED} →
//! DISCONNECTED`, with automatic reconnects (bounded, backed off) after
//! unexpected losses. Every transition persists the record first and then
//! publishes the matching event, so subscribers always observe the persisted
//! state. All failures stay inside this task: they are logged, persisted into
//! `status`/`retries`, broadcast — and never cross to other sessions.

use super::broadcaster::Broadcaster;
use chatmux_core::config::WhatsappConfig;
use chatmux_core::transport::{Transport, TransportConnection, TransportError, TransportEvent};
use chatmux_core::{
    Event, InboundMessage, SessionChange, SessionError, SessionRecord, SessionStatus, SessionStore,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Point-in-time view of a live client, mirrored through a watch channel so
/// `get` never has to touch the client task.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub session_id: i32,
    pub company_id: i32,
    pub name: String,
    pub status: SessionStatus,
    pub qrcode: String,
    pub pairing_code: Option<String>,
    pub retries: i32,
}

impl From<&SessionRecord> for ClientSnapshot {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.id,
            company_id: record.company_id,
            name: record.name.clone(),
            status: record.status,
            qrcode: record.qrcode.clone(),
            pairing_code: record.pairing_code.clone(),
            retries: record.retries,
        }
    }
}

/// Registry-held handle to a spawned client. Dropping the handle does not
/// stop the task; only [`ClientHandle::stop`] (or process shutdown) does.
pub struct ClientHandle {
    pub session_id: i32,
    pub company_id: i32,
    cancel: CancellationToken,
    state_rx: watch::Receiver<ClientSnapshot>,
    join: JoinHandle<()>,
}

impl ClientHandle {
    pub fn snapshot(&self) -> ClientSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientSnapshot> {
        self.state_rx.clone()
    }

    /// Cancel the client and wait for it to release its transport. Tasks that
    /// miss the deadline are aborted — a stopped session must not keep
    /// emitting events after this returns.
    pub async fn stop(self, timeout: Duration) {
        self.cancel.cancel();
        let abort = self.join.abort_handle();
        if tokio::time::timeout(timeout, self.join).await.is_err() {
            tracing::warn!(
                session_id = self.session_id,
                "client ignored cancellation; aborting"
            );
            abort.abort();
        }
    }
}

enum LoopOutcome {
    /// Explicit stop: transport released, Stopped event published.
    Cancelled,
    /// Max retries exceeded or fatal transport condition: the client stays
    /// registered in Disconnected until an explicit restart.
    Settled,
}

enum ConnOutcome {
    Lost(String),
    Fatal(String),
    PairingExpired,
    Cancelled,
}

enum Recovery {
    Retry,
    Settle,
    Cancelled,
}

/// Which event a transition publishes alongside the persisted record.
#[derive(Clone, Copy)]
enum ChangeKind {
    Updated,
    PairingCleared,
    Stopped,
}

pub struct ConnectionClient {
    record: SessionRecord,
    store: Arc<dyn SessionStore>,
    broadcaster: Arc<Broadcaster>,
    transport: Arc<dyn Transport>,
    config: WhatsappConfig,
    cancel: CancellationToken,
    state_tx: watch::Sender<ClientSnapshot>,
}

impl ConnectionClient {
    /// Spawn the client task for `record` and hand back the registry handle.
    pub fn spawn(
        record: SessionRecord,
        store: Arc<dyn SessionStore>,
        broadcaster: Arc<Broadcaster>,
        transport: Arc<dyn Transport>,
        config: WhatsappConfig,
    ) -> ClientHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ClientSnapshot::from(&record));
        let session_id = record.id;
        let company_id = record.company_id;

        let client = ConnectionClient {
            record,
            store,
            broadcaster,
            transport,
            config,
            cancel: cancel.clone(),
            state_tx,
        };
        let join = tokio::spawn(client.run());

        ClientHandle {
            session_id,
            company_id,
            cancel,
            state_rx,
            join,
        }
    }

    async fn run(mut self) {
        self.broadcaster.publish(Event::session(
            self.record.company_id,
            SessionChange::Started {
                record: self.record.clone(),
            },
        ));

        match self.drive().await {
            LoopOutcome::Cancelled => {
                self.record.qrcode.clear();
                self.record.pairing_code = None;
                self.transition(SessionStatus::Disconnected, ChangeKind::Stopped)
                    .await;
                tracing::info!(session_id = self.record.id, "client stopped");
            }
            LoopOutcome::Settled => {
                tracing::info!(
                    session_id = self.record.id,
                    retries = self.record.retries,
                    "client settled in DISCONNECTED; restart required"
                );
            }
        }
    }

    async fn drive(&mut self) -> LoopOutcome {
        loop {
            if self.cancel.is_cancelled() {
                return LoopOutcome::Cancelled;
            }

            self.transition(SessionStatus::Connecting, ChangeKind::Updated)
                .await;

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return LoopOutcome::Cancelled,
                result = self.transport.connect(self.record.id) => result,
            };

            let mut conn = match connected {
                Ok(conn) => conn,
                Err(err @ TransportError::Fatal(_)) => {
                    let err = SessionError::from(err);
                    tracing::warn!(
                        session_id = self.record.id,
                        error = %err,
                        "fatal transport condition; not retrying"
                    );
                    self.transition(SessionStatus::Disconnected, ChangeKind::Updated)
                        .await;
                    return LoopOutcome::Settled;
                }
                Err(err) => {
                    let err = SessionError::from(err);
                    tracing::warn!(session_id = self.record.id, error = %err, "handshake failed");
                    match self.recover(ChangeKind::Updated).await {
                        Recovery::Retry => continue,
                        Recovery::Settle => return LoopOutcome::Settled,
                        Recovery::Cancelled => return LoopOutcome::Cancelled,
                    }
                }
            };

            let outcome = self.drive_connection(conn.as_mut()).await;
            conn.disconnect().await;
            drop(conn);

            match outcome {
                ConnOutcome::Cancelled => return LoopOutcome::Cancelled,
                ConnOutcome::Fatal(reason) => {
                    tracing::warn!(
                        session_id = self.record.id,
                        %reason,
                        "remote ended the session; re-pairing required"
                    );
                    self.record.qrcode.clear();
                    self.record.pairing_code = None;
                    self.transition(SessionStatus::Disconnected, ChangeKind::Updated)
                        .await;
                    return LoopOutcome::Settled;
                }
                ConnOutcome::PairingExpired => {
                    tracing::info!(
                        session_id = self.record.id,
                        error = %SessionError::PairingExpired,
                        "a fresh credential is issued on the next attempt"
                    );
                    self.record.qrcode.clear();
                    self.record.pairing_code = None;
                    match self.recover(ChangeKind::PairingCleared).await {
                        Recovery::Retry => continue,
                        Recovery::Settle => return LoopOutcome::Settled,
                        Recovery::Cancelled => return LoopOutcome::Cancelled,
                    }
                }
                ConnOutcome::Lost(reason) => {
                    tracing::info!(session_id = self.record.id, %reason, "connection lost");
                    match self.recover(ChangeKind::Updated).await {
                        Recovery::Retry => continue,
                        Recovery::Settle => return LoopOutcome::Settled,
                        Recovery::Cancelled => return LoopOutcome::Cancelled,
                    }
                }
            }
        }
    }

    /// React to transport events until the connection ends one way or another.
    async fn drive_connection(&mut self, conn: &mut dyn TransportConnection) -> ConnOutcome {
        let mut pairing_deadline: Option<tokio::time::Instant> = None;

        loop {
            let event = if let Some(deadline) = pairing_deadline {
                tokio::select! {
                    _ = self.cancel.cancelled() => return ConnOutcome::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => return ConnOutcome::PairingExpired,
                    event = conn.next_event() => event,
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return ConnOutcome::Cancelled,
                    event = conn.next_event() => event,
                }
            };

            match event {
                Some(TransportEvent::CredentialIssued {
                    qrcode,
                    pairing_code,
                }) => {
                    self.record.qrcode = qrcode;
                    self.record.pairing_code = pairing_code;
                    self.transition(SessionStatus::Pairing, ChangeKind::Updated)
                        .await;
                    pairing_deadline = Some(
                        tokio::time::Instant::now()
                            + Duration::from_secs(self.config.pairing_timeout_seconds),
                    );
                }
                Some(TransportEvent::Paired) => {
                    let was_pairing = self.record.has_pairing_payload();
                    self.record.qrcode.clear();
                    self.record.pairing_code = None;
                    self.record.retries = 0;
                    pairing_deadline = None;
                    let kind = if was_pairing {
                        // Payload went non-empty → empty: the UI closes its
                        // pairing prompt on exactly this event.
                        ChangeKind::PairingCleared
                    } else {
                        ChangeKind::Updated
                    };
                    self.transition(SessionStatus::Connected, kind).await;
                }
                Some(TransportEvent::MessageReceived { body }) => {
                    self.broadcaster.publish(Event::Message {
                        session_id: self.record.id,
                        company_id: self.record.company_id,
                        message: InboundMessage {
                            id: Uuid::new_v4(),
                            received_at: Utc::now(),
                            body,
                        },
                    });
                }
                Some(TransportEvent::ConnectionLost { fatal: true, reason }) => {
                    return ConnOutcome::Fatal(reason)
                }
                Some(TransportEvent::ConnectionLost {
                    fatal: false,
                    reason,
                }) => return ConnOutcome::Lost(reason),
                None => return ConnOutcome::Lost("transport stream ended".to_string()),
            }
        }
    }

    /// Count a failed attempt, settle if the budget is spent, otherwise wait
    /// out the backoff delay (interruptible by cancellation).
    async fn recover(&mut self, kind: ChangeKind) -> Recovery {
        self.record.retries += 1;
        self.transition(SessionStatus::Disconnected, kind).await;

        if self.record.retries as u32 >= self.config.max_retries {
            let err = SessionError::MaxRetriesExceeded {
                id: self.record.id,
                attempts: self.record.retries as u32,
            };
            tracing::warn!(
                session_id = self.record.id,
                error = %err,
                max_retries = self.config.max_retries,
                "settling until an explicit restart"
            );
            return Recovery::Settle;
        }

        let delay = reconnect_delay(&self.config, self.record.retries as u32);
        tracing::debug!(
            session_id = self.record.id,
            delay_ms = delay.as_millis() as u64,
            "backing off before reconnect"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Recovery::Cancelled,
            _ = tokio::time::sleep(delay) => Recovery::Retry,
        }
    }

    /// Persist the new status, refresh the watch snapshot, publish the event —
    /// in that order, so the event always reflects the persisted state.
    async fn transition(&mut self, status: SessionStatus, kind: ChangeKind) {
        self.record.status = status;
        self.record.updated_at = Utc::now();

        if let Err(err) = self.store.save(&self.record).await {
            // The session keeps running on a persistence hiccup; the next
            // transition retries the write.
            tracing::error!(session_id = self.record.id, error = %err, "failed to persist status");
        }

        let _ = self.state_tx.send(ClientSnapshot::from(&self.record));

        let change = match kind {
            ChangeKind::Updated => SessionChange::Updated {
                record: self.record.clone(),
            },
            ChangeKind::PairingCleared => SessionChange::PairingCleared {
                record: self.record.clone(),
            },
            ChangeKind::Stopped => SessionChange::Stopped {
                record: self.record.clone(),
            },
        };
        self.broadcaster
            .publish(Event::session(self.record.company_id, change));
    }
}

/// Un-jittered reconnect schedule: base, 2×base, 4×base, … capped at the
/// configured maximum. `retry` is 1-based (the retry about to happen).
pub(crate) fn backoff_schedule(config: &WhatsappConfig) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(config.backoff_base_ms.max(2) / 2)
        .max_delay(Duration::from_millis(config.backoff_max_ms))
}

/// Delay before reconnect attempt `retry`, with full jitter to spread
/// reconnect storms after a shared outage.
pub fn reconnect_delay(config: &WhatsappConfig, retry: u32) -> Duration {
    let nth = retry.saturating_sub(1) as usize;
    backoff_schedule(config)
        .nth(nth)
        .map(jitter)
        .unwrap_or_else(|| Duration::from_millis(config.backoff_max_ms))
}
