//! Opaque protocol transport boundary.
//!
//! The session layer never speaks the wire protocol itself — it reacts to
//! the event stream a [`TransportConnection`] reports. Backends:
//! - **loopback** — in-process simulator for dev mode: issues a synthetic
//!   QR + pairing code, auto-confirms after a configurable delay, and
//!   remembers paired sessions so later connects reuse the credential.
//! - **scripted** — deterministic test double ([`ScriptedTransport`]) with
//!   per-connect plans, live event injection, and concurrency counters.

use crate::config::TransportConfig;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Inbound events a live connection reports to its owning client.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A pairing credential was issued; the end user must confirm it.
    CredentialIssued {
        qrcode: String,
        pairing_code: Option<String>,
    },
    /// The remote device confirmed the credential (or a stored credential
    /// was accepted on reconnect).
    Paired,
    MessageReceived { body: serde_json::Value },
    /// The connection dropped. `fatal` marks remote logout/ban — conditions
    /// the client must not retry automatically.
    ConnectionLost { fatal: bool, reason: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("remote rejected the session: {0}")]
    Fatal(String),

    #[error("unknown transport backend: {0}")]
    UnknownBackend(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        session_id: i32,
    ) -> Result<Box<dyn TransportConnection>, TransportError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
pub trait TransportConnection: Send {
    /// Next inbound event. `None` means the stream ended — the client treats
    /// that as a non-fatal connection loss.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    async fn send_message(&mut self, body: serde_json::Value) -> Result<(), TransportError>;

    async fn disconnect(&mut self);
}

pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match config.backend.as_str() {
        "loopback" => Ok(Arc::new(LoopbackTransport::new(Duration::from_millis(
            config.auto_confirm_ms,
        )))),
        other => Err(TransportError::UnknownBackend(other.to_string())),
    }
}

// ============================================================================
// Loopback backend
// ============================================================================

pub struct LoopbackTransport {
    auto_confirm: Duration,
    paired: Arc<Mutex<HashSet<i32>>>,
}

impl LoopbackTransport {
    pub fn new(auto_confirm: Duration) -> Self {
        Self {
            auto_confirm,
            paired: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        session_id: i32,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let has_credential = self.paired.lock().unwrap().contains(&session_id);
        let mut pending = VecDeque::new();
        if has_credential {
            pending.push_back(TransportEvent::Paired);
        } else {
            let token = Uuid::new_v4();
            let code = (token.as_u128() % 100_000_000) as u32;
            pending.push_back(TransportEvent::CredentialIssued {
                qrcode: format!("2@{token}"),
                pairing_code: Some(format!("{:04}-{:04}", code / 10_000, code % 10_000)),
            });
        }
        Ok(Box::new(LoopbackConnection {
            session_id,
            pending,
            awaiting_confirm: !has_credential,
            auto_confirm: self.auto_confirm,
            paired: Arc::clone(&self.paired),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

struct LoopbackConnection {
    session_id: i32,
    pending: VecDeque<TransportEvent>,
    awaiting_confirm: bool,
    auto_confirm: Duration,
    paired: Arc<Mutex<HashSet<i32>>>,
    closed: bool,
}

#[async_trait]
impl TransportConnection for LoopbackConnection {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.awaiting_confirm {
            // The "end user" scans the code after a short delay.
            tokio::time::sleep(self.auto_confirm).await;
            self.awaiting_confirm = false;
            self.paired.lock().unwrap().insert(self.session_id);
            return Some(TransportEvent::Paired);
        }
        // Connected and quiet: stay open until disconnected.
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn send_message(&mut self, body: serde_json::Value) -> Result<(), TransportError> {
        tracing::debug!(session_id = self.session_id, %body, "loopback message discarded");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.closed = true;
    }
}

// ============================================================================
// Scripted backend (tests)
// ============================================================================

/// What a single `connect` call should do.
#[derive(Debug)]
pub enum ConnectPlan {
    Fail(TransportError),
    /// Deliver these events in order, then stay open for live injection.
    Events(Vec<TransportEvent>),
}

/// Deterministic transport for exercising the connection state machine.
///
/// Each `connect` for a session consumes that session's next [`ConnectPlan`];
/// with none queued the handshake fails. Counters expose how many connects
/// happened and the peak number of simultaneously open connections, which is
/// how tests prove the registry never runs two clients for one session.
#[derive(Default)]
pub struct ScriptedTransport {
    plans: Mutex<HashMap<i32, VecDeque<ConnectPlan>>>,
    live: Mutex<HashMap<i32, Vec<mpsc::UnboundedSender<TransportEvent>>>>,
    connects: AtomicUsize,
    counters: Arc<ActiveCounters>,
}

#[derive(Default)]
struct ActiveCounters {
    active: AtomicUsize,
    max_active: AtomicUsize,
    per_session: Mutex<HashMap<i32, usize>>,
    max_per_session: Mutex<HashMap<i32, usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, session_id: i32, plan: ConnectPlan) {
        self.plans
            .lock()
            .unwrap()
            .entry(session_id)
            .or_default()
            .push_back(plan);
    }

    /// Inject an event into the session's most recently opened connection.
    pub fn push_live(&self, session_id: i32, event: TransportEvent) {
        let live = self.live.lock().unwrap();
        if let Some(sender) = live.get(&session_id).and_then(|v| v.last()) {
            let _ = sender.send(event);
        }
    }

    /// Drop all live senders — every open connection sees its stream end.
    pub fn end_all_streams(&self) {
        self.live.lock().unwrap().clear();
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    pub fn max_active_for(&self, session_id: i32) -> usize {
        *self
            .counters
            .max_per_session
            .lock()
            .unwrap()
            .get(&session_id)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        session_id: i32,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&session_id)
            .and_then(|queue| queue.pop_front());
        let events = match plan {
            Some(ConnectPlan::Fail(err)) => return Err(err),
            Some(ConnectPlan::Events(events)) => events,
            None => return Err(TransportError::Handshake("no scripted plan".to_string())),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.live
            .lock()
            .unwrap()
            .entry(session_id)
            .or_default()
            .push(tx);

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        {
            let mut per = self.counters.per_session.lock().unwrap();
            let count = per.entry(session_id).or_insert(0);
            *count += 1;
            let mut max_per = self.counters.max_per_session.lock().unwrap();
            let max = max_per.entry(session_id).or_insert(0);
            *max = (*max).max(*count);
        }

        Ok(Box::new(ScriptedConnection {
            scripted: events.into(),
            rx,
            _guard: ActiveGuard {
                session_id,
                counters: Arc::clone(&self.counters),
            },
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Decrements the open-connection counters when the connection drops,
/// however it drops.
struct ActiveGuard {
    session_id: i32,
    counters: Arc<ActiveCounters>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        let mut per = self.counters.per_session.lock().unwrap();
        if let Some(count) = per.get_mut(&self.session_id) {
            *count = count.saturating_sub(1);
        }
    }
}

struct ScriptedConnection {
    scripted: VecDeque<TransportEvent>,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    _guard: ActiveGuard,
}

#[async_trait]
impl TransportConnection for ScriptedConnection {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.scripted.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    async fn send_message(&mut self, _body: serde_json::Value) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.rx.close();
    }
}
