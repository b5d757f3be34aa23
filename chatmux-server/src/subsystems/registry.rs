//! Process-wide registry of live connection clients.
//!
//! Single source of truth for "which sessions are live", and the only
//! component allowed to create or destroy a client. Operations on one
//! session id are strictly serialized through a per-id gate; operations on
//! different ids never contend. A start or restart additionally marks the
//! slot, so only a competing start/restart fails fast with
//! `AlreadyStarting` — a start arriving during a stop or delete queues
//! behind it instead. The handle map itself is only locked for short,
//! await-free sections.

use super::broadcaster::Broadcaster;
use super::client::{ClientHandle, ClientSnapshot, ConnectionClient};
use chatmux_core::config::WhatsappConfig;
use chatmux_core::transport::Transport;
use chatmux_core::{Event, SessionChange, SessionError, SessionStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-id operation slot. `gate` serializes same-id operations; `starting`
/// marks an in-flight start/restart so competing starts can fail fast
/// instead of queueing.
#[derive(Default)]
struct OpSlot {
    gate: Mutex<()>,
    starting: AtomicBool,
}

/// Exclusive claim on the slot's start/restart role, released on drop.
struct StartingGuard(Arc<OpSlot>);

impl StartingGuard {
    fn acquire(slot: &Arc<OpSlot>) -> Option<Self> {
        slot.starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then(|| Self(Arc::clone(slot)))
    }
}

impl Drop for StartingGuard {
    fn drop(&mut self) {
        self.0.starting.store(false, Ordering::Release);
    }
}

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    broadcaster: Arc<Broadcaster>,
    transport: Arc<dyn Transport>,
    config: WhatsappConfig,
    sessions: Mutex<HashMap<i32, ClientHandle>>,
    op_slots: std::sync::Mutex<HashMap<i32, Arc<OpSlot>>>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        broadcaster: Arc<Broadcaster>,
        transport: Arc<dyn Transport>,
        config: WhatsappConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            transport,
            config,
            sessions: Mutex::new(HashMap::new()),
            op_slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn op_slot(&self, id: i32) -> Arc<OpSlot> {
        let mut slots = self.op_slots.lock().unwrap();
        Arc::clone(slots.entry(id).or_default())
    }

    #[cfg(test)]
    fn op_slot_count(&self) -> usize {
        self.op_slots.lock().unwrap().len()
    }

    /// Start the session's client. Idempotent: a live client is returned
    /// unchanged. A start queues behind a concurrent stop or delete for the
    /// same id; it errors with [`SessionError::AlreadyStarting`] only when
    /// another start or restart for the same id is in flight.
    pub async fn start(&self, id: i32) -> Result<ClientSnapshot, SessionError> {
        let slot = self.op_slot(id);
        let _starting =
            StartingGuard::acquire(&slot).ok_or(SessionError::AlreadyStarting(id))?;
        let _gate = slot.gate.lock().await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: i32) -> Result<ClientSnapshot, SessionError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(handle) = sessions.get(&id) {
                return Ok(handle.snapshot());
            }
        }

        let record = self
            .store
            .load(id)
            .await?
            .ok_or(SessionError::NotFound(id))?;

        tracing::info!(session_id = id, company_id = record.company_id, "starting session");
        let handle = ConnectionClient::spawn(
            record,
            Arc::clone(&self.store),
            Arc::clone(&self.broadcaster),
            Arc::clone(&self.transport),
            self.config.clone(),
        );
        let snapshot = handle.snapshot();
        self.sessions.lock().await.insert(id, handle);
        Ok(snapshot)
    }

    /// Stop the session's client, releasing its transport before returning.
    /// Stopping an absent session is a no-op.
    pub async fn stop(&self, id: i32) {
        let slot = self.op_slot(id);
        let _gate = slot.gate.lock().await;
        self.stop_locked(id).await;
    }

    async fn stop_locked(&self, id: i32) {
        let handle = self.sessions.lock().await.remove(&id);
        if let Some(handle) = handle {
            handle
                .stop(Duration::from_secs(self.config.stop_timeout_seconds))
                .await;
            tracing::info!(session_id = id, "session stopped");
        }
    }

    /// Stop then start as one atomic operation: the per-id gate is held
    /// across both phases, so no concurrent start can slip in between. Like
    /// [`SessionRegistry::start`], fails fast with `AlreadyStarting` when a
    /// competing start or restart is in flight.
    pub async fn restart(&self, id: i32) -> Result<ClientSnapshot, SessionError> {
        let slot = self.op_slot(id);
        let _starting =
            StartingGuard::acquire(&slot).ok_or(SessionError::AlreadyStarting(id))?;
        let _gate = slot.gate.lock().await;
        self.stop_locked(id).await;
        self.start_locked(id).await
    }

    /// Stop the client (if any), delete the persisted record, and announce
    /// the deletion.
    pub async fn delete(&self, id: i32) -> Result<(), SessionError> {
        let slot = self.op_slot(id);
        {
            let _gate = slot.gate.lock().await;
            self.stop_locked(id).await;
            let record = self.store.load(id).await?;
            self.store.delete(id).await?;
            let company_id = record.map(|r| r.company_id).unwrap_or_default();
            self.broadcaster
                .publish(Event::session(company_id, SessionChange::Deleted {
                    session_id: id,
                }));
            tracing::info!(session_id = id, "session deleted");
        }
        drop(slot);

        // The id is gone; drop its slot unless another operation still holds
        // a reference to it.
        let mut slots = self.op_slots.lock().unwrap();
        if slots.get(&id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&id);
        }
        Ok(())
    }

    /// Current state of one session, or `None` when it is not running.
    pub async fn get(&self, id: i32) -> Option<ClientSnapshot> {
        self.sessions.lock().await.get(&id).map(|h| h.snapshot())
    }

    /// Snapshots of every live session, ordered by id.
    pub async fn snapshots(&self) -> Vec<ClientSnapshot> {
        let sessions = self.sessions.lock().await;
        let mut all: Vec<_> = sessions.values().map(|h| h.snapshot()).collect();
        all.sort_by_key(|s| s.session_id);
        all
    }

    pub async fn running_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stop every live client in parallel within the grace period; stragglers
    /// are aborted by their handles.
    pub async fn shutdown_all(&self, grace: Duration) {
        let handles: Vec<ClientHandle> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "stopping all sessions");
        futures::future::join_all(handles.into_iter().map(|h| h.stop(grace))).await;
    }
}
