//! Shared harness for the session lifecycle integration tests.
//!
//! Everything runs against the in-memory store and the scripted transport,
//! so tests are deterministic and need no external services. Backoff and
//! pairing timeouts are shrunk to keep the suite fast.

#![allow(dead_code)]

use async_trait::async_trait;
use chatmux_core::config::WhatsappConfig;
use chatmux_core::transport::ScriptedTransport;
use chatmux_core::{MemorySessionStore, SessionRecord, SessionStatus, SessionStore, StoreError};
use chatmux_server::subsystems::broadcaster::Broadcaster;
use chatmux_server::subsystems::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Production defaults with millisecond backoff and a one-second pairing
/// window.
pub fn fast_config() -> WhatsappConfig {
    WhatsappConfig {
        max_retries: 3,
        backoff_base_ms: 2,
        backoff_max_ms: 10,
        pairing_timeout_seconds: 1,
        stop_timeout_seconds: 2,
        ..WhatsappConfig::default()
    }
}

/// Store whose loads and saves take a while, so per-id operations hold the
/// registry's serialization point long enough to race others against them.
struct SlowStore {
    inner: Arc<MemorySessionStore>,
    delay: Duration,
}

#[async_trait]
impl SessionStore for SlowStore {
    async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.load_all().await
    }

    async fn load(&self, id: i32) -> Result<Option<SessionRecord>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(id).await
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(record).await
    }

    async fn delete(&self, id: i32) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }
}

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<MemorySessionStore>,
    pub transport: Arc<ScriptedTransport>,
    pub broadcaster: Arc<Broadcaster>,
}

impl Harness {
    pub fn with_records(
        records: impl IntoIterator<Item = SessionRecord>,
        config: WhatsappConfig,
    ) -> Self {
        let store = Arc::new(MemorySessionStore::with_records(records));
        Self::build(Arc::clone(&store) as Arc<dyn SessionStore>, store, config)
    }

    /// Like [`Harness::with_records`], but every record load/save sleeps for
    /// `delay` first. `store` still reads the backing records directly.
    pub fn with_slow_records(
        records: impl IntoIterator<Item = SessionRecord>,
        config: WhatsappConfig,
        delay: Duration,
    ) -> Self {
        let inner = Arc::new(MemorySessionStore::with_records(records));
        let slow = Arc::new(SlowStore {
            inner: Arc::clone(&inner),
            delay,
        });
        Self::build(slow, inner, config)
    }

    fn build(
        registry_store: Arc<dyn SessionStore>,
        store: Arc<MemorySessionStore>,
        config: WhatsappConfig,
    ) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        let broadcaster = Arc::new(Broadcaster::new(64));
        let registry = Arc::new(SessionRegistry::new(
            registry_store,
            Arc::clone(&broadcaster),
            Arc::clone(&transport) as Arc<dyn chatmux_core::transport::Transport>,
            config,
        ));
        Self {
            registry,
            store,
            transport,
            broadcaster,
        }
    }

    /// Poll the persisted record until `pred` holds, panicking on timeout.
    pub async fn wait_for_record(
        &self,
        id: i32,
        timeout: Duration,
        pred: impl Fn(&SessionRecord) -> bool,
    ) -> SessionRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.store.load(id).await.unwrap() {
                if pred(&record) {
                    return record;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("session {id} did not reach the expected state within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_status(
        &self,
        id: i32,
        status: SessionStatus,
        timeout: Duration,
    ) -> SessionRecord {
        self.wait_for_record(id, timeout, |r| r.status == status)
            .await
    }
}

/// Poll an arbitrary condition, panicking on timeout.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
