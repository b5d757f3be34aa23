//! Persistence boundary for session records and the auto-close ticket sweep.
//!
//! Both stores are traits so the server can run against Postgres in
//! production and against the in-memory implementations in tests and
//! credential-less dev mode.

use crate::error::StoreError;
use crate::models::{SessionRecord, SessionStatus, Ticket, TicketStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError>;
    async fn load(&self, id: i32) -> Result<Option<SessionRecord>, StoreError>;
    /// Upsert — the record id is caller-assigned.
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn delete(&self, id: i32) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Open tickets whose last activity is at least `idle_for` in the past.
    async fn find_open_idle(&self, idle_for: Duration) -> Result<Vec<Ticket>, StoreError>;
    /// Close a ticket if it is still open. Returns whether this call
    /// actually closed it, so overlapping sweeps cannot double-count.
    async fn close(&self, id: i32) -> Result<bool, StoreError>;
}

// ============================================================================
// Postgres implementations
// ============================================================================

type SessionRow = (
    i32,
    i32,
    String,
    String,
    String,
    Option<String>,
    i32,
    DateTime<Utc>,
);

fn record_from_row(row: SessionRow) -> SessionRecord {
    let (id, company_id, name, status, qrcode, pairing_code, retries, updated_at) = row;
    let status = status.parse::<SessionStatus>().unwrap_or_else(|e| {
        tracing::warn!(session_id = id, "{e}; treating as DISCONNECTED");
        SessionStatus::Disconnected
    });
    SessionRecord {
        id,
        company_id,
        name,
        status,
        qrcode,
        pairing_code,
        retries,
        updated_at,
    }
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, company_id, name, status, qrcode, pairing_code, retries, updated_at
            FROM whatsapps
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(record_from_row).collect())
    }

    async fn load(&self, id: i32) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, company_id, name, status, qrcode, pairing_code, retries, updated_at
            FROM whatsapps
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(record_from_row))
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO whatsapps (id, company_id, name, status, qrcode, pairing_code, retries, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                qrcode = EXCLUDED.qrcode,
                pairing_code = EXCLUDED.pairing_code,
                retries = EXCLUDED.retries,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id)
        .bind(record.company_id)
        .bind(&record.name)
        .bind(record.status.as_str())
        .bind(&record.qrcode)
        .bind(&record.pairing_code)
        .bind(record.retries)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: i32) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM whatsapps WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn find_open_idle(&self, idle_for: Duration) -> Result<Vec<Ticket>, StoreError> {
        let cutoff = Utc::now() - idle_for;
        let rows = sqlx::query_as::<_, (i32, i32, String, DateTime<Utc>)>(
            r#"
            SELECT id, company_id, status, last_message_at
            FROM tickets
            WHERE status = 'open' AND last_message_at <= $1
            ORDER BY last_message_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, company_id, status, last_message_at)| Ticket {
                id,
                company_id,
                status: status.parse().unwrap_or(TicketStatus::Open),
                last_message_at,
            })
            .collect())
    }

    async fn close(&self, id: i32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tickets SET status = 'closed', updated_at = NOW() WHERE id = $1 AND status = 'open'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// In-memory implementations (tests, dev mode)
// ============================================================================

#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<i32, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = SessionRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().unwrap();
            for record in records {
                map.insert(record.id, record);
            }
        }
        store
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let map = self.records.lock().unwrap();
        let mut records: Vec<_> = map.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn load(&self, id: i32) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: i32) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTicketStore {
    tickets: Mutex<HashMap<i32, Ticket>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ticket: Ticket) {
        self.tickets.lock().unwrap().insert(ticket.id, ticket);
    }

    pub fn status_of(&self, id: i32) -> Option<TicketStatus> {
        self.tickets.lock().unwrap().get(&id).map(|t| t.status)
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn find_open_idle(&self, idle_for: Duration) -> Result<Vec<Ticket>, StoreError> {
        let cutoff = Utc::now() - idle_for;
        let map = self.tickets.lock().unwrap();
        let mut idle: Vec<_> = map
            .values()
            .filter(|t| t.status == TicketStatus::Open && t.last_message_at <= cutoff)
            .cloned()
            .collect();
        idle.sort_by_key(|t| t.last_message_at);
        Ok(idle)
    }

    async fn close(&self, id: i32) -> Result<bool, StoreError> {
        let mut map = self.tickets.lock().unwrap();
        match map.get_mut(&id) {
            Some(ticket) if ticket.status == TicketStatus::Open => {
                ticket.status = TicketStatus::Closed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_session_store_upserts_and_deletes() {
        let store = MemorySessionStore::new();
        let mut record = SessionRecord::new(1, 1, "main");
        store.save(&record).await.unwrap();

        record.status = SessionStatus::Connected;
        store.save(&record).await.unwrap();

        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Connected);
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        store.delete(1).await.unwrap();
        assert!(store.load(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_threshold_is_inclusive() {
        let store = MemoryTicketStore::new();
        let threshold = Duration::minutes(30);
        store.insert(Ticket {
            id: 1,
            company_id: 1,
            status: TicketStatus::Open,
            last_message_at: Utc::now() - threshold,
        });
        store.insert(Ticket {
            id: 2,
            company_id: 1,
            status: TicketStatus::Open,
            last_message_at: Utc::now() - threshold + Duration::seconds(1),
        });

        let idle = store.find_open_idle(threshold).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, 1);
    }

    #[tokio::test]
    async fn close_is_effective_exactly_once() {
        let store = MemoryTicketStore::new();
        store.insert(Ticket {
            id: 5,
            company_id: 1,
            status: TicketStatus::Open,
            last_message_at: Utc::now() - Duration::hours(1),
        });

        assert!(store.close(5).await.unwrap());
        assert!(!store.close(5).await.unwrap());
        assert_eq!(store.status_of(5), Some(TicketStatus::Closed));
    }
}
