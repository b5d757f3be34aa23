//! Typed lifecycle and message events fanned out by the broadcaster.
//!
//! Subscribers pattern-match on the enum discriminants instead of comparing
//! string `action` fields. Events are ephemeral: never persisted, never
//! redelivered — a subscriber that missed one re-queries current state
//! through the registry.

use crate::models::SessionRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to a session. Each variant carries the record as persisted
/// at the moment the event was published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionChange {
    /// A connection client was registered and its state machine began.
    Started { record: SessionRecord },
    /// Status/qrcode/retries changed on a live session.
    Updated { record: SessionRecord },
    /// The pairing payload was consumed or abandoned — `record.qrcode` is
    /// empty again. Pairing UIs close their prompt on this.
    PairingCleared { record: SessionRecord },
    /// The client was stopped and released its transport.
    Stopped { record: SessionRecord },
    /// The session record itself was deleted.
    Deleted { session_id: i32 },
}

impl SessionChange {
    pub fn session_id(&self) -> i32 {
        match self {
            SessionChange::Started { record }
            | SessionChange::Updated { record }
            | SessionChange::PairingCleared { record }
            | SessionChange::Stopped { record } => record.id,
            SessionChange::Deleted { session_id } => *session_id,
        }
    }
}

/// An inbound message surfaced by the protocol transport. Payload is opaque
/// to the session layer; the ticketing subsystem interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    #[serde(rename = "whatsappSession")]
    Session {
        session_id: i32,
        company_id: i32,
        #[serde(flatten)]
        change: SessionChange,
    },
    #[serde(rename = "whatsapp")]
    Message {
        session_id: i32,
        company_id: i32,
        message: InboundMessage,
    },
}

impl Event {
    pub fn session(company_id: i32, change: SessionChange) -> Self {
        Event::Session {
            session_id: change.session_id(),
            company_id,
            change,
        }
    }

    pub fn session_id(&self) -> i32 {
        match self {
            Event::Session { session_id, .. } | Event::Message { session_id, .. } => *session_id,
        }
    }

    pub fn company_id(&self) -> i32 {
        match self {
            Event::Session { company_id, .. } | Event::Message { company_id, .. } => *company_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionRecord, SessionStatus};

    #[test]
    fn session_event_serializes_with_kind_and_action_tags() {
        let mut record = SessionRecord::new(3, 1, "sales");
        record.status = SessionStatus::Pairing;
        record.qrcode = "2@abc".to_string();

        let event = Event::session(1, SessionChange::Updated { record });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "whatsappSession");
        assert_eq!(json["action"], "updated");
        assert_eq!(json["sessionId"], 3);
        assert_eq!(json["record"]["qrcode"], "2@abc");
    }

    #[test]
    fn deleted_event_carries_the_id_without_a_record() {
        let event = Event::session(9, SessionChange::Deleted { session_id: 42 });
        assert_eq!(event.session_id(), 42);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "deleted");
        assert!(json.get("record").is_none());
    }

    #[test]
    fn message_event_round_trips() {
        let event = Event::Message {
            session_id: 5,
            company_id: 2,
            message: InboundMessage {
                id: Uuid::new_v4(),
                received_at: chrono::Utc::now(),
                body: serde_json::json!({"text": "hello"}),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id(), 5);
        assert_eq!(back.company_id(), 2);
    }
}
