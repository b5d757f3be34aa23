use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection-lifecycle state of one WhatsApp session. Persisted as text and
/// mirrored live through the registry's watch channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Pairing,
    Connected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Pairing => "PAIRING",
            SessionStatus::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCONNECTED" => Ok(SessionStatus::Disconnected),
            "CONNECTING" => Ok(SessionStatus::Connecting),
            "PAIRING" => Ok(SessionStatus::Pairing),
            "CONNECTED" => Ok(SessionStatus::Connected),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Persisted configuration and last-known state of one tenant device
/// connection. Status fields are written only by the owning connection
/// client; deletion happens through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i32,
    pub company_id: i32,
    pub name: String,
    pub status: SessionStatus,
    /// Transient pairing payload; empty outside the pairing phase.
    pub qrcode: String,
    /// Numeric pairing alternative to the QR code.
    pub pairing_code: Option<String>,
    /// Consecutive failed connection attempts since the last success.
    pub retries: i32,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: i32, company_id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            company_id,
            name: name.into(),
            status: SessionStatus::Disconnected,
            qrcode: String::new(),
            pairing_code: None,
            retries: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether a pairing payload is currently held. The UI closes its pairing
    /// prompt when this flips back to false.
    pub fn has_pairing_payload(&self) -> bool {
        !self.qrcode.is_empty() || self.pairing_code.is_some()
    }
}
