use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ChatmuxConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub whatsapp: WhatsappConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub autoclose: AutoCloseConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// "postgres" (default) or "memory" for credential-less dev mode.
    #[serde(default = "default_db_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Tuning for the connection-client state machine and the registry.
#[derive(Debug, Deserialize, Clone)]
pub struct WhatsappConfig {
    /// Consecutive failed connection attempts before the client settles in
    /// Disconnected and waits for an explicit restart.
    pub max_retries: u32,
    /// First reconnect delay; subsequent delays grow exponentially.
    pub backoff_base_ms: u64,
    /// Upper bound on any single reconnect delay.
    pub backoff_max_ms: u64,
    /// How long an issued QR/pairing code stays valid before the client
    /// gives up on the pairing attempt.
    pub pairing_timeout_seconds: u64,
    /// How long `stop` waits for a client task to acknowledge cancellation
    /// before aborting it.
    pub stop_timeout_seconds: u64,
    /// Worker-pool width for bringing persisted sessions up at boot.
    pub startup_concurrency: usize,
    /// Grace period for stopping all clients at process shutdown.
    pub shutdown_grace_seconds: u64,
    /// Broadcast channel capacity for lifecycle/message events.
    pub event_capacity: usize,
}

impl Default for WhatsappConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 30_000,
            pairing_timeout_seconds: 60,
            stop_timeout_seconds: 5,
            startup_concurrency: 4,
            shutdown_grace_seconds: 10,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Protocol backend. "loopback" is the in-process dev backend; the real
    /// protocol bridge registers under its own name.
    pub backend: String,
    /// Loopback only: delay before a issued credential auto-confirms.
    pub auto_confirm_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: "loopback".to_string(),
            auto_confirm_ms: 1500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutoCloseConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Tickets idle for at least this long are closed by the sweep.
    pub idle_threshold_minutes: i64,
}

impl Default for AutoCloseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            idle_threshold_minutes: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8770,
        }
    }
}

impl ChatmuxConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}
