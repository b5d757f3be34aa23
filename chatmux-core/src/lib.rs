pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ipc;
pub mod models;
pub mod store;
pub mod transport;

pub use config::ChatmuxConfig;
pub use error::{ChatmuxError, SessionError, StoreError};
pub use events::{Event, InboundMessage, SessionChange};
pub use models::{SessionRecord, SessionStatus, Ticket, TicketStatus};
pub use store::{
    MemorySessionStore, MemoryTicketStore, PgSessionStore, PgTicketStore, SessionStore,
    TicketStore,
};
pub use transport::{
    create_transport, LoopbackTransport, ScriptedTransport, Transport, TransportConnection,
    TransportError, TransportEvent,
};
