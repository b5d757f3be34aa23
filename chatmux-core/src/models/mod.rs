pub mod ticket;
pub mod whatsapp;

pub use ticket::{Ticket, TicketStatus};
pub use whatsapp::{SessionRecord, SessionStatus};
