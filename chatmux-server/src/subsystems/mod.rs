pub mod autoclose;
pub mod broadcaster;
pub mod client;
pub mod orchestrator;
pub mod registry;
