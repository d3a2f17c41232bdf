// Discord layer - commands and delivery of decisions.

#[path = "commands/command_catalog.rs"]
pub mod commands;

#[path = "confessions/delivery.rs"]
pub mod delivery;

// Re-export command types for convenience
pub use commands::confessions::{Context, Data, Error};
