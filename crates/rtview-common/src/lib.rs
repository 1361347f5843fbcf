// Shared configuration and logging for the rtview workspace.

pub mod common;
pub mod config;
pub mod cvar;
