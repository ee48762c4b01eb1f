//! # Tideline
//!
//! Migration lifecycle engine: plan, gate, apply, roll back and squash
//! versioned schema migrations against an abstract record store, with a
//! structured event stream for whatever renders progress.

pub mod config;
pub mod migration;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use config::EngineConfig;
pub use migration::{CommandRouter, MigrationError, Migrator};
