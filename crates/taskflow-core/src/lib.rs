//! Taskflow Core: workflow orchestration engine.
//!
//! This crate contains the data models, SQLite stores and the engine that
//! sequences workflow steps. It has **no HTTP server or CLI dependency**,
//! making it suitable for use in:
//!
//! - CLI tools (via `taskflow-cli`)
//! - Schedulers and background workers
//! - Embedding inside a larger service
//!
//! Agents and webhooks are reached through the traits in [`workflow`];
//! callers plug in their own implementations or use the defaults.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod state;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::EngineError;
pub use state::{create_app_state, AppState, AppStateInner};
