//! Library crate for portwatch: scheduled TCP port discovery backed by SQLite.
pub mod agent;
pub mod config;
pub mod dial;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod reconciler;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
