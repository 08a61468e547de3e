//! bomwatch: work-driven CAD activity monitor with BOM version control.
//!
//! Polls the modeling application for open documents, turns changes into
//! Opened/Saved/Closed events, tracks work sessions per file and keeps an
//! append-only, numbered history of assembly bills of materials.
//!
//! ## Modules
//!
//! - [`watcher`]: poll-and-diff over the open document set
//! - [`resolver`]: project and machine identity for a document
//! - [`sessions`]: work session state machine and tracker
//! - [`detector`]: canonical BOM hashing and change decisions
//! - [`store`]: SQLite-backed version and session store
//! - [`dispatch`]: per-file ordered work queues
//! - [`monitor`]: lifecycle and wiring

pub mod backoff;
pub mod config;
pub mod detector;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod resolver;
pub mod sessions;
pub mod source;
pub mod store;
pub mod watcher;

pub use config::{load_config, MonitorConfig, UnknownProjectPolicy};
pub use error::{MonitorError, Result};
pub use monitor::{Monitor, ShutdownReport};
