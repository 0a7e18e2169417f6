//! GeoNotes sync engine
//!
//! Keeps a canonical store of geo-referenced map notes in sync with a
//! rate-limited notes API and its periodic full dumps, and keeps each note's
//! region assignment consistent with the current region boundaries.
//!
//! # Components
//!
//! - [`scheduler`]: fair, capacity-aware ticket queue in front of every remote
//!   resource
//! - [`retry`]: bounded exponential backoff that cleans up partial artifacts
//! - [`pipeline`]: dump splitter, parallel partition workers and the
//!   consolidator
//! - [`controller`]: the incremental sync state machine, daemon and one-shot
//!   drivers
//! - [`verify`]: resumable chunked region verification and assignment
//! - [`store`]: durable state, in Postgres or in memory
//!
//! # Example
//!
//! ```no_run
//! use geonotes_sync::config::SyncConfig;
//! use geonotes_sync::store::PgStore;
//!
//! # async fn run() -> geonotes_sync::error::Result<()> {
//! let config = SyncConfig::load(None)?;
//! let store = PgStore::connect(&config.database).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod verify;

pub use error::{Result, SyncError};
