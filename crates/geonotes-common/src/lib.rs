//! geonotes common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the geonotes workspace:
//!
//! - **Error Handling**: [`GeoNotesError`] and the crate [`Result`] alias
//! - **Checksums**: SHA-256 helpers for dump and partition artifacts
//! - **Logging**: `tracing` subscriber setup shared by all binaries
//!
//! # Example
//!
//! ```no_run
//! use geonotes_common::checksum::verify_sha256_file;
//! use geonotes_common::Result;
//!
//! fn check(path: &str, digest: &str) -> Result<()> {
//!     verify_sha256_file(path, digest)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{GeoNotesError, Result};
