//! enrichflow: a Postgres-backed job queue and the transaction enrichment
//! pipeline it drives.
//!
//! - `jobs`: durable job store, handler registry and the polling worker loop
//! - `enrich`: batched categorization and recurring/subscription detection
//! - `api`: optional admin HTTP surface for operators

pub mod api;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod jobs;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
