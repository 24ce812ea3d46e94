//! Database layer for workpulse
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations and read-only schema inspection
//! - The interval store, opened per operation
//! - Backup snapshots taken before bulk writes

pub mod backup;
pub mod schema;
mod store;

pub use schema::SchemaReport;
pub use store::{Store, START_MATCH_TOLERANCE_MS};
