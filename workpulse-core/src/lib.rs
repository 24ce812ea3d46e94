//! # workpulse-core
//!
//! Core library for workpulse - a crash-resilient work/pause time tracker.
//!
//! This library provides:
//! - Domain types for intervals, modes and totals
//! - The time segment engine and its checkpoint scheduler
//! - Interval normalization
//! - Database storage layer with SQLite
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through three layers:
//! - **Engine:** the live session, held in memory under one lock
//! - **Normalizer:** folds overlapping and adjacent same-kind intervals before they are saved
//! - **Store:** start-keyed SQLite rows, opened per operation and pruned to the retention horizon
//!
//! ## Example
//!
//! ```rust,no_run
//! use workpulse_core::{Config, Engine};
//!
//! let config = Config::load().expect("failed to load config");
//! let engine = Engine::from_config(&config);
//!
//! engine.start();
//! // ...
//! engine.pause();
//! println!("{:?}", engine.totals());
//! ```

// Re-export commonly used items at the crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{SchemaReport, Store};
pub use engine::{Engine, EntryOrigin, ReviewEntry, ReviewSession};
pub use error::{Error, Result};
pub use scheduler::CheckpointTicker;
pub use types::*;

// Public modules
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod scheduler;
pub mod types;
