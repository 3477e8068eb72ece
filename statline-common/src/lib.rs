//! # Statline Common Library
//!
//! Shared code for the statline pipeline crates including:
//! - Error type used across crates
//! - Configuration document loading and validation
//! - Clock abstraction (wall clock and manual clock for tests)
//! - Run-log database initialization and lock-retry helper

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod time;

pub use config::StatlineConfig;
pub use error::{Error, Result};
pub use time::{Clock, ManualClock, SystemClock};
