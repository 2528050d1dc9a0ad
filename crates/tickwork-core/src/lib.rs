//! `tickwork-core`: configuration and shared error types.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, SchedulerSection, TickworkConfig};
pub use error::{CoreError, Result};
