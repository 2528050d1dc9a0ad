//! `tickwork-scheduler`: in-process job scheduler with a durable SQLite mirror.
//!
//! # Overview
//!
//! Jobs live in an in-memory [`store::JobStore`] indexed by schedule time.
//! Every mutation is written through to a [`mirror::JobMirror`] so that a
//! restarted process can rebuild the index with [`store::JobStore::init`].
//! The [`engine::Scheduler`] wakes every tick, executes what is due and
//! applies the outcome.
//!
//! # Job lifecycle
//!
//! | Outcome  | One-shot job                         | Recurring job                     |
//! |----------|--------------------------------------|-----------------------------------|
//! | success  | removed                              | back to `pending` at next run     |
//! | failure  | kept as `failed`, `retry_count + 1`  | back to `pending` at next run     |
//!
//! Handlers are looked up by name in a process-local
//! [`registry::HandlerRegistry`] and are never persisted.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::SqliteMirror;
pub use engine::{ExecutionOutcome, Scheduler, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use mirror::JobMirror;
pub use registry::{FnHandler, HandlerRegistry, JobHandler};
pub use store::JobStore;
pub use types::{FieldUpdate, Job, JobRecord, JobStatus, Millis, Recurrence, RetryStrategy};
