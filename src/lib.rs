//! # Datamon
//!
//! Data-monitoring scheduler: periodic SQL probes, boolean validators,
//! IM and email alerting.
//!
//! ## Overview
//!
//! Datamon enables you to:
//! - **Probe** relational databases with scheduled SQL statements
//! - **Validate** results with user-defined boolean expressions
//! - **Alert** through an IM gateway and SMTP email when validation fails
//!
//! ## Quick Start
//!
//! ```no_run
//! use datamon::cmd::{run_monitor, Cli};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> datamon::Result<()> {
//!     let cli = Cli::parse();
//!     run_monitor(&cli).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Deadline dispatch**: jobs run at their configured due time, ordered
//!   by a priority queue, with bounded parallelism
//! - **Retry with backoff**: failed jobs re-enqueue at `now + retry_interval`
//! - **Templated config**: `{expr | filter(...)}` rendering of job options
//!   with `BASETIME` / `DUETIME` in scope
//! - **Sandboxed validators**: a small expression interpreter with a fixed
//!   builtin allow-list, no host-language eval
//! - **Connection pooling**: one lazily-created pool per datasource
//! - **Structured Logging**: JSON and human-readable log formats
//!
//! ## Architecture
//!
//! ```text
//! Config files → Job Validator → Scheduler → Probe Executor → Alerting
//! ```
//!
//! - **Config Layer**: sectioned key/value files, conflict detection,
//!   two-pass template rendering
//! - **Scheduler Layer**: due-time priority queue, worker pool, retries
//! - **Alert Layer**: IM text messages (chunked) and HTML email

// Public API exports
pub use errors::{MonitorError, Result};

// Public modules
pub mod alarm;
pub mod cmd;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod expr;
pub mod filters;
pub mod log;
pub mod probe;
pub mod scheduler;
pub mod table;
pub mod template;
pub mod time;
pub mod validators;
