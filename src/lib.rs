//! rowforge — per-row task engine.
//!
//! A project is a SQL table plus an ordered list of tasks. Each task owns two
//! columns on the table: `<task>` (JSON result) and `<task>_err` (error
//! text). The engine selects rows where a task has not yet run and all of its
//! dependencies have a result, dispatches each row to a bounded pool of
//! isolated plugin processes, and writes exactly one of the two columns back.
//! Scheduling state lives entirely in those columns — there is no job queue,
//! and re-running the engine is the retry mechanism.

pub mod config;
pub mod context;
pub mod engine;
pub mod executor;
pub mod plugin;
pub mod storage;

pub use config::{ProjectConfig, TaskConfig};
pub use context::RunContext;
pub use engine::{runner::PassReport, runner::PassStatus, ProjectEngine, RunSummary};
pub use storage::Storage;
