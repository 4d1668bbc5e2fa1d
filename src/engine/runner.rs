//! Task Runner — one task's pass over a snapshot of eligible rows.
//!
//! A pass moves through Counting → (Skipped | Empty | Streaming) → Draining.
//! The selection is a single snapshot: rows resolved by a concurrently
//! running dependency task during this pass are picked up only by the next
//! engine invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures_util::TryStreamExt;
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ProjectConfig, TaskConfig};
use crate::context::RunContext;
use crate::executor::WorkerPool;
use crate::storage::{self, Storage};

/// Terminal state of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Skip flag set — no storage access at all.
    Skipped,
    /// Eligible count was zero — no further queries, no dispatch.
    Empty,
    /// Rows were dispatched and drained.
    Completed,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Empty => "empty",
            Self::Completed => "completed",
        }
    }
}

/// What one pass did, for the run summary.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub task: String,
    pub status: PassStatus,
    pub eligible: i64,
    pub succeeded: usize,
    pub failed: usize,
}

impl PassReport {
    fn terminal(task: &TaskConfig, status: PassStatus) -> Self {
        Self {
            task: task.id.clone(),
            status,
            eligible: 0,
            succeeded: 0,
            failed: 0,
        }
    }
}

pub struct TaskRunner {
    ctx: Arc<RunContext>,
    project: Arc<ProjectConfig>,
    task: TaskConfig,
    storage: Storage,
}

impl TaskRunner {
    pub fn new(
        ctx: Arc<RunContext>,
        project: Arc<ProjectConfig>,
        task: TaskConfig,
        storage: Storage,
    ) -> Self {
        Self {
            ctx,
            project,
            task,
            storage,
        }
    }

    /// Drive the pass to a terminal state.
    ///
    /// Per-row failures are data (written to the error column) and never fail
    /// the pass; only storage write failures do, since the outcome columns
    /// are the engine's sole durability mechanism.
    pub async fn run(self) -> Result<PassReport> {
        if self.task.skip {
            info!(run = %self.ctx.run_id, task = %self.task.id, "task skipped");
            return Ok(PassReport::terminal(&self.task, PassStatus::Skipped));
        }

        let eligible = self
            .storage
            .count_eligible(&self.project.id, &self.task)
            .await?;
        info!(run = %self.ctx.run_id, task = %self.task.id, eligible, "eligible rows counted");
        if eligible == 0 {
            return Ok(PassReport::terminal(&self.task, PassStatus::Empty));
        }

        // Two equal bounds: the dispatch semaphore caps in-flight rows, the
        // worker pool reuses at most that many plugin processes.
        let workers = self.task.worker_bound();
        let semaphore = Arc::new(Semaphore::new(workers));
        let pool = Arc::new(WorkerPool::new(&self.task));
        let task = Arc::new(self.task.clone());
        let write_failed = Arc::new(AtomicBool::new(false));
        let mut dispatches: JoinSet<Result<bool>> = JoinSet::new();

        let order = self.project.order_for(&self.task);
        let (sql, fields) = storage::select_eligible_sql(&self.project.id, &self.task, order);

        debug!(run = %self.ctx.run_id, task = %task.id, workers, order, "streaming eligible rows");

        // Forward-only cursor — large tables are never materialized. The
        // cursor lives on its own connection: it stays open for the whole
        // pass, and a pooled connection held that long would be one fewer
        // for the outcome writes racing it across every concurrent task.
        let mut cursor = self.storage.cursor_connection().await?;
        let mut rows = sqlx::query(&sql).fetch(&mut cursor);
        // A failed stream stops submission but must not abort in-flight
        // dispatches; they drain to terminal writes like any other pass.
        let mut stream_error: Option<anyhow::Error> = None;
        loop {
            if write_failed.load(Ordering::Acquire) {
                // A dispatch already lost a storage write; stop submitting.
                break;
            }
            let row = match rows.try_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    stream_error = Some(anyhow::Error::new(e).context(format!(
                        "eligibility stream failed for task {:?}",
                        task.id
                    )));
                    break;
                }
            };
            let row_fields = match storage::row_to_fields(&row, &fields) {
                Ok(row_fields) => row_fields,
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    stream_error = Some(anyhow::Error::new(e).context("dispatch semaphore closed"));
                    break;
                }
            };
            dispatches.spawn(dispatch_row(
                self.ctx.clone(),
                self.storage.clone(),
                self.project.id.clone(),
                task.clone(),
                pool.clone(),
                row_fields,
                write_failed.clone(),
                permit,
            ));
        }
        drop(rows);

        // Draining: every submitted row reaches a terminal write before the
        // pass is done.
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = dispatches.join_next().await {
            match joined {
                Ok(Ok(true)) => succeeded += 1,
                Ok(Ok(false)) => failed += 1,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow::Error::new(e).context("dispatch task panicked"));
                    }
                }
            }
        }
        pool.shutdown().await;

        if let Some(e) = stream_error.or(first_error) {
            return Err(e.context(format!("pass aborted for task {:?}", task.id)));
        }

        info!(
            run = %self.ctx.run_id,
            task = %task.id,
            eligible,
            succeeded,
            failed,
            "pass drained"
        );
        Ok(PassReport {
            task: task.id.clone(),
            status: PassStatus::Completed,
            eligible,
            succeeded,
            failed,
        })
    }
}

/// Execute one row and persist its outcome. Returns whether the row
/// succeeded; errors only for storage write failures.
#[allow(clippy::too_many_arguments)]
async fn dispatch_row(
    ctx: Arc<RunContext>,
    storage: Storage,
    table: String,
    task: Arc<TaskConfig>,
    pool: Arc<WorkerPool>,
    row_fields: Map<String, Value>,
    write_failed: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
) -> Result<bool> {
    let row_id = row_fields
        .get("id")
        .and_then(Value::as_str)
        .context("selected row has no id")?
        .to_string();
    debug!(run = %ctx.run_id, task = %task.id, row = %row_id, "dispatching row");

    let outcome = pool.execute(row_fields, task.timeout()).await;

    let written = match &outcome.error {
        None => {
            // Executor normalization guarantees a result here.
            let result = outcome.result.as_ref().unwrap_or(&Value::Null);
            let write = storage.write_result(&table, &task, &row_id, result).await;
            if write.is_ok() {
                info!(run = %ctx.run_id, task = %task.id, row = %row_id, "row resolved");
            }
            write.map(|_| true)
        }
        Some(message) => {
            let write = storage.write_error(&table, &task, &row_id, message).await;
            if write.is_ok() {
                warn!(run = %ctx.run_id, task = %task.id, row = %row_id, error = %message, "row failed");
            }
            write.map(|_| false)
        }
    };

    written.inspect_err(|_| write_failed.store(true, Ordering::Release))
}
