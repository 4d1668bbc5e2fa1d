//! Project Engine — runs every task's pass concurrently.
//!
//! One tokio task per project task; no ordering between tasks beyond what
//! dependency columns enforce at selection time. The run is done when every
//! pass reaches a terminal state.

pub mod runner;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::ProjectConfig;
use crate::context::RunContext;
use crate::storage::Storage;
use runner::{PassReport, TaskRunner};

/// Aggregate of one engine invocation.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    /// One report per task, in configuration order.
    pub reports: Vec<PassReport>,
}

/// Per-task pending-work view for `rowforge status`.
#[derive(Debug)]
pub struct TaskPending {
    pub task: String,
    pub skip: bool,
    /// None for skipped tasks — they get no storage access at all.
    pub eligible: Option<i64>,
}

pub struct ProjectEngine {
    config: Arc<ProjectConfig>,
    storage: Storage,
    ctx: Arc<RunContext>,
}

impl ProjectEngine {
    /// Connect to storage and provision the schema. Any failure here is
    /// fatal to the run — per spec, setup-time errors are never retried.
    pub async fn connect(config: ProjectConfig) -> Result<Self> {
        let ctx = Arc::new(RunContext::new(&config.id));
        let storage = Storage::connect(&config.db).await?;
        storage
            .provision(&config.id, &config.tasks)
            .await
            .context("schema provisioning failed")?;
        Ok(Self {
            config: Arc::new(config),
            storage,
            ctx,
        })
    }

    pub fn context(&self) -> Arc<RunContext> {
        self.ctx.clone()
    }

    /// Run every task's pass once, concurrently.
    ///
    /// Per-row failures are recorded as data. A pass-fatal failure (storage
    /// write loss) fails the run, but only after every other pass finished.
    pub async fn run(&self) -> Result<RunSummary> {
        info!(
            run = %self.ctx.run_id,
            project = %self.config.id,
            tasks = self.config.tasks.len(),
            "run started"
        );

        let mut passes: JoinSet<Result<PassReport>> = JoinSet::new();
        for task in self.config.tasks.clone() {
            let runner = TaskRunner::new(
                self.ctx.clone(),
                self.config.clone(),
                task,
                self.storage.clone(),
            );
            passes.spawn(runner.run());
        }

        let mut reports: Vec<PassReport> = Vec::with_capacity(self.config.tasks.len());
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    error!(run = %self.ctx.run_id, error = %format!("{e:#}"), "pass failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow::Error::new(e).context("pass panicked"));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        // JoinSet yields in completion order; report in configuration order.
        reports.sort_by_key(|r| {
            self.config
                .tasks
                .iter()
                .position(|t| t.id == r.task)
                .unwrap_or(usize::MAX)
        });

        info!(
            run = %self.ctx.run_id,
            project = %self.config.id,
            elapsed_ms = self.ctx.elapsed_ms(),
            "run finished"
        );
        Ok(RunSummary {
            run_id: self.ctx.run_id.clone(),
            reports,
        })
    }

    /// Pending-work counts per task, without dispatching anything.
    pub async fn status(&self) -> Result<Vec<TaskPending>> {
        let mut out = Vec::with_capacity(self.config.tasks.len());
        for task in &self.config.tasks {
            let eligible = if task.skip {
                None
            } else {
                Some(self.storage.count_eligible(&self.config.id, task).await?)
            };
            out.push(TaskPending {
                task: task.id.clone(),
                skip: task.skip,
                eligible,
            });
        }
        Ok(out)
    }
}
