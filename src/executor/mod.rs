// SPDX-License-Identifier: MIT
//! Isolated task execution — a bounded pool of long-lived plugin processes.
//!
//! Each task gets its own pool. A worker is one OS process spawned from the
//! task's plugin executable; requests and responses travel over its
//! stdin/stdout as length-prefixed JSON frames. A crash, hang or panic in
//! user logic is confined to the worker process: the engine observes it as a
//! closed pipe or an expired timeout and records an error for that row.
//!
//! Workers are reused across rows to avoid a spawn per invocation. A worker
//! that timed out or broke protocol is killed and dropped; the pool respawns
//! lazily on the next checkout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::config::TaskConfig;
use crate::plugin::wire::{self, WorkRequest, WorkResponse};

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Terminal outcome of executing one (task, row). Exactly one side is set.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    /// Success. A null result is normalized to `{}` so the result column is
    /// set (a stored NULL would leave the row pending forever).
    pub fn success(result: Value) -> Self {
        let result = match result {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    fn from_response(response: WorkResponse) -> Self {
        match response.error {
            Some(message) => Self::failure(message),
            None => Self::success(response.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// One live plugin process with framed pipes attached.
struct PluginWorker {
    child: Child,
    requests: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    responses: FramedRead<ChildStdout, LengthDelimitedCodec>,
}

impl PluginWorker {
    async fn spawn(task: &str, command: &PathBuf, args: &[String]) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn plugin {}", command.display()))?;

        let stdin = child.stdin.take().context("plugin has no stdin")?;
        let stdout = child.stdout.take().context("plugin has no stdout")?;
        let stderr = child.stderr.take().context("plugin has no stderr")?;

        // Drain stderr so the plugin can never block on a full pipe; surface
        // whatever it prints at debug level.
        let task_name = task.to_string();
        let pid = child.id();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "plugin_stderr", task = %task_name, pid, "{line}");
            }
        });

        debug!(task, pid, plugin = %command.display(), "spawned plugin worker");
        Ok(Self {
            child,
            requests: FramedWrite::new(stdin, wire::codec()),
            responses: FramedRead::new(stdout, wire::codec()),
        })
    }

    /// One request/response round trip.
    async fn exchange(&mut self, request: &WorkRequest) -> Result<WorkResponse> {
        let bytes = serde_json::to_vec(request).context("failed to encode request")?;
        self.requests
            .send(bytes.into())
            .await
            .context("failed to write request to plugin")?;
        match self.responses.next().await {
            Some(frame) => {
                let frame = frame.context("failed to read response from plugin")?;
                serde_json::from_slice(&frame).context("malformed response frame from plugin")
            }
            // The worker exited (crash, exit(), killed) before responding.
            None => bail!("plugin worker closed its pipe before responding"),
        }
    }

    async fn kill(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

/// Bounded pool of plugin workers for one task.
///
/// The pool itself holds only idle workers; the concurrency ceiling is the
/// task runner's dispatch semaphore, sized identically to `max_workers`, so
/// checkout never creates more than `max_workers` live processes.
pub struct WorkerPool {
    task: String,
    command: PathBuf,
    args: Vec<String>,
    idle: Mutex<Vec<PluginWorker>>,
}

impl WorkerPool {
    pub fn new(task: &TaskConfig) -> Self {
        Self {
            task: task.id.clone(),
            command: task.command.clone(),
            args: task.args.clone(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Execute one row in an isolated worker, bounded by `timeout`.
    ///
    /// Never returns an error to the caller: spawn failures, protocol
    /// failures, worker crashes and timeouts all come back as the error side
    /// of the outcome, to be persisted like any handler failure.
    pub async fn execute(
        &self,
        row: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> TaskOutcome {
        let request = WorkRequest {
            task: self.task.clone(),
            row,
        };

        let mut worker = match self.checkout().await {
            Ok(worker) => worker,
            Err(e) => return TaskOutcome::failure(format!("{e:#}")),
        };

        let exchanged = match timeout {
            Some(limit) => match tokio::time::timeout(limit, worker.exchange(&request)).await {
                Ok(exchanged) => exchanged,
                Err(_) => {
                    // Kill rather than reuse: the worker is still busy with
                    // the abandoned request and its pipe is out of sync.
                    warn!(task = %self.task, timeout_ms = limit.as_millis() as u64, "execution timed out — killing worker");
                    worker.kill().await;
                    return TaskOutcome::failure(format!(
                        "execution timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => worker.exchange(&request).await,
        };

        match exchanged {
            Ok(response) => {
                self.check_in(worker).await;
                TaskOutcome::from_response(response)
            }
            Err(e) => {
                worker.kill().await;
                TaskOutcome::failure(format!("{e:#}"))
            }
        }
    }

    async fn checkout(&self) -> Result<PluginWorker> {
        if let Some(worker) = self.idle.lock().await.pop() {
            return Ok(worker);
        }
        PluginWorker::spawn(&self.task, &self.command, &self.args).await
    }

    async fn check_in(&self, worker: PluginWorker) {
        self.idle.lock().await.push(worker);
    }

    /// Kill all idle workers. Called when a pass drains.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.idle.lock().await);
        for worker in workers {
            worker.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_result_normalized_to_empty_object() {
        let outcome = TaskOutcome::success(Value::Null);
        assert_eq!(outcome.result, Some(json!({})));
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_response_error_wins() {
        let outcome = TaskOutcome::from_response(WorkResponse::err("boom"));
        assert!(outcome.result.is_none());
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_outcome_not_an_error() {
        let task = TaskConfig {
            id: "ghost".to_string(),
            command: PathBuf::from("/nonexistent/plugin-binary"),
            args: vec![],
            deps: vec![],
            skip: false,
            timeout_ms: None,
            max_workers: None,
            order: None,
        };
        let pool = WorkerPool::new(&task);
        let outcome = pool.execute(Map::new(), None).await;
        let err = outcome.error.expect("spawn failure must surface as outcome error");
        assert!(err.contains("failed to spawn"), "got: {err}");
    }
}
