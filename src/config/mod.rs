//! Project configuration — TOML file parsing and startup validation.
//!
//! The engine never invents schema: every table and column name is derived
//! from identifiers in this file, so validation here is what keeps the
//! dynamically built SQL safe. A config that passes `ProjectConfig::load`
//! is trusted by every later layer.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Suffix of every task's error column (`<task>_err`).
pub const ERROR_SUFFIX: &str = "_err";

/// Ordering applied when neither the task nor the project declares one.
/// Explicit so tests and operators never have to guess the fallback.
pub const DEFAULT_ORDER: &str = "RANDOM()";

fn default_order() -> String {
    DEFAULT_ORDER.to_string()
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("project id {0:?} is not a valid identifier (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidProjectId(String),

    #[error("task id {0:?} is not a valid identifier (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidTaskId(String),

    #[error("task id {0:?} is reserved (collides with the row identity column)")]
    ReservedTaskId(String),

    #[error("duplicate task id {0:?}")]
    DuplicateTaskId(String),

    #[error("task id {0:?} collides with the error column of task {1:?}")]
    ErrorColumnCollision(String, String),

    #[error("task {task:?} declares unknown dependency {dep:?}")]
    UnknownDependency { task: String, dep: String },

    #[error("task {0:?} depends on itself")]
    SelfDependency(String),

    #[error("project declares no tasks")]
    NoTasks,
}

// ─── TaskConfig ──────────────────────────────────────────────────────────────

/// One task definition (`[[task]]` in the project file).
///
/// The task id triples as the plugin entry-point name and the base name of
/// the task's two table columns.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    /// Plugin executable implementing this task's handler.
    pub command: PathBuf,
    /// Extra arguments passed to the plugin executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Tasks whose result column must be non-null before a row is eligible.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Skip this task entirely — no reads, no writes.
    #[serde(default)]
    pub skip: bool,
    /// Per-row execution timeout in milliseconds. None = unbounded.
    pub timeout_ms: Option<u64>,
    /// Max simultaneous row executions. None = available CPU parallelism.
    pub max_workers: Option<usize>,
    /// Row-ordering SQL expression for this task's pass. Overrides the
    /// project default.
    pub order: Option<String>,
}

impl TaskConfig {
    /// Name of the JSON result column.
    pub fn result_column(&self) -> &str {
        &self.id
    }

    /// Name of the text error column.
    pub fn error_column(&self) -> String {
        format!("{}{ERROR_SUFFIX}", self.id)
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Effective worker bound for this task.
    pub fn worker_bound(&self) -> usize {
        self.max_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(default_parallelism)
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ─── ProjectConfig ───────────────────────────────────────────────────────────

/// Root of the project file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Project identifier — also the backing table name.
    pub id: String,
    /// Storage connection string, e.g. `sqlite://myproject.db`.
    pub db: String,
    /// Default row-ordering SQL expression for tasks that declare none.
    #[serde(default = "default_order")]
    pub order: String,
    #[serde(rename = "task", default)]
    pub tasks: Vec<TaskConfig>,
}

impl ProjectConfig {
    /// Read and validate a project file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate identifiers and dependency references.
    ///
    /// Everything here is fatal: a config that fails validation would
    /// otherwise surface later as malformed SQL against a live table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_ident(&self.id) {
            return Err(ConfigError::InvalidProjectId(self.id.clone()));
        }
        if self.tasks.is_empty() {
            return Err(ConfigError::NoTasks);
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if !is_valid_ident(&task.id) {
                return Err(ConfigError::InvalidTaskId(task.id.clone()));
            }
            if task.id == "id" {
                return Err(ConfigError::ReservedTaskId(task.id.clone()));
            }
            if seen.contains(&task.id.as_str()) {
                return Err(ConfigError::DuplicateTaskId(task.id.clone()));
            }
            seen.push(&task.id);
        }

        // A task named "x_err" would share a column with task "x"'s errors.
        for task in &self.tasks {
            if let Some(base) = task.id.strip_suffix(ERROR_SUFFIX) {
                if let Some(other) = self.tasks.iter().find(|t| t.id == base) {
                    return Err(ConfigError::ErrorColumnCollision(
                        task.id.clone(),
                        other.id.clone(),
                    ));
                }
            }
        }

        for task in &self.tasks {
            for dep in &task.deps {
                if dep == &task.id {
                    return Err(ConfigError::SelfDependency(task.id.clone()));
                }
                if !self.tasks.iter().any(|t| &t.id == dep) {
                    return Err(ConfigError::UnknownDependency {
                        task: task.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Effective ordering expression for one task's pass.
    pub fn order_for<'a>(&'a self, task: &'a TaskConfig) -> &'a str {
        task.order.as_deref().unwrap_or(&self.order)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*` — safe to interpolate as a quoted SQL identifier.
pub fn is_valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> ProjectConfig {
        toml::from_str(toml_src).expect("parse")
    }

    const MINIMAL: &str = r#"
        id = "docs"
        db = "sqlite://docs.db"

        [[task]]
        id = "fetch"
        command = "plugins/fetch"

        [[task]]
        id = "summarize"
        command = "plugins/summarize"
        deps = ["fetch"]
        timeout_ms = 5000
        max_workers = 2
    "#;

    #[test]
    fn test_parse_minimal() {
        let cfg = parse(MINIMAL);
        cfg.validate().unwrap();
        assert_eq!(cfg.id, "docs");
        assert_eq!(cfg.order, DEFAULT_ORDER);
        assert_eq!(cfg.tasks.len(), 2);
        let summarize = &cfg.tasks[1];
        assert_eq!(summarize.deps, vec!["fetch"]);
        assert_eq!(summarize.error_column(), "summarize_err");
        assert_eq!(summarize.worker_bound(), 2);
        assert_eq!(
            summarize.timeout(),
            Some(std::time::Duration::from_millis(5000))
        );
    }

    #[test]
    fn test_order_fallbacks() {
        let mut cfg = parse(MINIMAL);
        assert_eq!(cfg.order_for(&cfg.tasks[0]), "RANDOM()");
        cfg.order = "id".to_string();
        assert_eq!(cfg.order_for(&cfg.tasks[0]), "id");
        cfg.tasks[0].order = Some("id DESC".to_string());
        assert_eq!(cfg.order_for(&cfg.tasks[0]), "id DESC");
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let mut cfg = parse(MINIMAL);
        cfg.tasks[0].deps = vec!["nope".to_string()];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_rejects_self_dependency() {
        let mut cfg = parse(MINIMAL);
        cfg.tasks[0].deps = vec!["fetch".to_string()];
        assert!(matches!(cfg.validate(), Err(ConfigError::SelfDependency(_))));
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let mut cfg = parse(MINIMAL);
        cfg.tasks[0].id = "drop table; --".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTaskId(_))));

        let mut cfg = parse(MINIMAL);
        cfg.id = "1bad".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidProjectId(_))
        ));

        let mut cfg = parse(MINIMAL);
        cfg.tasks[0].id = "id".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::ReservedTaskId(_))));
    }

    #[test]
    fn test_rejects_error_column_collision() {
        let mut cfg = parse(MINIMAL);
        cfg.tasks[1].id = "fetch_err".to_string();
        cfg.tasks[1].deps.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ErrorColumnCollision(..))
        ));
    }

    #[test]
    fn test_rejects_duplicate_task_id() {
        let mut cfg = parse(MINIMAL);
        cfg.tasks[1].id = "fetch".to_string();
        cfg.tasks[1].deps.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateTaskId(_))));
    }
}
