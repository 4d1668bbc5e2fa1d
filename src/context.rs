//! Per-run context — explicit state shared by every component of one run.
//!
//! Components receive an `Arc<RunContext>` instead of reading ambient
//! process-global state, so two runs in the same process (e.g. tests) never
//! bleed into each other's logs.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug)]
pub struct RunContext {
    /// Unique id for this engine invocation (UUID v4). Attached to every
    /// log event so one run's rows can be filtered out of aggregated logs.
    pub run_id: String,
    /// Project identifier — also the backing table name.
    pub project: String,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            project: project.into(),
            started_at: Utc::now(),
        }
    }

    /// Milliseconds elapsed since the run started.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique() {
        let a = RunContext::new("p");
        let b = RunContext::new("p");
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.project, "p");
    }
}
