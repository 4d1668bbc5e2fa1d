//! SQLite storage — schema provisioning, eligibility queries, outcome writes.
//!
//! The backing table IS the scheduler state: one `id` column plus two columns
//! per task (`<task>` JSON result, `<task>_err` error text). All SQL here is
//! built from identifiers validated at config load and quoted; row values go
//! through bind parameters.

use std::str::FromStr;

use anyhow::{Context as _, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{Connection as _, Row as _, SqlitePool};
use tracing::{debug, info};

use crate::config::{TaskConfig, ERROR_SUFFIX};

/// SQL type of a task's result column. SQLite stores this as text; the
/// declared name keeps the schema self-describing.
const RESULT_SQL_TYPE: &str = "JSON";
/// SQL type of a task's error column.
const ERROR_SQL_TYPE: &str = "TEXT";

/// Quote a validated identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{ident}\"")
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    opts: SqliteConnectOptions,
}

impl Storage {
    /// Open (creating if missing) the database behind a connection string
    /// like `sqlite://myproject.db`.
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid storage connection string {url:?}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePool::connect_with(opts.clone())
            .await
            .with_context(|| format!("failed to open storage at {url:?}"))?;
        Ok(Self { pool, opts })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Open a dedicated connection for one pass's streaming cursor.
    ///
    /// A forward-only cursor holds its connection until the stream drops.
    /// On the shared pool, each concurrently streaming task would pin one
    /// pooled connection for its whole pass, and with enough tasks the
    /// outcome writes behind the cursors could no longer acquire a
    /// connection at all.
    pub async fn cursor_connection(&self) -> Result<SqliteConnection> {
        SqliteConnection::connect_with(&self.opts)
            .await
            .context("failed to open streaming cursor connection")
    }

    // ─── Schema provisioner ─────────────────────────────────────────────────

    /// Ensure the project table exists with `id` plus two columns per task.
    ///
    /// Missing columns are added, never removed, so tables accumulate columns
    /// as tasks are added across runs. Not safe against a concurrent
    /// provisioner on the same table — callers serialize that.
    pub async fn provision(&self, project: &str, tasks: &[TaskConfig]) -> Result<()> {
        let existing = self.existing_columns(project).await?;

        if existing.is_empty() {
            let mut columns = vec![format!("{} TEXT PRIMARY KEY", quote_ident("id"))];
            for task in tasks {
                columns.push(format!(
                    "{} {RESULT_SQL_TYPE}",
                    quote_ident(task.result_column())
                ));
                columns.push(format!(
                    "{} {ERROR_SQL_TYPE}",
                    quote_ident(&task.error_column())
                ));
            }
            let sql = format!(
                "CREATE TABLE {} ({})",
                quote_ident(project),
                columns.join(", ")
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to create table {project:?}"))?;
            info!(table = project, columns = columns.len(), "created project table");
            return Ok(());
        }

        let mut required: Vec<String> = Vec::with_capacity(tasks.len() * 2);
        for task in tasks {
            required.push(task.result_column().to_string());
            required.push(task.error_column());
        }

        let mut added = 0usize;
        for column in required {
            if existing.iter().any(|c| c == &column) {
                continue;
            }
            let sql_type = if column.ends_with(ERROR_SUFFIX) {
                ERROR_SQL_TYPE
            } else {
                RESULT_SQL_TYPE
            };
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {sql_type}",
                quote_ident(project),
                quote_ident(&column)
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to add column {column:?} to {project:?}"))?;
            debug!(table = project, column = %column, "added task column");
            added += 1;
        }
        if added > 0 {
            info!(table = project, added, "extended project table");
        }
        Ok(())
    }

    async fn existing_columns(&self, table: &str) -> Result<Vec<String>> {
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?1)")
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("failed to inspect table {table:?}"))?;
        Ok(columns)
    }

    // ─── Eligibility selector ───────────────────────────────────────────────

    /// Count rows currently eligible for a task: own result and error both
    /// null, every dependency's result non-null.
    pub async fn count_eligible(&self, project: &str, task: &TaskConfig) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(project),
            eligible_where(task)
        );
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("eligibility count failed for task {:?}", task.id))
    }

    // ─── Outcome store ──────────────────────────────────────────────────────

    /// Persist a task's success result for one row. Single autocommitted
    /// statement; idempotent per (task, row).
    pub async fn write_result(
        &self,
        project: &str,
        task: &TaskConfig,
        row_id: &str,
        result: &Value,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_ident(project),
            quote_ident(task.result_column()),
            quote_ident("id")
        );
        let payload = serde_json::to_string(result).context("failed to serialize result")?;
        sqlx::query(&sql)
            .bind(payload)
            .bind(row_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to write result for {}:{row_id}", task.id))?;
        Ok(())
    }

    /// Persist a task's failure message for one row.
    pub async fn write_error(
        &self,
        project: &str,
        task: &TaskConfig,
        row_id: &str,
        message: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_ident(project),
            quote_ident(&task.error_column()),
            quote_ident("id")
        );
        sqlx::query(&sql)
            .bind(message)
            .bind(row_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to write error for {}:{row_id}", task.id))?;
        Ok(())
    }
}

/// WHERE clause shared by the count and the streaming select.
fn eligible_where(task: &TaskConfig) -> String {
    let mut predicates = vec![
        format!("{} IS NULL", quote_ident(task.result_column())),
        format!("{} IS NULL", quote_ident(&task.error_column())),
    ];
    for dep in &task.deps {
        predicates.push(format!("{} IS NOT NULL", quote_ident(dep)));
    }
    predicates.join(" AND ")
}

/// Build the streaming select for a task's pass.
///
/// Returns the SQL plus the field names in select order: `id` first, then
/// each declared dependency. Dependency values are cast to text so JSON that
/// SQLite coerced to a numeric representation still decodes uniformly.
pub fn select_eligible_sql(project: &str, task: &TaskConfig, order: &str) -> (String, Vec<String>) {
    let mut fields = vec!["id".to_string()];
    let mut select = vec![quote_ident("id")];
    for dep in &task.deps {
        fields.push(dep.clone());
        select.push(format!("CAST({0} AS TEXT) AS {0}", quote_ident(dep)));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {order}",
        select.join(", "),
        quote_ident(project),
        eligible_where(task)
    );
    (sql, fields)
}

/// Decode one selected row into the field mapping handed to the plugin.
///
/// The `id` is passed through as a string; dependency columns hold JSON
/// written by this engine, so they are parsed — anything unparseable is
/// passed along as a raw string rather than dropped.
pub fn row_to_fields(row: &SqliteRow, fields: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::with_capacity(fields.len());
    let id: String = row.try_get("id").context("failed to read row id")?;
    map.insert("id".to_string(), Value::String(id));
    for field in &fields[1..] {
        let raw: Option<String> = row
            .try_get(field.as_str())
            .with_context(|| format!("failed to read dependency column {field:?}"))?;
        let value = match raw {
            Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            None => Value::Null,
        };
        map.insert(field.clone(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task(id: &str, deps: &[&str]) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            command: PathBuf::from("unused"),
            args: vec![],
            deps: deps.iter().map(|d| d.to_string()).collect(),
            skip: false,
            timeout_ms: None,
            max_workers: None,
            order: None,
        }
    }

    async fn temp_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("t.db").display());
        let storage = Storage::connect(&url).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_provision_creates_table_idempotently() {
        let (_dir, storage) = temp_storage().await;
        let tasks = vec![task("a", &[]), task("b", &["a"])];

        storage.provision("proj", &tasks).await.unwrap();
        let first = storage.existing_columns("proj").await.unwrap();
        assert_eq!(first, vec!["id", "a", "a_err", "b", "b_err"]);

        storage.provision("proj", &tasks).await.unwrap();
        let second = storage.existing_columns("proj").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_provision_adds_columns_for_new_tasks() {
        let (_dir, storage) = temp_storage().await;
        storage.provision("proj", &[task("a", &[])]).await.unwrap();
        storage
            .provision("proj", &[task("a", &[]), task("b", &["a"])])
            .await
            .unwrap();
        let columns = storage.existing_columns("proj").await.unwrap();
        assert_eq!(columns, vec!["id", "a", "a_err", "b", "b_err"]);
    }

    #[tokio::test]
    async fn test_eligibility_respects_dependencies() {
        let (_dir, storage) = temp_storage().await;
        let a = task("a", &[]);
        let b = task("b", &["a"]);
        storage
            .provision("proj", std::slice::from_ref(&a))
            .await
            .unwrap();
        storage
            .provision("proj", &[a.clone(), b.clone()])
            .await
            .unwrap();

        for id in ["r1", "r2"] {
            sqlx::query("INSERT INTO \"proj\" (\"id\") VALUES (?1)")
                .bind(id)
                .execute(&storage.pool())
                .await
                .unwrap();
        }

        assert_eq!(storage.count_eligible("proj", &a).await.unwrap(), 2);
        // No row has a's result yet, so b is fully blocked.
        assert_eq!(storage.count_eligible("proj", &b).await.unwrap(), 0);

        storage
            .write_result("proj", &a, "r1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        storage.write_error("proj", &a, "r2", "nope").await.unwrap();

        // r1 resolved with a result: no longer eligible for a, unblocks b.
        // r2 resolved with an error: excluded from a, still blocks b.
        assert_eq!(storage.count_eligible("proj", &a).await.unwrap(), 0);
        assert_eq!(storage.count_eligible("proj", &b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_streaming_select_carries_dependency_values() {
        let (_dir, storage) = temp_storage().await;
        let a = task("a", &[]);
        let b = task("b", &["a"]);
        storage
            .provision("proj", &[a.clone(), b.clone()])
            .await
            .unwrap();
        sqlx::query("INSERT INTO \"proj\" (\"id\") VALUES ('r1')")
            .execute(&storage.pool())
            .await
            .unwrap();
        storage
            .write_result("proj", &a, "r1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();

        let (sql, fields) = select_eligible_sql("proj", &b, "id");
        let rows = sqlx::query(&sql).fetch_all(&storage.pool()).await.unwrap();
        assert_eq!(rows.len(), 1);
        let map = row_to_fields(&rows[0], &fields).unwrap();
        assert_eq!(map["id"], serde_json::json!("r1"));
        assert_eq!(map["a"], serde_json::json!({"x": 1}));
    }
}
