//! Embedded file-database [`QueueStorage`] backend, backed by SQLite via
//! `sqlx`.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`, so `next()` can't rely on
//! row-level locking the way a server-hosted SQL backend would. Instead,
//! the pool this backend expects is opened with exactly one connection
//! (`SqlitePoolOptions::max_connections(1)`), so at most one `next()`
//! transaction is ever open against the database at a time - that single
//! connection, not anything inside the transaction itself, is the real
//! mutual-exclusion mechanism. `next()` additionally takes an in-process
//! `tokio::sync::Mutex` so two callers against the same handle never
//! interleave their select-then-update even while awaiting the same
//! connection.
//!
//! One physical table backs one `(queue_name, prefix-schema-shape)`
//! combination, named via [`PrefixSchema::table_name`]. Within a table,
//! rows from different prefix *values* (e.g. different tenants) are
//! distinguished by a derived `prefix_key` column - a canonical JSON
//! encoding of the scoped prefix values - rather than one SQL column per
//! prefix column, keeping the schema stable across however many prefix
//! columns a caller declares.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    ChangeNotice, CompleteUpdate, Job, JobInput, JobStatus, PrefixSchema, PrefixValue, QueueError,
    QueueResult, QueueStats, QueueStorage,
};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A `(queue_name, prefix)`-scoped handle over one SQLite-backed table.
pub struct SqliteQueueStorage {
    pool: SqlitePool,
    queue_name: String,
    prefix: PrefixSchema,
    table: String,
    prefix_key: String,
    /// SQLite has no `SKIP LOCKED`; this serializes the select-then-update
    /// in `next()` so two callers against the same pool never race for the
    /// same row even if the pool has more than one connection open.
    dispatch_lock: tokio::sync::Mutex<()>,
}

impl SqliteQueueStorage {
    /// Opens (creating if absent) the SQLite database at `path` and scopes
    /// a storage handle to `queue_name`/`prefix`. A single-connection pool
    /// is used, matching the "single-writer dispatch" design: SQLite
    /// tolerates many readers but this backend is built around one writer.
    pub async fn open(path: &str, queue_name: impl Into<String>, prefix: PrefixSchema) -> QueueResult<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(Self::from_pool(pool, queue_name, prefix))
    }

    /// Build a storage handle from an already-open pool, useful for sharing
    /// one file across multiple queues/prefixes in tests.
    pub fn from_pool(pool: SqlitePool, queue_name: impl Into<String>, prefix: PrefixSchema) -> Self {
        let table = prefix.table_name();
        let prefix_key = encode_prefix_key(prefix.values());
        Self {
            pool,
            queue_name: queue_name.into(),
            table,
            prefix_key,
            prefix,
            dispatch_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn scope_clause(&self) -> &'static str {
        "queue_name = ? AND prefix_key = ?"
    }
}

fn encode_prefix_key(values: &BTreeMap<String, PrefixValue>) -> String {
    serde_json::to_string(values).expect("prefix values always serialize")
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> QueueResult<Job> {
    let prefix_json: String = row.try_get("prefix_json").map_err(sqlx_err)?;
    let input_json: String = row.try_get("input").map_err(sqlx_err)?;
    let output_json: Option<String> = row.try_get("output").map_err(sqlx_err)?;
    let progress_details: Option<String> = row.try_get("progress_details").map_err(sqlx_err)?;
    let status: String = row.try_get("status").map_err(sqlx_err)?;

    Ok(Job {
        id: row.try_get("id").map_err(sqlx_err)?,
        queue_name: row.try_get("queue_name").map_err(sqlx_err)?,
        prefix: serde_json::from_str(&prefix_json)?,
        task_type: row.try_get("task_type").map_err(sqlx_err)?,
        model_name: row.try_get("model_name").map_err(sqlx_err)?,
        job_run_id: row.try_get("job_run_id").map_err(sqlx_err)?,
        fingerprint: row.try_get("fingerprint").map_err(sqlx_err)?,
        input: serde_json::from_str(&input_json)?,
        output: output_json.map(|s| serde_json::from_str(&s)).transpose()?,
        status: JobStatus::from_str_opt(&status)
            .ok_or_else(|| QueueError::Configuration(format!("unknown status {status}")))?,
        error: row.try_get("error").map_err(sqlx_err)?,
        error_code: row.try_get("error_code").map_err(sqlx_err)?,
        run_attempts: row.try_get::<i64, _>("run_attempts").map_err(sqlx_err)? as u32,
        max_retries: row.try_get::<i64, _>("max_retries").map_err(sqlx_err)? as u32,
        run_after: row.try_get("run_after").map_err(sqlx_err)?,
        deadline_at: row.try_get("deadline_at").map_err(sqlx_err)?,
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        last_ran_at: row.try_get("last_ran_at").map_err(sqlx_err)?,
        completed_at: row.try_get("completed_at").map_err(sqlx_err)?,
        progress: row.try_get("progress").map_err(sqlx_err)?,
        progress_message: row.try_get("progress_message").map_err(sqlx_err)?,
        progress_details: progress_details.map(|s| serde_json::from_str(&s)).transpose()?,
        worker_id: row.try_get("worker_id").map_err(sqlx_err)?,
    })
}

fn sqlx_err(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.into())
}

#[async_trait]
impl QueueStorage for SqliteQueueStorage {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn prefix(&self) -> &PrefixSchema {
        &self.prefix
    }

    async fn setup(&self) -> QueueResult<()> {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                prefix_key TEXT NOT NULL,
                prefix_json TEXT NOT NULL,
                task_type TEXT NOT NULL,
                model_name TEXT,
                job_run_id TEXT,
                fingerprint TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                status TEXT NOT NULL,
                error TEXT,
                error_code TEXT,
                run_attempts INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                run_after TEXT NOT NULL,
                deadline_at TEXT,
                created_at TEXT NOT NULL,
                last_ran_at TEXT,
                completed_at TEXT,
                progress REAL NOT NULL,
                progress_message TEXT,
                progress_details TEXT,
                worker_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_dispatch
                ON {table} (queue_name, prefix_key, status, run_after, id);
            CREATE INDEX IF NOT EXISTS idx_{table}_run_id
                ON {table} (queue_name, prefix_key, job_run_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_fingerprint
                ON {table} (queue_name, prefix_key, fingerprint, status);
            "#,
            table = self.table
        );
        sqlx::query(&create).execute(&self.pool).await.map_err(sqlx_err)?;
        Ok(())
    }

    async fn add(&self, input: JobInput) -> QueueResult<Job> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let fingerprint = queue_core::fingerprint(&input.input);
        let input_json = serde_json::to_string(&input.input)?;
        let run_after = input.run_after.unwrap_or(now);

        let sql = format!(
            "INSERT INTO {table} (id, queue_name, prefix_key, prefix_json, task_type, model_name,
                job_run_id, fingerprint, input, output, status, error, error_code, run_attempts,
                max_retries, run_after, deadline_at, created_at, last_ran_at, completed_at,
                progress, progress_message, progress_details, worker_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL, NULL, 0, ?, ?, ?, ?, NULL, NULL, 0.0, NULL, NULL, NULL)",
            table = self.table
        );
        sqlx::query(&sql)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(serde_json::to_string(self.prefix.values())?)
            .bind(&input.task_type)
            .bind(&input.model_name)
            .bind(&input.job_run_id)
            .bind(&fingerprint)
            .bind(&input_json)
            .bind(JobStatus::Pending.as_str())
            .bind(input.max_retries as i64)
            .bind(run_after)
            .bind(input.deadline_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

        self.get(&id).await?.ok_or(QueueError::NotFound(id))
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE id = ? AND {scope}",
            table = self.table,
            scope = self.scope_clause()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn next(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let _guard = self.dispatch_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let select = format!(
            "SELECT id FROM {table}
             WHERE {scope} AND status = ? AND run_after <= ?
               AND (deadline_at IS NULL OR deadline_at > ?)
             ORDER BY run_after ASC, id ASC
             LIMIT 1",
            table = self.table,
            scope = self.scope_clause()
        );
        let candidate: Option<String> = sqlx::query(&select)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(JobStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?
            .map(|row| row.get::<String, _>("id"));

        let Some(id) = candidate else {
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(None);
        };

        let update = format!(
            "UPDATE {table} SET status = ?, worker_id = ?, last_ran_at = ? WHERE id = ?",
            table = self.table
        );
        sqlx::query(&update)
            .bind(JobStatus::Processing.as_str())
            .bind(worker_id)
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        let select_row = format!("SELECT * FROM {table} WHERE id = ?", table = self.table);
        let row = sqlx::query(&select_row)
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        let job = row_to_job(&row)?;
        tx.commit().await.map_err(sqlx_err)?;
        Ok(Some(job))
    }

    async fn peek(&self, status: JobStatus, n: usize) -> QueueResult<Vec<Job>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE {scope} AND status = ?
             ORDER BY run_after ASC, id ASC LIMIT ?",
            table = self.table,
            scope = self.scope_clause()
        );
        let rows = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(status.as_str())
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn size(&self, status: JobStatus) -> QueueResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) as n FROM {table} WHERE {scope} AND status = ?",
            table = self.table,
            scope = self.scope_clause()
        );
        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(row.try_get::<i64, _>("n").map_err(sqlx_err)? as u64)
    }

    async fn complete(&self, id: &str, update: CompleteUpdate) -> QueueResult<Job> {
        let current = self.get(id).await?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let now = Utc::now();

        let next_status = match &update {
            CompleteUpdate::Completed { .. } => JobStatus::Completed,
            CompleteUpdate::Failed { .. } => JobStatus::Failed,
            CompleteUpdate::Retry { .. } => JobStatus::Pending,
            CompleteUpdate::Disabled => JobStatus::Disabled,
        };
        if !current.status.can_transition_to(next_status) {
            return Err(QueueError::IllegalTransition {
                from: current.status.to_string(),
                to: next_status.to_string(),
            });
        }

        match update {
            CompleteUpdate::Completed { output } => {
                let sql = format!(
                    "UPDATE {table} SET status = ?, output = ?, completed_at = ?, progress = 100.0,
                        run_attempts = run_attempts + 1 WHERE id = ?",
                    table = self.table
                );
                sqlx::query(&sql)
                    .bind(JobStatus::Completed.as_str())
                    .bind(serde_json::to_string(&output)?)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(sqlx_err)?;
            }
            CompleteUpdate::Failed { error, error_code } => {
                let sql = format!(
                    "UPDATE {table} SET status = ?, error = ?, error_code = ?, completed_at = ?,
                        progress = 100.0, run_attempts = run_attempts + 1 WHERE id = ?",
                    table = self.table
                );
                sqlx::query(&sql)
                    .bind(JobStatus::Failed.as_str())
                    .bind(error)
                    .bind(error_code)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(sqlx_err)?;
            }
            CompleteUpdate::Retry {
                run_after,
                error,
                error_code,
            } => {
                let sql = format!(
                    "UPDATE {table} SET status = ?, run_after = ?, error = ?, error_code = ?,
                        progress = 0.0, progress_message = NULL, progress_details = NULL,
                        worker_id = NULL, run_attempts = run_attempts + 1 WHERE id = ?",
                    table = self.table
                );
                sqlx::query(&sql)
                    .bind(JobStatus::Pending.as_str())
                    .bind(run_after)
                    .bind(error)
                    .bind(error_code)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(sqlx_err)?;
            }
            CompleteUpdate::Disabled => {
                let sql = format!(
                    "UPDATE {table} SET status = ?, completed_at = ? WHERE id = ?",
                    table = self.table
                );
                sqlx::query(&sql)
                    .bind(JobStatus::Disabled.as_str())
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await
                    .map_err(sqlx_err)?;
            }
        }

        self.get(id).await?.ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn abort(&self, id: &str) -> QueueResult<()> {
        let current = self.get(id).await?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !current.status.can_transition_to(JobStatus::Aborting) {
            return Err(QueueError::IllegalTransition {
                from: current.status.to_string(),
                to: JobStatus::Aborting.to_string(),
            });
        }
        let sql = format!("UPDATE {table} SET status = ? WHERE id = ?", table = self.table);
        sqlx::query(&sql)
            .bind(JobStatus::Aborting.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_by_run_id(&self, run_id: &str) -> QueueResult<Vec<Job>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE {scope} AND job_run_id = ?",
            table = self.table,
            scope = self.scope_clause()
        );
        let rows = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn output_for_input(&self, input: &Value) -> QueueResult<Option<Value>> {
        let fingerprint = queue_core::fingerprint(input);
        let sql = format!(
            "SELECT output FROM {table} WHERE {scope} AND status = ? AND fingerprint = ?
             ORDER BY completed_at DESC LIMIT 1",
            table = self.table,
            scope = self.scope_clause()
        );
        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(JobStatus::Completed.as_str())
            .bind(&fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let output: Option<String> = row.try_get("output").map_err(sqlx_err)?;
                output.map(|s| serde_json::from_str(&s)).transpose().map_err(QueueError::from)
            }
        }
    }

    async fn save_progress(
        &self,
        id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<Value>,
    ) -> QueueResult<()> {
        let details_json = details.as_ref().map(serde_json::to_string).transpose()?;
        let sql = format!(
            "UPDATE {table} SET progress = ?, progress_message = ?, progress_details = ? WHERE id = ?",
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(progress)
            .bind(message)
            .bind(details_json)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> QueueResult<()> {
        let sql = format!(
            "DELETE FROM {table} WHERE id = ? AND {scope}",
            table = self.table,
            scope = self.scope_clause()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        let sql = format!("DELETE FROM {table} WHERE {scope}", table = self.table, scope = self.scope_clause());
        let result = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_by_status_and_age(&self, status: JobStatus, older_than_ms: i64) -> QueueResult<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        let sql = format!(
            "DELETE FROM {table} WHERE {scope} AND status = ? AND completed_at IS NOT NULL AND completed_at <= ?",
            table = self.table,
            scope = self.scope_clause()
        );
        let result = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(status.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn reclaim_stale_leases(&self, stale_after_ms: i64) -> QueueResult<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::milliseconds(stale_after_ms);
        let now = Utc::now();
        let sql = format!(
            "UPDATE {table} SET status = ?, worker_id = NULL, run_after = ?
             WHERE {scope} AND status = ? AND (last_ran_at IS NULL OR last_ran_at <= ?)",
            table = self.table,
            scope = self.scope_clause()
        );
        let result = sqlx::query(&sql)
            .bind(JobStatus::Pending.as_str())
            .bind(now)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(JobStatus::Processing.as_str())
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn fail_expired_deadlines(&self) -> QueueResult<u64> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE {table} SET status = ?, error = ?, error_code = ?, completed_at = ?, progress = 100.0
             WHERE {scope} AND status = ? AND deadline_at IS NOT NULL AND deadline_at <= ?",
            table = self.table,
            scope = self.scope_clause()
        );
        let result = sqlx::query(&sql)
            .bind(JobStatus::Failed.as_str())
            .bind("deadline exceeded before dispatch")
            .bind(queue_core::error_codes::DEADLINE_EXCEEDED)
            .bind(now)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .bind(JobStatus::Pending.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let sql = format!(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') as pending,
                COUNT(*) FILTER (WHERE status = 'PROCESSING') as processing,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') as completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') as failed,
                COUNT(*) FILTER (WHERE status = 'ABORTING') as aborting,
                COUNT(*) FILTER (WHERE status = 'DISABLED') as disabled,
                COUNT(*) FILTER (WHERE status = 'FAILED' AND error_code = 'RETRIES_EXHAUSTED') as failed_exhausted
             FROM {table} WHERE {scope}",
            table = self.table,
            scope = self.scope_clause()
        );
        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(QueueStats {
            pending: row.try_get::<i64, _>("pending").map_err(sqlx_err)? as u64,
            processing: row.try_get::<i64, _>("processing").map_err(sqlx_err)? as u64,
            completed: row.try_get::<i64, _>("completed").map_err(sqlx_err)? as u64,
            failed: row.try_get::<i64, _>("failed").map_err(sqlx_err)? as u64,
            aborting: row.try_get::<i64, _>("aborting").map_err(sqlx_err)? as u64,
            disabled: row.try_get::<i64, _>("disabled").map_err(sqlx_err)? as u64,
            failed_exhausted: row.try_get::<i64, _>("failed_exhausted").map_err(sqlx_err)? as u64,
        })
    }

    async fn snapshot(&self) -> QueueResult<Vec<Job>> {
        let sql = format!("SELECT * FROM {table} WHERE {scope}", table = self.table, scope = self.scope_clause());
        let rows = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(&self.prefix_key)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(row_to_job).collect()
    }

    fn native_change_feed(&self) -> Option<tokio::sync::broadcast::Receiver<ChangeNotice>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn storage() -> SqliteQueueStorage {
        let storage = SqliteQueueStorage::open(":memory:", "summaries", PrefixSchema::new())
            .await
            .unwrap();
        storage.setup().await.unwrap();
        storage
    }

    fn input(task_type: &str) -> JobInput {
        JobInput::new(task_type, json!({"x": 1}))
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let storage = storage().await;
        let job = storage.add(input("summarize")).await.unwrap();
        let fetched = storage.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.task_type, "summarize");
    }

    #[tokio::test]
    async fn next_transitions_to_processing_and_is_exclusive() {
        let storage = storage().await;
        storage.add(input("a")).await.unwrap();
        let dispatched = storage.next("worker-1").await.unwrap().unwrap();
        assert_eq!(dispatched.status, JobStatus::Processing);
        assert!(storage.next("worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_rejects_illegal_transition() {
        let storage = storage().await;
        let job = storage.add(input("a")).await.unwrap();
        let err = storage
            .complete(&job.id, CompleteUpdate::Completed { output: json!(null) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn output_for_input_caches_by_fingerprint() {
        let storage = storage().await;
        let payload = json!({"text": "hi"});
        let job = storage.add(JobInput::new("summarize", payload.clone())).await.unwrap();
        storage.next("w").await.unwrap();
        storage
            .complete(&job.id, CompleteUpdate::Completed { output: json!("cached") })
            .await
            .unwrap();
        assert_eq!(storage.output_for_input(&payload).await.unwrap(), Some(json!("cached")));
    }

    #[tokio::test]
    async fn reclaim_stale_leases_reverts_to_pending() {
        let storage = storage().await;
        let job = storage.add(input("a")).await.unwrap();
        storage.next("worker-1").await.unwrap();
        let reclaimed = storage.reclaim_stale_leases(-1).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(storage.get(&job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn fail_expired_deadlines_marks_failed() {
        let storage = storage().await;
        let past = Utc::now() - chrono::Duration::seconds(1);
        let mut expired = input("a");
        expired.deadline_at = Some(past);
        let job = storage.add(expired).await.unwrap();
        assert_eq!(storage.fail_expired_deadlines().await.unwrap(), 1);
        let after = storage.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn conformance_suite_passes() {
        let storage = storage().await;
        queue_testing::run_single_instance_suite(&storage).await;
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let storage = storage().await;
        storage.add(input("a")).await.unwrap();
        storage.add(input("a")).await.unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn conformance_prefix_isolation_passes() {
        use queue_core::{PrefixColumn, PrefixValue};

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        let schema = |tenant: &str| {
            PrefixSchema::new().with_value(
                PrefixColumn::uuid("tenant"),
                PrefixValue::Text(tenant.to_string()),
            )
        };

        let a = SqliteQueueStorage::from_pool(pool.clone(), "summaries", schema("tenant-a"));
        let b = SqliteQueueStorage::from_pool(pool, "summaries", schema("tenant-b"));
        a.setup().await.unwrap();
        b.setup().await.unwrap();

        queue_testing::run_prefix_isolation_suite(&a, &b).await;
    }
}
