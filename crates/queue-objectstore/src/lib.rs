//! Client-embedded [`QueueStorage`] backend, backed by `sled`, a
//! single-process embedded KV store.
//!
//! Unlike the SQL backends, there is no query planner to lean on: dispatch
//! order is maintained explicitly as a secondary index (`pending_index`)
//! whose keys sort lexicographically by `(run_after, id)`, so `next()` is a
//! cursor walk over that index rather than a `SELECT ... ORDER BY`. A
//! `tokio::sync::Mutex` serializes the scan-then-mutate the same way the
//! in-memory backend's single mutex does, since sled gives per-tree atomic
//! compare-and-swap but not a cross-tree `SELECT FOR UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_core::{
    ChangeNotice, CompleteUpdate, Job, JobInput, JobStatus, PrefixSchema, QueueError, QueueResult,
    QueueStats, QueueStorage,
};
use serde_json::Value;
use uuid::Uuid;

/// A `(queue_name, prefix)`-scoped handle over one sled database.
pub struct ObjectStoreQueueStorage {
    db: sled::Db,
    jobs: sled::Tree,
    pending_index: sled::Tree,
    queue_name: String,
    prefix: PrefixSchema,
    scope: String,
    dispatch_lock: tokio::sync::Mutex<()>,
}

impl ObjectStoreQueueStorage {
    /// Opens (creating if absent) the sled database at `path`.
    pub fn open(path: &str, queue_name: impl Into<String>, prefix: PrefixSchema) -> QueueResult<Self> {
        let db = sled::open(path).map_err(|e| QueueError::Backend(e.into()))?;
        Self::from_db(db, queue_name, prefix)
    }

    /// An ephemeral, non-persistent database, useful for tests and demos.
    pub fn open_temporary(queue_name: impl Into<String>, prefix: PrefixSchema) -> QueueResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| QueueError::Backend(e.into()))?;
        Self::from_db(db, queue_name, prefix)
    }

    /// Build a storage handle from an already-open database, useful for
    /// sharing one sled database across multiple queues/prefixes in tests.
    pub fn from_db(db: sled::Db, queue_name: impl Into<String>, prefix: PrefixSchema) -> QueueResult<Self> {
        let table = prefix.table_name();
        let jobs = db
            .open_tree(format!("{table}__jobs"))
            .map_err(|e| QueueError::Backend(e.into()))?;
        let pending_index = db
            .open_tree(format!("{table}__pending_index"))
            .map_err(|e| QueueError::Backend(e.into()))?;
        let queue_name = queue_name.into();
        let prefix_key = serde_json::to_string(prefix.values()).expect("prefix values always serialize");
        let scope = format!("{queue_name}\0{prefix_key}");
        Ok(Self {
            db,
            jobs,
            pending_index,
            queue_name,
            prefix,
            scope,
            dispatch_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn job_key(&self, id: &str) -> Vec<u8> {
        format!("{}\0{id}", self.scope).into_bytes()
    }

    fn pending_key(&self, run_after: DateTime<Utc>, id: &str) -> Vec<u8> {
        format!("{}\0{:020}\0{id}", self.scope, run_after.timestamp_millis().max(0)).into_bytes()
    }

    fn store_job(&self, job: &Job) -> QueueResult<()> {
        let bytes = serde_json::to_vec(job)?;
        self.jobs
            .insert(self.job_key(&job.id), bytes)
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(())
    }

    fn load_job(&self, id: &str) -> QueueResult<Option<Job>> {
        let bytes = self.jobs.get(self.job_key(id)).map_err(|e| QueueError::Backend(e.into()))?;
        bytes.map(|b| serde_json::from_slice(&b)).transpose().map_err(QueueError::from)
    }

    fn index_pending(&self, job: &Job) -> QueueResult<()> {
        self.pending_index
            .insert(self.pending_key(job.run_after, &job.id), job.id.as_bytes())
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(())
    }

    fn unindex_pending(&self, run_after: DateTime<Utc>, id: &str) -> QueueResult<()> {
        self.pending_index
            .remove(self.pending_key(run_after, id))
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(())
    }

    fn scan_scope(&self) -> QueueResult<Vec<Job>> {
        let prefix = format!("{}\0", self.scope);
        let mut out = Vec::new();
        for entry in self.jobs.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry.map_err(|e| QueueError::Backend(e.into()))?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl QueueStorage for ObjectStoreQueueStorage {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn prefix(&self) -> &PrefixSchema {
        &self.prefix
    }

    async fn setup(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn add(&self, input: JobInput) -> QueueResult<Job> {
        let now = Utc::now();
        let fingerprint = queue_core::fingerprint(&input.input);
        let job = Job {
            id: Uuid::new_v4().to_string(),
            queue_name: self.queue_name.clone(),
            prefix: self.prefix.values().clone(),
            task_type: input.task_type,
            model_name: input.model_name,
            job_run_id: input.job_run_id,
            fingerprint,
            input: input.input,
            output: None,
            status: JobStatus::Pending,
            error: None,
            error_code: None,
            run_attempts: 0,
            max_retries: input.max_retries,
            run_after: input.run_after.unwrap_or(now),
            deadline_at: input.deadline_at,
            created_at: now,
            last_ran_at: None,
            completed_at: None,
            progress: 0.0,
            progress_message: None,
            progress_details: None,
            worker_id: None,
        };
        self.store_job(&job)?;
        self.index_pending(&job)?;
        self.db.flush_async().await.map_err(|e| QueueError::Backend(e.into()))?;
        Ok(job)
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        self.load_job(id)
    }

    async fn next(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let _guard = self.dispatch_lock.lock().await;
        let now = Utc::now();
        let prefix = format!("{}\0", self.scope);

        let mut dispatched = None;
        for entry in self.pending_index.scan_prefix(prefix.as_bytes()) {
            let (key, id_bytes) = entry.map_err(|e| QueueError::Backend(e.into()))?;
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            let Some(mut job) = self.load_job(&id)? else {
                self.pending_index.remove(key).map_err(|e| QueueError::Backend(e.into()))?;
                continue;
            };
            if job.run_after > now {
                break; // index is sorted by run_after: nothing further is eligible yet
            }
            if job.deadline_at.map(|d| d <= now).unwrap_or(false) {
                continue; // left for fail_expired_deadlines, never dispatched
            }
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.to_string());
            job.last_ran_at = Some(now);
            self.store_job(&job)?;
            self.pending_index.remove(key).map_err(|e| QueueError::Backend(e.into()))?;
            dispatched = Some(job);
            break;
        }
        if dispatched.is_some() {
            self.db.flush_async().await.map_err(|e| QueueError::Backend(e.into()))?;
        }
        Ok(dispatched)
    }

    async fn peek(&self, status: JobStatus, n: usize) -> QueueResult<Vec<Job>> {
        let mut matching: Vec<Job> = self
            .scan_scope()?
            .into_iter()
            .filter(|j| j.status == status)
            .collect();
        matching.sort_by(|a, b| (a.run_after, &a.id).cmp(&(b.run_after, &b.id)));
        matching.truncate(n);
        Ok(matching)
    }

    async fn size(&self, status: JobStatus) -> QueueResult<u64> {
        Ok(self.scan_scope()?.into_iter().filter(|j| j.status == status).count() as u64)
    }

    async fn complete(&self, id: &str, update: CompleteUpdate) -> QueueResult<Job> {
        let mut job = self.load_job(id)?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let now = Utc::now();

        match update {
            CompleteUpdate::Completed { output } => {
                if !job.status.can_transition_to(JobStatus::Completed) {
                    return Err(QueueError::IllegalTransition {
                        from: job.status.to_string(),
                        to: JobStatus::Completed.to_string(),
                    });
                }
                job.output = Some(output);
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.progress = 100.0;
                job.run_attempts += 1;
            }
            CompleteUpdate::Failed { error, error_code } => {
                if !job.status.can_transition_to(JobStatus::Failed) {
                    return Err(QueueError::IllegalTransition {
                        from: job.status.to_string(),
                        to: JobStatus::Failed.to_string(),
                    });
                }
                job.error = Some(error);
                job.error_code = Some(error_code);
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.progress = 100.0;
                job.run_attempts += 1;
            }
            CompleteUpdate::Retry {
                run_after,
                error,
                error_code,
            } => {
                if !job.status.can_transition_to(JobStatus::Pending) {
                    return Err(QueueError::IllegalTransition {
                        from: job.status.to_string(),
                        to: JobStatus::Pending.to_string(),
                    });
                }
                job.status = JobStatus::Pending;
                job.run_after = run_after;
                job.error = error;
                job.error_code = error_code;
                job.progress = 0.0;
                job.progress_message = None;
                job.progress_details = None;
                job.worker_id = None;
                job.run_attempts += 1;
                self.store_job(&job)?;
                self.index_pending(&job)?;
                self.db.flush_async().await.map_err(|e| QueueError::Backend(e.into()))?;
                return Ok(job);
            }
            CompleteUpdate::Disabled => {
                if !job.status.can_transition_to(JobStatus::Disabled) {
                    return Err(QueueError::IllegalTransition {
                        from: job.status.to_string(),
                        to: JobStatus::Disabled.to_string(),
                    });
                }
                job.status = JobStatus::Disabled;
                job.completed_at = Some(now);
            }
        }
        self.store_job(&job)?;
        self.db.flush_async().await.map_err(|e| QueueError::Backend(e.into()))?;
        Ok(job)
    }

    async fn abort(&self, id: &str) -> QueueResult<()> {
        let mut job = self.load_job(id)?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !job.status.can_transition_to(JobStatus::Aborting) {
            return Err(QueueError::IllegalTransition {
                from: job.status.to_string(),
                to: JobStatus::Aborting.to_string(),
            });
        }
        job.status = JobStatus::Aborting;
        self.store_job(&job)?;
        Ok(())
    }

    async fn get_by_run_id(&self, run_id: &str) -> QueueResult<Vec<Job>> {
        Ok(self
            .scan_scope()?
            .into_iter()
            .filter(|j| j.job_run_id.as_deref() == Some(run_id))
            .collect())
    }

    async fn output_for_input(&self, input: &Value) -> QueueResult<Option<Value>> {
        let fingerprint = queue_core::fingerprint(input);
        Ok(self
            .scan_scope()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Completed && j.fingerprint == fingerprint)
            .max_by_key(|j| j.completed_at)
            .and_then(|j| j.output))
    }

    async fn save_progress(
        &self,
        id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<Value>,
    ) -> QueueResult<()> {
        let mut job = self.load_job(id)?.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.progress = progress;
        job.progress_message = message;
        job.progress_details = details;
        self.store_job(&job)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> QueueResult<()> {
        if let Some(job) = self.load_job(id)? {
            self.jobs.remove(self.job_key(id)).map_err(|e| QueueError::Backend(e.into()))?;
            if job.status == JobStatus::Pending {
                self.unindex_pending(job.run_after, id)?;
            }
        }
        Ok(())
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        let jobs = self.scan_scope()?;
        for job in &jobs {
            self.jobs.remove(self.job_key(&job.id)).map_err(|e| QueueError::Backend(e.into()))?;
            if job.status == JobStatus::Pending {
                self.unindex_pending(job.run_after, &job.id)?;
            }
        }
        Ok(jobs.len() as u64)
    }

    async fn delete_by_status_and_age(&self, status: JobStatus, older_than_ms: i64) -> QueueResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        let matching: Vec<Job> = self
            .scan_scope()?
            .into_iter()
            .filter(|j| j.status == status && j.completed_at.map(|c| c <= cutoff).unwrap_or(false))
            .collect();
        for job in &matching {
            self.jobs.remove(self.job_key(&job.id)).map_err(|e| QueueError::Backend(e.into()))?;
        }
        Ok(matching.len() as u64)
    }

    async fn reclaim_stale_leases(&self, stale_after_ms: i64) -> QueueResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(stale_after_ms);
        let now = Utc::now();
        let stale: Vec<Job> = self
            .scan_scope()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Processing && j.last_ran_at.map(|t| t <= cutoff).unwrap_or(true))
            .collect();
        for mut job in stale.clone() {
            job.status = JobStatus::Pending;
            job.worker_id = None;
            job.run_after = now;
            self.store_job(&job)?;
            self.index_pending(&job)?;
        }
        Ok(stale.len() as u64)
    }

    async fn fail_expired_deadlines(&self) -> QueueResult<u64> {
        let now = Utc::now();
        let expired: Vec<Job> = self
            .scan_scope()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending && j.deadline_at.map(|d| d <= now).unwrap_or(false))
            .collect();
        for mut job in expired.clone() {
            self.unindex_pending(job.run_after, &job.id)?;
            job.status = JobStatus::Failed;
            job.error_code = Some(queue_core::error_codes::DEADLINE_EXCEEDED.to_string());
            job.error = Some("deadline exceeded before dispatch".to_string());
            job.completed_at = Some(now);
            job.progress = 100.0;
            self.store_job(&job)?;
        }
        Ok(expired.len() as u64)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        for job in self.scan_scope()? {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    if job.error_code.as_deref() == Some(queue_core::error_codes::RETRIES_EXHAUSTED) {
                        stats.failed_exhausted += 1;
                    }
                }
                JobStatus::Aborting => stats.aborting += 1,
                JobStatus::Disabled => stats.disabled += 1,
            }
        }
        Ok(stats)
    }

    async fn snapshot(&self) -> QueueResult<Vec<Job>> {
        self.scan_scope()
    }

    fn native_change_feed(&self) -> Option<tokio::sync::broadcast::Receiver<ChangeNotice>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> ObjectStoreQueueStorage {
        ObjectStoreQueueStorage::open_temporary("summaries", PrefixSchema::new()).unwrap()
    }

    fn input(task_type: &str) -> JobInput {
        JobInput::new(task_type, json!({"x": 1}))
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let storage = storage();
        let job = storage.add(input("summarize")).await.unwrap();
        let fetched = storage.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn next_walks_the_pending_index_in_order() {
        let storage = storage();
        let first = storage.add(input("a")).await.unwrap();
        let second = storage.add(input("a")).await.unwrap();
        let dispatched_first = storage.next("w").await.unwrap().unwrap();
        let dispatched_second = storage.next("w").await.unwrap().unwrap();
        let mut ids = vec![dispatched_first.id, dispatched_second.id];
        ids.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(storage.next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_skips_jobs_past_their_deadline() {
        let storage = storage();
        let mut expired = input("a");
        expired.deadline_at = Some(Utc::now() - chrono::Duration::seconds(1));
        storage.add(expired).await.unwrap();
        assert!(storage.next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_reinserts_into_pending_index() {
        let storage = storage();
        let job = storage.add(input("a")).await.unwrap();
        storage.next("w").await.unwrap();
        storage
            .complete(
                &job.id,
                CompleteUpdate::Retry {
                    run_after: Utc::now(),
                    error: Some("transient".into()),
                    error_code: Some("RETRYABLE".into()),
                },
            )
            .await
            .unwrap();
        let again = storage.next("w").await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.run_attempts, 1);
    }

    #[tokio::test]
    async fn reclaim_stale_leases_reverts_and_reindexes() {
        let storage = storage();
        let job = storage.add(input("a")).await.unwrap();
        storage.next("w").await.unwrap();
        assert_eq!(storage.reclaim_stale_leases(-1).await.unwrap(), 1);
        let reclaimed = storage.next("w").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
    }

    #[tokio::test]
    async fn conformance_suite_passes() {
        let storage = storage();
        queue_testing::run_single_instance_suite(&storage).await;
    }

    #[tokio::test]
    async fn fail_expired_deadlines_removes_from_index() {
        let storage = storage();
        let mut expired = input("a");
        expired.deadline_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let job = storage.add(expired).await.unwrap();
        assert_eq!(storage.fail_expired_deadlines().await.unwrap(), 1);
        assert_eq!(storage.get(&job.id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(storage.next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conformance_prefix_isolation_passes() {
        use queue_core::{PrefixColumn, PrefixValue};

        let db = sled::Config::new().temporary(true).open().unwrap();

        let schema = |tenant: &str| {
            PrefixSchema::new().with_value(
                PrefixColumn::uuid("tenant"),
                PrefixValue::Text(tenant.to_string()),
            )
        };

        let a = ObjectStoreQueueStorage::from_db(db.clone(), "summaries", schema("tenant-a")).unwrap();
        let b = ObjectStoreQueueStorage::from_db(db, "summaries", schema("tenant-b")).unwrap();

        queue_testing::run_prefix_isolation_suite(&a, &b).await;
    }
}
