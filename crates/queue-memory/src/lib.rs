//! In-memory [`QueueStorage`] backend.
//!
//! This is the reference implementation: no persistence, no network, a
//! single mutex protecting the whole table and guarding dispatch's
//! scan-then-mutate. It exists for unit tests, demos, and as the oracle
//! the conformance suite in `queue-testing` is written against before
//! being pointed at a real backend.
//!
//! Multiple [`MemoryQueueStorage`] instances can share one [`MemoryDb`],
//! each scoped to its own `(queue_name, prefix)` pair, exactly like several
//! `QueueStorage` handles pointed at the same physical table in the SQL
//! backends. This is what lets prefix isolation be exercised without
//! spinning up a real database.

use async_trait::async_trait;
use chrono::Utc;
use queue_core::{
    ChangeNotice, CompleteUpdate, Job, JobInput, JobStatus, PrefixSchema, QueueError, QueueResult,
    QueueStats, QueueStorage,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Shared table backing one or more [`MemoryQueueStorage`] scopes. Cheaply
/// cloneable; every clone points at the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryDb {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce a storage handle scoped to `queue_name`/`prefix`, sharing
    /// this db's underlying table.
    pub fn scope(&self, queue_name: impl Into<String>, prefix: PrefixSchema) -> MemoryQueueStorage {
        MemoryQueueStorage {
            db: self.clone(),
            queue_name: queue_name.into(),
            prefix,
        }
    }
}

/// A `(queue_name, prefix)`-scoped view over a [`MemoryDb`].
pub struct MemoryQueueStorage {
    db: MemoryDb,
    queue_name: String,
    prefix: PrefixSchema,
}

impl MemoryQueueStorage {
    /// Convenience constructor for a storage handle with its own private
    /// table - the common case in tests and demos that don't need to share
    /// state across instances.
    pub fn new(queue_name: impl Into<String>, prefix: PrefixSchema) -> Self {
        MemoryDb::new().scope(queue_name, prefix)
    }

    fn in_scope(&self, job: &Job) -> bool {
        job.queue_name == self.queue_name && job.prefix == *self.prefix.values()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
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
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        Ok(jobs.get(id).filter(|j| self.in_scope(j)).cloned())
    }

    async fn next(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let candidate_id = jobs
            .values()
            .filter(|j| {
                self.in_scope(j)
                    && j.status == JobStatus::Pending
                    && j.run_after <= now
                    && j.deadline_at.map(|d| d > now).unwrap_or(true)
            })
            .min_by(|a, b| (a.run_after, &a.id).cmp(&(b.run_after, &b.id)))
            .map(|j| j.id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).expect("candidate id just selected from map");
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.last_ran_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn peek(&self, status: JobStatus, n: usize) -> QueueResult<Vec<Job>> {
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| self.in_scope(j) && j.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.run_after, &a.id).cmp(&(b.run_after, &b.id)));
        matching.truncate(n);
        Ok(matching)
    }

    async fn size(&self, status: JobStatus) -> QueueResult<u64> {
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        Ok(jobs
            .values()
            .filter(|j| self.in_scope(j) && j.status == status)
            .count() as u64)
    }

    async fn complete(&self, id: &str, update: CompleteUpdate) -> QueueResult<Job> {
        let now = Utc::now();
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let job = jobs
            .get_mut(id)
            .filter(|j| self.in_scope(j))
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

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
        Ok(job.clone())
    }

    async fn abort(&self, id: &str) -> QueueResult<()> {
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let job = jobs
            .get_mut(id)
            .filter(|j| self.in_scope(j))
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !job.status.can_transition_to(JobStatus::Aborting) {
            return Err(QueueError::IllegalTransition {
                from: job.status.to_string(),
                to: JobStatus::Aborting.to_string(),
            });
        }
        job.status = JobStatus::Aborting;
        Ok(())
    }

    async fn get_by_run_id(&self, run_id: &str) -> QueueResult<Vec<Job>> {
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        Ok(jobs
            .values()
            .filter(|j| self.in_scope(j) && j.job_run_id.as_deref() == Some(run_id))
            .cloned()
            .collect())
    }

    async fn output_for_input(&self, input: &Value) -> QueueResult<Option<Value>> {
        let fingerprint = queue_core::fingerprint(input);
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        Ok(jobs
            .values()
            .filter(|j| {
                self.in_scope(j) && j.status == JobStatus::Completed && j.fingerprint == fingerprint
            })
            .max_by_key(|j| j.completed_at)
            .and_then(|j| j.output.clone()))
    }

    async fn save_progress(
        &self,
        id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<Value>,
    ) -> QueueResult<()> {
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let job = jobs
            .get_mut(id)
            .filter(|j| self.in_scope(j))
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.progress = progress;
        job.progress_message = message;
        job.progress_details = details;
        Ok(())
    }

    async fn delete(&self, id: &str) -> QueueResult<()> {
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        if jobs.get(id).filter(|j| self.in_scope(j)).is_some() {
            jobs.remove(id);
        }
        Ok(())
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let ids: Vec<String> = jobs
            .values()
            .filter(|j| self.in_scope(j))
            .map(|j| j.id.clone())
            .collect();
        for id in &ids {
            jobs.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn delete_by_status_and_age(
        &self,
        status: JobStatus,
        older_than_ms: i64,
    ) -> QueueResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let ids: Vec<String> = jobs
            .values()
            .filter(|j| {
                self.in_scope(j)
                    && j.status == status
                    && j.completed_at.map(|c| c <= cutoff).unwrap_or(false)
            })
            .map(|j| j.id.clone())
            .collect();
        for id in &ids {
            jobs.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn reclaim_stale_leases(&self, stale_after_ms: i64) -> QueueResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(stale_after_ms);
        let now = Utc::now();
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let mut reclaimed = 0u64;
        for job in jobs.values_mut() {
            if self.in_scope(job)
                && job.status == JobStatus::Processing
                && job.last_ran_at.map(|t| t <= cutoff).unwrap_or(true)
            {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.run_after = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn fail_expired_deadlines(&self) -> QueueResult<u64> {
        let now = Utc::now();
        let mut jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let mut failed = 0u64;
        for job in jobs.values_mut() {
            if self.in_scope(job)
                && job.status == JobStatus::Pending
                && job.deadline_at.map(|d| d <= now).unwrap_or(false)
            {
                job.status = JobStatus::Failed;
                job.error_code = Some(queue_core::error_codes::DEADLINE_EXCEEDED.to_string());
                job.error = Some("deadline exceeded before dispatch".to_string());
                job.completed_at = Some(now);
                job.progress = 100.0;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| self.in_scope(j)) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    if job.error_code.as_deref() == Some(queue_core::error_codes::RETRIES_EXHAUSTED)
                    {
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
        let jobs = self.db.jobs.lock().expect("memory db mutex poisoned");
        Ok(jobs.values().filter(|j| self.in_scope(j)).cloned().collect())
    }

    fn native_change_feed(&self) -> Option<tokio::sync::broadcast::Receiver<ChangeNotice>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::PrefixColumn;
    use queue_core::PrefixValue;
    use serde_json::json;

    fn input(task_type: &str) -> JobInput {
        JobInput::new(task_type, json!({"x": 1}))
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let storage = MemoryQueueStorage::new("summaries", PrefixSchema::new());
        let job = storage.add(input("summarize")).await.unwrap();
        let fetched = storage.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn next_dispatches_in_run_after_order() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let first = storage.add(input("a")).await.unwrap();
        let second = storage.add(input("a")).await.unwrap();
        let dispatched = storage.next("worker-1").await.unwrap().unwrap();
        assert!(dispatched.id == first.id || dispatched.id == second.id);
        assert_eq!(dispatched.status, JobStatus::Processing);
        // The other one is still pending and is returned next.
        let second_dispatch = storage.next("worker-1").await.unwrap().unwrap();
        assert_ne!(second_dispatch.id, dispatched.id);
    }

    #[tokio::test]
    async fn next_skips_jobs_with_expired_deadline() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let past = Utc::now() - chrono::Duration::seconds(5);
        let mut past_due = input("a");
        past_due.deadline_at = Some(past);
        storage.add(past_due).await.unwrap();
        assert!(storage.next("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_rejects_illegal_transition() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let job = storage.add(input("a")).await.unwrap();
        let err = storage
            .complete(&job.id, CompleteUpdate::Completed { output: json!(null) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn output_for_input_returns_most_recent_completed_match() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let payload = json!({"text": "hello"});
        let job = storage
            .add(JobInput::new("summarize", payload.clone()))
            .await
            .unwrap();
        storage.next("w").await.unwrap();
        storage
            .complete(&job.id, CompleteUpdate::Completed { output: json!("cached") })
            .await
            .unwrap();
        let cached = storage.output_for_input(&payload).await.unwrap();
        assert_eq!(cached, Some(json!("cached")));
    }

    #[tokio::test]
    async fn prefix_isolation_scopes_instances_sharing_one_db() {
        let db = MemoryDb::new();
        let tenant_a = db.scope(
            "q",
            PrefixSchema::new().with_value(
                PrefixColumn::uuid("tenant"),
                PrefixValue::Uuid(Uuid::nil()),
            ),
        );
        let tenant_b = db.scope(
            "q",
            PrefixSchema::new().with_value(
                PrefixColumn::uuid("tenant"),
                PrefixValue::Uuid(Uuid::new_v4()),
            ),
        );
        let job = tenant_a.add(input("a")).await.unwrap();
        assert!(tenant_b.get(&job.id).await.unwrap().is_none());
        assert_eq!(tenant_a.size(JobStatus::Pending).await.unwrap(), 1);
        assert_eq!(tenant_b.size(JobStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reclaim_stale_leases_reverts_to_pending() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let job = storage.add(input("a")).await.unwrap();
        storage.next("worker-1").await.unwrap();
        let reclaimed = storage.reclaim_stale_leases(-1).await.unwrap();
        assert_eq!(reclaimed, 1);
        let after = storage.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert!(after.worker_id.is_none());
    }

    #[tokio::test]
    async fn fail_expired_deadlines_marks_pending_rows_failed() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let past = Utc::now() - chrono::Duration::seconds(1);
        let mut expired = input("a");
        expired.deadline_at = Some(past);
        let job = storage.add(expired).await.unwrap();
        let failed = storage.fail_expired_deadlines().await.unwrap();
        assert_eq!(failed, 1);
        let after = storage.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(
            after.error_code.as_deref(),
            Some(queue_core::error_codes::DEADLINE_EXCEEDED)
        );
    }

    #[tokio::test]
    async fn delete_by_status_and_age_only_removes_old_terminal_rows() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        let job = storage.add(input("a")).await.unwrap();
        storage.next("w").await.unwrap();
        storage
            .complete(&job.id, CompleteUpdate::Completed { output: json!(1) })
            .await
            .unwrap();
        let deleted = storage
            .delete_by_status_and_age(JobStatus::Completed, -1_000)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(storage.get(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conformance_suite_passes() {
        let storage = MemoryQueueStorage::new("conformance", PrefixSchema::new());
        queue_testing::run_single_instance_suite(&storage).await;
    }

    #[tokio::test]
    async fn conformance_prefix_isolation_passes() {
        let db = MemoryDb::new();
        let a = db.scope(
            "conformance",
            PrefixSchema::new().with_value(PrefixColumn::integer("tenant"), PrefixValue::Int(1)),
        );
        let b = db.scope(
            "conformance",
            PrefixSchema::new().with_value(PrefixColumn::integer("tenant"), PrefixValue::Int(2)),
        );
        queue_testing::run_prefix_isolation_suite(&a, &b).await;
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let storage = MemoryQueueStorage::new("q", PrefixSchema::new());
        storage.add(input("a")).await.unwrap();
        storage.add(input("a")).await.unwrap();
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 0);
    }
}
