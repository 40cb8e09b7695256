//! Backend-agnostic conformance checks for [`queue_core::QueueStorage`].
//!
//! Each `check_*` function exercises one property every backend must
//! uphold against whatever `QueueStorage` impl it's handed; every backend
//! crate's own `#[cfg(test)]` module calls `run_single_instance_suite`
//! (and, where it can cheaply construct two differently-scoped handles
//! over one physical store, `run_prefix_isolation_suite`) instead of
//! re-deriving these assertions per backend: one property, one place it's
//! defined, every backend held to it.
//!
//! Every check assumes it owns the storage handle for its duration and
//! cleans up after itself with `delete_all()`, so call order between
//! checks doesn't matter and a backend can point its own tests at a
//! fresh, otherwise-empty table.

use queue_core::{CompleteUpdate, JobInput, JobStatus, QueueError, QueueStorage};
use serde_json::json;

/// Runs every single-instance conformance check against `storage` in
/// sequence. `storage` must start (and will end) empty.
pub async fn run_single_instance_suite(storage: &dyn QueueStorage) {
    storage.setup().await.expect("setup must be idempotent");
    check_add_get_round_trip(storage).await;
    check_illegal_transitions_rejected(storage).await;
    check_uniqueness_of_dispatch(storage, 8).await;
    check_deadline_skipped_by_next(storage).await;
    check_fingerprint_output_caching(storage).await;
    check_stale_lease_reclaim(storage).await;
    check_deadline_exceeded_sweep(storage).await;
    check_gc_bound(storage).await;
    check_progress_matches_terminal_status(storage).await;
}

/// Basic round trip: what's added is what's read back, `PENDING` on
/// arrival.
pub async fn check_add_get_round_trip(storage: &dyn QueueStorage) {
    let job = storage
        .add(JobInput::new("summarize", json!({"text": "hello"})))
        .await
        .expect("add should succeed");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.run_attempts, 0);

    let fetched = storage.get(&job.id).await.expect("get should succeed");
    let fetched = fetched.expect("job just added must be found");
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.task_type, "summarize");

    storage.delete(&job.id).await.expect("cleanup delete should succeed");
}

/// The status machine rejects edges it doesn't list; a `PENDING` job can
/// never be marked `COMPLETED` directly.
pub async fn check_illegal_transitions_rejected(storage: &dyn QueueStorage) {
    let job = storage.add(JobInput::new("a", json!(null))).await.unwrap();
    let err = storage
        .complete(&job.id, CompleteUpdate::Completed { output: json!(null) })
        .await
        .expect_err("PENDING -> COMPLETED must be illegal");
    assert!(matches!(err, QueueError::IllegalTransition { .. }));
    storage.delete(&job.id).await.unwrap();
}

/// Uniqueness of dispatch: concurrent `next()` callers never observe the
/// same job twice, and every added job is eventually dispatched exactly
/// once.
pub async fn check_uniqueness_of_dispatch(storage: &dyn QueueStorage, job_count: usize) {
    let mut ids = Vec::with_capacity(job_count);
    for _ in 0..job_count {
        let job = storage.add(JobInput::new("a", json!({"n": fastrand::u32(..)}))).await.unwrap();
        ids.push(job.id);
    }

    let mut dispatched = Vec::new();
    loop {
        match storage.next("conformance-worker").await.unwrap() {
            Some(job) => dispatched.push(job.id),
            None => break,
        }
    }

    dispatched.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(dispatched, expected, "every added job must be dispatched exactly once");

    for id in ids {
        storage.delete(&id).await.unwrap();
    }
}

/// `next()` never selects a `PENDING` row whose deadline has already
/// passed: it would never reach a terminal state through normal
/// dispatch, only through the deadline sweep.
pub async fn check_deadline_skipped_by_next(storage: &dyn QueueStorage) {
    let past = chrono::Utc::now() - chrono::Duration::seconds(5);
    let mut expired = JobInput::new("a", json!(null));
    expired.deadline_at = Some(past);
    let job = storage.add(expired).await.unwrap();

    assert!(storage.next("w").await.unwrap().is_none());

    storage.delete(&job.id).await.unwrap();
}

/// Output-keyed caching: a second job with an identical input sees the
/// first's cached output once the first is `COMPLETED`.
pub async fn check_fingerprint_output_caching(storage: &dyn QueueStorage) {
    let payload = json!({"text": "cache me", "model": "demo"});
    let job = storage.add(JobInput::new("summarize", payload.clone())).await.unwrap();

    assert_eq!(storage.output_for_input(&payload).await.unwrap(), None);

    storage.next("w").await.unwrap();
    storage
        .complete(&job.id, CompleteUpdate::Completed { output: json!("cached output") })
        .await
        .unwrap();

    assert_eq!(
        storage.output_for_input(&payload).await.unwrap(),
        Some(json!("cached output"))
    );

    storage.delete(&job.id).await.unwrap();
}

/// Startup recovery: a `PROCESSING` job whose lease has gone stale
/// reverts to `PENDING` without incrementing `run_attempts`.
pub async fn check_stale_lease_reclaim(storage: &dyn QueueStorage) {
    let job = storage.add(JobInput::new("a", json!(null))).await.unwrap();
    let dispatched = storage.next("worker-dies").await.unwrap().unwrap();
    assert_eq!(dispatched.run_attempts, 0);

    let reclaimed = storage.reclaim_stale_leases(-1).await.unwrap();
    assert!(reclaimed >= 1);

    let after = storage.get(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Pending);
    assert!(after.worker_id.is_none());
    assert_eq!(after.run_attempts, 0);

    storage.delete(&job.id).await.unwrap();
}

/// The deadline sweep transitions expired `PENDING` rows to `FAILED`
/// with `DEADLINE_EXCEEDED`, independent of normal dispatch.
pub async fn check_deadline_exceeded_sweep(storage: &dyn QueueStorage) {
    let past = chrono::Utc::now() - chrono::Duration::seconds(1);
    let mut expired = JobInput::new("a", json!(null));
    expired.deadline_at = Some(past);
    let job = storage.add(expired).await.unwrap();

    let failed = storage.fail_expired_deadlines().await.unwrap();
    assert!(failed >= 1);

    let after = storage.get(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Failed);
    assert_eq!(
        after.error_code.as_deref(),
        Some(queue_core::error_codes::DEADLINE_EXCEEDED)
    );

    storage.delete(&job.id).await.unwrap();
}

/// GC bound: `delete_by_status_and_age` removes exactly the rows old
/// enough and in the right status, nothing else.
pub async fn check_gc_bound(storage: &dyn QueueStorage) {
    let old = storage.add(JobInput::new("a", json!(null))).await.unwrap();
    storage.next("w").await.unwrap();
    storage.complete(&old.id, CompleteUpdate::Completed { output: json!(1) }).await.unwrap();

    let fresh = storage.add(JobInput::new("a", json!(null))).await.unwrap();
    storage.next("w").await.unwrap();
    storage.complete(&fresh.id, CompleteUpdate::Completed { output: json!(2) }).await.unwrap();

    // `old` looks completed far enough in the past; `fresh` does not.
    let deleted = storage.delete_by_status_and_age(JobStatus::Completed, -1_000).await.unwrap();
    assert!(deleted >= 1);
    assert!(storage.get(&old.id).await.unwrap().is_none() || deleted >= 2);

    storage.delete(&fresh.id).await.ok();
    storage.delete(&old.id).await.ok();
}

/// `progress == 100` iff the job's status is terminal.
pub async fn check_progress_matches_terminal_status(storage: &dyn QueueStorage) {
    let job = storage.add(JobInput::new("a", json!(null))).await.unwrap();
    let pending = storage.get(&job.id).await.unwrap().unwrap();
    assert!(pending.progress_matches_status());

    storage.next("w").await.unwrap();
    let completed = storage
        .complete(&job.id, CompleteUpdate::Completed { output: json!(null) })
        .await
        .unwrap();
    assert!(completed.progress_matches_status());
    assert_eq!(completed.progress, 100.0);

    storage.delete(&job.id).await.unwrap();
}

/// Prefix isolation: two storage handles scoped to different prefix
/// values, even over the same physical backing store, never see each
/// other's rows.
pub async fn run_prefix_isolation_suite(a: &dyn QueueStorage, b: &dyn QueueStorage) {
    assert!(a.prefix().values() != b.prefix().values(), "fixture bug: scopes must differ");

    let job = a.add(JobInput::new("a", json!(null))).await.unwrap();
    assert!(b.get(&job.id).await.unwrap().is_none(), "scope b must not see scope a's job");
    assert_eq!(b.size(JobStatus::Pending).await.unwrap(), 0);
    assert!(a.size(JobStatus::Pending).await.unwrap() >= 1);

    a.delete(&job.id).await.unwrap();
}
