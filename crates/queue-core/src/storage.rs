//! The backend-neutral storage contract every queue backend implements.
//! This is the stable seam: `queue-memory`, `queue-sqlite`,
//! `queue-objectstore`, and `queue-postgres` are all just `QueueStorage`
//! impls, and `queue-testing`'s conformance suite exercises any of them
//! through this trait alone.

use crate::error::QueueResult;
use crate::job::{Job, JobInput, JobStatus};
use crate::prefix::PrefixSchema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The caller-prepared terminal or retry update passed to
/// [`QueueStorage::complete`]. `run_attempts` bookkeeping (increment by
/// exactly one, except `Disabled`) is the storage backend's job, not the
/// caller's - see each variant's doc for what the backend must additionally
/// write.
#[derive(Debug, Clone)]
pub enum CompleteUpdate {
    /// `output` is stored, `completed_at=now`, `progress=100`.
    Completed { output: Value },
    /// `error`/`error_code` stored, `completed_at=now`, `progress=100`.
    Failed {
        error: String,
        error_code: String,
    },
    /// Progress is cleared, `run_after` is advanced, `error`/`error_code`
    /// recorded for visibility even though the job goes back to `PENDING`.
    Retry {
        run_after: DateTime<Utc>,
        error: Option<String>,
        error_code: Option<String>,
    },
    /// `run_attempts` is left unchanged; `completed_at` is still set.
    Disabled,
}

/// Aggregate counts by status, plus a dead-letter-style breakdown for
/// operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborting: u64,
    pub disabled: u64,
    /// Subset of `failed` whose `error_code == RETRIES_EXHAUSTED`.
    pub failed_exhausted: u64,
}

/// The contract every backend implements. All operations are implicitly
/// scoped to `queue_name()` and `prefix()`'s fixed values: every query
/// filters by `queue_name` and, if configured, by every prefix column.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    fn queue_name(&self) -> &str;
    fn prefix(&self) -> &PrefixSchema;

    /// Idempotently ensure schema/indexes exist.
    async fn setup(&self) -> QueueResult<()>;

    /// Assign an id, stamp timestamps, fingerprint the input, store as
    /// `PENDING`.
    async fn add(&self, input: JobInput) -> QueueResult<Job>;

    async fn get(&self, id: &str) -> QueueResult<Option<Job>>;

    /// Atomically select one eligible `PENDING` job (`run_after <= now`,
    /// ordered `run_after ASC, id ASC`), transition it to `PROCESSING`, and
    /// return it. Must never return the same job to two concurrent
    /// callers. Rows whose `deadline_at` has already passed are skipped,
    /// not returned.
    async fn next(&self, worker_id: &str) -> QueueResult<Option<Job>>;

    /// Read-only slice of jobs in `status`, ordered `run_after ASC, id ASC`,
    /// no state change.
    async fn peek(&self, status: JobStatus, n: usize) -> QueueResult<Vec<Job>>;

    async fn size(&self, status: JobStatus) -> QueueResult<u64>;

    /// Apply a caller-prepared terminal or retry update. See
    /// [`CompleteUpdate`] for what each variant writes.
    async fn complete(&self, id: &str, update: CompleteUpdate) -> QueueResult<Job>;

    /// Set `status=ABORTING`; does not increment `run_attempts`.
    async fn abort(&self, id: &str) -> QueueResult<()>;

    async fn get_by_run_id(&self, run_id: &str) -> QueueResult<Vec<Job>>;

    /// Look up the cached output of the most recent `COMPLETED` job whose
    /// fingerprint matches `input`, within this instance's `(queue_name,
    /// prefix)` scope.
    async fn output_for_input(&self, input: &Value) -> QueueResult<Option<Value>>;

    /// Direct column write; must not change `status`.
    async fn save_progress(
        &self,
        id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<Value>,
    ) -> QueueResult<()>;

    async fn delete(&self, id: &str) -> QueueResult<()>;

    async fn delete_all(&self) -> QueueResult<u64>;

    /// Deletes exactly the rows with `status=S AND completed_at <=
    /// now-older_than_ms`.
    async fn delete_by_status_and_age(
        &self,
        status: JobStatus,
        older_than_ms: i64,
    ) -> QueueResult<u64>;

    /// Reclaims `PROCESSING` jobs whose lease is older than
    /// `stale_after_ms`: reverts to `PENDING`, clears `worker_id`, sets
    /// `run_after=now`. `run_attempts` is NOT incremented. Returns the
    /// number of jobs reclaimed.
    async fn reclaim_stale_leases(&self, stale_after_ms: i64) -> QueueResult<u64>;

    /// Transitions `PENDING` rows whose `deadline_at` has already passed to
    /// `FAILED` with `error_code=DEADLINE_EXCEEDED`. `next()` never selects
    /// these rows (they would never otherwise reach a terminal state), so
    /// this backend-level sweep, called periodically by the runtime, is
    /// what moves them to a terminal state. `run_attempts` is left
    /// unchanged: the job never entered `PROCESSING`.
    async fn fail_expired_deadlines(&self) -> QueueResult<u64>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// A full, in-scope snapshot of jobs, used by the generic polling
    /// [`crate::subscription::SubscriptionManager`] to diff against the
    /// previous poll. Backends with a cheap native change feed may ignore
    /// this in favor of [`QueueStorage::native_change_feed`].
    async fn snapshot(&self) -> QueueResult<Vec<Job>>;

    /// Backends with a native change-notification mechanism (cloud-hosted
    /// SQL's `LISTEN`/`NOTIFY`) return a receiver here; the subscription
    /// manager forwards its events directly instead of polling, though it
    /// still runs a low-frequency backup poll.
    fn native_change_feed(&self) -> Option<tokio::sync::broadcast::Receiver<ChangeNotice>> {
        None
    }
}

/// A cheap "something changed" signal a backend can broadcast natively.
/// Distinct from [`crate::subscription::ChangePayload`]: this just tells
/// listeners to re-poll immediately, it does not itself carry the diff -
/// listeners respond by polling immediately and then quiescing.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    pub queue_name: String,
}
