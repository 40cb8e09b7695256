//! The queue runtime: the worker pool that drives dispatch, execution,
//! retry, progress, and cancellation.

use crate::error::{classify, ErrorCategory};
use crate::job::{error_codes, Job, JobStatus};
use crate::storage::{CompleteUpdate, QueueStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// A model resolved from the [`ModelRepository`]. Deliberately opaque
/// beyond a name and capability tag: model shape is an external
/// collaborator's concern, not the queue's.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub task: String,
}

/// External collaborator: `find_by_name` is called at dispatch time to
/// attach the model to the job context.
pub trait ModelRepository: Send + Sync {
    fn find_by_name(&self, name: &str) -> Option<Model>;
    fn find_models_by_task(&self, task: &str) -> Vec<Model>;
}

/// The caller-supplied executor associated with one `(provider, task_type)`
/// pair.
#[async_trait]
pub trait RunFunction: Send + Sync {
    async fn run(
        &self,
        input: Value,
        model: Option<Model>,
        progress: ProgressReporter,
        cancel: CancelToken,
    ) -> anyhow::Result<Value>;
}

/// External collaborator: maps `(provider_name, task_type) ->
/// run_function`. `provider_name` is the runtime's queue name, since one
/// queue has one concurrency cap and one provider.
pub trait ProviderRegistry: Send + Sync {
    fn run_function(&self, provider: &str, task_type: &str) -> Option<Arc<dyn RunFunction>>;
}

/// Why a [`CancelToken`] was triggered; determines which terminal error
/// code the runtime records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Aborted,
    DeadlineExceeded,
}

/// Cooperative cancellation signal passed to run functions. Run functions
/// should poll [`CancelToken::is_cancelled`] or await
/// [`CancelToken::cancelled`] and return promptly once cancelled.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    reason: Arc<std::sync::Mutex<Option<CancelReason>>>,
    notify: Arc<tokio::sync::Notify>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(std::sync::Mutex::new(None)),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().expect("cancel token mutex poisoned")
    }

    fn trigger(&self, reason: CancelReason) {
        let mut slot = self.reason.lock().expect("cancel token mutex poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once cancelled; resolves immediately if already cancelled.
    /// An awaitable form of cancellation rather than a callback
    /// registration, so run functions can `tokio::select!` against it.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Coalescing progress callback passed to run functions: only emits to
/// storage when progress changes by at least a configured delta, or when
/// the message/details change.
#[derive(Clone)]
pub struct ProgressReporter {
    storage: Arc<dyn QueueStorage>,
    job_id: String,
    delta: f64,
    last: Arc<std::sync::Mutex<LastProgress>>,
}

#[derive(Default)]
struct LastProgress {
    progress: f64,
    message: Option<String>,
    details_hash: Option<u64>,
}

impl ProgressReporter {
    fn new(storage: Arc<dyn QueueStorage>, job_id: String, delta: f64) -> Self {
        Self {
            storage,
            job_id,
            delta,
            last: Arc::new(std::sync::Mutex::new(LastProgress::default())),
        }
    }

    /// Reports progress, writing to storage only if it clears the
    /// coalescing threshold. Never decreases what has already been
    /// recorded within this attempt.
    pub async fn report(&self, progress: f64, message: Option<String>, details: Option<Value>) {
        let details_hash = details.as_ref().map(hash_value);
        let should_emit = {
            let mut last = self.last.lock().expect("progress mutex poisoned");
            let progress_jumped = (progress - last.progress).abs() >= self.delta;
            let message_changed = message != last.message;
            let details_changed = details_hash != last.details_hash;
            if progress_jumped || message_changed || details_changed {
                last.progress = last.progress.max(progress);
                last.message = message.clone();
                last.details_hash = details_hash;
                true
            } else {
                false
            }
        };

        if should_emit {
            if let Err(err) = self
                .storage
                .save_progress(&self.job_id, progress, message, details)
                .await
            {
                tracing::warn!(job_id = %self.job_id, error = %err, "failed to save progress");
            }
        }
    }
}

fn hash_value(value: &Value) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Runtime tunables, exposed rather than hard-coded so deployments can
/// tune concurrency and timing to their own workload.
#[derive(Debug, Clone)]
pub struct QueueRuntimeConfig {
    /// Max in-flight executions per queue.
    pub concurrency: usize,
    /// Bounds for the jittered backoff used between empty `next()` polls.
    pub poll_interval_min: Duration,
    pub poll_interval_max: Duration,
    /// How often the runtime checks storage for `ABORTING` on jobs it
    /// owns. Default 500ms.
    pub abort_poll_interval: Duration,
    /// A `PROCESSING` lease older than this is reclaimed at startup,
    /// chosen generously relative to the abort-poll interval so normal
    /// long jobs aren't reclaimed.
    pub stale_lease_horizon: Duration,
    /// Minimum progress delta that triggers a storage write. Default 1.0.
    pub progress_coalesce_delta: f64,
    /// How long a run function is given to return after a cancel signal
    /// before the runtime gives up on waiting (but does not force-kill).
    /// Default 30s.
    pub grace_period: Duration,
    /// Exponential backoff base/cap for retries.
    pub retry_backoff_base_ms: i64,
    pub retry_backoff_max_ms: i64,
    /// How often the runtime sweeps `PENDING` jobs past their deadline
    /// into `FAILED(DEADLINE_EXCEEDED)`.
    pub deadline_sweep_interval: Duration,
}

impl Default for QueueRuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_min: Duration::from_millis(10),
            poll_interval_max: Duration::from_secs(1),
            abort_poll_interval: Duration::from_millis(500),
            stale_lease_horizon: Duration::from_secs(5 * 60),
            progress_coalesce_delta: 1.0,
            grace_period: Duration::from_secs(30),
            retry_backoff_base_ms: 200,
            retry_backoff_max_ms: 60_000,
            deadline_sweep_interval: Duration::from_secs(1),
        }
    }
}

fn backoff_ms(config: &QueueRuntimeConfig, attempt: u32) -> i64 {
    let shift = attempt.min(30);
    let scaled = config.retry_backoff_base_ms.saturating_mul(1i64 << shift);
    scaled.min(config.retry_backoff_max_ms)
}

/// The worker pool driving one queue. Construct one per queue; each runs
/// its own dispatch loop at its own concurrency cap.
pub struct QueueRuntime {
    storage: Arc<dyn QueueStorage>,
    providers: Arc<dyn ProviderRegistry>,
    models: Arc<dyn ModelRepository>,
    config: QueueRuntimeConfig,
    worker_id: String,
}

impl QueueRuntime {
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        providers: Arc<dyn ProviderRegistry>,
        models: Arc<dyn ModelRepository>,
        config: QueueRuntimeConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            providers,
            models,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Reclaims leases abandoned by a prior process. Call once before (or
    /// concurrently with) `start()`.
    pub async fn recover_stale_leases(&self) -> crate::error::QueueResult<u64> {
        self.storage
            .reclaim_stale_leases(self.config.stale_lease_horizon.as_millis() as i64)
            .await
    }

    /// Starts the dispatch loop on the current Tokio runtime and returns a
    /// handle for graceful shutdown.
    pub fn start(self) -> RuntimeHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let inflight = Arc::new(AtomicU64::new(0));
        let storage = self.storage.clone();
        let providers = self.providers.clone();
        let models = self.models.clone();
        let config = self.config.clone();
        let worker_id = self.worker_id.clone();

        let shutdown_task = shutdown.clone();
        let inflight_task = inflight.clone();
        let join = tokio::spawn(async move {
            dispatch_loop(
                storage,
                providers,
                models,
                config,
                worker_id,
                shutdown_task,
                inflight_task,
            )
            .await;
        });

        let sweep_storage = self.storage.clone();
        let sweep_interval = self.config.deadline_sweep_interval;
        let sweep_shutdown = shutdown.clone();
        let sweep_join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                if sweep_shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(err) = sweep_storage.fail_expired_deadlines().await {
                    tracing::warn!(error = %err, "deadline sweep failed");
                }
            }
        });

        RuntimeHandle {
            shutdown,
            inflight,
            join: std::sync::Mutex::new(Some(join)),
            sweep_join: std::sync::Mutex::new(Some(sweep_join)),
            grace_period: self.config.grace_period,
        }
    }
}

/// Returned by [`QueueRuntime::start`]. `stop()` stops accepting new work,
/// signals cancellation to in-flight jobs via their natural abort-poll
/// path, waits up to the grace period, then returns.
pub struct RuntimeHandle {
    shutdown: Arc<AtomicBool>,
    inflight: Arc<AtomicU64>,
    join: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweep_join: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    grace_period: Duration,
}

impl RuntimeHandle {
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.grace_period;
        while self.inflight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if let Some(join) = self.join.lock().expect("runtime handle mutex poisoned").take() {
            join.abort();
        }
        if let Some(join) = self
            .sweep_join
            .lock()
            .expect("runtime handle mutex poisoned")
            .take()
        {
            join.abort();
        }
    }

    pub fn inflight_count(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }
}

async fn dispatch_loop(
    storage: Arc<dyn QueueStorage>,
    providers: Arc<dyn ProviderRegistry>,
    models: Arc<dyn ModelRepository>,
    config: QueueRuntimeConfig,
    worker_id: String,
    shutdown: Arc<AtomicBool>,
    inflight: Arc<AtomicU64>,
) {
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let mut tasks = JoinSet::new();
    let mut backoff = config.poll_interval_min;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Drain completed execution tasks without blocking the loop.
        while tasks.try_join_next().is_some() {}

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // All slots busy; wait for one to free rather than hammer
                // storage with a `next()` call we know will be unusable.
                if let Some(_res) = tasks.join_next().await {
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
        };

        match storage.next(&worker_id).await {
            Ok(Some(job)) => {
                backoff = config.poll_interval_min;
                inflight.fetch_add(1, Ordering::SeqCst);
                let storage = storage.clone();
                let providers = providers.clone();
                let models = models.clone();
                let config = config.clone();
                let inflight = inflight.clone();
                tasks.spawn(async move {
                    execute_job(storage, providers, models, &config, job).await;
                    inflight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                let jitter = Duration::from_millis(fastrand::u64(0..=5));
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(config.poll_interval_max);
            }
            Err(err) => {
                drop(permit);
                tracing::error!(error = %err, "storage next() failed; backing off");
                tokio::time::sleep(config.poll_interval_max).await;
            }
        }
    }

    // Let any still-running executions finish naturally; the caller's
    // `RuntimeHandle::stop` already waited on `inflight` before we get
    // here in practice, but draining here avoids leaking task references.
    while tasks.join_next().await.is_some() {}
}

async fn execute_job(
    storage: Arc<dyn QueueStorage>,
    providers: Arc<dyn ProviderRegistry>,
    models: Arc<dyn ModelRepository>,
    config: &QueueRuntimeConfig,
    job: Job,
) {
    let span = tracing::info_span!("execute_job", job_id = %job.id, queue = %job.queue_name, attempt = job.run_attempts);
    let _enter = span.enter();

    let run_fn = match providers.run_function(&job.queue_name, &job.task_type) {
        Some(f) => f,
        None => {
            fail_immediately(&storage, &job.id, error_codes::NO_RUN_FUNCTION, "no run function registered").await;
            return;
        }
    };

    let model = match &job.model_name {
        Some(name) => match models.find_by_name(name) {
            Some(m) => Some(m),
            None => {
                fail_immediately(&storage, &job.id, error_codes::MODEL_NOT_FOUND, "model not found").await;
                return;
            }
        },
        None => None,
    };

    let cancel = CancelToken::new();
    let reporter = ProgressReporter::new(storage.clone(), job.id.clone(), config.progress_coalesce_delta);

    let exec_done = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn(watch_for_cancel(
        storage.clone(),
        job.id.clone(),
        job.deadline_at,
        config.abort_poll_interval,
        cancel.clone(),
        exec_done.clone(),
    ));

    let mut run_task = tokio::spawn(run_fn.run(job.input.clone(), model, reporter, cancel.clone()));

    let outcome = tokio::select! {
        res = &mut run_task => {
            exec_done.store(true, Ordering::SeqCst);
            Outcome::Returned(res)
        }
        _ = cancel.cancelled() => {
            match tokio::time::timeout(config.grace_period, &mut run_task).await {
                Ok(res) => { exec_done.store(true, Ordering::SeqCst); Outcome::Returned(res) }
                Err(_) => { exec_done.store(true, Ordering::SeqCst); Outcome::GraceExpired }
            }
        }
    };
    watcher.abort();

    let update = match (cancel.reason(), outcome) {
        (Some(CancelReason::DeadlineExceeded), _) => CompleteUpdate::Failed {
            error: "deadline exceeded".into(),
            error_code: error_codes::DEADLINE_EXCEEDED.into(),
        },
        (Some(CancelReason::Aborted), Outcome::GraceExpired) => CompleteUpdate::Failed {
            error: "run function did not return within the cancellation grace period".into(),
            error_code: error_codes::ABORT_TIMEOUT.into(),
        },
        (Some(CancelReason::Aborted), _) => CompleteUpdate::Failed {
            error: "aborted".into(),
            error_code: error_codes::ABORTED.into(),
        },
        (None, Outcome::GraceExpired) => unreachable!("grace period only elapses after a cancel signal"),
        (None, Outcome::Returned(join_result)) => match join_result {
            Ok(Ok(output)) => CompleteUpdate::Completed { output },
            Ok(Err(run_err)) => retry_or_fail(config, &job, &run_err),
            Err(join_err) => retry_or_fail(config, &job, &anyhow::anyhow!("worker task failed: {join_err}")),
        },
    };

    match storage.complete(&job.id, update).await {
        Ok(_) => {}
        Err(err) => tracing::error!(job_id = %job.id, error = %err, "failed to persist job completion"),
    }
}

enum Outcome {
    Returned(Result<anyhow::Result<Value>, tokio::task::JoinError>),
    GraceExpired,
}

fn retry_or_fail(config: &QueueRuntimeConfig, job: &Job, err: &anyhow::Error) -> CompleteUpdate {
    let (category, retry_after_override, code) = classify(err);
    let next_attempt = job.run_attempts + 1;

    if category == ErrorCategory::Permanent {
        return CompleteUpdate::Failed {
            error: err.to_string(),
            error_code: code.into(),
        };
    }

    if next_attempt >= job.max_retries {
        return CompleteUpdate::Failed {
            error: err.to_string(),
            error_code: error_codes::RETRIES_EXHAUSTED.into(),
        };
    }

    let computed = backoff_ms(config, job.run_attempts);
    let delay_ms = retry_after_override.map_or(computed, |over| computed.max(over));
    CompleteUpdate::Retry {
        run_after: Utc::now() + chrono::Duration::milliseconds(delay_ms),
        error: Some(err.to_string()),
        error_code: Some(code.into()),
    }
}

async fn fail_immediately(storage: &Arc<dyn QueueStorage>, job_id: &str, code: &str, message: &str) {
    let update = CompleteUpdate::Failed {
        error: message.into(),
        error_code: code.into(),
    };
    if let Err(err) = storage.complete(job_id, update).await {
        tracing::error!(job_id, error = %err, "failed to persist immediate failure");
    }
}

async fn watch_for_cancel(
    storage: Arc<dyn QueueStorage>,
    job_id: String,
    deadline_at: Option<DateTime<Utc>>,
    abort_poll_interval: Duration,
    cancel: CancelToken,
    exec_done: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(abort_poll_interval);
    loop {
        ticker.tick().await;
        if exec_done.load(Ordering::SeqCst) {
            return;
        }
        if let Some(deadline) = deadline_at {
            if Utc::now() >= deadline {
                cancel.trigger(CancelReason::DeadlineExceeded);
                return;
            }
        }
        match storage.get(&job_id).await {
            Ok(Some(j)) if j.status == JobStatus::Aborting => {
                cancel.trigger(CancelReason::Aborted);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "abort-poll get() failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = QueueRuntimeConfig::default();
        let b0 = backoff_ms(&config, 0);
        let b1 = backoff_ms(&config, 1);
        let b_big = backoff_ms(&config, 20);
        assert!(b1 > b0);
        assert_eq!(b_big, config.retry_backoff_max_ms);
    }

    #[tokio::test]
    async fn cancel_token_resolves_cancelled_future() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.trigger(CancelReason::Aborted);
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Aborted));
        // Already cancelled: resolves immediately.
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately once triggered");
    }

    #[test]
    fn first_trigger_wins_reason() {
        let token = CancelToken::new();
        token.trigger(CancelReason::Aborted);
        token.trigger(CancelReason::DeadlineExceeded);
        assert_eq!(token.reason(), Some(CancelReason::Aborted));
    }
}
