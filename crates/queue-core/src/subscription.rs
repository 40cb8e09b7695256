//! Consolidated polling and native-feed fan-out for queue change
//! notifications.

use crate::job::Job;
use crate::storage::QueueStorage;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The change payload delivered to subscribers. `Insert` omits `old`,
/// `Delete` omits `new`.
#[derive(Debug, Clone)]
pub enum ChangePayload {
    Insert { new: Job },
    Update { old: Job, new: Job },
    Delete { old: Job },
}

impl ChangePayload {
    pub fn job_id(&self) -> &str {
        match self {
            ChangePayload::Insert { new } => &new.id,
            ChangePayload::Update { new, .. } => &new.id,
            ChangePayload::Delete { old } => &old.id,
        }
    }
}

type Callback = Box<dyn Fn(ChangePayload) + Send + Sync>;

struct Subscriber {
    callback: Callback,
    active: Arc<AtomicBool>,
}

/// A handle returned by [`SubscriptionManager::subscribe`]. Dropping it
/// does NOT unsubscribe; call [`Unsubscribe::unsubscribe`]. Calling it
/// more than once is a no-op.
pub struct Unsubscribe {
    active: Arc<AtomicBool>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// One consolidated fetch-and-diff loop, shared by every subscriber that
/// asked for the same polling interval against the same storage handle.
struct PollLoop {
    subscribers: Arc<DashMap<Uuid, Subscriber>>,
    _task: tokio::task::JoinHandle<()>,
}

/// Fans change events out to subscribers of one [`QueueStorage`] handle.
/// Construct one per distinct prefix scope you want to observe: the
/// storage instance's own scope by default, or a differently-scoped
/// storage handle (including an explicit empty-prefix instance meaning
/// "all partitions") for a dedicated custom-filter loop.
pub struct SubscriptionManager {
    storage: Arc<dyn QueueStorage>,
    loops: tokio::sync::Mutex<HashMap<Duration, Arc<PollLoop>>>,
    /// Backup poll interval used alongside a native change feed, default
    /// 5s.
    backup_poll_interval: Duration,
}

impl SubscriptionManager {
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Self {
            storage,
            loops: tokio::sync::Mutex::new(HashMap::new()),
            backup_poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_backup_poll_interval(mut self, interval: Duration) -> Self {
        self.backup_poll_interval = interval;
        self
    }

    /// Subscribe at the given polling cadence. Delivers the current state
    /// as a sequence of `Insert` payloads immediately on subscribe, then
    /// streams subsequent diffs on every poll tick.
    ///
    /// If the storage backend exposes a native change feed, it is used
    /// instead of primary polling, with `poll_interval` demoted to a
    /// backup cadence only.
    pub async fn subscribe(
        &self,
        poll_interval: Duration,
        callback: impl Fn(ChangePayload) + Send + Sync + 'static,
    ) -> Unsubscribe {
        if let Some(native) = self.storage.native_change_feed() {
            return self
                .subscribe_native(native, self.backup_poll_interval, callback)
                .await;
        }

        let poll_loop = self.loop_for_interval(poll_interval).await;
        self.register(&poll_loop, callback).await
    }

    async fn loop_for_interval(&self, interval: Duration) -> Arc<PollLoop> {
        let mut loops = self.loops.lock().await;
        if let Some(existing) = loops.get(&interval) {
            return existing.clone();
        }
        let poll_loop = Arc::new(spawn_poll_loop(self.storage.clone(), interval));
        loops.insert(interval, poll_loop.clone());
        poll_loop
    }

    async fn register(
        &self,
        poll_loop: &Arc<PollLoop>,
        callback: impl Fn(ChangePayload) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let active = Arc::new(AtomicBool::new(true));
        let id = Uuid::new_v4();

        // Deliver current state as INSERTs before the subscriber is
        // registered for the poll loop's ongoing diffs, so it never misses
        // or double-counts a transition.
        if let Ok(snapshot) = self.storage.snapshot().await {
            for job in snapshot {
                callback(ChangePayload::Insert { new: job });
            }
        }

        poll_loop.subscribers.insert(
            id,
            Subscriber {
                callback: Box::new(callback),
                active: active.clone(),
            },
        );

        Unsubscribe { active }
    }

    async fn subscribe_native(
        &self,
        mut native: tokio::sync::broadcast::Receiver<crate::storage::ChangeNotice>,
        backup_interval: Duration,
        callback: impl Fn(ChangePayload) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let active = Arc::new(AtomicBool::new(true));
        let callback = Arc::new(callback);
        let storage = self.storage.clone();

        let initial = storage.snapshot().await.unwrap_or_default();
        for job in &initial {
            callback(ChangePayload::Insert { new: job.clone() });
        }
        let mut last_snapshot: HashMap<String, Job> =
            initial.into_iter().map(|j| (j.id.clone(), j)).collect();

        let active_task = active.clone();
        let callback_task = callback.clone();
        let storage_task = storage.clone();
        tokio::spawn(async move {
            let mut backup = tokio::time::interval(backup_interval);
            backup.tick().await; // first tick fires immediately; skip it
            loop {
                if !active_task.load(Ordering::SeqCst) {
                    return;
                }
                tokio::select! {
                    notice = native.recv() => {
                        match notice {
                            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = backup.tick() => {}
                }
                if !active_task.load(Ordering::SeqCst) {
                    return;
                }
                if let Ok(current) = storage_task.snapshot().await {
                    diff_and_emit(&mut last_snapshot, current, |payload| {
                        callback_task(payload)
                    });
                }
            }
        });

        Unsubscribe { active }
    }
}

fn spawn_poll_loop(storage: Arc<dyn QueueStorage>, interval: Duration) -> PollLoop {
    let subscribers: Arc<DashMap<Uuid, Subscriber>> = Arc::new(DashMap::new());
    let subscribers_task = subscribers.clone();

    let task = tokio::spawn(async move {
        let mut last_snapshot: HashMap<String, Job> = HashMap::new();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let current = match storage.snapshot().await {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::warn!(error = %err, "subscription poll snapshot failed");
                    continue;
                }
            };

            subscribers_task.retain(|_, sub| sub.active.load(Ordering::SeqCst));
            if subscribers_task.is_empty() {
                last_snapshot = current.into_iter().map(|j| (j.id.clone(), j)).collect();
                continue;
            }

            diff_and_emit(&mut last_snapshot, current, |payload| {
                for entry in subscribers_task.iter() {
                    if entry.active.load(Ordering::SeqCst) {
                        (entry.callback)(payload.clone());
                    }
                }
            });
        }
    });

    PollLoop {
        subscribers,
        _task: task,
    }
}

/// Deep-equality diff between two snapshots. `last` is updated in place to
/// `current` so the next call diffs against this one.
fn diff_and_emit(
    last: &mut HashMap<String, Job>,
    current: Vec<Job>,
    mut emit: impl FnMut(ChangePayload),
) {
    let mut seen = std::collections::HashSet::with_capacity(current.len());
    let mut next = HashMap::with_capacity(current.len());

    for job in current {
        seen.insert(job.id.clone());
        match last.get(&job.id) {
            None => emit(ChangePayload::Insert { new: job.clone() }),
            Some(prev) if *prev != job => emit(ChangePayload::Update {
                old: prev.clone(),
                new: job.clone(),
            }),
            Some(_) => {}
        }
        next.insert(job.id.clone(), job);
    }

    for (id, prev) in last.iter() {
        if !seen.contains(id) {
            emit(ChangePayload::Delete { old: prev.clone() });
        }
    }

    *last = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus, PrefixValue};
    use crate::prefix::PrefixSchema;
    use std::collections::BTreeMap;

    fn job(id: &str, status: JobStatus) -> Job {
        Job {
            id: id.to_string(),
            queue_name: "q".into(),
            prefix: BTreeMap::<String, PrefixValue>::new(),
            task_type: "noop".into(),
            model_name: None,
            job_run_id: None,
            fingerprint: "fp".into(),
            input: serde_json::json!({}),
            output: None,
            status,
            error: None,
            error_code: None,
            run_attempts: 0,
            max_retries: 20,
            run_after: chrono::Utc::now(),
            deadline_at: None,
            created_at: chrono::Utc::now(),
            last_ran_at: None,
            completed_at: None,
            progress: 0.0,
            progress_message: None,
            progress_details: None,
            worker_id: None,
        }
    }

    #[test]
    fn diff_emits_insert_update_delete() {
        let mut last = HashMap::new();
        let mut events = Vec::new();

        // first snapshot: all inserts
        diff_and_emit(
            &mut last,
            vec![job("a", JobStatus::Pending), job("b", JobStatus::Pending)],
            |p| events.push(p),
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChangePayload::Insert { .. }));

        events.clear();
        // second snapshot: a updated, b deleted, c inserted
        diff_and_emit(
            &mut last,
            vec![job("a", JobStatus::Processing), job("c", JobStatus::Pending)],
            |p| events.push(p),
        );

        let has_update = events
            .iter()
            .any(|e| matches!(e, ChangePayload::Update { .. } if e.job_id() == "a"));
        let has_delete = events
            .iter()
            .any(|e| matches!(e, ChangePayload::Delete { .. } if e.job_id() == "b"));
        let has_insert = events
            .iter()
            .any(|e| matches!(e, ChangePayload::Insert { .. } if e.job_id() == "c"));
        assert!(has_update && has_delete && has_insert);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn no_change_no_emission() {
        let mut last = HashMap::new();
        let j = job("a", JobStatus::Pending);
        diff_and_emit(&mut last, vec![j.clone()], |_| {});
        let mut count = 0;
        diff_and_emit(&mut last, vec![j], |_| count += 1);
        assert_eq!(count, 0);
    }
}
