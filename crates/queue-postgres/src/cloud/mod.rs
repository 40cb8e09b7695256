//! Cloud-hosted PostgreSQL variant: identical schema and dispatch query to
//! [`crate::PgQueueStorage`], plus native change notification via
//! `LISTEN`/`NOTIFY`. Every mutation that changes a row `pg_notify`s a
//! per-queue channel, and a background task forwards those notifications
//! into a `queue-core` [`ChangeNotice`] broadcast so
//! [`queue_core::SubscriptionManager`] can skip its polling fallback to a
//! cheap, infrequent backstop.

use crate::{sqlx_err, PgQueueStorage};
use async_trait::async_trait;
use queue_core::{
    ChangeNotice, CompleteUpdate, Job, JobInput, JobStatus, PrefixSchema, QueueResult, QueueStats,
    QueueStorage,
};
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

/// Channel name derivation: one `LISTEN` channel per queue, since
/// subscriptions are always scoped to a single queue's changes.
fn channel_name(queue_name: &str) -> String {
    format!("job_queue_{queue_name}")
}

pub struct CloudPgQueueStorage {
    inner: PgQueueStorage,
    channel: String,
    notify_tx: tokio::sync::broadcast::Sender<ChangeNotice>,
    _listener_task: tokio::task::JoinHandle<()>,
}

impl CloudPgQueueStorage {
    /// Opens a dedicated listener connection against `pool` and starts
    /// forwarding `NOTIFY` traffic on this queue's channel. The listener
    /// task runs for the lifetime of the returned handle.
    pub async fn connect(
        pool: PgPool,
        queue_name: impl Into<String>,
        prefix: PrefixSchema,
    ) -> QueueResult<Self> {
        let queue_name = queue_name.into();
        let channel = channel_name(&queue_name);
        let (notify_tx, _) = tokio::sync::broadcast::channel(256);

        let mut listener = PgListener::connect_with(&pool).await.map_err(sqlx_err)?;
        listener.listen(&channel).await.map_err(sqlx_err)?;

        let forward_tx = notify_tx.clone();
        let forward_queue_name = queue_name.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(_notification) => {
                        let _ = forward_tx.send(ChangeNotice {
                            queue_name: forward_queue_name.clone(),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "postgres change listener disconnected");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            inner: PgQueueStorage::new(pool, queue_name, prefix),
            channel,
            notify_tx,
            _listener_task: listener_task,
        })
    }

    async fn notify(&self) -> QueueResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&self.inner.queue_name().to_string())
            .execute(self.inner.pool())
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl QueueStorage for CloudPgQueueStorage {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    fn prefix(&self) -> &PrefixSchema {
        self.inner.prefix()
    }

    async fn setup(&self) -> QueueResult<()> {
        self.inner.setup().await
    }

    async fn add(&self, input: JobInput) -> QueueResult<Job> {
        let job = self.inner.add(input).await?;
        self.notify().await?;
        Ok(job)
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        self.inner.get(id).await
    }

    async fn next(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        self.inner.next(worker_id).await
    }

    async fn peek(&self, status: JobStatus, n: usize) -> QueueResult<Vec<Job>> {
        self.inner.peek(status, n).await
    }

    async fn size(&self, status: JobStatus) -> QueueResult<u64> {
        self.inner.size(status).await
    }

    async fn complete(&self, id: &str, update: CompleteUpdate) -> QueueResult<Job> {
        let job = self.inner.complete(id, update).await?;
        self.notify().await?;
        Ok(job)
    }

    async fn abort(&self, id: &str) -> QueueResult<()> {
        self.inner.abort(id).await?;
        self.notify().await?;
        Ok(())
    }

    async fn get_by_run_id(&self, run_id: &str) -> QueueResult<Vec<Job>> {
        self.inner.get_by_run_id(run_id).await
    }

    async fn output_for_input(&self, input: &Value) -> QueueResult<Option<Value>> {
        self.inner.output_for_input(input).await
    }

    async fn save_progress(
        &self,
        id: &str,
        progress: f64,
        message: Option<String>,
        details: Option<Value>,
    ) -> QueueResult<()> {
        self.inner.save_progress(id, progress, message, details).await
    }

    async fn delete(&self, id: &str) -> QueueResult<()> {
        self.inner.delete(id).await
    }

    async fn delete_all(&self) -> QueueResult<u64> {
        self.inner.delete_all().await
    }

    async fn delete_by_status_and_age(&self, status: JobStatus, older_than_ms: i64) -> QueueResult<u64> {
        self.inner.delete_by_status_and_age(status, older_than_ms).await
    }

    async fn reclaim_stale_leases(&self, stale_after_ms: i64) -> QueueResult<u64> {
        let reclaimed = self.inner.reclaim_stale_leases(stale_after_ms).await?;
        if reclaimed > 0 {
            self.notify().await?;
        }
        Ok(reclaimed)
    }

    async fn fail_expired_deadlines(&self) -> QueueResult<u64> {
        let failed = self.inner.fail_expired_deadlines().await?;
        if failed > 0 {
            self.notify().await?;
        }
        Ok(failed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        self.inner.stats().await
    }

    async fn snapshot(&self) -> QueueResult<Vec<Job>> {
        self.inner.snapshot().await
    }

    fn native_change_feed(&self) -> Option<tokio::sync::broadcast::Receiver<ChangeNotice>> {
        Some(self.notify_tx.subscribe())
    }
}
