//! HTTP-fetch demo: a single run function that performs a GET request,
//! driven against the embedded SQLite backend. Shows a run function that
//! can genuinely fail transiently (network errors, non-2xx responses) and
//! so exercises the runtime's retry/backoff path, plus a per-job deadline.
//!
//! Run with `FETCH_URLS=https://example.com,https://httpbin.org/status/500`
//! to override the default sample set.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use queue_core::{
    JobInput, Model, ModelRepository, PrefixSchema, ProgressReporter, ProviderRegistry,
    QueueRuntime, QueueRuntimeConfig, QueueStorage, RunError, RunFunction,
};
use queue_sqlite::SqliteQueueStorage;
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const PROVIDER: &str = "http-fetcher";

struct FetchUrl {
    client: reqwest::Client,
}

#[async_trait]
impl RunFunction for FetchUrl {
    async fn run(
        &self,
        input: Value,
        _model: Option<Model>,
        progress: ProgressReporter,
        cancel: queue_core::CancelToken,
    ) -> Result<Value> {
        let url = input["url"]
            .as_str()
            .ok_or_else(|| anyhow::Error::new(RunError::permanent("job input missing \"url\"")))?;

        progress.report(10.0, Some(format!("fetching {url}")), None).await;

        let request = self.client.get(url).send();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow!("cancelled before response arrived")),
            result = request => {
                let response = result?;
                let status = response.status();
                if !status.is_success() {
                    // Non-2xx is retryable: the site may recover before
                    // `max_retries` is exhausted.
                    return Err(anyhow!("GET {url} returned {status}"));
                }
                let body = response.text().await?;
                progress.report(90.0, Some("downloaded".to_string()), None).await;
                Ok(json!({ "url": url, "status": status.as_u16(), "bytes": body.len() }))
            }
        }
    }
}

struct FetchProvider {
    fetch: Arc<FetchUrl>,
}

impl ProviderRegistry for FetchProvider {
    fn run_function(&self, provider: &str, task_type: &str) -> Option<Arc<dyn RunFunction>> {
        if provider == PROVIDER && task_type == "fetch" {
            Some(self.fetch.clone())
        } else {
            None
        }
    }
}

struct NoModels;

impl ModelRepository for NoModels {
    fn find_by_name(&self, _name: &str) -> Option<Model> {
        None
    }

    fn find_models_by_task(&self, _task: &str) -> Vec<Model> {
        Vec::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db_path = env::var("FETCH_QUEUE_DB").unwrap_or_else(|_| "fetch-queue.sqlite3".to_string());
    let storage: Arc<dyn QueueStorage> = Arc::new(
        SqliteQueueStorage::open(&db_path, PROVIDER, PrefixSchema::new()).await?,
    );
    storage.setup().await?;

    let providers: Arc<dyn ProviderRegistry> = Arc::new(FetchProvider {
        fetch: Arc::new(FetchUrl { client: reqwest::Client::new() }),
    });
    let models: Arc<dyn ModelRepository> = Arc::new(NoModels);

    let mut config = QueueRuntimeConfig::default();
    config.concurrency = 3;

    let runtime = QueueRuntime::new(storage.clone(), providers, models, config, "demo-fetcher-1");
    runtime.recover_stale_leases().await?;
    let handle = runtime.start();

    let urls = env::var("FETCH_URLS")
        .unwrap_or_else(|_| "https://www.rust-lang.org,https://crates.io".to_string());
    for url in urls.split(',').map(str::trim).filter(|u| !u.is_empty()) {
        let deadline = chrono::Utc::now() + chrono::Duration::seconds(30);
        storage
            .add(
                JobInput::new("fetch", json!({ "url": url }))
                    .with_max_retries(3)
                    .with_deadline(deadline),
            )
            .await?;
        println!("queued fetch for {url}");
    }

    tokio::time::sleep(Duration::from_secs(5)).await;

    for job in storage.peek(queue_core::JobStatus::Completed, 20).await? {
        println!("done: {} -> {:?}", job.id, job.output);
    }
    for job in storage.peek(queue_core::JobStatus::Failed, 20).await? {
        println!("failed: {} -> {:?} ({:?})", job.id, job.error, job.error_code);
    }

    handle.stop().await;
    Ok(())
}
