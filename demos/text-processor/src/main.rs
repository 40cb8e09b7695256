//! Text-processing demo: a provider offering two run functions
//! (`uppercase`, `word_count`) driven by [`queue_core::QueueRuntime`]
//! against the in-memory backend, with a live subscription printing every
//! change as jobs move through the queue.
//!
//! No external API calls here - see `demo-http-fetcher` for a run function
//! that talks to the network. This one shows the runtime/provider/model
//! wiring on its own.

use anyhow::Result;
use async_trait::async_trait;
use queue_core::{
    ChangePayload, JobInput, Model, ModelRepository, ProgressReporter, ProviderRegistry,
    QueueRuntime, QueueRuntimeConfig, QueueStorage, RunFunction, SubscriptionManager,
};
use queue_memory::MemoryQueueStorage;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const PROVIDER: &str = "text-processor";

struct Uppercase;

#[async_trait]
impl RunFunction for Uppercase {
    async fn run(
        &self,
        input: Value,
        _model: Option<Model>,
        progress: ProgressReporter,
        _cancel: queue_core::CancelToken,
    ) -> Result<Value> {
        let text = input["text"].as_str().unwrap_or_default();
        progress.report(50.0, Some("uppercasing".to_string()), None).await;
        Ok(json!({ "result": text.to_uppercase() }))
    }
}

struct WordCount;

#[async_trait]
impl RunFunction for WordCount {
    async fn run(
        &self,
        input: Value,
        _model: Option<Model>,
        progress: ProgressReporter,
        _cancel: queue_core::CancelToken,
    ) -> Result<Value> {
        let text = input["text"].as_str().unwrap_or_default();
        progress.report(50.0, Some("counting".to_string()), None).await;
        Ok(json!({ "result": text.split_whitespace().count() }))
    }
}

struct TextProvider {
    uppercase: Arc<Uppercase>,
    word_count: Arc<WordCount>,
}

impl ProviderRegistry for TextProvider {
    fn run_function(&self, provider: &str, task_type: &str) -> Option<Arc<dyn RunFunction>> {
        if provider != PROVIDER {
            return None;
        }
        match task_type {
            "uppercase" => Some(self.uppercase.clone()),
            "word_count" => Some(self.word_count.clone()),
            _ => None,
        }
    }
}

/// This demo's task types need no model, but the registry still has to
/// answer for one the way a real provider (an LLM task) would.
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

    let storage: Arc<dyn QueueStorage> =
        Arc::new(MemoryQueueStorage::new(PROVIDER, queue_core::PrefixSchema::new()));
    storage.setup().await?;

    let subscriptions = SubscriptionManager::new(storage.clone());
    let _subscription = subscriptions
        .subscribe(Duration::from_millis(100), |change| match change {
            ChangePayload::Insert { new } => {
                println!("+ {} ({}) queued", new.id, new.task_type);
            }
            ChangePayload::Update { old, new } => {
                println!("~ {} {} -> {}", new.id, old.status, new.status);
            }
            ChangePayload::Delete { old } => {
                println!("- {} removed", old.id);
            }
        })
        .await;

    let providers: Arc<dyn ProviderRegistry> = Arc::new(TextProvider {
        uppercase: Arc::new(Uppercase),
        word_count: Arc::new(WordCount),
    });
    let models: Arc<dyn ModelRepository> = Arc::new(NoModels);

    let runtime = QueueRuntime::new(
        storage.clone(),
        providers,
        models,
        QueueRuntimeConfig::default(),
        "demo-worker-1",
    );
    runtime.recover_stale_leases().await?;
    let handle = runtime.start();

    let samples = [
        "the quick brown fox jumps over the lazy dog",
        "rust enforces memory safety without a garbage collector",
    ];
    for text in samples {
        storage
            .add(JobInput::new("uppercase", json!({ "text": text })))
            .await?;
        storage
            .add(JobInput::new("word_count", json!({ "text": text })))
            .await?;
    }

    // Give the dispatch loop time to drain the queue before shutting down.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = storage.stats().await?;
    println!(
        "completed={} failed={} pending={} processing={}",
        stats.completed, stats.failed, stats.pending, stats.processing
    );

    handle.stop().await;
    Ok(())
}
