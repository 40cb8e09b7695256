//! # queue-core
//!
//! A durable, multi-backend job queue for AI task execution. This crate
//! defines the storage contract every backend implements, the job model
//! and its status machine, content fingerprinting for input-keyed output
//! caching, the subscription manager, and the worker-pool runtime that
//! drives dispatch, retry, progress, and cancellation.
//!
//! ## What this crate is not
//!
//! `queue-core` has no opinion on how a job gets executed beyond the
//! `(input, model, progress, cancel) -> output` shape: the model
//! repository and provider registry are external collaborators passed in
//! as trait objects, not implemented here. Task-graph orchestration,
//! document parsing, embedding math, and CLI/binding glue live outside
//! this workspace entirely.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ add(JobInput)
//!   ▼
//! QueueStorage (one impl per backend) ──PENDING──┐
//!   │ next(worker_id)                             │
//!   ▼                                              │
//! QueueRuntime worker pool                         │
//!   │ resolve (provider, task_type) -> run_fn      │
//!   │ resolve model_name -> Model                  │
//!   ▼                                              │
//! run_fn.run(input, model, progress, cancel)       │
//!   │                                              │
//!   ├─ Ok(output)   -> complete(COMPLETED)         │
//!   ├─ Err(permanent) -> complete(FAILED)          │
//!   ├─ Err(retryable)  -> complete(PENDING, retry) ┘
//!   └─ cancelled       -> complete(FAILED, ABORTED/DEADLINE_EXCEEDED)
//!
//! SubscriptionManager polls/taps QueueStorage and fans ChangePayloads out
//! to subscribers, consolidating loops that share a polling interval.
//! ```

mod error;
mod fingerprint;
mod job;
mod prefix;
mod runtime;
mod storage;
mod subscription;

pub use error::{classify, Categorizable, ErrorCategory, QueueError, QueueResult, RunError};
pub use fingerprint::fingerprint;
pub use job::{error_codes, Job, JobInput, JobStatus, PrefixValue, DEFAULT_MAX_RETRIES};
pub use prefix::{PrefixColumn, PrefixColumnKind, PrefixSchema};
pub use runtime::{
    CancelReason, CancelToken, Model, ModelRepository, ProgressReporter, ProviderRegistry,
    QueueRuntime, QueueRuntimeConfig, RunFunction, RuntimeHandle,
};
pub use storage::{ChangeNotice, CompleteUpdate, QueueStats, QueueStorage};
pub use subscription::{ChangePayload, SubscriptionManager, Unsubscribe};

// Re-export commonly used external types for callers implementing
// `QueueStorage`/`RunFunction` without a direct `async-trait` dependency.
pub use async_trait::async_trait;
