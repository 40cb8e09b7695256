//! The job record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Legal job states.
///
/// Transitions are enforced by [`JobStatus::can_transition_to`], not by the
/// storage backends themselves - a backend applies whatever transition its
/// caller asks for, but every caller in this crate (the runtime) only ever
/// asks for transitions this table allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Aborting,
    Disabled,
}

impl JobStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Disabled)
    }

    /// Whether `self -> next` is a legal edge in the status machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed) => true,
            (Processing, Failed) => true,
            (Processing, Pending) => true,
            (Processing, Aborting) => true,
            (Aborting, Failed) => true,
            (s, Disabled) if !s.is_terminal() => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Aborting => "ABORTING",
            JobStatus::Disabled => "DISABLED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => JobStatus::Pending,
            "PROCESSING" => JobStatus::Processing,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "ABORTING" => JobStatus::Aborting,
            "DISABLED" => JobStatus::Disabled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque, caller-declared discriminator value prepended to every
/// compound index. `Uuid` covers uuid-text-shaped tenant/shard keys;
/// `Int` covers integer ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefixValue {
    Uuid(Uuid),
    Int(i64),
    Text(String),
}

impl std::fmt::Display for PrefixValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrefixValue::Uuid(u) => write!(f, "{u}"),
            PrefixValue::Int(i) => write!(f, "{i}"),
            PrefixValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// The caller-supplied payload that becomes a job. `fingerprint` is derived
/// from `input` at `add()` time, never supplied directly by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    /// Selects the run function within this queue's provider, via
    /// `(queue_name, task_type)`: the provider registry maps
    /// `(provider_name, task_type)`, and `queue_name` plays the role of
    /// `provider_name` since one queue has one concurrency cap and one
    /// provider.
    pub task_type: String,
    /// Name looked up in the model repository at dispatch time; `None`
    /// means this task type needs no model.
    pub model_name: Option<String>,
    pub job_run_id: Option<String>,
    pub input: Value,
    pub max_retries: u32,
    pub run_after: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

impl JobInput {
    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self {
            task_type: task_type.into(),
            model_name: None,
            job_run_id: None,
            input,
            max_retries: DEFAULT_MAX_RETRIES,
            run_after: None,
            deadline_at: None,
        }
    }

    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_job_run_id(mut self, id: impl Into<String>) -> Self {
        self.job_run_id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn with_deadline(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(at);
        self
    }
}

/// Default cap on `run_attempts` before a job is considered exhausted.
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// The durable unit of work, persisted as-is by every backend rather than
/// translated into a queue-internal representation on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub prefix: BTreeMap<String, PrefixValue>,
    pub task_type: String,
    pub model_name: Option<String>,
    pub job_run_id: Option<String>,
    pub fingerprint: String,
    pub input: Value,
    pub output: Option<Value>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub run_attempts: u32,
    pub max_retries: u32,
    pub run_after: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_ran_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub progress_message: Option<String>,
    pub progress_details: Option<Value>,
    pub worker_id: Option<String>,
}

impl Job {
    /// `progress == 100` iff the job's status is terminal.
    pub fn progress_matches_status(&self) -> bool {
        (self.progress >= 100.0) == self.status.is_terminal()
    }
}

/// Stable error-code strings. Kept as constants rather than an enum so
/// storage layers can store/compare them as plain text without a
/// conversion layer.
pub mod error_codes {
    pub const ABORTED: &str = "ABORTED";
    pub const ABORT_TIMEOUT: &str = "ABORT_TIMEOUT";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
    pub const MODEL_NOT_FOUND: &str = "MODEL_NOT_FOUND";
    pub const NO_RUN_FUNCTION: &str = "NO_RUN_FUNCTION";
    pub const PERMANENT: &str = "PERMANENT";
    pub const RETRYABLE: &str = "RETRYABLE";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Disabled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Aborting.is_terminal());
    }

    #[test]
    fn legal_edges_match_status_machine() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Disabled));
        assert!(Processing.can_transition_to(Disabled));
        assert!(Aborting.can_transition_to(Disabled));
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        use JobStatus::*;
        for terminal in [Completed, Failed, Disabled] {
            for next in [Pending, Processing, Completed, Failed, Aborting, Disabled] {
                assert!(
                    !terminal.can_transition_to(next) || (terminal == next && false),
                    "{terminal:?} -> {next:?} should be illegal"
                );
            }
        }
    }

    #[test]
    fn illegal_edges_rejected() {
        use JobStatus::*;
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Aborting));
        assert!(!Aborting.can_transition_to(Completed));
        assert!(!Aborting.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Aborting,
            JobStatus::Disabled,
        ] {
            assert_eq!(JobStatus::from_str_opt(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::from_str_opt("bogus"), None);
    }
}
