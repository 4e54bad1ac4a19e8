//! Job and event-record data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status drawn from a closed set. Transitions are monotone along the
/// pipeline: `Pending -> Downloading -> {Completed | Translating -> {Completed | Failed}} | Failed`,
/// with `Failed` reachable from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Translating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an allowed transition under the pipeline's
    /// monotone ordering. `Failed` is reachable from any non-terminal
    /// status; `Completed` is terminal and accepts no further transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if *self == Completed {
            return false;
        }
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Completed)
                | (Downloading, Translating)
                | (Translating, Completed)
        )
    }
}

/// Opaque job identifier. UUID v4 is the preferred construction but any
/// stable string is accepted.
pub type JobId = String;

/// The unit of work tracked in the store; one job corresponds to one
/// user-facing request routed through this pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Free-form request metadata (e.g. source identifier, source/target
    /// language) — opaque to the core, owned by the handler.
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, metadata: HashMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mints a fresh job with a generated v4 UUID as its id — the preferred
    /// construction for callers that don't already have a stable external
    /// identifier to key off of.
    pub fn new_with_generated_id(metadata: HashMap<String, serde_json::Value>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), metadata)
    }
}

/// An entry in a job's append-only event log describing a phase change or
/// terminal outcome. Insertion order equals emit order; readers receive
/// newest-first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    /// From a closed vocabulary owned by the event-schema contract
    /// (out of scope here — the core treats this as an opaque string).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the component that produced this event.
    pub source: String,
    pub payload: HashMap<String, serde_json::Value>,
}

impl EventRecord {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_transitions_are_monotone() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Downloading));
        assert!(JobStatus::Downloading.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Downloading.can_transition_to(JobStatus::Translating));
        assert!(JobStatus::Translating.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Translating));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Downloading));
    }

    #[test]
    fn failed_reachable_from_any_non_terminal_status() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Downloading.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Translating.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn job_new_sets_created_and_updated_equal() {
        let job = Job::new("job-1", HashMap::new());
        assert_eq!(job.created_at, job.updated_at);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn generated_id_is_a_valid_v4_uuid() {
        let job = Job::new_with_generated_id(HashMap::new());
        let parsed = uuid::Uuid::parse_str(&job.id).expect("id must be a valid UUID");
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
        assert!(!JobStatus::Translating.is_terminal());
    }
}
