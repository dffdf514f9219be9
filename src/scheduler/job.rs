use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = u64;
pub type ServiceId = u32;
pub type ServiceVersion = u32;
pub type ClientId = u32;

/// Identity a worker presents on fetch, exchange and result submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing key: every partition owns its own queue and lease bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub service_id: ServiceId,
    pub service_version: ServiceVersion,
}

impl PartitionKey {
    pub fn new(service_id: ServiceId, service_version: ServiceVersion) -> Self {
        Self {
            service_id,
            service_version,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.service_version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Edges of the per-job state machine. Completed and Failed have no way out.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Assigned)
                | (JobState::Assigned, JobState::Completed)
                | (JobState::Assigned, JobState::Pending)
                | (JobState::Assigned, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// A worker's time-bounded claim on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub deadline: Instant,
}

impl Assignment {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub partition: PartitionKey,
    pub payload: Vec<u8>,
    pub state: JobState,
    pub client_id: Option<ClientId>,
    pub assignment: Option<Assignment>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        partition: PartitionKey,
        payload: Vec<u8>,
        client_id: Option<ClientId>,
    ) -> Self {
        Self {
            id,
            partition,
            payload,
            state: JobState::Pending,
            client_id,
            assignment: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn assigned_worker(&self) -> Option<&WorkerId> {
        self.assignment.as_ref().map(|a| &a.worker_id)
    }
}

/// What a worker produced for a job, or the reason none will ever arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success { data: Vec<u8> },
    Error { message: String },
}

impl Outcome {
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Outcome::Success { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub outcome: Outcome,
}

impl JobResult {
    pub fn new(job_id: JobId, outcome: Outcome) -> Self {
        Self { job_id, outcome }
    }

    /// Synthetic result for a job that ran out of lease retries.
    pub fn retries_exhausted(job_id: JobId, retry_count: u32) -> Self {
        Self::new(
            job_id,
            Outcome::error(format!(
                "job {} failed: lease expired after {} retries",
                job_id, retry_count
            )),
        )
    }
}
