use thiserror::Error;

use crate::scheduler::job::{ClientId, JobId, JobState, ServiceId, ServiceVersion, WorkerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Invalid partition: service {service_id} version {service_version}")]
    InvalidPartition {
        service_id: ServiceId,
        service_version: ServiceVersion,
    },

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {0} is not assigned")]
    NotAssigned(JobId),

    #[error("Worker {worker_id} does not hold the lease on job {job_id}")]
    NotOwner { job_id: JobId, worker_id: WorkerId },

    #[error("Job {0} already has an active lease")]
    AlreadyAssigned(JobId),

    #[error("State conflict on job {job_id}: expected {expected}, found {actual}")]
    StateConflict {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("Illegal transition on job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Partition queue is at capacity ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridError {
    /// Stale completion from a worker that already lost its lease. Callers
    /// discard the result and must not resubmit it.
    pub fn is_benign(&self) -> bool {
        matches!(self, GridError::NotAssigned(_) | GridError::NotOwner { .. })
    }

    /// The operation lost a race; re-reading and deciding again is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::StateConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_completions_are_benign() {
        assert!(GridError::NotAssigned(7).is_benign());
        assert!(GridError::NotOwner {
            job_id: 7,
            worker_id: WorkerId::from("w1"),
        }
        .is_benign());
        assert!(!GridError::UnknownJob(7).is_benign());
        assert!(!GridError::QueueFull { capacity: 1 }.is_benign());
    }

    #[test]
    fn only_state_conflicts_are_retryable() {
        let conflict = GridError::StateConflict {
            job_id: 1,
            expected: JobState::Assigned,
            actual: JobState::Pending,
        };
        assert!(conflict.is_retryable());
        assert!(!GridError::NotAssigned(1).is_retryable());
    }

    #[test]
    fn error_messages_name_the_job() {
        let err = GridError::StateConflict {
            job_id: 42,
            expected: JobState::Assigned,
            actual: JobState::Completed,
        };
        assert_eq!(
            err.to_string(),
            "State conflict on job 42: expected assigned, found completed"
        );
    }
}
