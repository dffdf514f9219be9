use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{GridError, Result};
use crate::scheduler::job::{Assignment, ClientId, Job, JobId, JobState, PartitionKey};

/// Hands out job identifiers. Shared by every partition so ids are unique
/// server-wide, strictly increasing and never reused.
#[derive(Debug, Clone, Default)]
pub struct JobIdGenerator {
    next: Arc<AtomicU64>,
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> JobId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of ids allocated so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Job records of a single partition.
#[derive(Debug)]
pub struct JobStore {
    partition: PartitionKey,
    ids: JobIdGenerator,
    jobs: HashMap<JobId, Job>,
}

impl JobStore {
    pub fn new(partition: PartitionKey, ids: JobIdGenerator) -> Self {
        Self {
            partition,
            ids,
            jobs: HashMap::new(),
        }
    }

    /// Allocate an id and record a Pending job.
    pub fn create(
        &mut self,
        partition: PartitionKey,
        payload: Vec<u8>,
        client_id: Option<ClientId>,
    ) -> Result<JobId> {
        if partition != self.partition {
            return Err(GridError::InvalidPartition {
                service_id: partition.service_id,
                service_version: partition.service_version,
            });
        }
        let id = self.ids.next_id();
        self.jobs
            .insert(id, Job::new(id, partition, payload, client_id));
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<&Job> {
        self.jobs.get(&id).ok_or(GridError::NotFound(id))
    }

    /// Compare-and-swap on the job state.
    ///
    /// Entering `Assigned` requires an assignment; leaving it clears the
    /// assignment. `Assigned -> Pending` counts as a retry.
    pub fn transition(
        &mut self,
        id: JobId,
        from: JobState,
        to: JobState,
        assignment: Option<Assignment>,
    ) -> Result<&Job> {
        let job = self.jobs.get_mut(&id).ok_or(GridError::NotFound(id))?;
        if job.state != from {
            return Err(GridError::StateConflict {
                job_id: id,
                expected: from,
                actual: job.state,
            });
        }
        if !from.can_transition_to(to) {
            return Err(GridError::IllegalTransition {
                job_id: id,
                from,
                to,
            });
        }

        match to {
            JobState::Assigned => {
                let assignment = assignment.ok_or_else(|| {
                    GridError::Internal(format!("job {} assigned without a lease", id))
                })?;
                job.assignment = Some(assignment);
            }
            JobState::Pending => {
                job.assignment = None;
                job.retry_count += 1;
            }
            JobState::Completed | JobState::Failed => {
                job.assignment = None;
            }
        }
        job.state = to;
        Ok(job)
    }

    /// Drop a finished job whose result has been claimed. Live jobs are kept.
    pub fn purge(&mut self, id: JobId) -> Option<Job> {
        match self.jobs.get(&id) {
            Some(job) if job.state.is_terminal() => self.jobs.remove(&id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::WorkerId;
    use std::time::{Duration, Instant};

    fn key() -> PartitionKey {
        PartitionKey::new(1, 2)
    }

    fn lease(id: JobId) -> Assignment {
        Assignment {
            job_id: id,
            worker_id: WorkerId::from("w1"),
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    #[test]
    fn ids_are_monotonic_across_stores() {
        let ids = JobIdGenerator::new();
        let mut a = JobStore::new(PartitionKey::new(0, 0), ids.clone());
        let mut b = JobStore::new(PartitionKey::new(0, 1), ids.clone());

        let first = a.create(PartitionKey::new(0, 0), vec![], None).unwrap();
        let second = b.create(PartitionKey::new(0, 1), vec![], None).unwrap();
        let third = a.create(PartitionKey::new(0, 0), vec![], None).unwrap();

        assert!(first < second && second < third);
        assert_eq!(ids.allocated(), 3);
    }

    #[test]
    fn create_rejects_foreign_partition() {
        let mut store = JobStore::new(key(), JobIdGenerator::new());
        let err = store
            .create(PartitionKey::new(9, 9), vec![], None)
            .unwrap_err();
        assert!(matches!(err, GridError::InvalidPartition { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let mut store = JobStore::new(key(), JobIdGenerator::new());
        let id = store.create(key(), b"x".to_vec(), None).unwrap();

        store
            .transition(id, JobState::Pending, JobState::Assigned, Some(lease(id)))
            .unwrap();
        store
            .transition(id, JobState::Assigned, JobState::Completed, None)
            .unwrap();

        // A second completion loses.
        let err = store
            .transition(id, JobState::Assigned, JobState::Completed, None)
            .unwrap_err();
        assert_eq!(
            err,
            GridError::StateConflict {
                job_id: id,
                expected: JobState::Assigned,
                actual: JobState::Completed,
            }
        );
    }

    #[test]
    fn requeue_increments_retry_and_clears_assignment() {
        let mut store = JobStore::new(key(), JobIdGenerator::new());
        let id = store.create(key(), vec![], None).unwrap();
        store
            .transition(id, JobState::Pending, JobState::Assigned, Some(lease(id)))
            .unwrap();

        let job = store
            .transition(id, JobState::Assigned, JobState::Pending, None)
            .unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.assignment.is_none());
    }

    #[test]
    fn assigning_without_lease_fails() {
        let mut store = JobStore::new(key(), JobIdGenerator::new());
        let id = store.create(key(), vec![], None).unwrap();
        let err = store
            .transition(id, JobState::Pending, JobState::Assigned, None)
            .unwrap_err();
        assert!(matches!(err, GridError::Internal(_)));
        assert_eq!(store.get(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn illegal_edge_is_rejected() {
        let mut store = JobStore::new(key(), JobIdGenerator::new());
        let id = store.create(key(), vec![], None).unwrap();
        let err = store
            .transition(id, JobState::Pending, JobState::Completed, None)
            .unwrap_err();
        assert!(matches!(err, GridError::IllegalTransition { .. }));
    }

    #[test]
    fn purge_only_removes_finished_jobs() {
        let mut store = JobStore::new(key(), JobIdGenerator::new());
        let id = store.create(key(), vec![], None).unwrap();
        assert!(store.purge(id).is_none());

        store
            .transition(id, JobState::Pending, JobState::Assigned, Some(lease(id)))
            .unwrap();
        store
            .transition(id, JobState::Assigned, JobState::Failed, None)
            .unwrap();
        assert!(store.purge(id).is_some());
        assert_eq!(store.get(id).unwrap_err(), GridError::NotFound(id));
    }
}
