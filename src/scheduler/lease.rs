use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{GridError, Result};
use crate::scheduler::job::{Assignment, JobId, WorkerId};

/// Active leases of one partition, keyed by job.
#[derive(Debug, Default)]
pub struct LeaseTracker {
    leases: HashMap<JobId, Assignment>,
}

impl LeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `worker_id` holds `job_id` until `now + lease_duration`.
    pub fn acquire(
        &mut self,
        job_id: JobId,
        worker_id: WorkerId,
        lease_duration: Duration,
        now: Instant,
    ) -> Result<Assignment> {
        if self.leases.contains_key(&job_id) {
            return Err(GridError::AlreadyAssigned(job_id));
        }
        let assignment = Assignment {
            job_id,
            worker_id,
            deadline: now + lease_duration,
        };
        self.leases.insert(job_id, assignment.clone());
        Ok(assignment)
    }

    /// Clear a lease on completion. With `worker_id` set, only the holder may
    /// release; `None` releases whoever holds it.
    pub fn release(&mut self, job_id: JobId, worker_id: Option<&WorkerId>) -> Result<Assignment> {
        let holder = self
            .leases
            .get(&job_id)
            .ok_or(GridError::NotAssigned(job_id))?;
        if let Some(worker_id) = worker_id {
            if &holder.worker_id != worker_id {
                return Err(GridError::NotOwner {
                    job_id,
                    worker_id: worker_id.clone(),
                });
            }
        }
        self.leases
            .remove(&job_id)
            .ok_or(GridError::NotAssigned(job_id))
    }

    /// Remove and return every lease whose deadline has passed, oldest
    /// deadline first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Assignment> {
        let expired: Vec<JobId> = self
            .leases
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.job_id)
            .collect();

        let mut taken: Vec<Assignment> = expired
            .into_iter()
            .filter_map(|id| self.leases.remove(&id))
            .collect();
        taken.sort_by_key(|a| (a.deadline, a.job_id));
        taken
    }

    pub fn get(&self, job_id: JobId) -> Option<&Assignment> {
        self.leases.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
