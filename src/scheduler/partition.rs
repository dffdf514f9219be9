//! One serialization domain: the store, queue and leases of a single
//! (service id, service version) pair. Callers hold the partition's lock for
//! the whole of each operation, so a sweep reclaiming a lease and a worker
//! completing the same job are strictly ordered.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{GridError, Result};
use crate::scheduler::job::{
    ClientId, Job, JobId, JobResult, JobState, Outcome, PartitionKey, WorkerId,
};
use crate::scheduler::lease::LeaseTracker;
use crate::scheduler::queue::JobQueue;
use crate::scheduler::store::{JobIdGenerator, JobStore};

/// A result ready for the outbox, tagged with the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub client_id: Option<ClientId>,
    pub result: JobResult,
}

/// What the sweep did with one expired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    Requeued { job_id: JobId, retry_count: u32 },
    Failed(Finished),
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub service_id: u32,
    pub service_version: u32,
    pub pending: usize,
    pub assigned: usize,
    pub lease_ms: u64,
}

#[derive(Debug)]
pub struct Partition {
    key: PartitionKey,
    store: JobStore,
    queue: JobQueue,
    leases: LeaseTracker,
    lease_duration: Duration,
    max_retries: u32,
}

impl Partition {
    pub fn new(
        key: PartitionKey,
        ids: JobIdGenerator,
        lease_duration: Duration,
        max_retries: u32,
        max_pending: usize,
    ) -> Self {
        Self {
            key,
            store: JobStore::new(key, ids),
            queue: JobQueue::with_capacity(max_pending),
            leases: LeaseTracker::new(),
            lease_duration,
            max_retries,
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    /// Create a Pending job and queue it behind earlier submissions.
    pub fn submit(&mut self, payload: Vec<u8>, client_id: Option<ClientId>) -> Result<JobId> {
        if self.queue.is_full() {
            return Err(GridError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }
        let job_id = self.store.create(self.key, payload, client_id)?;
        self.queue.enqueue(job_id)?;
        Ok(job_id)
    }

    /// Pop the next pending job and lease it to `worker_id`.
    ///
    /// A pending `skip` job is passed over and stays at the head of the queue.
    pub fn fetch(
        &mut self,
        worker_id: &WorkerId,
        now: Instant,
        skip: Option<JobId>,
    ) -> Result<Option<Job>> {
        let mut deferred = None;
        let fetched = loop {
            let Some(job_id) = self.queue.dequeue() else {
                break Ok(None);
            };
            match self.store.get(job_id) {
                Ok(job) if job.state == JobState::Pending => {}
                Ok(job) => {
                    tracing::warn!(
                        job_id,
                        state = %job.state,
                        partition = %self.key,
                        "Skipping queued job that is no longer pending"
                    );
                    continue;
                }
                Err(_) => continue,
            }
            if skip == Some(job_id) {
                deferred = Some(job_id);
                continue;
            }
            break self.lease(job_id, worker_id, now).map(Some);
        };

        if let Some(job_id) = deferred {
            self.queue.restore(job_id);
        }
        fetched
    }

    /// Lease a dequeued Pending job. On failure the job goes back to the head
    /// of the queue with no lease held.
    fn lease(&mut self, job_id: JobId, worker_id: &WorkerId, now: Instant) -> Result<Job> {
        let assignment =
            match self
                .leases
                .acquire(job_id, worker_id.clone(), self.lease_duration, now)
            {
                Ok(assignment) => assignment,
                Err(e) => {
                    self.queue.restore(job_id);
                    return Err(e);
                }
            };

        match self.store.transition(
            job_id,
            JobState::Pending,
            JobState::Assigned,
            Some(assignment),
        ) {
            Ok(job) => Ok(job.clone()),
            Err(e) => {
                if let Err(release_err) = self.leases.release(job_id, Some(worker_id)) {
                    tracing::warn!(
                        job_id,
                        error = %release_err,
                        partition = %self.key,
                        "Lease rollback failed"
                    );
                }
                self.queue.restore(job_id);
                Err(e)
            }
        }
    }

    /// Complete an assigned job. `worker_id`, when given, must hold the lease.
    pub fn complete(
        &mut self,
        job_id: JobId,
        worker_id: Option<&WorkerId>,
        outcome: Outcome,
    ) -> Result<Finished> {
        let job = self
            .store
            .get(job_id)
            .map_err(|_| GridError::UnknownJob(job_id))?;
        if job.state != JobState::Assigned {
            return Err(GridError::NotAssigned(job_id));
        }
        let client_id = job.client_id;

        self.leases.release(job_id, worker_id)?;
        self.store
            .transition(job_id, JobState::Assigned, JobState::Completed, None)?;

        Ok(Finished {
            client_id,
            result: JobResult::new(job_id, outcome),
        })
    }

    /// Reclaim every lease past its deadline. Jobs with retries left go back
    /// to the head of the queue; the rest fail with a synthetic error result.
    pub fn sweep(&mut self, now: Instant) -> Vec<Reclaim> {
        let mut reclaimed = Vec::new();
        for expired in self.leases.take_expired(now) {
            let job_id = expired.job_id;
            let (retry_count, client_id) = match self.store.get(job_id) {
                Ok(job) if job.state == JobState::Assigned => (job.retry_count, job.client_id),
                _ => continue,
            };

            if retry_count >= self.max_retries {
                if self
                    .store
                    .transition(job_id, JobState::Assigned, JobState::Failed, None)
                    .is_err()
                {
                    continue;
                }
                tracing::warn!(
                    job_id,
                    worker_id = %expired.worker_id,
                    retry_count,
                    partition = %self.key,
                    "Lease expired with no retries left, job failed"
                );
                reclaimed.push(Reclaim::Failed(Finished {
                    client_id,
                    result: JobResult::retries_exhausted(job_id, retry_count),
                }));
            } else {
                let retry_count = match self.store.transition(
                    job_id,
                    JobState::Assigned,
                    JobState::Pending,
                    None,
                ) {
                    Ok(job) => job.retry_count,
                    Err(_) => continue,
                };
                self.queue.requeue_reclaimed(job_id);
                tracing::info!(
                    job_id,
                    worker_id = %expired.worker_id,
                    retry_count,
                    partition = %self.key,
                    "Lease expired, job requeued"
                );
                reclaimed.push(Reclaim::Requeued {
                    job_id,
                    retry_count,
                });
            }
        }
        reclaimed
    }

    pub fn get(&self, job_id: JobId) -> Result<&Job> {
        self.store.get(job_id)
    }

    pub fn purge(&mut self, job_id: JobId) -> Option<Job> {
        self.store.purge(job_id)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn assigned_len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_queued(&self, job_id: JobId) -> bool {
        self.queue.contains(job_id)
    }

    pub fn status(&self) -> PartitionStatus {
        PartitionStatus {
            service_id: self.key.service_id,
            service_version: self.key.service_version,
            pending: self.queue.len(),
            assigned: self.leases.len(),
            lease_ms: self.lease_duration.as_millis() as u64,
        }
    }
}
