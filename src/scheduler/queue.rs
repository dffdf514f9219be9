use std::collections::VecDeque;

use crate::error::{GridError, Result};
use crate::scheduler::job::JobId;

const DEFAULT_MAX_PENDING: usize = 10_000;

/// Pending job ids of one partition.
///
/// Two tiers: jobs returned after a lease expiry are served before freshly
/// submitted ones. Each tier is FIFO.
#[derive(Debug)]
pub struct JobQueue {
    reclaimed: VecDeque<JobId>,
    fresh: VecDeque<JobId>,
    max_pending: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            reclaimed: VecDeque::new(),
            fresh: VecDeque::new(),
            max_pending,
        }
    }

    /// Append a freshly submitted job. Fails when the partition is at capacity.
    pub fn enqueue(&mut self, job_id: JobId) -> Result<()> {
        if self.is_full() {
            return Err(GridError::QueueFull {
                capacity: self.max_pending,
            });
        }
        self.fresh.push_back(job_id);
        Ok(())
    }

    /// Re-admit a job whose lease expired. Never rejected: the job was
    /// already counted against capacity when it was first submitted.
    pub fn requeue_reclaimed(&mut self, job_id: JobId) {
        self.reclaimed.push_back(job_id);
    }

    /// Put a dequeued job back at the very front, ahead of other reclaimed jobs.
    pub fn restore(&mut self, job_id: JobId) {
        self.reclaimed.push_front(job_id);
    }

    /// Pop the next job, reclaimed tier first. Never blocks.
    pub fn dequeue(&mut self) -> Option<JobId> {
        self.reclaimed
            .pop_front()
            .or_else(|| self.fresh.pop_front())
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.reclaimed.contains(&job_id) || self.fresh.contains(&job_id)
    }

    pub fn len(&self) -> usize {
        self.reclaimed.len() + self.fresh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.fresh.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_pending
    }

    pub fn capacity(&self) -> usize {
        self.max_pending
    }
}
