use std::collections::{BTreeMap, HashMap};

use crate::scheduler::job::{ClientId, JobId, JobResult};

/// Ready results awaiting a claim, in arrival order.
#[derive(Debug, Default)]
pub struct ResultStream {
    next_seq: u64,
    by_seq: BTreeMap<u64, JobResult>,
    seq_by_job: HashMap<JobId, u64>,
}

impl ResultStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. A stale entry for the same job is replaced and the
    /// result moves to the back of the stream.
    pub fn deposit(&mut self, result: JobResult) {
        if let Some(old_seq) = self.seq_by_job.remove(&result.job_id) {
            self.by_seq.remove(&old_seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_by_job.insert(result.job_id, seq);
        self.by_seq.insert(seq, result);
    }

    /// Remove and return up to `max_n` results, oldest first.
    pub fn drain(&mut self, max_n: usize) -> Vec<JobResult> {
        let mut drained = Vec::with_capacity(max_n.min(self.by_seq.len()));
        while drained.len() < max_n {
            let Some((_, result)) = self.by_seq.pop_first() else {
                break;
            };
            self.seq_by_job.remove(&result.job_id);
            drained.push(result);
        }
        drained
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.seq_by_job.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}

/// Results keyed by the client that submitted the job. Jobs submitted
/// without a client id share the anonymous stream.
#[derive(Debug, Default)]
pub struct ResultOutbox {
    shared: ResultStream,
    per_client: HashMap<ClientId, ResultStream>,
}

impl ResultOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&mut self, client_id: Option<ClientId>, result: JobResult) {
        match client_id {
            Some(client_id) => self.per_client.entry(client_id).or_default().deposit(result),
            None => self.shared.deposit(result),
        }
    }

    pub fn drain(&mut self, client_id: Option<ClientId>, max_n: usize) -> Vec<JobResult> {
        match client_id {
            Some(client_id) => {
                let Some(stream) = self.per_client.get_mut(&client_id) else {
                    return Vec::new();
                };
                let drained = stream.drain(max_n);
                if stream.is_empty() {
                    self.per_client.remove(&client_id);
                }
                drained
            }
            None => self.shared.drain(max_n),
        }
    }

    pub fn contains(&self, client_id: Option<ClientId>, job_id: JobId) -> bool {
        match client_id {
            Some(client_id) => self
                .per_client
                .get(&client_id)
                .is_some_and(|s| s.contains(job_id)),
            None => self.shared.contains(job_id),
        }
    }

    /// Total results waiting across every stream.
    pub fn len(&self) -> usize {
        self.shared.len() + self.per_client.values().map(ResultStream::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
