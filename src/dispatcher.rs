//! The façade clients and workers talk to.
//!
//! Every partition is its own serialization domain behind a `Mutex`, so busy
//! services never contend with each other. The results outbox, the job
//! routing index and the client registry sit behind their own locks. Lock
//! order is always partition, then outbox or routes; nothing takes a
//! partition lock while holding one of those.
//!
//! Delivery to workers is at-least-once: a slow worker whose lease expired
//! may still be processing a job that has since been handed to someone else.
//! Consumers of results must tolerate duplicate processing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{GridError, Result};
use crate::scheduler::clients::ClientRegistry;
use crate::scheduler::job::{ClientId, Job, JobId, JobResult, PartitionKey, WorkerId};
use crate::scheduler::outbox::ResultOutbox;
use crate::scheduler::partition::{Partition, PartitionStatus, Reclaim};
use crate::scheduler::store::JobIdGenerator;

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub jobs_submitted: u64,
    pub results_ready: usize,
    pub clients: usize,
    pub partitions: Vec<PartitionStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub requeued: usize,
    pub failed: usize,
}

impl SweepSummary {
    fn merge(&mut self, other: SweepSummary) {
        self.requeued += other.requeued;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

pub struct Dispatcher {
    config: ServerConfig,
    ids: JobIdGenerator,
    partitions: RwLock<HashMap<PartitionKey, Arc<Mutex<Partition>>>>,
    routes: RwLock<HashMap<JobId, PartitionKey>>,
    outbox: Mutex<ResultOutbox>,
    clients: Mutex<ClientRegistry>,
}

impl Dispatcher {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            ids: JobIdGenerator::new(),
            partitions: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            outbox: Mutex::new(ResultOutbox::new()),
            clients: Mutex::new(ClientRegistry::new()),
        }
    }

    pub async fn register_client(&self, description: impl Into<String>) -> ClientId {
        self.clients.lock().await.register(description)
    }

    /// Create a job and queue it on its partition. Results for jobs submitted
    /// with a client id are only returned to that client.
    pub async fn submit_job(
        &self,
        key: PartitionKey,
        payload: Vec<u8>,
        client_id: Option<ClientId>,
    ) -> Result<JobId> {
        if let Some(client_id) = client_id {
            self.clients.lock().await.touch(client_id)?;
        }
        let slot = self.partition_or_create(key).await?;
        let mut partition = slot.lock().await;

        let job_id = match partition.submit(payload, client_id) {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::warn!(partition = %key, error = %e, "Job rejected");
                return Err(e);
            }
        };
        self.routes.write().await.insert(job_id, key);

        tracing::info!(job_id, partition = %key, client_id = ?client_id, "Job submitted");
        Ok(job_id)
    }

    pub async fn fetch_job(&self, key: PartitionKey, worker_id: &WorkerId) -> Result<Option<Job>> {
        self.fetch_job_at(key, worker_id, Instant::now()).await
    }

    /// Lease the next pending job of `key` to `worker_id`. Returns `None`
    /// immediately when nothing is pending.
    pub async fn fetch_job_at(
        &self,
        key: PartitionKey,
        worker_id: &WorkerId,
        now: Instant,
    ) -> Result<Option<Job>> {
        self.config.bounds.check(&key)?;
        let Some(slot) = self.partition(&key).await else {
            tracing::debug!(partition = %key, "Fetch on partition with no jobs");
            return Ok(None);
        };
        let mut partition = slot.lock().await;
        self.reclaim_locked(&mut partition, now).await;

        let job = partition.fetch(worker_id, now, None)?;
        log_fetch(key, worker_id, job.as_ref());
        Ok(job)
    }

    /// Complete a leased job and make its result claimable.
    ///
    /// `NotAssigned` and `NotOwner` mean the lease was already reclaimed; the
    /// caller should drop the result.
    pub async fn submit_result(
        &self,
        result: JobResult,
        worker_id: Option<&WorkerId>,
    ) -> Result<()> {
        let key = self.route(result.job_id).await?;
        let slot = self
            .partition(&key)
            .await
            .ok_or(GridError::UnknownJob(result.job_id))?;
        let mut partition = slot.lock().await;
        self.complete_locked(&mut partition, result, worker_id).await
    }

    pub async fn exchange(
        &self,
        key: PartitionKey,
        worker_id: &WorkerId,
        result: Option<JobResult>,
    ) -> Result<Option<Job>> {
        self.exchange_at(key, worker_id, result, Instant::now()).await
    }

    /// Acknowledge the worker's previous job, then lease it the next one.
    ///
    /// When the previous job belongs to `key`, both steps run under a single
    /// hold of the partition lock. A stale result does not stop the fetch, and
    /// the reported job is never handed back to the same worker in this call.
    pub async fn exchange_at(
        &self,
        key: PartitionKey,
        worker_id: &WorkerId,
        result: Option<JobResult>,
        now: Instant,
    ) -> Result<Option<Job>> {
        self.config.bounds.check(&key)?;

        let result = match result {
            Some(result) => {
                if self.route(result.job_id).await? == key {
                    Some(result)
                } else {
                    acknowledge(self.submit_result(result, Some(worker_id)).await)?;
                    None
                }
            }
            None => None,
        };

        let Some(slot) = self.partition(&key).await else {
            tracing::debug!(partition = %key, %worker_id, "Exchange on partition with no jobs");
            return Ok(None);
        };
        let mut partition = slot.lock().await;
        let mut reported = None;
        if let Some(result) = result {
            reported = Some(result.job_id);
            acknowledge(
                self.complete_locked(&mut partition, result, Some(worker_id))
                    .await,
            )?;
        }
        self.reclaim_locked(&mut partition, now).await;

        let job = partition.fetch(worker_id, now, reported)?;
        log_fetch(key, worker_id, job.as_ref());
        Ok(job)
    }

    /// Claim up to `max_n` ready results (the configured default when `None`).
    /// A claimed result is never returned again.
    pub async fn fetch_results(
        &self,
        client_id: Option<ClientId>,
        max_n: Option<usize>,
    ) -> Result<Vec<JobResult>> {
        if let Some(client_id) = client_id {
            self.clients.lock().await.touch(client_id)?;
        }
        let max_n = max_n.unwrap_or(self.config.default_fetch_limit);
        let results = self.outbox.lock().await.drain(client_id, max_n);

        if results.is_empty() {
            tracing::debug!(client_id = ?client_id, "No results ready");
        } else {
            tracing::info!(count = results.len(), client_id = ?client_id, "Results claimed");
            self.purge_claimed(&results).await;
        }
        Ok(results)
    }

    pub async fn sweep_expired(&self) -> SweepSummary {
        self.sweep_expired_at(Instant::now()).await
    }

    /// Reclaim expired leases on every partition, one partition lock at a time.
    pub async fn sweep_expired_at(&self, now: Instant) -> SweepSummary {
        let mut summary = SweepSummary::default();
        for slot in self.all_partitions().await {
            let mut partition = slot.lock().await;
            summary.merge(self.reclaim_locked(&mut partition, now).await);
        }
        summary
    }

    /// Snapshot of a job record.
    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        let key = self
            .route(job_id)
            .await
            .map_err(|_| GridError::NotFound(job_id))?;
        let slot = self
            .partition(&key)
            .await
            .ok_or(GridError::NotFound(job_id))?;
        let partition = slot.lock().await;
        partition.get(job_id).cloned()
    }

    pub async fn status(&self) -> ServerStatus {
        let mut partitions = Vec::new();
        for slot in self.all_partitions().await {
            partitions.push(slot.lock().await.status());
        }
        partitions.sort_by_key(|p| (p.service_id, p.service_version));

        ServerStatus {
            jobs_submitted: self.ids.allocated(),
            results_ready: self.outbox.lock().await.len(),
            clients: self.clients.lock().await.len(),
            partitions,
        }
    }

    /// Run the lease sweep every `sweep_interval_ms` until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.lease.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = period.as_millis() as u64, "Lease sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Lease sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let summary = self.sweep_expired().await;
                        if !summary.is_empty() {
                            tracing::debug!(
                                requeued = summary.requeued,
                                failed = summary.failed,
                                "Lease sweep reclaimed jobs"
                            );
                        }
                    }
                }
            }
        })
    }

    async fn partition(&self, key: &PartitionKey) -> Option<Arc<Mutex<Partition>>> {
        self.partitions.read().await.get(key).cloned()
    }

    async fn all_partitions(&self) -> Vec<Arc<Mutex<Partition>>> {
        self.partitions.read().await.values().cloned().collect()
    }

    async fn partition_or_create(&self, key: PartitionKey) -> Result<Arc<Mutex<Partition>>> {
        self.config.bounds.check(&key)?;
        if let Some(slot) = self.partition(&key).await {
            return Ok(slot);
        }

        let mut partitions = self.partitions.write().await;
        let slot = partitions.entry(key).or_insert_with(|| {
            let lease = self.config.lease.lease_for(&key);
            tracing::info!(
                partition = %key,
                lease_ms = lease.as_millis() as u64,
                "Partition created"
            );
            Arc::new(Mutex::new(Partition::new(
                key,
                self.ids.clone(),
                lease,
                self.config.lease.max_retries,
                self.config.max_pending_per_partition,
            )))
        });
        Ok(slot.clone())
    }

    async fn route(&self, job_id: JobId) -> Result<PartitionKey> {
        self.routes
            .read()
            .await
            .get(&job_id)
            .copied()
            .ok_or(GridError::UnknownJob(job_id))
    }

    async fn complete_locked(
        &self,
        partition: &mut Partition,
        result: JobResult,
        worker_id: Option<&WorkerId>,
    ) -> Result<()> {
        let job_id = result.job_id;
        match partition.complete(job_id, worker_id, result.outcome) {
            Ok(finished) => {
                let is_error = finished.result.outcome.is_error();
                self.outbox
                    .lock()
                    .await
                    .deposit(finished.client_id, finished.result);
                tracing::info!(
                    job_id,
                    worker_id = ?worker_id,
                    partition = %partition.key(),
                    is_error,
                    "Job completed"
                );
                Ok(())
            }
            Err(e) if e.is_benign() => {
                tracing::warn!(job_id, worker_id = ?worker_id, error = %e, "Discarding stale result");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn reclaim_locked(&self, partition: &mut Partition, now: Instant) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut failed = Vec::new();
        for reclaim in partition.sweep(now) {
            match reclaim {
                Reclaim::Requeued { .. } => summary.requeued += 1,
                Reclaim::Failed(finished) => {
                    summary.failed += 1;
                    failed.push(finished);
                }
            }
        }

        if !failed.is_empty() {
            let mut outbox = self.outbox.lock().await;
            for finished in failed {
                outbox.deposit(finished.client_id, finished.result);
            }
        }
        summary
    }

    async fn purge_claimed(&self, results: &[JobResult]) {
        for result in results {
            let job_id = result.job_id;
            let Some(key) = self.routes.read().await.get(&job_id).copied() else {
                continue;
            };
            let Some(slot) = self.partition(&key).await else {
                continue;
            };
            let purged = slot.lock().await.purge(job_id).is_some();
            if purged {
                self.routes.write().await.remove(&job_id);
            }
        }
    }
}

/// Treat a stale completion as already handled.
fn acknowledge(outcome: Result<()>) -> Result<()> {
    match outcome {
        Err(e) if e.is_benign() => Ok(()),
        other => other,
    }
}

fn log_fetch(key: PartitionKey, worker_id: &WorkerId, job: Option<&Job>) {
    match job {
        Some(job) => tracing::info!(
            job_id = job.id,
            %worker_id,
            partition = %key,
            retry_count = job.retry_count,
            "Job assigned"
        ),
        None => tracing::debug!(%worker_id, partition = %key, "No pending jobs"),
    }
}
