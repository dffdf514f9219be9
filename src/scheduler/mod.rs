pub mod clients;
pub mod job;
pub mod lease;
pub mod outbox;
pub mod partition;
pub mod queue;
pub mod store;

pub use job::{Job, JobId, JobResult, JobState, Outcome, PartitionKey, WorkerId};
pub use partition::Partition;
pub use queue::JobQueue;
