//! # Durable job store
//!
//! Abstraction over an external key/value + list-capable store holding the
//! waiting queue, the single active job and its lease, delayed retries,
//! batch counters, and TTL-bounded result records.
//!
//! Two implementations: [`RedisStore`] for production and [`MemoryStore`]
//! for tests and local runs without a store process.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::job::{Batch, Job, JobOutcome, ResultRecord};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Enumeration of errors for operations against the job store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: ::redis::RedisError },
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: String,
        error: ::redis::RedisError,
    },
    #[error("{command} command timed out")]
    TimeoutError { command: String },
    #[error("stored payload could not be decoded: {0}")]
    PayloadError(#[from] serde_json::Error),
    #[error("stored value for {field} is not valid")]
    CorruptRecord { field: &'static str },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Counts of jobs per state, for the stats endpoint and drain estimates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed_retained: u64,
    pub failed_retained: u64,
}

impl QueueStats {
    /// Jobs still ahead of a brand-new submission.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// Retention bounds applied by the store when a job reaches a terminal
/// state: keep at most `keep` records, and let the retained set expire
/// wholesale after `max_age` without new terminal writes.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed_keep: usize,
    pub completed_max_age: Duration,
    pub failed_keep: usize,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_keep: 1000,
            completed_max_age: Duration::from_secs(24 * 60 * 60),
            failed_keep: 500,
            failed_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Namespace prepended to every key so multiple deployments can share
    /// one store.
    pub key_prefix: String,
    /// Exclusive hold on a claimed job. Must be renewed at a fraction of
    /// this interval; an expired lease returns the job to waiting.
    pub lease: Duration,
    pub result_ttl: Duration,
    pub batch_ttl: Duration,
    pub retention: RetentionPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_prefix: "dripgate".to_owned(),
            lease: Duration::from_secs(5 * 60),
            result_ttl: Duration::from_secs(24 * 60 * 60),
            batch_ttl: Duration::from_secs(48 * 60 * 60),
            retention: RetentionPolicy::default(),
        }
    }
}

impl StoreSettings {
    pub fn queue_key(&self) -> String {
        format!("{}:jobs", self.key_prefix)
    }

    pub fn delayed_key(&self) -> String {
        format!("{}:delayed", self.key_prefix)
    }

    pub fn active_key(&self) -> String {
        format!("{}:active", self.key_prefix)
    }

    pub fn lease_key(&self) -> String {
        format!("{}:active:lease", self.key_prefix)
    }

    pub fn seq_key(&self) -> String {
        format!("{}:seq", self.key_prefix)
    }

    pub fn batch_key(&self, batch_id: &str) -> String {
        format!("{}:batch:{}", self.key_prefix, batch_id)
    }

    pub fn result_key(&self, job_id: &str, batch_id: Option<&str>) -> String {
        match batch_id {
            Some(batch_id) => format!("{}:result:{}:{}", self.key_prefix, job_id, batch_id),
            None => format!("{}:result:{}", self.key_prefix, job_id),
        }
    }

    pub fn result_scan_pattern(&self, batch_id: &str) -> String {
        format!("{}:result:*:{}", self.key_prefix, batch_id)
    }

    pub fn retained_key(&self, outcome: JobOutcome) -> String {
        match outcome {
            JobOutcome::Completed => format!("{}:completed", self.key_prefix),
            JobOutcome::Failed => format!("{}:failed", self.key_prefix),
        }
    }
}

/// The durable store contract. The worker is the only caller of the
/// claim/lease/terminal operations; the ingress only pushes and reads.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append one job to the waiting queue.
    async fn push(&self, job: Job) -> StoreResult<()>;

    /// Append a submission's jobs in one round trip, preserving order.
    async fn push_bulk(&self, jobs: Vec<Job>) -> StoreResult<usize>;

    /// Move the head of the waiting queue into the active holding area
    /// under a fresh lease. Promotes due delayed retries and reclaims a
    /// stalled active job first. Returns None when nothing is runnable.
    async fn claim_next(&self) -> StoreResult<Option<Job>>;

    /// Extend the lease on the active job. Returns false when the lease has
    /// already expired (the job will be handed to another claimer).
    async fn renew_lease(&self, job_id: &str) -> StoreResult<bool>;

    /// Park the active job for a later attempt. Clears the active area.
    async fn schedule_retry(&self, job: Job, delay: Duration) -> StoreResult<()>;

    /// Terminal success: clear the active area and retain the job per the
    /// retention policy.
    async fn complete_job(&self, job: &Job) -> StoreResult<()>;

    /// Terminal failure: clear the active area and retain the job per the
    /// retention policy.
    async fn fail_job(&self, job: &Job) -> StoreResult<()>;

    async fn create_batch(&self, batch: &Batch) -> StoreResult<()>;

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<Batch>>;

    /// Atomically bump the batch counter for one terminal outcome.
    async fn record_outcome(&self, batch_id: &str, outcome: JobOutcome) -> StoreResult<()>;

    /// Write the per-job result record with its own TTL.
    async fn write_result(&self, record: &ResultRecord) -> StoreResult<()>;

    /// Enumerate result records for a batch, newest-agnostic, up to `limit`.
    async fn results_for_batch(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ResultRecord>>;

    async fn stats(&self) -> StoreResult<QueueStats>;

    /// Cheap reachability probe for the health endpoint.
    async fn ping(&self) -> StoreResult<()>;
}
