//! In-process [`JobStore`] used by tests and store-less local runs. Mirrors
//! the Redis layout semantics (priority order, lease expiry, TTLs) without
//! any I/O.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::job::{Batch, Job, JobOutcome, ResultRecord};
use crate::store::{JobStore, QueueStats, StoreResult, StoreSettings};

/// Waiting jobs are ordered by (priority, sequence): lowest numeric
/// priority first, FIFO within a priority.
type Slot = (u8, u64);

struct ActiveJob {
    job: Job,
    slot: Slot,
    lease_until: Instant,
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    waiting: BTreeMap<Slot, Job>,
    delayed: BTreeMap<(Instant, u64), Job>,
    active: Option<ActiveJob>,
    batches: HashMap<String, Expiring<Batch>>,
    results: HashMap<String, Expiring<ResultRecord>>,
    completed: VecDeque<Job>,
    failed: VecDeque<Job>,
}

pub struct MemoryStore {
    settings: StoreSettings,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    fn enqueue_locked(inner: &mut Inner, job: Job) {
        inner.seq += 1;
        inner.waiting.insert((job.priority, inner.seq), job);
    }

    /// Lease expiry and due retries are applied lazily, on the next store
    /// interaction, the same way the Redis implementation does on claim.
    fn settle_locked(inner: &mut Inner, now: Instant) {
        if let Some(active) = inner.active.take() {
            if active.lease_until > now {
                inner.active = Some(active);
            } else {
                inner.waiting.insert(active.slot, active.job);
            }
        }

        let due: Vec<(Instant, u64)> = inner
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            if let Some(job) = inner.delayed.remove(&key) {
                Self::enqueue_locked(inner, job);
            }
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn push(&self, job: Job) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::enqueue_locked(&mut inner, job);
        Ok(())
    }

    async fn push_bulk(&self, jobs: Vec<Job>) -> StoreResult<usize> {
        let mut inner = self.lock();
        let count = jobs.len();
        for job in jobs {
            Self::enqueue_locked(&mut inner, job);
        }
        Ok(count)
    }

    async fn claim_next(&self) -> StoreResult<Option<Job>> {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::settle_locked(&mut inner, now);

        if inner.active.is_some() {
            return Ok(None);
        }

        let Some(slot) = inner.waiting.keys().next().copied() else {
            return Ok(None);
        };
        let job = inner.waiting.remove(&slot).expect("slot key vanished");
        inner.active = Some(ActiveJob {
            job: job.clone(),
            slot,
            lease_until: now + self.settings.lease,
        });

        Ok(Some(job))
    }

    async fn renew_lease(&self, job_id: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.active.as_mut() {
            Some(active) if active.job.job_id == job_id && active.lease_until > now => {
                active.lease_until = now + self.settings.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_retry(&self, job: Job, delay: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner
            .active
            .as_ref()
            .is_some_and(|active| active.job.job_id == job.job_id)
        {
            inner.active = None;
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.delayed.insert((now + delay, seq), job);
        Ok(())
    }

    async fn complete_job(&self, job: &Job) -> StoreResult<()> {
        let retention = self.settings.retention;
        let mut inner = self.lock();

        if inner
            .active
            .as_ref()
            .is_some_and(|active| active.job.job_id == job.job_id)
        {
            inner.active = None;
        }
        inner.completed.push_front(job.clone());
        inner.completed.truncate(retention.completed_keep);
        prune_by_age(&mut inner.completed, retention.completed_max_age);
        Ok(())
    }

    async fn fail_job(&self, job: &Job) -> StoreResult<()> {
        let retention = self.settings.retention;
        let mut inner = self.lock();

        if inner
            .active
            .as_ref()
            .is_some_and(|active| active.job.job_id == job.job_id)
        {
            inner.active = None;
        }
        inner.failed.push_front(job.clone());
        inner.failed.truncate(retention.failed_keep);
        prune_by_age(&mut inner.failed, retention.failed_max_age);
        Ok(())
    }

    async fn create_batch(&self, batch: &Batch) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.batches.insert(
            batch.batch_id.clone(),
            Expiring {
                value: batch.clone(),
                expires_at: Instant::now() + self.settings.batch_ttl,
            },
        );
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<Batch>> {
        let inner = self.lock();
        Ok(inner
            .batches
            .get(batch_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn record_outcome(&self, batch_id: &str, outcome: JobOutcome) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(entry) = inner.batches.get_mut(batch_id) {
            match outcome {
                JobOutcome::Completed => entry.value.completed += 1,
                JobOutcome::Failed => entry.value.failed += 1,
            }
        }
        Ok(())
    }

    async fn write_result(&self, record: &ResultRecord) -> StoreResult<()> {
        let key = self
            .settings
            .result_key(&record.job_id, record.batch_id.as_deref());
        let mut inner = self.lock();
        inner.results.insert(
            key,
            Expiring {
                value: record.clone(),
                expires_at: Instant::now() + self.settings.result_ttl,
            },
        );
        Ok(())
    }

    async fn results_for_batch(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ResultRecord>> {
        let now = Instant::now();
        let inner = self.lock();
        let mut records: Vec<ResultRecord> = inner
            .results
            .values()
            .filter(|entry| entry.expires_at > now)
            .filter(|entry| entry.value.batch_id.as_deref() == Some(batch_id))
            .map(|entry| entry.value.clone())
            .collect();
        records.sort_by(|a, b| a.stored_at.cmp(&b.stored_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::settle_locked(&mut inner, now);

        Ok(QueueStats {
            waiting: inner.waiting.len() as u64,
            active: u64::from(inner.active.is_some()),
            delayed: inner.delayed.len() as u64,
            completed_retained: inner.completed.len() as u64,
            failed_retained: inner.failed.len() as u64,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

fn prune_by_age(retained: &mut VecDeque<Job>, max_age: Duration) {
    let Ok(max_age) = chrono::Duration::from_std(max_age) else {
        return;
    };
    let cutoff = Utc::now() - max_age;
    while retained
        .back()
        .is_some_and(|job| job.finished_at.unwrap_or(job.enqueued_at) < cutoff)
    {
        retained.pop_back();
    }
}
