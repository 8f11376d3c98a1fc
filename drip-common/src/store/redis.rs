//! Redis-backed [`JobStore`].
//!
//! Layout (under the configured prefix): `jobs` is a sorted set scored by
//! (priority, enqueue sequence) so the head is always the runnable job that
//! should start next; `delayed` is a sorted set scored by due time in epoch
//! millis; the single active job lives in the `active` hash with a
//! separate `active:lease` key whose PX expiry is the lease. Batches are
//! hashes with a TTL, results are TTL'd strings keyed so a pattern scan
//! enumerates a batch.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tokio::time::timeout;

use crate::job::{Batch, Job, JobOutcome, ResultRecord};
use crate::store::{JobStore, QueueStats, StoreError, StoreResult, StoreSettings};

/// Upper bound for any single command round trip. The claim path issues a
/// handful of commands, each individually bounded.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Sequence numbers occupy the low bits of a queue score so that equal
/// priorities pop in enqueue order. Scores stay well inside f64's exact
/// integer range (2^53) for any realistic queue lifetime.
const PRIORITY_STRIDE: u64 = 1 << 40;

fn queue_score(priority: u8, seq: u64) -> f64 {
    (u64::from(priority) * PRIORITY_STRIDE + seq) as f64
}

pub struct RedisStore {
    client: redis::Client,
    settings: StoreSettings,
}

impl RedisStore {
    pub fn new(url: &str, settings: StoreSettings) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    async fn connection(&self) -> StoreResult<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|error| StoreError::ConnectionError { error })
    }

    async fn run<T>(
        &self,
        command: &str,
        operation: impl Future<Output = redis::RedisResult<T>>,
    ) -> StoreResult<T> {
        match timeout(COMMAND_TIMEOUT, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(StoreError::CommandError {
                command: command.to_owned(),
                error,
            }),
            Err(_) => Err(StoreError::TimeoutError {
                command: command.to_owned(),
            }),
        }
    }

    /// Move every due delayed job back into the waiting queue. Runs on the
    /// claim path; only the single worker calls it, so the
    /// read-then-move sequence does not race.
    async fn promote_due_retries(&self, conn: &mut redis::aio::Connection) -> StoreResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = self
            .run(
                "ZRANGEBYSCORE",
                conn.zrangebyscore(self.settings.delayed_key(), "-inf", now_ms),
            )
            .await?;

        for member in due {
            let job: Job = serde_json::from_str(&member)?;
            let seq: u64 = self
                .run("INCR", conn.incr(self.settings.seq_key(), 1u64))
                .await?;
            let mut pipe = redis::pipe();
            pipe.zadd(
                self.settings.queue_key(),
                &member,
                queue_score(job.priority, seq),
            )
            .ignore()
            .zrem(self.settings.delayed_key(), &member)
            .ignore();
            self.run("promote pipeline", pipe.query_async::<_, ()>(conn))
                .await?;
        }

        Ok(())
    }

    /// Clear the active holding area and retain the terminal job, trimming
    /// the retained list to the retention policy's count bound and
    /// refreshing its age bound.
    async fn finish_job(&self, job: &Job, outcome: JobOutcome) -> StoreResult<()> {
        let (keep, max_age) = match outcome {
            JobOutcome::Completed => (
                self.settings.retention.completed_keep,
                self.settings.retention.completed_max_age,
            ),
            JobOutcome::Failed => (
                self.settings.retention.failed_keep,
                self.settings.retention.failed_max_age,
            ),
        };
        let retained_key = self.settings.retained_key(outcome);
        let payload = serde_json::to_string(job)?;

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.del(vec![self.settings.active_key(), self.settings.lease_key()])
            .ignore()
            .lpush(&retained_key, payload)
            .ignore()
            .ltrim(&retained_key, 0, keep as isize - 1)
            .ignore()
            .expire(&retained_key, max_age.as_secs() as usize)
            .ignore();

        self.run("terminal pipeline", pipe.query_async::<_, ()>(&mut conn))
            .await
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn push(&self, job: Job) -> StoreResult<()> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.connection().await?;

        let seq: u64 = self
            .run("INCR", conn.incr(self.settings.seq_key(), 1u64))
            .await?;
        self.run(
            "ZADD",
            conn.zadd(
                self.settings.queue_key(),
                payload,
                queue_score(job.priority, seq),
            ),
        )
        .await
    }

    async fn push_bulk(&self, jobs: Vec<Job>) -> StoreResult<usize> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let count = jobs.len();
        let mut conn = self.connection().await?;

        // Reserve a contiguous block of sequence numbers, then write every
        // member in one pipeline so a submission lands in order.
        let end: u64 = self
            .run("INCRBY", conn.incr(self.settings.seq_key(), count as u64))
            .await?;
        let start = end - count as u64 + 1;

        let mut pipe = redis::pipe();
        for (offset, job) in jobs.iter().enumerate() {
            let payload = serde_json::to_string(job)?;
            pipe.zadd(
                self.settings.queue_key(),
                payload,
                queue_score(job.priority, start + offset as u64),
            )
            .ignore();
        }
        self.run("bulk ZADD pipeline", pipe.query_async::<_, ()>(&mut conn))
            .await?;

        Ok(count)
    }

    async fn claim_next(&self) -> StoreResult<Option<Job>> {
        let mut conn = self.connection().await?;

        let active_exists: bool = self
            .run("EXISTS", conn.exists(self.settings.active_key()))
            .await?;
        if active_exists {
            let lease_live: bool = self
                .run("EXISTS", conn.exists(self.settings.lease_key()))
                .await?;
            if lease_live {
                // Single-flight: somebody (normally: us, on a previous
                // iteration) still holds a live lease.
                return Ok(None);
            }

            // Stalled lease. Return the job to the waiting queue at its
            // original position.
            let fields: HashMap<String, String> = self
                .run("HGETALL", conn.hgetall(self.settings.active_key()))
                .await?;
            if let (Some(member), Some(score)) = (fields.get("job"), fields.get("score")) {
                let score: f64 = score
                    .parse()
                    .map_err(|_| StoreError::CorruptRecord { field: "score" })?;
                self.run(
                    "ZADD",
                    conn.zadd::<_, _, _, ()>(self.settings.queue_key(), member.as_str(), score),
                )
                .await?;
            }
            self.run("DEL", conn.del::<_, ()>(self.settings.active_key()))
                .await?;
        }

        self.promote_due_retries(&mut conn).await?;

        let popped: Vec<(String, f64)> = self
            .run("ZPOPMIN", conn.zpopmin(self.settings.queue_key(), 1))
            .await?;
        let Some((member, score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let job: Job = serde_json::from_str(&member)?;

        let score_repr = score.to_string();
        self.run(
            "HSET",
            conn.hset_multiple::<_, _, _, ()>(
                self.settings.active_key(),
                &[("job", member.as_str()), ("score", score_repr.as_str())],
            ),
        )
        .await?;
        self.run(
            "SET PX",
            redis::cmd("SET")
                .arg(self.settings.lease_key())
                .arg(&job.job_id)
                .arg("PX")
                .arg(self.settings.lease.as_millis() as u64)
                .query_async::<_, ()>(&mut conn),
        )
        .await?;

        Ok(Some(job))
    }

    async fn renew_lease(&self, job_id: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;

        let holder: Option<String> = self
            .run("GET", conn.get(self.settings.lease_key()))
            .await?;
        if holder.as_deref() != Some(job_id) {
            return Ok(false);
        }

        self.run(
            "PEXPIRE",
            conn.pexpire(
                self.settings.lease_key(),
                self.settings.lease.as_millis() as usize,
            ),
        )
        .await
    }

    async fn schedule_retry(&self, job: Job, delay: Duration) -> StoreResult<()> {
        let payload = serde_json::to_string(&job)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.zadd(self.settings.delayed_key(), payload, due_ms)
            .ignore()
            .del(vec![self.settings.active_key(), self.settings.lease_key()])
            .ignore();
        self.run("retry pipeline", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn complete_job(&self, job: &Job) -> StoreResult<()> {
        self.finish_job(job, JobOutcome::Completed).await
    }

    async fn fail_job(&self, job: &Job) -> StoreResult<()> {
        self.finish_job(job, JobOutcome::Failed).await
    }

    async fn create_batch(&self, batch: &Batch) -> StoreResult<()> {
        let key = self.settings.batch_key(&batch.batch_id);
        let created_at = batch.created_at.to_rfc3339();
        let total = batch.total.to_string();
        let completed = batch.completed.to_string();
        let failed = batch.failed.to_string();
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.hset_multiple(
            &key,
            &[
                ("batch_id", batch.batch_id.as_str()),
                ("tool", batch.tool.as_str()),
                ("created_at", created_at.as_str()),
                ("total", total.as_str()),
                ("completed", completed.as_str()),
                ("failed", failed.as_str()),
            ],
        )
        .ignore()
        .expire(&key, self.settings.batch_ttl.as_secs() as usize)
        .ignore();

        self.run("batch pipeline", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<Batch>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = self
            .run("HGETALL", conn.hgetall(self.settings.batch_key(batch_id)))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let created_at = fields
            .get("created_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(StoreError::CorruptRecord { field: "created_at" })?;

        let read_counter = |field: &'static str| -> StoreResult<u64> {
            fields
                .get(field)
                .and_then(|raw| raw.parse().ok())
                .ok_or(StoreError::CorruptRecord { field })
        };

        Ok(Some(Batch {
            batch_id: batch_id.to_owned(),
            tool: fields.get("tool").cloned().unwrap_or_default(),
            created_at,
            total: read_counter("total")?,
            completed: read_counter("completed")?,
            failed: read_counter("failed")?,
        }))
    }

    async fn record_outcome(&self, batch_id: &str, outcome: JobOutcome) -> StoreResult<()> {
        let field = outcome.as_str();
        let mut conn = self.connection().await?;
        self.run(
            "HINCRBY",
            conn.hincr(self.settings.batch_key(batch_id), field, 1u64),
        )
        .await
    }

    async fn write_result(&self, record: &ResultRecord) -> StoreResult<()> {
        let key = self
            .settings
            .result_key(&record.job_id, record.batch_id.as_deref());
        let payload = serde_json::to_string(record)?;
        let mut conn = self.connection().await?;

        self.run(
            "SETEX",
            conn.set_ex(key, payload, self.settings.result_ttl.as_secs() as usize),
        )
        .await
    }

    async fn results_for_batch(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ResultRecord>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = self
            .run(
                "KEYS",
                conn.keys(self.settings.result_scan_pattern(batch_id)),
            )
            .await?;

        let mut records = Vec::with_capacity(keys.len().min(limit));
        for key in keys.into_iter().take(limit) {
            let payload: Option<String> = self.run("GET", conn.get(&key)).await?;
            if let Some(payload) = payload {
                records.push(serde_json::from_str(&payload)?);
            }
        }
        records.sort_by(|a: &ResultRecord, b: &ResultRecord| a.stored_at.cmp(&b.stored_at));

        Ok(records)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let mut conn = self.connection().await?;

        let waiting: u64 = self
            .run("ZCARD", conn.zcard(self.settings.queue_key()))
            .await?;
        let delayed: u64 = self
            .run("ZCARD", conn.zcard(self.settings.delayed_key()))
            .await?;
        let active: bool = self
            .run("EXISTS", conn.exists(self.settings.active_key()))
            .await?;
        let completed_retained: u64 = self
            .run(
                "LLEN",
                conn.llen(self.settings.retained_key(JobOutcome::Completed)),
            )
            .await?;
        let failed_retained: u64 = self
            .run(
                "LLEN",
                conn.llen(self.settings.retained_key(JobOutcome::Failed)),
            )
            .await?;

        Ok(QueueStats {
            waiting,
            active: u64::from(active),
            delayed,
            completed_retained,
            failed_retained,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        self.run(
            "PING",
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await?;
        Ok(())
    }
}
