//! Data model for queued work: jobs, batch accounting, and result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Schema-less parameters forwarded verbatim as the downstream request body.
pub type JobParams = Map<String, Value>;

/// A single unit of downstream work.
///
/// Created by the ingress, mutated only by the worker that holds its lease,
/// and removed by the store's retention policy once terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// A unique, server-assigned identifier.
    pub job_id: String,
    /// Name of a tool present in the registry.
    pub tool: String,
    /// Arbitrary JSON parameters, validated lazily against the registry.
    pub params: JobParams,
    /// Caller correlation key, server-generated when absent.
    pub row_id: String,
    /// Group key for jobs submitted together. None for singleton submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Absolute URL to deliver this job's result to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// 1 (highest) to 10 (lowest).
    pub priority: u8,
    /// Number of executions the scheduler has finished for this job.
    pub attempts_made: u32,
    /// Scheduler-level attempt budget.
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: String,
        tool: String,
        params: JobParams,
        row_id: String,
        priority: u8,
        max_attempts: u32,
    ) -> Self {
        Self {
            job_id,
            tool,
            params,
            row_id,
            batch_id: None,
            callback_url: None,
            priority,
            attempts_made: 0,
            max_attempts,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether another scheduler-level attempt remains after `attempts_made`.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// Aggregate accounting for a group of jobs submitted together.
///
/// Counters only ever grow, and `completed + failed == total` is the
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub batch_id: String,
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl Batch {
    pub fn new(batch_id: String, tool: String, total: u64) -> Self {
        Self {
            batch_id,
            tool,
            created_at: Utc::now(),
            total,
            completed: 0,
            failed: 0,
        }
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.completed + self.failed)
    }

    pub fn is_done(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// Terminal outcome of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
        }
    }
}

/// Written exactly once per job on terminal outcome, before any callback
/// attempt for that job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub job_id: String,
    pub row_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: JobOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Executions consumed by the time the job went terminal.
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn completed(job: &Job, data: Value) -> Self {
        Self {
            job_id: job.job_id.clone(),
            row_id: job.row_id.clone(),
            tool: job.tool.clone(),
            batch_id: job.batch_id.clone(),
            status: JobOutcome::Completed,
            data: Some(data),
            error: None,
            attempts: job.attempts_made,
            finished_at: job.finished_at.unwrap_or_else(Utc::now),
            stored_at: Utc::now(),
        }
    }

    pub fn failed(job: &Job, error: String) -> Self {
        Self {
            job_id: job.job_id.clone(),
            row_id: job.row_id.clone(),
            tool: job.tool.clone(),
            batch_id: job.batch_id.clone(),
            status: JobOutcome::Failed,
            data: None,
            error: Some(error),
            attempts: job.attempts_made,
            finished_at: job.finished_at.unwrap_or_else(Utc::now),
            stored_at: Utc::now(),
        }
    }
}
