//! Per-job result fan-out to caller-supplied callback URLs.
//!
//! Delivery runs on its own retry schedule, concurrently with the next
//! drip tick, and its outcome never changes the job's terminal status.

use std::time;

use chrono::{DateTime, Utc};
use drip_common::job::{Job, JobOutcome, ResultRecord};
use drip_common::retry::RetryPolicy;
use reqwest::header;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub const CALLBACK_USER_AGENT: &str = concat!("dripgate/", env!("CARGO_PKG_VERSION"));

/// The JSON document POSTed to a callback receiver. `job_id` doubles as an
/// idempotency key: delivery is at-least-once across worker restarts.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CallbackPayload {
    pub job_id: String,
    pub row_id: String,
    pub batch_id: Option<String>,
    pub tool: String,
    pub status: JobOutcome,
    pub processed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl CallbackPayload {
    pub fn from_result(job: &Job, record: &ResultRecord) -> Self {
        Self {
            job_id: job.job_id.clone(),
            row_id: job.row_id.clone(),
            batch_id: job.batch_id.clone(),
            tool: job.tool.clone(),
            status: record.status,
            processed_at: record.finished_at,
            data: record.data.clone(),
            error: record.error.clone(),
            attempts: match record.status {
                JobOutcome::Completed => None,
                JobOutcome::Failed => Some(record.attempts),
            },
        }
    }
}

/// What happened to one delivery, reported back to the worker for logs and
/// metrics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub success: bool,
    pub skipped: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

impl CallbackOutcome {
    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            attempts: 0,
            error: None,
        }
    }
}

enum DeliveryError {
    Retryable(String),
    Fatal(String),
}

impl DeliveryError {
    fn message(self) -> String {
        match self {
            DeliveryError::Retryable(message) | DeliveryError::Fatal(message) => message,
        }
    }
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_policy: RetryPolicy,
}

impl CallbackDispatcher {
    pub fn new(
        request_timeout: time::Duration,
        max_retries: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(CALLBACK_USER_AGENT)
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for callback dispatch");

        Self {
            client,
            max_retries: max_retries.max(1),
            retry_policy,
        }
    }

    /// Deliver `payload` to `url`, retrying transient failures. A job with
    /// no callback URL is a successful no-op.
    pub async fn dispatch(&self, url: Option<&str>, payload: &CallbackPayload) -> CallbackOutcome {
        let Some(url) = url else {
            return CallbackOutcome::skipped();
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(url, payload, attempt).await {
                Ok(()) => {
                    return CallbackOutcome {
                        success: true,
                        skipped: false,
                        attempts: attempt,
                        error: None,
                    }
                }
                Err(DeliveryError::Retryable(message)) if attempt < self.max_retries => {
                    let delay = self.retry_policy.time_until_next_retry(attempt);
                    debug!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "callback delivery failed, backing off: {}",
                        message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return CallbackOutcome {
                        success: false,
                        skipped: false,
                        attempts: attempt,
                        error: Some(error.message()),
                    }
                }
            }
        }
    }

    async fn post_once(
        &self,
        url: &str,
        payload: &CallbackPayload,
        attempt: u32,
    ) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .header("x-attempt", attempt)
            .json(payload)
            .send()
            .await
            .map_err(|error| DeliveryError::Retryable(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = format!("callback receiver returned {}", status.as_u16());
        if status.as_u16() == 429 || status.is_server_error() {
            Err(DeliveryError::Retryable(message))
        } else {
            Err(DeliveryError::Fatal(message))
        }
    }
}
