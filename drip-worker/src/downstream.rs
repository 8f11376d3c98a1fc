//! Client for the downstream API that jobs are shaped onto.
//!
//! Retries here are internal to a single job execution: they cover
//! transient transport faults and 429/5xx responses, and do not consume the
//! job's scheduler-level attempt budget.

use std::time;

use drip_common::job::JobParams;
use drip_common::registry::ToolEntry;
use drip_common::retry::RetryPolicy;
use reqwest::header;
use serde_json::Value;
use tracing::debug;

use crate::error::DownstreamError;

pub struct DownstreamClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_policy: RetryPolicy,
}

impl DownstreamClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        request_timeout: time::Duration,
        max_retries: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        let mut bearer = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .expect("downstream api key is not a valid header value");
        bearer.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("dripgate/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for downstream calls");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            max_retries: max_retries.max(1),
            retry_policy,
        }
    }

    /// Issue one tool invocation, retrying transient faults internally.
    /// Returns the decoded 2xx response body.
    pub async fn call(
        &self,
        entry: &ToolEntry,
        params: &JobParams,
    ) -> Result<Value, DownstreamError> {
        let url = format!("{}{}", self.base_url, entry.endpoint_path);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&url, entry, params, attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_policy.time_until_next_retry(attempt);
                    debug!(
                        endpoint = entry.endpoint_path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "downstream attempt failed, backing off: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        entry: &ToolEntry,
        params: &JobParams,
        attempt: u32,
    ) -> Result<Value, DownstreamError> {
        let method: http::Method = entry.method.into();

        let response = self
            .client
            .request(method, url)
            .json(params)
            .send()
            .await
            .map_err(|error| DownstreamError::Transport {
                endpoint: entry.endpoint_path.to_owned(),
                attempts: attempt,
                message: error.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|error| DownstreamError::Decode {
                    endpoint: entry.endpoint_path.to_owned(),
                    message: error.to_string(),
                });
        }

        let message = status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_owned();
        let body = response.text().await.ok().filter(|text| !text.is_empty());

        Err(DownstreamError::UpstreamStatus {
            endpoint: entry.endpoint_path.to_owned(),
            status: status.as_u16(),
            message,
            body,
        })
    }
}
