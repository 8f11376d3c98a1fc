//! Submission handlers: validate, assign identifiers, enqueue.
//!
//! Ingress checks the tool and the envelope only; per-record parameters are
//! validated lazily by the worker so one bad record fails alone instead of
//! rejecting its whole batch.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use url::Url;

use drip_common::ids;
use drip_common::job::{Batch, Job, JobParams, MAX_PRIORITY, MIN_PRIORITY};

use crate::errors::ApiError;
use crate::handlers::AppState;

/// The body of a request enqueueing a batch of jobs.
#[derive(Deserialize, Debug)]
pub struct BatchRequestBody {
    tool: String,
    records: Vec<BatchRecord>,
    callback_url: Option<String>,
    priority: Option<u8>,
}

/// One record: an optional caller correlation key, everything else is the
/// tool's params object.
#[derive(Deserialize, Debug)]
pub struct BatchRecord {
    row_id: Option<String>,
    #[serde(flatten)]
    params: JobParams,
}

#[derive(Serialize)]
pub struct BatchResponse {
    success: bool,
    batch_id: String,
    jobs_queued: usize,
    estimated_completion_seconds: u64,
    status_url: String,
}

pub async fn batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchRequestBody>,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    check_tool(&state, &payload.tool)?;
    let priority = check_priority(payload.priority)?;
    let callback_url = check_callback_url(payload.callback_url)?;

    if payload.records.is_empty() {
        return Err(ApiError::Validation(
            "records must contain at least one entry".to_owned(),
        ));
    }
    let cap = state.settings.max_batch_size;
    if payload.records.len() > cap {
        return Err(ApiError::Validation(format!(
            "records exceeds the maximum batch size of {cap}"
        )));
    }

    let batch_id = ids::batch_id();
    let jobs: Vec<Job> = payload
        .records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let row_id = record
                .row_id
                .filter(|row_id| !row_id.is_empty())
                .unwrap_or_else(|| format!("{batch_id}_{index}"));
            let mut job = Job::new(
                ids::job_id(),
                payload.tool.clone(),
                record.params,
                row_id,
                priority,
                state.settings.max_job_attempts,
            );
            job.batch_id = Some(batch_id.clone());
            job.callback_url = callback_url.clone();
            job
        })
        .collect();

    let batch = Batch::new(batch_id.clone(), payload.tool.clone(), jobs.len() as u64);
    state.store.create_batch(&batch).await?;
    let jobs_queued = state.store.push_bulk(jobs).await?;

    metrics::counter!("ingress_jobs_enqueued_total").increment(jobs_queued as u64);
    tracing::info!(
        batch_id = %batch_id,
        tool = %payload.tool,
        jobs_queued,
        "batch accepted"
    );

    let response = BatchResponse {
        success: true,
        batch_id: batch_id.clone(),
        jobs_queued,
        estimated_completion_seconds: estimate_seconds(&state, jobs_queued as u64),
        status_url: format!("/api/status/{batch_id}"),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// The body of a request enqueueing a single job.
#[derive(Deserialize, Debug)]
pub struct SingleRequestBody {
    tool: String,
    params: JobParams,
    row_id: Option<String>,
    callback_url: Option<String>,
    priority: Option<u8>,
}

#[derive(Serialize)]
pub struct SingleResponse {
    success: bool,
    job_id: String,
    row_id: String,
    position: u64,
    estimated_wait_seconds: u64,
}

pub async fn single(
    State(state): State<AppState>,
    Json(payload): Json<SingleRequestBody>,
) -> Result<(StatusCode, Json<SingleResponse>), ApiError> {
    check_tool(&state, &payload.tool)?;
    let priority = check_priority(payload.priority)?;
    let callback_url = check_callback_url(payload.callback_url)?;

    let row_id = payload
        .row_id
        .filter(|row_id| !row_id.is_empty())
        .unwrap_or_else(ids::single_row_id);

    let mut job = Job::new(
        ids::job_id(),
        payload.tool,
        payload.params,
        row_id.clone(),
        priority,
        state.settings.max_job_attempts,
    );
    job.callback_url = callback_url;
    let job_id = job.job_id.clone();

    // Everything already queued or in flight runs before this job.
    let stats = state.store.stats().await?;
    let position = stats.waiting + stats.active + 1;

    state.store.push(job).await?;
    metrics::counter!("ingress_jobs_enqueued_total").increment(1);

    let response = SingleResponse {
        success: true,
        job_id,
        row_id,
        position,
        estimated_wait_seconds: estimate_seconds(&state, position),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

fn check_tool(state: &AppState, tool: &str) -> Result<(), ApiError> {
    if state.registry.lookup(tool).is_none() {
        return Err(ApiError::UnknownTool {
            tool: tool.to_owned(),
            available: state.registry.tools(),
        });
    }
    Ok(())
}

fn check_priority(priority: Option<u8>) -> Result<u8, ApiError> {
    let priority = priority.unwrap_or(drip_common::job::DEFAULT_PRIORITY);
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(ApiError::Validation(format!(
            "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
        )));
    }
    Ok(priority)
}

fn check_callback_url(callback_url: Option<String>) -> Result<Option<String>, ApiError> {
    let Some(callback_url) = callback_url else {
        return Ok(None);
    };

    let parsed = Url::parse(&callback_url)
        .map_err(|_| ApiError::Validation("callback_url is not an absolute URL".to_owned()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::Validation(
            "callback_url must use http or https".to_owned(),
        ));
    }

    Ok(Some(callback_url))
}

/// ceil(jobs * drip interval), in whole seconds.
fn estimate_seconds(state: &AppState, jobs: u64) -> u64 {
    let drip_ms = state.settings.drip_interval.as_millis() as u64;
    (jobs * drip_ms).div_ceil(1000)
}
