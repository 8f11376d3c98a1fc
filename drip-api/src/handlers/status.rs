//! Read-side handlers: batch progress, tool listing, queue stats, health.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use drip_common::job::ResultRecord;
use drip_common::store::QueueStats;

use crate::errors::ApiError;
use crate::handlers::AppState;

const DEFAULT_RESULTS_LIMIT: usize = 100;

#[derive(Deserialize)]
pub struct StatusQuery {
    results: Option<bool>,
    limit: Option<usize>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    success: bool,
    batch_id: String,
    tool: String,
    created_at: DateTime<Utc>,
    total: u64,
    completed: u64,
    failed: u64,
    pending: u64,
    done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<ResultRecord>>,
}

pub async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let batch = state
        .store
        .get_batch(&batch_id)
        .await?
        .ok_or_else(|| ApiError::BatchNotFound(batch_id.clone()))?;

    let results = if query.results.unwrap_or(false) {
        let limit = query.limit.unwrap_or(DEFAULT_RESULTS_LIMIT);
        Some(state.store.results_for_batch(&batch_id, limit).await?)
    } else {
        None
    };

    Ok(Json(StatusResponse {
        success: true,
        batch_id: batch.batch_id.clone(),
        tool: batch.tool.clone(),
        created_at: batch.created_at,
        total: batch.total,
        completed: batch.completed,
        failed: batch.failed,
        pending: batch.pending(),
        done: batch.is_done(),
        results,
    }))
}

#[derive(Serialize)]
pub struct ToolsResponse {
    tools: Vec<&'static str>,
    by_category: BTreeMap<&'static str, Vec<&'static str>>,
    total: usize,
}

pub async fn tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.registry.tools(),
        by_category: state.registry.by_category(),
        total: state.registry.len(),
    })
}

#[derive(Serialize)]
pub struct StatsResponse {
    queue: QueueStats,
    config: StatsConfig,
    estimated_drain_time_seconds: u64,
}

#[derive(Serialize)]
pub struct StatsConfig {
    drip_interval_ms: u64,
    max_batch_size: usize,
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let queue = state.store.stats().await?;
    let drip_ms = state.settings.drip_interval.as_millis() as u64;

    Ok(Json(StatsResponse {
        queue,
        config: StatsConfig {
            drip_interval_ms: drip_ms,
            max_batch_size: state.settings.max_batch_size,
        },
        estimated_drain_time_seconds: (queue.backlog() * drip_ms).div_ceil(1000),
    }))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            tracing::warn!("health check failed to reach the store: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable"})),
            )
        }
    }
}
