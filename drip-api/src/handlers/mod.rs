use std::sync::Arc;
use std::time;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use drip_common::registry::ToolRegistry;
use drip_common::store::JobStore;

use crate::guard::{self, SourceLimiter};

mod status;
mod submit;

/// Ingress knobs fixed at startup.
pub struct IngressSettings {
    pub webhook_secret: String,
    pub max_batch_size: usize,
    pub max_job_attempts: u32,
    /// The worker's pace, used here only for wait estimates.
    pub drip_interval: time::Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub registry: &'static ToolRegistry,
    pub settings: Arc<IngressSettings>,
    pub limiter: SourceLimiter,
}

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/api/batch", post(submit::batch))
        .route("/api/single", post(submit::single))
        .route("/api/status/:batch_id", get(status::batch_status))
        .route("/api/tools", get(status::tools))
        .route("/api/stats", get(status::stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guard::require_secret,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guard::rate_limit,
        ));

    Router::new()
        .route("/api/health", get(status::health))
        .merge(guarded)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
