//! Ingress guards: shared-secret check and a coarse per-source rate limit.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_client_ip::InsecureClientIp;
use governor::{clock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};

use crate::errors::ApiError;
use crate::handlers::AppState;

pub const SECRET_HEADER: &str = "x-webhook-secret";

/// Keyed limiter guarding the ingress itself, one bucket per source IP.
// See: https://docs.rs/governor/latest/governor/_guide/index.html#usage-in-multiple-threads
#[derive(Clone)]
pub struct SourceLimiter {
    limiter: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, clock::DefaultClock>>,
}

impl SourceLimiter {
    pub fn new(per_minute: NonZeroU32) -> Self {
        let quota = Quota::per_minute(per_minute);
        let limiter = Arc::new(RateLimiter::dashmap(quota));

        SourceLimiter { limiter }
    }

    pub fn is_limited(&self, key: &String) -> bool {
        self.limiter.check_key(key).is_err()
    }
}

/// Reject requests whose x-webhook-secret header is absent (401) or does
/// not match the configured secret (403).
pub async fn require_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match request.headers().get(SECRET_HEADER) {
        None => ApiError::MissingSecret.into_response(),
        Some(provided) if provided.as_bytes() == state.settings.webhook_secret.as_bytes() => {
            next.run(request).await
        }
        Some(_) => ApiError::InvalidSecret.into_response(),
    }
}

/// Coarse per-source limit; submissions throttle themselves long before
/// the drip worker ever would.
pub async fn rate_limit(
    State(state): State<AppState>,
    InsecureClientIp(ip): InsecureClientIp,
    request: Request,
    next: Next,
) -> Response {
    let key = ip.to_string();
    if state.limiter.is_limited(&key) {
        metrics::counter!("ingress_rate_limited_total").increment(1);
        return ApiError::RateLimited.into_response();
    }

    next.run(request).await
}
