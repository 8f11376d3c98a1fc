//! Liveness reporting for the worker loop.
//!
//! The scheduler is a single cooperative loop; if it stops beating (a hung
//! store call, a deadlock) the process should fail its liveness probe so a
//! supervisor restarts it. The loop reports a heartbeat every time it
//! passes a suspension point, and the probe turns unhealthy once no beat
//! has arrived within the deadline.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Clone)]
pub struct Liveness {
    deadline: Duration,
    last_beat: Arc<RwLock<Instant>>,
}

impl Liveness {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            last_beat: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Record that the loop is still making progress. Must be called more
    /// frequently than the configured deadline.
    pub fn beat(&self) {
        let mut last_beat = self.last_beat.write().expect("liveness lock poisoned");
        *last_beat = Instant::now();
    }

    pub fn healthy(&self) -> bool {
        let last_beat = self.last_beat.read().expect("liveness lock poisoned");
        last_beat.elapsed() <= self.deadline
    }

    pub fn status(&self) -> LivenessStatus {
        LivenessStatus {
            healthy: self.healthy(),
        }
    }
}

#[derive(Debug)]
pub struct LivenessStatus {
    pub healthy: bool,
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        match self.healthy {
            true => (StatusCode::OK, "ok"),
            false => (StatusCode::SERVICE_UNAVAILABLE, "stalled"),
        }
        .into_response()
    }
}
