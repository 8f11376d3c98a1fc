//! Prometheus wiring shared by the ingress and the worker: a recorder, a
//! `/metrics` route, per-route request accounting, and queue depth gauges
//! fed from the job store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::store::JobStore;

/// Serve an operational router (liveness, prometheus) on its own port,
/// next to whichever loop the binary actually runs.
pub async fn serve_ops(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("ops server listening on {}", bind);

    axum::serve(listener, router).await
}

/// Install the prometheus recorder and expose it under `/metrics` on the
/// given router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(record_http_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Job processing is dominated by one downstream HTTP call, so the
    // buckets stretch well past the default drip interval.
    const BUCKET_SECONDS: &[f64] = &[
        0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKET_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Count and time every request, labelled by the matched route template so
/// `/api/status/:batch_id` aggregates as one series.
async fn record_http_metrics(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let started = Instant::now();
    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("gateway_http_requests_total", &labels).increment(1);
    metrics::histogram!("gateway_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}

/// Report queue depth gauges on an interval. Spawn as a separate task; runs
/// until the process exits.
pub async fn report_queue_depth(store: Arc<dyn JobStore>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match store.stats().await {
            Ok(stats) => {
                metrics::gauge!("queue_jobs_waiting").set(stats.waiting as f64);
                metrics::gauge!("queue_jobs_active").set(stats.active as f64);
                metrics::gauge!("queue_jobs_delayed").set(stats.delayed as f64);
            }
            Err(e) => {
                tracing::warn!("failed to read queue stats for metrics: {}", e);
            }
        }
    }
}
