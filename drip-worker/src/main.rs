//! Consume job store entries to run rate-shaped downstream calls.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::error;
use tracing_subscriber::EnvFilter;

use drip_common::liveness::Liveness;
use drip_common::metrics::{report_queue_depth, serve_ops, setup_metrics_routes};
use drip_common::registry::default_registry;
use drip_common::retry::RetryPolicy;
use drip_common::store::{JobStore, RedisStore, StoreSettings};
use drip_worker::callback::CallbackDispatcher;
use drip_worker::config::Config;
use drip_worker::downstream::DownstreamClient;
use drip_worker::error::WorkerError;
use drip_worker::worker::DripWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env().expect("Invalid configuration:");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).expect("LOG_LEVEL is not a valid filter"),
        )
        .init();

    let settings = StoreSettings {
        key_prefix: config.key_prefix.clone(),
        lease: config.lease.0,
        result_ttl: Duration::from_secs(config.result_ttl_seconds),
        ..StoreSettings::default()
    };
    let store: Arc<dyn JobStore> = Arc::new(
        RedisStore::new(&config.store_url, settings).expect("failed to initialize job store"),
    );

    let downstream = DownstreamClient::new(
        &config.downstream_base_url,
        &config.downstream_api_key,
        config.downstream_timeout.0,
        config.downstream_max_retries,
        RetryPolicy::new(2, Duration::from_secs(1), Some(Duration::from_secs(30)), 0.1),
    );
    let callbacks = Arc::new(CallbackDispatcher::new(
        config.callback_timeout.0,
        config.callback_max_retries,
        RetryPolicy::new(
            2,
            config.callback_retry_delay.0,
            Some(Duration::from_secs(30)),
            0.2,
        ),
    ));

    // The loop beats at every poll; a minute without one means it is wedged.
    let liveness = Liveness::new(Duration::from_secs(60));

    let worker = DripWorker::new(
        store.clone(),
        default_registry(),
        downstream,
        callbacks,
        config.drip_interval.0,
        config.poll_interval.0,
        config.lease_renew.0,
        RetryPolicy::new(2, config.job_retry_base.0, None, 0.0),
        config.grace_period.0,
        liveness.clone(),
    );

    let probe = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(probe.status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve_ops(router, &bind).await {
            error!("failed to start the ops server: {}", e);
        }
    });
    tokio::task::spawn(report_queue_depth(store, Duration::from_secs(10)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::task::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send(true).ok();
    });

    worker.run(shutdown_rx).await
}

/// Resolve on SIGTERM or ctrl-c, whichever lands first.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub async fn index() -> &'static str {
    "dripgate worker"
}
