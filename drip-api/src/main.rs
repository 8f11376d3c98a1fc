//! HTTP ingress: validates submissions and enqueues them for the drip
//! worker, and serves progress, stats, and health reads.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use drip_common::metrics::setup_metrics_routes;
use drip_common::registry::default_registry;
use drip_common::store::{JobStore, RedisStore, StoreSettings};

use config::Config;
use guard::SourceLimiter;
use handlers::{AppState, IngressSettings};

mod config;
mod errors;
mod guard;
mod handlers;

async fn listen(app: axum::Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).expect("LOG_LEVEL is not a valid filter"),
        )
        .init();

    let settings = StoreSettings {
        key_prefix: config.key_prefix.clone(),
        batch_ttl: Duration::from_secs(config.batch_ttl_seconds),
        ..StoreSettings::default()
    };
    let store: Arc<dyn JobStore> = Arc::new(
        RedisStore::new(&config.store_url, settings).expect("failed to initialize job store"),
    );

    let rate_limit = NonZeroU32::new(config.rate_limit_per_minute.max(1))
        .expect("rate limit must be non-zero");
    let state = AppState {
        store,
        registry: default_registry(),
        settings: Arc::new(IngressSettings {
            webhook_secret: config.webhook_secret.clone(),
            max_batch_size: config.max_batch_size,
            max_job_attempts: config.max_job_attempts,
            drip_interval: config.drip_interval.0,
        }),
        limiter: SourceLimiter::new(rate_limit),
    };

    let app = handlers::router(state);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start drip-api http server, {}", e),
    }
}

/// Resolve on SIGTERM or ctrl-c so in-flight requests drain before exit.
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
