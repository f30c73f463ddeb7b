//! Arrakis Transport - Discord gateway pool process
//!
//! Runs one pool of gateway shards and:
//! - Publishes dispatched events to NATS JetStream when configured
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use arrakis_transport::events::{EventDispatcher, EventRouter, TracingDispatcher};
use arrakis_transport::health::{self, AppState};
use arrakis_transport::metrics::GatewayMetrics;
use arrakis_transport::nats::{ensure_streams, NatsDispatcher, NatsPublisher};
use arrakis_transport::{GatewayConfig, RequestExecutor, ShardManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_transport={}", gateway_config.log_level).parse()?)
                .add_directive("tokio_tungstenite=info".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_id = gateway_config.pool_id,
        total_shards = gateway_config.total_shards,
        intents = gateway_config.intents,
        "Starting Arrakis Transport"
    );

    let metrics = Arc::new(GatewayMetrics::install()?);
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = if let Some(ref url) = gateway_config.nats_url {
        match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                info!(%url, "Connected to NATS");
                if let Err(e) = ensure_streams(publisher.jetstream()).await {
                    warn!(error = %e, "Could not configure NATS streams");
                }
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let (sink, publisher_task): (Arc<dyn EventDispatcher>, _) = match &nats {
        Some(publisher) => {
            let (dispatcher, task) = NatsDispatcher::spawn(Arc::clone(publisher));
            (dispatcher as Arc<dyn EventDispatcher>, Some(task))
        }
        None => (Arc::new(TracingDispatcher) as Arc<dyn EventDispatcher>, None),
    };
    let router = Arc::new(EventRouter::new(sink));

    let rest = RequestExecutor::new(
        &gateway_config.http_config(),
        Default::default(),
        Arc::clone(&metrics),
    )?;
    match rest.get_me().await {
        Ok(Some(me)) => info!(user_id = %me["id"], username = %me["username"], "Authenticated"),
        Ok(None) => warn!("Empty response for current user"),
        Err(e) => warn!(error = %e, "Could not fetch current user"),
    }

    let pool = ShardManager::new(
        gateway_config.pool_id,
        gateway_config.total_shards,
        Arc::new(gateway_config.shard_config()),
        router,
        Arc::clone(&metrics),
    )?;

    let pool_state = pool.state();
    let shutdown = pool.shutdown_handle();
    info!(
        pool_id = gateway_config.pool_id,
        shard_count = pool_state.shard_count(),
        "Shard pool created"
    );

    // Start health server
    let app_state = AppState {
        shard_state: pool_state.clone(),
        nats: nats.clone(),
        limiter: rest.limiter().clone(),
        metrics: Arc::clone(&metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let mut pool_task = tokio::spawn(pool.run());
    let mut pool_finished = false;

    tokio::select! {
        result = &mut pool_task => {
            pool_finished = true;
            match result {
                Ok(Err(e)) => error!(error = %e, "Shard pool error"),
                Err(e) => error!(error = %e, "Shard pool task panicked"),
                Ok(Ok(())) => info!("All shards stopped"),
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gateway...");

    // closes every socket with a normal close before the process exits
    if !pool_finished && shutdown.send(()).is_ok() {
        if let Err(e) = pool_task.await {
            error!(error = %e, "Shard pool task failed during shutdown");
        }
    }

    if let Some(task) = publisher_task {
        task.abort();
    }
    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
