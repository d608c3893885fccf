use faces_mesh::admin::AdminService;
use faces_mesh::config::FacesConfig;
use faces_mesh::error::Result;
use faces_mesh::listener::Listener;
use faces_mesh::ratelimit::RateLimiter;
use faces_mesh::service::FacesService;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match FacesConfig::from_env_validated() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(config.debug_enabled);

    info!("Starting faces {} service", config.service);

    if let Err(e) = run(config).await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `DEBUG_ENABLED` picks between info and debug.
fn init_tracing(debug_enabled: bool) {
    let default_filter = if debug_enabled { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

async fn run(config: FacesConfig) -> Result<()> {
    info!(
        "config: service={}, listen={}, admin={}, error_fraction={}, latch_fraction={}, delays={:?}, max_rate={}, timeout={}ms",
        config.service,
        config.listen_addr,
        config.metrics_addr,
        config.error_fraction,
        config.latch_fraction,
        config.delay_buckets,
        config.max_rate,
        config.request_timeout.as_millis()
    );

    let limiter = RateLimiter::from_max_rate(config.max_rate).map(Arc::new);
    let ticker = limiter.clone().map(RateLimiter::spawn_ticker);

    let service = FacesService::from_config(&config, limiter)?;

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let faces_listener = Listener::bind(&config.listen_addr, service).await?;
    let faces_addr = faces_listener.local_addr();
    info!("{} listening on {}", config.service, faces_addr);

    let admin_listener = Listener::bind(&config.metrics_addr, AdminService::new()).await?;
    let admin_addr = admin_listener.local_addr();
    info!("admin endpoints on {} (/health, /metrics)", admin_addr);

    let mut faces_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = faces_listener.serve(shutdown_rx).await {
                error!("faces listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut faces_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut faces_task => {
            faces_finished = true;
            match res {
                Ok(()) => info!("faces task completed"),
                Err(err) => error!("faces task join error: {}", err),
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            match res {
                Ok(()) => info!("admin task completed"),
                Err(err) => error!("admin task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    if let Some(ticker) = ticker {
        ticker.abort();
    }

    if !faces_finished {
        match faces_task.await {
            Ok(()) => info!("faces task completed"),
            Err(err) => error!("faces task join error: {}", err),
        }
    }

    if !admin_finished {
        match admin_task.await {
            Ok(()) => info!("admin task completed"),
            Err(err) => error!("admin task join error: {}", err),
        }
    }

    info!("shutdown complete");
    Ok(())
}
