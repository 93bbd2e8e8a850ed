// src/main.rs
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskbus::config::{self, CONFIG_FILE_NAME};
use taskbus::rabbitmq::{RabbitChannel, ShutdownCoordinator};
use taskbus::worker;

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Raises the shutdown signal on SIGINT or SIGTERM.
async fn watch_signals(shutdown: ShutdownCoordinator) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.raised() => return,
    }
    shutdown.signal();
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("init-config") {
        init_tracing(false);
        let path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        return config::create_default_config_file(&path);
    }

    let (config, source) = config::load_config().context("Failed to load configuration")?;
    init_tracing(config.debug);
    info!("Configuration loaded from {}", source);

    let shutdown = ShutdownCoordinator::new();
    let channel = RabbitChannel::connect_rabbitmq(&config.rabbitmq, shutdown.clone())
        .await
        .context("Failed to connect to RabbitMQ")?;

    if let Err(e) = worker::start(&channel, &config.worker).await {
        shutdown.signal();
        let _ = channel.close().await;
        return Err(e).context("Failed to start the worker");
    }

    tokio::spawn(watch_signals(shutdown.clone()));

    let outcome = shutdown.wait().await;
    if let Err(e) = channel.close().await {
        error!("Failed to close the RabbitMQ channel: {}", e);
    }

    match outcome {
        Ok(()) => {
            info!("Worker stopped");
            Ok(())
        }
        Err(e) => {
            error!("Worker stopped on a fatal error: {}", e);
            Err(e.into())
        }
    }
}
