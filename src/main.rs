//! realtime-link - command-line realtime pub/sub client
//!
//! Connects to the service, attaches the configured channels, logs what
//! arrives on them and publishes stdin lines to the first one.

use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use realtime_link::config::{env::get_config_path, load_and_validate};
use realtime_link::protocol::Message;
use realtime_link::{Channel, Realtime};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("realtime-link v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    if let Some(env) = config.realtime.environment() {
        info!("  Environment: {}", env);
    }
    if let Some(host) = config.realtime.realtime_host.as_deref() {
        info!("  Host: {}", host);
    }
    info!("  Channels: {}", config.channels.join(", "));

    let mut options = config.realtime.clone();
    // Channels are attached below, once the state logger is in place.
    let auto_connect = options.auto_connect;
    options.auto_connect = false;
    let client = Realtime::new(options)?;

    // Task 1: connection state logger
    let state_logger = {
        let mut changes = client.connection().on_state_change();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => match (change.reason, change.retry_in) {
                        (Some(reason), Some(retry_in)) => warn!(
                            "Connection {}: {} (retry in {:.1}s)",
                            change.current,
                            reason,
                            retry_in.as_secs_f64()
                        ),
                        (Some(reason), None) => info!("Connection {}: {}", change.current, reason),
                        (None, _) => info!("Connection {}", change.current),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("State logger lagged by {} changes", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    if auto_connect {
        client.connect()?;
    }

    // Task 2..n: one subscriber per channel
    let mut channels = Vec::new();
    for name in &config.channels {
        let channel = client.channel(name);
        spawn_subscriber(&channel);
        let attaching = channel.clone();
        tokio::spawn(async move {
            match attaching.attach_and_wait(Duration::from_secs(30)).await {
                Ok(()) => info!("Attached to {}", attaching.name()),
                Err(e) => warn!("Attach to {} failed: {}", attaching.name(), e),
            }
        });
        channels.push(channel);
    }

    // Task n+1: stdin publisher
    let publisher = channels.first().cloned().map(|channel| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => publish_line(&channel, line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            info!("stdin closed; no longer publishing");
        })
    });

    shutdown_signal().await;
    info!("Shutdown signal received - closing connection...");

    if let Some(publisher) = publisher {
        publisher.abort();
    }
    match client.connection().close_and_wait(Duration::from_secs(5)).await {
        Ok(state) => info!("Connection {}", state),
        Err(e) => warn!("Close did not complete: {}", e),
    }
    client.shutdown().await;
    state_logger.abort();

    info!("Exiting...");
    Ok(())
}

fn spawn_subscriber(channel: &Channel) {
    let name = channel.name().to_string();
    let mut messages = channel.subscribe();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => info!(
                    "[{}] {}: {}",
                    name,
                    message.name.as_deref().unwrap_or("-"),
                    message.data.unwrap_or(serde_json::Value::Null)
                ),
                Err(RecvError::Lagged(skipped)) => warn!("[{}] missed {} messages", name, skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn publish_line(channel: &Channel, line: String) {
    let message = Message::new("line", Value::String(line));
    match channel.publish(vec![message]).await {
        Ok(()) => debug!("Published to {}", channel.name()),
        Err(e) => warn!("Publish to {} failed: {}", channel.name(), e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
