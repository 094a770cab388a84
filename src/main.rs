use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use starrocks_operator::health::{DEFAULT_HEALTH_PORT, HealthState, run_health_server};
use starrocks_operator::run_controller_scoped;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("starrocks_operator=info".parse()?)
        .add_directive("kube=info".parse()?);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!("Starting starrocks-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Empty or unset watches every namespace
    let watch_namespace = std::env::var("WATCH_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty());
    let health_port = match std::env::var("HEALTH_PORT") {
        Ok(port) => port.parse().unwrap_or_else(|_| {
            warn!(value = %port, "Invalid HEALTH_PORT, using {}", DEFAULT_HEALTH_PORT);
            DEFAULT_HEALTH_PORT
        }),
        Err(_) => DEFAULT_HEALTH_PORT,
    };

    let health_state = Arc::new(HealthState::new());
    let cancel = CancellationToken::new();

    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, health_port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    info!("Watching StarRocksCluster resources (apiVersion: starrocks.com/v1)");
    let mut controller_handle = {
        let health_state = health_state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_controller_scoped(client, Some(health_state), cancel, watch_namespace.as_deref())
                .await;
        })
    };

    let shutdown_requested = tokio::select! {
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
            false
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
            false
        }
        _ = shutdown_signal() => true,
    };

    if shutdown_requested {
        info!("Received shutdown signal, initiating graceful shutdown...");

        // Mark as not ready to stop receiving new work
        health_state.set_ready(false).await;
        cancel.cancel();

        info!(
            "Waiting up to {}s for in-flight reconciliations to complete...",
            SHUTDOWN_GRACE_PERIOD_SECS
        );
        if tokio::time::timeout(
            Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
            controller_handle,
        )
        .await
        .is_err()
        {
            warn!("Grace period elapsed with reconciliations still running");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
