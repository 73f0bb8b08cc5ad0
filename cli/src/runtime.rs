// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-level wiring shared by the long-running commands: logging,
//! the Prometheus listener, signal handling and the event log.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cohort_dlm_core::domain::events::{LockEvent, NamespaceEvent, PoolEvent};
use cohort_dlm_core::infrastructure::event_bus::{DlmEvent, EventBus, EventBusError};

/// Initialize tracing subscriber for logging
pub fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}

/// Serve `/metrics` on `0.0.0.0:port`.
pub fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics listener on {}", addr))?;
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Mirror bus events into the log until `shutdown`.
pub fn spawn_event_logger(bus: Arc<EventBus>, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => log_event(&event),
                Err(EventBusError::Lagged(n)) => warn!(skipped = n, "Event logger lagged"),
                Err(_) => break,
            }
        }
    })
}

fn log_event(event: &DlmEvent) {
    match event {
        DlmEvent::Lock(LockEvent::DeadlockDetected {
            namespace,
            resource,
            requester,
            blocker,
            ..
        }) => warn!(
            namespace = %namespace,
            resource = %resource,
            requester = requester.pid,
            blocker = blocker.pid,
            "Deadlock refused"
        ),
        DlmEvent::Pool(PoolEvent::LruCancelled {
            namespace,
            cancelled,
            remaining,
            ..
        }) => info!(namespace = %namespace, cancelled, remaining, "Idle locks cancelled"),
        DlmEvent::Namespace(NamespaceEvent::NamespaceCreated { namespace, side, .. }) => {
            info!(namespace = %namespace, side = %side, "Namespace online")
        }
        DlmEvent::Namespace(NamespaceEvent::NamespaceRemoved {
            namespace,
            locks_cancelled,
            ..
        }) => info!(namespace = %namespace, locks_cancelled, "Namespace removed"),
        other => {
            if let Ok(json) = serde_json::to_string(other) {
                debug!(namespace = %other.namespace(), event = %json, "DLM event");
            }
        }
    }
}
