// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `cohortctl serve` - run a lock manager node until signalled.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cohort_dlm_core::domain::config::ClusterConfigManifest;
use cohort_dlm_core::infrastructure::event_bus::EventBus;
use cohort_dlm_core::infrastructure::request_worker::RequestWorkerPool;
use cohort_dlm_core::DlmService;

use crate::runtime::{install_metrics_exporter, shutdown_signal, spawn_event_logger};

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Serve Prometheus metrics on this port (overrides configuration)
    #[arg(long, env = "COHORT_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Do not start the metrics listener even if configured
    #[arg(long)]
    pub no_metrics: bool,

    /// Seconds between namespace statistics log lines (0 disables)
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,
}

pub async fn run(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let manifest = ClusterConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    manifest
        .validate()
        .context("Configuration validation failed")?;

    info!(
        node = %manifest.spec.node.id,
        namespaces = manifest.spec.namespaces.len(),
        "Configuration loaded"
    );

    if let Some(port) = metrics_port(&args, &manifest) {
        install_metrics_exporter(port)?;
    }

    let events = Arc::new(EventBus::with_default_capacity());
    let service = DlmService::from_config(&manifest, events.clone())
        .context("Failed to create namespaces")?;

    let shutdown = CancellationToken::new();
    let logger = spawn_event_logger(events, shutdown.child_token());
    let workers = RequestWorkerPool::start(
        service.clone(),
        &manifest.spec.workers,
        shutdown.child_token(),
    );
    let stats = (args.stats_interval > 0).then(|| {
        spawn_stats_logger(
            service.clone(),
            Duration::from_secs(args.stats_interval),
            shutdown.child_token(),
        )
    });

    info!(node = %service.node_id(), "Cohort node ready");
    shutdown_signal().await;

    info!("Cohort node shutting down");
    shutdown.cancel();
    workers.join().await;
    service.shutdown().await;
    for task in std::iter::once(logger).chain(stats) {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    Ok(())
}

fn metrics_port(args: &ServeArgs, manifest: &ClusterConfigManifest) -> Option<u16> {
    if args.no_metrics {
        return None;
    }
    if args.metrics_port.is_some() {
        return args.metrics_port;
    }
    manifest
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
        .map(|m| m.port)
}

fn spawn_stats_logger(
    service: Arc<DlmService>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            for name in service.namespaces() {
                let Ok(ns) = service.namespace(&name) else {
                    continue;
                };
                let stats = ns.stats();
                info!(
                    namespace = %stats.name,
                    side = %stats.side,
                    resources = stats.resources,
                    locks = stats.locks,
                    unused = stats.unused,
                    volume = stats.pool.volume,
                    "Namespace stats"
                );
            }
        }
    })
}
