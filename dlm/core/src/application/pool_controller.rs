// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Pool Controller - Background task driving one namespace's pool
//!
//! Ticks every `recalc_interval`, or earlier when the namespace asks for a
//! recompute (tunable change, server update, LRU over its cap). The
//! authority recomputes its grant plan and volume; the cache side samples
//! its rates and cancels idle locks the pool no longer pays for.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Periodic SLV recalculation and LRU eviction

use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::namespace::Namespace;

pub struct PoolController {
    namespace: Arc<Namespace>,
}

impl PoolController {
    pub fn new(namespace: Arc<Namespace>) -> Self {
        Self { namespace }
    }

    /// Start the controller background task. It stops when `shutdown` is
    /// cancelled.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, shutdown: CancellationToken) {
        let ns = &self.namespace;
        info!(
            namespace = %ns.name(),
            side = %ns.side(),
            interval_ms = ns.recalc_interval().as_millis() as u64,
            "Starting pool controller"
        );

        let mut tick = interval(ns.recalc_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.cycle("tick");
                }
                _ = ns.recalc_signal().notified() => {
                    self.cycle("signal");
                }
                _ = shutdown.cancelled() => {
                    info!(namespace = %ns.name(), "Shutdown signal received, stopping pool controller");
                    break;
                }
            }
        }
    }

    /// Run one recalculation now.
    pub fn cycle(&self, reason: &'static str) {
        let stats = self.namespace.recalc_pool(Instant::now());
        debug!(
            namespace = %self.namespace.name(),
            reason,
            volume = stats.volume,
            granted = stats.granted,
            "Pool controller cycle completed"
        );
    }
}
