// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `cohortctl simulate` - contending clients against an in-process node.
//!
//! Each client repeatedly picks a resource, takes a lock in a read or write
//! mode, holds it briefly and releases it. The report counts immediate
//! grants, grants after waiting, refusals and timeouts, then shows the pool
//! state the controller converged to.

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cohort_dlm_core::domain::ast::NoopAstTarget;
use cohort_dlm_core::domain::config::NamespaceConfig;
use cohort_dlm_core::domain::lock::ExportId;
use cohort_dlm_core::domain::pool::{NamespaceSide, PoolStats};
use cohort_dlm_core::infrastructure::ast::AstDeliveryConfig;
use cohort_dlm_core::infrastructure::event_bus::EventBus;
use cohort_dlm_core::{
    ByteRange, DlmError, DlmService, EnqueueOutcome, LockHandle, LockMode, LockOwner, LockRequest,
    Namespace, PolicyData, ResourceId, WaitOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SimKind {
    Plain,
    Extent,
    Flock,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Concurrent clients
    #[arg(long, default_value = "8")]
    pub clients: u32,

    /// Distinct resources the clients contend on
    #[arg(long, default_value = "4")]
    pub resources: u64,

    /// Lock/unlock cycles per client
    #[arg(long, default_value = "50")]
    pub rounds: u32,

    /// Lock kind to exercise
    #[arg(long, value_enum, default_value = "plain")]
    pub kind: SimKind,

    /// Percentage of requests taken in a write mode
    #[arg(long, default_value = "25")]
    pub write_pct: u32,

    /// How long a granted lock is held, in milliseconds
    #[arg(long, default_value = "1")]
    pub hold_ms: u64,

    /// Give up on a blocked request after this many milliseconds
    #[arg(long, default_value = "2000")]
    pub wait_ms: u64,

    /// Pool limit of the simulated namespace
    #[arg(long, default_value = "64")]
    pub limit: u64,

    /// Seed for the request mix
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            clients: 8,
            resources: 4,
            rounds: 50,
            kind: SimKind::Plain,
            write_pct: 25,
            hold_ms: 1,
            wait_ms: 2000,
            limit: 64,
            seed: 1,
            json: false,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ClientTally {
    pub granted_immediately: u64,
    pub granted_after_wait: u64,
    pub would_block: u64,
    pub deadlocks: u64,
    pub timed_out: u64,
}

impl ClientTally {
    fn absorb(&mut self, other: &ClientTally) {
        self.granted_immediately += other.granted_immediately;
        self.granted_after_wait += other.granted_after_wait;
        self.would_block += other.would_block;
        self.deadlocks += other.deadlocks;
        self.timed_out += other.timed_out;
    }

    pub fn requests(&self) -> u64 {
        self.granted_immediately
            + self.granted_after_wait
            + self.would_block
            + self.deadlocks
            + self.timed_out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub kind: SimKind,
    pub clients: u32,
    pub rounds: u32,
    pub elapsed_ms: u64,
    pub totals: ClientTally,
    pub locks_left: usize,
    pub pool: PoolStats,
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    let report = simulate(&args).await?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

pub async fn simulate(args: &SimulateArgs) -> Result<SimulationReport> {
    if args.clients == 0 || args.resources == 0 {
        bail!("--clients and --resources must be at least 1");
    }
    if args.write_pct > 100 {
        bail!("--write-pct is a percentage, got {}", args.write_pct);
    }

    let service = DlmService::new(
        "simulator",
        NamespaceSide::Server,
        AstDeliveryConfig::default(),
        Arc::new(EventBus::with_default_capacity()),
    );
    let mut config = NamespaceConfig::new("sim", NamespaceSide::Server);
    config.limit = args.limit;
    config.recalc_interval_ms = 100;
    let ns = service
        .create_namespace(&config)
        .context("Failed to create simulation namespace")?;

    let started = Instant::now();
    let clients = (1..=args.clients).map(|pid| run_client(ns.clone(), pid, args.clone()));
    let tallies = futures::future::join_all(clients).await;
    let elapsed = started.elapsed();

    let mut totals = ClientTally::default();
    for tally in &tallies {
        totals.absorb(tally);
    }
    let report = SimulationReport {
        kind: args.kind,
        clients: args.clients,
        rounds: args.rounds,
        elapsed_ms: elapsed.as_millis() as u64,
        totals,
        locks_left: ns.live_locks(),
        pool: ns.recalc_pool(Instant::now()),
    };

    service
        .remove_namespace("sim")
        .await
        .context("Failed to remove simulation namespace")?;
    service.shutdown().await;
    Ok(report)
}

async fn run_client(ns: Arc<Namespace>, pid: u32, args: SimulateArgs) -> ClientTally {
    let owner = LockOwner::new(pid, ExportId::local());
    let mut rng = XorShift::new(args.seed ^ u64::from(pid).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let token = CancellationToken::new();
    let mut tally = ClientTally::default();

    for _ in 0..args.rounds {
        let res = ResourceId::new(1, rng.next() % args.resources);
        let write = rng.next() % 100 < u64::from(args.write_pct);
        let (mode, policy) = request_shape(args.kind, write, &mut rng);
        let request = LockRequest::new(res, mode, policy, owner, Arc::new(NoopAstTarget));

        let immediate = match ns.enqueue(request) {
            Ok(EnqueueOutcome::Granted(h)) => Some((h, true)),
            Ok(EnqueueOutcome::Blocked(h)) => Some((h, false)),
            Ok(_) => None,
            Err(e) => {
                record_refusal(&mut tally, &e);
                None
            }
        };
        let Some((handle, now)) = immediate else {
            continue;
        };

        if now {
            tally.granted_immediately += 1;
        } else {
            let wait = Some(Duration::from_millis(args.wait_ms));
            match ns.wait_for_grant(handle, wait, &token).await {
                WaitOutcome::Granted => tally.granted_after_wait += 1,
                _ => {
                    tally.timed_out += 1;
                    continue;
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;
        release(&ns, handle, res, mode, policy, owner);
    }
    debug!(pid, requests = tally.requests(), "Simulated client finished");
    tally
}

fn request_shape(kind: SimKind, write: bool, rng: &mut XorShift) -> (LockMode, PolicyData) {
    let start = (rng.next() % 16) * 4096;
    let range = ByteRange::new(start, start + 4096).unwrap_or_else(|_| ByteRange::whole());
    match (kind, write) {
        (SimKind::Plain, false) => (LockMode::Pr, PolicyData::Plain),
        (SimKind::Plain, true) => (LockMode::Ex, PolicyData::Plain),
        (SimKind::Extent, w) => (
            if w { LockMode::Pw } else { LockMode::Pr },
            PolicyData::Extent { range, gid: 0 },
        ),
        (SimKind::Flock, w) => (
            if w { LockMode::Pw } else { LockMode::Pr },
            PolicyData::Flock { range },
        ),
    }
}

/// Flock locks may have been merged into a neighbour, so they are released
/// by unlocking the range; everything else is cancelled by handle.
fn release(
    ns: &Namespace,
    handle: LockHandle,
    res: ResourceId,
    mode: LockMode,
    policy: PolicyData,
    owner: LockOwner,
) {
    if matches!(policy, PolicyData::Flock { .. }) {
        let unlock = LockRequest::new(res, LockMode::Nl, policy, owner, Arc::new(NoopAstTarget));
        if let Err(e) = ns.enqueue(unlock) {
            debug!(error = %e, mode = %mode, "Flock unlock failed");
        }
    } else {
        ns.cancel(handle);
    }
}

fn record_refusal(tally: &mut ClientTally, e: &DlmError) {
    match e {
        DlmError::Deadlock { .. } => tally.deadlocks += 1,
        DlmError::WouldBlock => tally.would_block += 1,
        _ => tally.timed_out += 1,
    }
}

fn print_report(report: &SimulationReport) {
    let t = &report.totals;
    println!("{}", "Simulation report".bold());
    println!(
        "  {:?} locks, {} clients x {} rounds in {} ms",
        report.kind, report.clients, report.rounds, report.elapsed_ms
    );
    println!("  Granted immediately: {}", t.granted_immediately.to_string().green());
    println!("  Granted after wait:  {}", t.granted_after_wait.to_string().green());
    println!("  Deadlocks refused:   {}", t.deadlocks.to_string().yellow());
    println!("  Timed out / failed:  {}", t.timed_out.to_string().red());
    println!("  Locks still held:    {}", report.locks_left);
    println!(
        "  Pool: granted={} plan={} volume={} limit={}",
        report.pool.granted, report.pool.grant_plan, report.pool.volume, report.pool.limit
    );
}

/// Deterministic request mix; the exact distribution is irrelevant.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_simulation_accounts_every_request() {
        let args = SimulateArgs {
            clients: 4,
            resources: 2,
            rounds: 10,
            write_pct: 50,
            hold_ms: 0,
            ..SimulateArgs::default()
        };
        let report = simulate(&args).await.unwrap();
        assert_eq!(report.totals.requests(), 40);
        assert_eq!(report.totals.deadlocks, 0);
        assert_eq!(report.locks_left, 0);
    }

    #[tokio::test]
    async fn test_flock_simulation_releases_ranges() {
        let args = SimulateArgs {
            clients: 3,
            resources: 1,
            rounds: 8,
            kind: SimKind::Flock,
            hold_ms: 0,
            ..SimulateArgs::default()
        };
        let report = simulate(&args).await.unwrap();
        assert_eq!(report.locks_left, 0);
        assert!(report.totals.granted_immediately > 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let args = SimulateArgs {
            write_pct: 150,
            ..SimulateArgs::default()
        };
        assert!(simulate(&args).await.is_err());
    }
}
