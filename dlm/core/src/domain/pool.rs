// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lock Pool (Server Lock Volume)
//!
//! Feedback state that throttles how many locks clients cache.
//!
//! The authority side periodically corrects a scalar *volume* (lock-seconds
//! the cluster can sustain) from how far the granted count has drifted from
//! the last grant plan:
//!
//! ```text
//! slv_factor  = max(limit - (granted - grant_plan), 1)
//! grant_plan' = granted + (limit - granted) * grant_step / 100
//! volume'     = clamp(volume * slv_factor * 100 / limit / 100, 1, limit * MAX_AGE)
//! ```
//!
//! The cache side only consumes the last published volume: a cached idle
//! lock whose age times `volume_factor` exceeds it is an eviction candidate.
//!
//! The pool is plain data; the owning namespace keeps it behind its own
//! mutex, which is never held while taking a resource or namespace lock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Seconds a client may hold `limit` locks worth of volume.
pub const MAX_AGE_SECS: u64 = 36_000;
pub const DEFAULT_GRANT_STEP: u32 = 5;
pub const DEFAULT_VOLUME_FACTOR: u64 = 1;
pub const DEFAULT_LIMIT: u64 = 1_000;
pub const DEFAULT_RECALC_INTERVAL: Duration = Duration::from_secs(1);

pub fn volume_max(limit: u64) -> u64 {
    limit.saturating_mul(MAX_AGE_SECS).max(1)
}

pub const fn volume_min(_limit: u64) -> u64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceSide {
    /// Cache side: consumes the published volume and evicts idle locks.
    Client,
    /// Authority side: grants locks and publishes the volume.
    Server,
}

impl fmt::Display for NamespaceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceSide::Client => f.write_str("client"),
            NamespaceSide::Server => f.write_str("server"),
        }
    }
}

impl FromStr for NamespaceSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(NamespaceSide::Client),
            "server" => Ok(NamespaceSide::Server),
            other => Err(format!("unknown namespace side '{}'", other)),
        }
    }
}

/// The authority's published `(volume, limit)` pair, piggybacked on replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPool {
    pub volume: u64,
    pub limit: u64,
}

/// Point-in-time view of a pool, for diagnostics and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub side: NamespaceSide,
    pub granted: u64,
    pub grant_rate: u64,
    pub cancel_rate: u64,
    pub grant_speed: i64,
    pub grant_plan: u64,
    pub grant_step: u32,
    pub limit: u64,
    pub volume: u64,
    pub volume_factor: u64,
}

#[derive(Debug, Clone)]
pub struct Pool {
    side: NamespaceSide,
    granted: u64,
    grants_since_sample: u64,
    cancels_since_sample: u64,
    grant_rate: u64,
    cancel_rate: u64,
    grant_speed: i64,
    grant_plan: u64,
    grant_step: u32,
    limit: u64,
    volume: u64,
    volume_factor: u64,
    last_update: Instant,
}

impl Pool {
    pub fn new(side: NamespaceSide, limit: u64) -> Self {
        let limit = limit.max(1);
        Self {
            side,
            granted: 0,
            grants_since_sample: 0,
            cancels_since_sample: 0,
            grant_rate: 0,
            cancel_rate: 0,
            grant_speed: 0,
            grant_plan: limit,
            grant_step: DEFAULT_GRANT_STEP,
            limit,
            volume: volume_max(limit),
            volume_factor: DEFAULT_VOLUME_FACTOR,
            last_update: Instant::now(),
        }
    }

    pub fn side(&self) -> NamespaceSide {
        self.side
    }

    pub fn granted(&self) -> u64 {
        self.granted
    }

    pub fn volume(&self) -> u64 {
        self.volume
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn grant_plan(&self) -> u64 {
        self.grant_plan
    }

    pub fn grant_step(&self) -> u32 {
        self.grant_step
    }

    pub fn volume_factor(&self) -> u64 {
        self.volume_factor
    }

    pub fn record_grant(&mut self) {
        self.granted += 1;
        self.grants_since_sample += 1;
    }

    pub fn record_cancel(&mut self) {
        self.granted = self.granted.saturating_sub(1);
        self.cancels_since_sample += 1;
    }

    /// Changing the limit re-clamps the volume into the new bounds.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit.max(1);
        self.clamp_volume();
    }

    pub fn set_grant_step(&mut self, step: u32) {
        self.grant_step = step.min(100);
    }

    pub fn set_volume_factor(&mut self, factor: u64) {
        self.volume_factor = factor.max(1);
    }

    fn clamp_volume(&mut self) {
        self.volume = self
            .volume
            .clamp(volume_min(self.limit), volume_max(self.limit));
    }

    /// Turn the counts accumulated since the last sample into per-second
    /// rates, using the real elapsed time so a late tick stays accurate.
    fn sample_rates(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_update).as_millis().max(1) as u64;
        self.grant_rate = self.grants_since_sample.saturating_mul(1000) / elapsed_ms;
        self.cancel_rate = self.cancels_since_sample.saturating_mul(1000) / elapsed_ms;
        self.grant_speed = self.grant_rate as i64 - self.cancel_rate as i64;
        self.grants_since_sample = 0;
        self.cancels_since_sample = 0;
        self.last_update = now;
    }

    /// Authority-side correction of the grant plan and the volume.
    pub fn recalc(&mut self, now: Instant) -> PoolStats {
        self.sample_rates(now);
        if self.side == NamespaceSide::Client {
            return self.stats();
        }

        let limit = self.limit as i128;
        let granted = self.granted as i128;
        let plan = self.grant_plan as i128;

        let slv_factor = (limit - (granted - plan)).max(1);
        let next_plan = granted + (limit - granted) * self.grant_step as i128 / 100;
        self.grant_plan = next_plan.max(0) as u64;

        let factor_pct = slv_factor * 100 / limit;
        let volume = self.volume as i128 * factor_pct / 100;
        self.volume = volume.clamp(
            volume_min(self.limit) as i128,
            volume_max(self.limit) as i128,
        ) as u64;
        self.stats()
    }

    /// Lower the volume so clients release roughly `nr` locks. Nothing is
    /// freed here; returns the granted count.
    pub fn shrink_volume(&mut self, nr: u64) -> u64 {
        if nr == 0 || self.granted == 0 {
            return self.granted;
        }
        let delta = nr as u128 * self.volume as u128 / self.granted as u128;
        let delta = u64::try_from(delta).unwrap_or(u64::MAX);
        self.volume = self.volume.saturating_sub(delta);
        self.clamp_volume();
        self.granted
    }

    pub fn published(&self) -> PublishedPool {
        PublishedPool {
            volume: self.volume,
            limit: self.limit,
        }
    }

    /// Cache side: adopt the authority's latest scalar.
    pub fn apply_server_update(&mut self, update: PublishedPool) {
        self.limit = update.limit.max(1);
        self.volume = update.volume;
        self.clamp_volume();
    }

    /// Eviction weight of a lock idle for `age`.
    pub fn lock_volume(&self, age: Duration) -> u64 {
        age.as_secs().saturating_mul(self.volume_factor)
    }

    pub fn is_eviction_candidate(&self, age: Duration) -> bool {
        self.lock_volume(age) > self.volume
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            side: self.side,
            granted: self.granted,
            grant_rate: self.grant_rate,
            cancel_rate: self.cancel_rate,
            grant_speed: self.grant_speed,
            grant_plan: self.grant_plan,
            grant_step: self.grant_step,
            limit: self.limit,
            volume: self.volume,
            volume_factor: self.volume_factor,
        }
    }
}
