// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pool recalculation and shrink, value-block glimpses, tunables.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, warn};

use super::{Namespace, GLIMPSE_TIMEOUT};
use crate::domain::ast::{AstMessage, AstReply};
use crate::domain::error::DlmError;
use crate::domain::events::PoolEvent;
use crate::domain::lock::LockState;
use crate::domain::mode::LockMode;
use crate::domain::pool::{NamespaceSide, PoolStats, PublishedPool};
use crate::domain::resource::{ResourceId, ValueBlock};

/// Integer knobs exposed per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tunable {
    Limit,
    GrantStep,
    VolumeFactor,
    UnusedMax,
    LockCapacity,
}

impl Tunable {
    pub const ALL: [Tunable; 5] = [
        Tunable::Limit,
        Tunable::GrantStep,
        Tunable::VolumeFactor,
        Tunable::UnusedMax,
        Tunable::LockCapacity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tunable::Limit => "limit",
            Tunable::GrantStep => "grant_step",
            Tunable::VolumeFactor => "volume_factor",
            Tunable::UnusedMax => "unused_max",
            Tunable::LockCapacity => "lock_capacity",
        }
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tunable {
    type Err = DlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tunable::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DlmError::invalid(format!("unknown tunable '{}'", s)))
    }
}

impl Namespace {
    /// One controller cycle: recompute the pool and, on the cache side, run
    /// an LRU cancellation pass against the current volume.
    pub fn recalc_pool(&self, now: Instant) -> PoolStats {
        let stats = self.pool.lock().recalc(now);
        metrics::gauge!("dlm_pool_volume", "namespace" => self.name.clone()).set(stats.volume as f64);
        metrics::gauge!("dlm_pool_granted", "namespace" => self.name.clone())
            .set(stats.granted as f64);

        if self.side == NamespaceSide::Client {
            let cancelled = self.cancel_lru(now);
            if cancelled > 0 {
                self.events.publish_pool_event(PoolEvent::LruCancelled {
                    namespace: self.name.clone(),
                    cancelled,
                    remaining: self.unused_count(),
                    cancelled_at: Utc::now(),
                });
            }
        }

        debug!(
            namespace = %self.name,
            side = %self.side,
            granted = stats.granted,
            grant_plan = stats.grant_plan,
            volume = stats.volume,
            "pool recalculated"
        );
        self.events.publish_pool_event(PoolEvent::PoolRecalculated {
            namespace: self.name.clone(),
            stats,
            recalculated_at: Utc::now(),
        });
        stats
    }

    /// Memory-pressure hook. The authority lowers its volume; the cache
    /// side cancels up to `nr` idle locks right away. Returns the count
    /// still held (authority) or cached (cache side). Never fails.
    pub fn shrink(&self, nr: u64) -> u64 {
        let remaining = match self.side {
            NamespaceSide::Server => self.pool.lock().shrink_volume(nr),
            NamespaceSide::Client => {
                if nr > 0 {
                    self.cancel_oldest(usize::try_from(nr).unwrap_or(usize::MAX));
                }
                self.unused_count() as u64
            }
        };
        if nr > 0 {
            self.events.publish_pool_event(PoolEvent::PoolShrunk {
                namespace: self.name.clone(),
                requested: nr,
                remaining,
                shrunk_at: Utc::now(),
            });
        }
        remaining
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.lock().stats()
    }

    /// The authority's current `(volume, limit)`, for the transport to
    /// piggyback on replies.
    pub fn published_pool(&self) -> PublishedPool {
        self.pool.lock().published()
    }

    /// Cache side: adopt the authority's latest published pool and run an
    /// eviction pass soon.
    pub fn apply_server_pool_update(&self, update: PublishedPool) -> Result<(), DlmError> {
        if self.side != NamespaceSide::Client {
            return Err(DlmError::invalid(format!(
                "namespace {} is the authority for its pool",
                self.name
            )));
        }
        self.pool.lock().apply_server_update(update);
        self.request_recalc();
        Ok(())
    }

    /// Fetch fresh attributes for `resource` from the holder of its first
    /// granted write lock, falling back to the cached value block.
    pub async fn glimpse(&self, resource: ResourceId) -> Result<ValueBlock, DlmError> {
        let res = self.find_resource(resource).ok_or(DlmError::NoLockData)?;
        let writer = {
            let st = res.state();
            st.granted
                .iter()
                .filter_map(|h| st.lock(*h))
                .find(|l| {
                    l.state == LockState::Granted
                        && matches!(l.granted_mode, Some(LockMode::Pw) | Some(LockMode::Ex))
                })
                .map(|l| (l.describe(), l.ast.clone()))
        };

        if let Some((desc, target)) = writer {
            let handle = desc.handle;
            metrics::counter!("dlm_asts_sent_total", "kind" => "glimpse").increment(1);
            let reply =
                tokio::time::timeout(GLIMPSE_TIMEOUT, target.deliver(AstMessage::Glimpse { lock: desc }))
                    .await;
            match reply {
                Ok(Ok(AstReply::ValueBlock(fresh))) => {
                    let mut st = res.state();
                    let cached = st.value_block.get_or_insert_with(ValueBlock::default);
                    cached.merge(&fresh);
                    return Ok(*cached);
                }
                Ok(Ok(AstReply::Ack)) => {}
                Ok(Err(e)) => {
                    warn!(namespace = %self.name, handle = %handle, error = %e, "glimpse failed")
                }
                Err(_) => {
                    warn!(namespace = %self.name, handle = %handle, "glimpse timed out")
                }
            }
        }

        let cached = res.state().value_block;
        cached.ok_or(DlmError::NoLockData)
    }

    /// Merge attributes reported by a holder into the resource's cached
    /// value block.
    pub fn update_value_block(
        &self,
        resource: ResourceId,
        fresh: ValueBlock,
    ) -> Result<ValueBlock, DlmError> {
        let res = self
            .find_resource(resource)
            .ok_or_else(|| DlmError::invalid(format!("no such resource {}", resource)))?;
        let mut st = res.state();
        let cached = st.value_block.get_or_insert_with(ValueBlock::default);
        cached.merge(&fresh);
        Ok(*cached)
    }

    pub fn get_tunable(&self, tunable: Tunable) -> u64 {
        match tunable {
            Tunable::Limit => self.pool.lock().limit(),
            Tunable::GrantStep => u64::from(self.pool.lock().grant_step()),
            Tunable::VolumeFactor => self.pool.lock().volume_factor(),
            Tunable::UnusedMax => self.unused_max.load(Ordering::Acquire) as u64,
            Tunable::LockCapacity => match self.lock_capacity.load(Ordering::Acquire) {
                usize::MAX => u64::MAX,
                n => n as u64,
            },
        }
    }

    pub fn set_tunable(&self, tunable: Tunable, value: u64) -> Result<(), DlmError> {
        let out_of_range = || DlmError::invalid(format!("{} = {} is out of range", tunable, value));
        match tunable {
            Tunable::Limit => {
                if value == 0 {
                    return Err(out_of_range());
                }
                self.pool.lock().set_limit(value);
            }
            Tunable::GrantStep => {
                let step = u32::try_from(value)
                    .ok()
                    .filter(|s| *s <= 100)
                    .ok_or_else(out_of_range)?;
                self.pool.lock().set_grant_step(step);
            }
            Tunable::VolumeFactor => {
                if value == 0 {
                    return Err(out_of_range());
                }
                self.pool.lock().set_volume_factor(value);
            }
            Tunable::UnusedMax => {
                let max = usize::try_from(value).map_err(|_| out_of_range())?;
                self.unused_max.store(max, Ordering::Release);
                self.request_recalc();
            }
            Tunable::LockCapacity => {
                if value == 0 {
                    return Err(out_of_range());
                }
                let capacity = usize::try_from(value).unwrap_or(usize::MAX);
                self.lock_capacity.store(capacity, Ordering::Release);
            }
        }
        debug!(namespace = %self.name, tunable = %tunable, value, "tunable updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::*;
    use super::super::{EnqueueOutcome, LockRequest};
    use super::*;
    use crate::domain::ast::{AstError, AstTarget, HolderLocality};
    use crate::domain::lock::{ByteRange, PolicyData};
    use crate::domain::pool::volume_max;
    use crate::infrastructure::ast::LocalAstTarget;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[test]
    fn test_tunables_round_trip_and_reject() {
        let (ns, _worker) = namespace("mdt0");
        ns.set_tunable(Tunable::Limit, 500).unwrap();
        ns.set_tunable(Tunable::GrantStep, 20).unwrap();
        assert_eq!(ns.get_tunable(Tunable::Limit), 500);
        assert_eq!(ns.get_tunable(Tunable::GrantStep), 20);
        assert_eq!(ns.get_tunable(Tunable::LockCapacity), u64::MAX);

        assert!(ns.set_tunable(Tunable::Limit, 0).is_err());
        assert!(ns.set_tunable(Tunable::GrantStep, 101).is_err());
        assert!(ns.set_tunable(Tunable::VolumeFactor, 0).is_err());
        assert_eq!("unused_max".parse::<Tunable>().unwrap(), Tunable::UnusedMax);
        assert!("bogus".parse::<Tunable>().is_err());
    }

    #[test]
    fn test_lock_capacity_tunable_limits_enqueue() {
        let (ns, _worker) = namespace("mdt0");
        ns.set_tunable(Tunable::LockCapacity, 1).unwrap();
        ns.enqueue(plain(ResourceId::new(1, 1), LockMode::Pr, owner(1)))
            .unwrap();
        let err = ns
            .enqueue(plain(ResourceId::new(1, 2), LockMode::Pr, owner(1)))
            .unwrap_err();
        assert_eq!(
            err,
            DlmError::NoMemory {
                requested: 1,
                available: 0
            }
        );
        assert_eq!(ns.resource_count(), 1);
    }

    #[test]
    fn test_server_shrink() {
        let (ns, _worker) = namespace("mdt0");
        for i in 0..4 {
            ns.enqueue(plain(ResourceId::new(2, i), LockMode::Pr, owner(1)))
                .unwrap();
        }
        let before = ns.pool_stats();
        assert_eq!(ns.shrink(0), 4);
        assert_eq!(ns.pool_stats(), before);

        assert_eq!(ns.shrink(2), 4);
        let after = ns.pool_stats();
        assert!(after.volume < before.volume);
        assert_eq!(after.granted, 4);
    }

    #[test]
    fn test_client_shrink_cancels_idle_locks() {
        let (ns, _worker) = namespace_with("osc0", |cfg| cfg.side = Some(NamespaceSide::Client));
        for i in 0..5 {
            let EnqueueOutcome::Granted(h) = ns
                .enqueue(plain(ResourceId::new(3, i), LockMode::Pr, owner(1)))
                .unwrap()
            else {
                panic!()
            };
            ns.decref(h, LockMode::Pr).unwrap();
        }
        assert_eq!(ns.shrink(0), 5);
        assert_eq!(ns.shrink(3), 2);
        assert_eq!(ns.pool_stats().granted, 2);
    }

    #[test]
    fn test_pool_update_only_on_client() {
        let (server, _w1) = namespace("mdt0");
        let (client, _w2) = namespace_with("mdc0", |cfg| cfg.side = Some(NamespaceSide::Client));
        let published = server.published_pool();
        assert_eq!(published.volume, volume_max(published.limit));

        assert!(server.apply_server_pool_update(published).is_err());
        client
            .apply_server_pool_update(PublishedPool {
                volume: 42,
                limit: 10,
            })
            .unwrap();
        assert_eq!(client.pool_stats().volume, 42);
        assert_eq!(client.get_tunable(Tunable::Limit), 10);
    }

    #[test]
    fn test_recalc_keeps_volume_in_bounds() {
        let (ns, _worker) = namespace_with("mdt0", |cfg| cfg.limit = 10);
        for i in 0..30 {
            ns.enqueue(plain(ResourceId::new(4, i), LockMode::Pr, owner(1)))
                .unwrap();
        }
        let mut now = Instant::now();
        for _ in 0..20 {
            now += std::time::Duration::from_secs(1);
            let stats = ns.recalc_pool(now);
            assert!(stats.volume >= 1);
            assert!(stats.volume <= volume_max(stats.limit));
        }
    }

    struct Slow;

    #[async_trait]
    impl AstTarget for Slow {
        fn locality(&self) -> HolderLocality {
            HolderLocality::Remote
        }

        async fn deliver(&self, _message: AstMessage) -> Result<AstReply, AstError> {
            std::future::pending().await
        }
    }

    fn extent_pw(res: ResourceId, target: Arc<dyn AstTarget>) -> LockRequest {
        LockRequest::new(
            res,
            LockMode::Pw,
            PolicyData::Extent {
                range: ByteRange::whole(),
                gid: 0,
            },
            owner(1),
            target,
        )
    }

    #[tokio::test]
    async fn test_glimpse_merges_holder_reply() {
        let (ns, _worker) = namespace("ost0");
        let res = ResourceId::new(5, 1);
        assert!(ns.update_value_block(res, ValueBlock::default()).is_err());

        let holder = Arc::new(LocalAstTarget::new(|_| {
            AstReply::ValueBlock(ValueBlock {
                size: 4096,
                blocks: 8,
                mtime: 100,
                atime: 100,
                ctime: 100,
            })
        }));
        ns.enqueue(extent_pw(res, holder)).unwrap();
        ns.update_value_block(
            res,
            ValueBlock {
                size: 10,
                mtime: 500,
                ..ValueBlock::default()
            },
        )
        .unwrap();

        let vb = ns.glimpse(res).await.unwrap();
        assert_eq!(vb.size, 4096);
        assert_eq!(vb.mtime, 500);
    }

    #[test]
    fn test_glimpse_without_data() {
        let (ns, _worker) = namespace("ost0");
        let res = ResourceId::new(5, 2);
        assert_eq!(tokio_test::block_on(ns.glimpse(res)), Err(DlmError::NoLockData));

        ns.enqueue(plain(res, LockMode::Pr, owner(1))).unwrap();
        assert_eq!(tokio_test::block_on(ns.glimpse(res)), Err(DlmError::NoLockData));
    }

    #[tokio::test(start_paused = true)]
    async fn test_glimpse_timeout_falls_back_to_cache() {
        let (ns, _worker) = namespace("ost0");
        let res = ResourceId::new(5, 3);
        ns.enqueue(extent_pw(res, Arc::new(Slow))).unwrap();
        ns.update_value_block(
            res,
            ValueBlock {
                size: 7,
                ..ValueBlock::default()
            },
        )
        .unwrap();

        assert_eq!(ns.glimpse(res).await.unwrap().size, 7);
    }
}
