// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cache-side lock reuse: user references, matching, callback-pending
//! locks and the idle-lock LRU.

use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info};

use super::{Followups, Namespace};
use crate::domain::error::DlmError;
use crate::domain::lock::{LockFlags, LockHandle, LockState, PolicyData};
use crate::domain::mode::{LockMode, ModeSet};
use crate::domain::policy::policy_for;
use crate::domain::pool::NamespaceSide;
use crate::domain::resource::{ResourceId, ResourceKind};

impl Namespace {
    /// Take a user reference on a lock. A lock in use is never in the LRU.
    pub fn addref(&self, handle: LockHandle, mode: LockMode) -> Result<(), DlmError> {
        self.with_resource_of(handle, |st| {
            st.lock_mut(handle).map(|lock| lock.add_user(mode))
        })
        .flatten()
        .ok_or(DlmError::LockNotFound(handle))?;
        self.table.lock().lru.remove(handle);
        Ok(())
    }

    /// Drop a user reference. The last reference either cancels a
    /// callback-pending lock or parks a cache-side lock in the LRU.
    pub fn decref(&self, handle: LockHandle, mode: LockMode) -> Result<(), DlmError> {
        let (idle, callback_pending, cacheable) = self
            .with_resource_of(handle, |st| -> Result<_, DlmError> {
                let kind = st.kind;
                let lock = st
                    .lock_mut(handle)
                    .ok_or(DlmError::LockNotFound(handle))?;
                if lock.users() == 0 {
                    return Err(DlmError::invalid(format!("lock {} has no users", handle)));
                }
                let left = lock.remove_user(mode);
                Ok((
                    left == 0,
                    lock.flags.contains(LockFlags::CB_PENDING),
                    lock.state == LockState::Granted && kind != ResourceKind::Flock,
                ))
            })
            .unwrap_or(Err(DlmError::LockNotFound(handle)))?;

        if !idle {
            return Ok(());
        }
        if callback_pending {
            self.cancel(handle);
            return Ok(());
        }
        if cacheable && self.side == NamespaceSide::Client {
            // A cancel racing in after the resource lock was dropped has
            // already unregistered the handle; its LRU cleanup runs under
            // the table lock, so checking here leaves no dead entry behind.
            let over = {
                let mut table = self.table.lock();
                let Some(resource) = self.handles.lock().get(&handle).copied() else {
                    return Ok(());
                };
                table.lru.insert(handle, resource, Instant::now());
                table.lru.len() > self.unused_max.load(Ordering::Acquire)
            };
            if over {
                self.request_recalc();
            }
        }
        Ok(())
    }

    /// Find a granted lock on `resource` whose mode is in `modes` and whose
    /// policy data covers `wanted`, and take a user reference on it.
    pub fn match_lock(
        &self,
        resource: ResourceId,
        modes: ModeSet,
        wanted: &PolicyData,
    ) -> Option<LockHandle> {
        let res = self.find_resource(resource)?;
        let handle = {
            let mut st = res.state();
            if st.kind != wanted.kind() {
                return None;
            }
            let policy = policy_for(st.kind);
            let found = st.granted.iter().copied().find(|h| {
                st.lock(*h).is_some_and(|lock| {
                    lock.state == LockState::Granted
                        && !lock.flags.contains(LockFlags::CB_PENDING)
                        && lock.granted_mode.is_some_and(|m| modes.contains(m))
                        && policy.covers(&lock.policy, wanted)
                })
            })?;
            let lock = st.lock_mut(found)?;
            let mode = lock.granted_mode?;
            lock.add_user(mode);
            found
        };
        self.table.lock().lru.remove(handle);
        debug!(namespace = %self.name, handle = %handle, "matched cached lock");
        Some(handle)
    }

    /// A blocking AST reached the holder of `handle`. The lock stops being
    /// matchable and goes away as soon as it is idle. Returns whether it
    /// was cancelled right away.
    pub fn handle_blocking_ast(&self, handle: LockHandle) -> bool {
        let idle = self.with_resource_of(handle, |st| {
            st.lock_mut(handle).map(|lock| {
                lock.flags.insert(LockFlags::CB_PENDING);
                lock.users() == 0
            })
        });
        let Some(Some(idle)) = idle else {
            return false;
        };
        if idle {
            self.cancel(handle)
        } else {
            debug!(namespace = %self.name, handle = %handle, "lock busy, cancel deferred to last user");
            false
        }
    }

    pub fn unused_count(&self) -> usize {
        self.table.lock().lru.len()
    }

    /// Cancel idle cached locks, oldest first, while the LRU is over
    /// `unused_max`, the lock is older than the maximum age, or its volume
    /// exceeds what the pool allows.
    pub fn cancel_lru(&self, now: Instant) -> usize {
        let unused_max = self.unused_max.load(Ordering::Acquire);
        let picked = {
            let mut table = self.table.lock();
            let pool = self.pool.lock();
            let mut picked = Vec::new();
            while let Some(entry) = table.lru.oldest().copied() {
                let age = entry.age(now);
                let excess = table.lru.len() > unused_max;
                if !(excess || age >= self.max_age || pool.is_eviction_candidate(age)) {
                    break;
                }
                table.lru.pop_oldest();
                picked.push(entry.handle);
            }
            picked
        };
        self.cancel_idle(&picked)
    }

    /// Cancel up to `nr` of the oldest idle cached locks.
    pub(super) fn cancel_oldest(&self, nr: usize) -> usize {
        let picked: Vec<LockHandle> = {
            let mut table = self.table.lock();
            std::iter::from_fn(|| table.lru.pop_oldest().map(|e| e.handle))
                .take(nr)
                .collect()
        };
        self.cancel_idle(&picked)
    }

    /// Cancel the given locks that are still idle and granted.
    fn cancel_idle(&self, handles: &[LockHandle]) -> usize {
        let mut cancelled = 0;
        for handle in handles {
            let mut followups = Followups::default();
            let done = self.with_resource_of(*handle, |st| {
                let idle = st
                    .lock(*handle)
                    .is_some_and(|l| l.users() == 0 && l.state == LockState::Granted);
                if idle && self.destroy_locked(st, *handle, &mut followups) {
                    let policy = policy_for(st.kind);
                    self.reprocess_locked(st, policy, &mut followups);
                    return true;
                }
                false
            });
            if done == Some(true) {
                cancelled += 1;
            }
            self.finish(followups);
        }
        if cancelled > 0 {
            metrics::counter!("dlm_lru_cancelled_total").increment(cancelled as u64);
            info!(namespace = %self.name, cancelled, "cancelled idle cached locks");
        }
        cancelled
    }
}
