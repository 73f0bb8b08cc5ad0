// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::atomic::Ordering;
use tracing::{debug, info};

use super::{Followups, Namespace, NamespaceStats, ResourceSnapshot};
use crate::domain::error::DlmError;
use crate::domain::lock::{Lock, LockDesc, LockHandle, LockOwner, LockState};
use crate::domain::mode::LockMode;
use crate::domain::policy::policy_for;
use crate::domain::resource::{Resource, ResourceId, ResourceKind, ResourceState};

impl Namespace {
    /// Move a granted lock to `new_id`, a resource of the same kind, when
    /// it is compatible with everything already held there.
    pub fn rehome(&self, handle: LockHandle, new_id: ResourceId) -> Result<(), DlmError> {
        let src = self
            .resource_of(handle)
            .ok_or(DlmError::LockNotFound(handle))?;
        if src.id() == new_id {
            return Ok(());
        }
        if src.kind() == ResourceKind::Flock {
            return Err(DlmError::invalid("flock locks cannot be re-homed"));
        }
        let dst = self.get_or_create_resource(new_id, src.kind())?;

        let mut followups = Followups::default();
        let moved = {
            let (mut s, mut d) = if src.id() < dst.id() {
                let s = src.state();
                let d = dst.state();
                (s, d)
            } else {
                let d = dst.state();
                let s = src.state();
                (s, d)
            };
            self.rehome_locked(&mut s, &mut d, handle, &mut followups)
        };
        if moved.is_err() {
            self.put_resource(&dst);
        }
        self.finish(followups);
        if moved.is_ok() {
            info!(namespace = %self.name, handle = %handle, from = %src.id(), to = %new_id, "lock re-homed");
        }
        moved
    }

    fn rehome_locked(
        &self,
        src: &mut ResourceState,
        dst: &mut ResourceState,
        handle: LockHandle,
        f: &mut Followups,
    ) -> Result<(), DlmError> {
        let policy = policy_for(dst.kind);
        let lock = src.lock(handle).ok_or(DlmError::LockNotFound(handle))?;
        if lock.state != LockState::Granted {
            return Err(DlmError::invalid(format!(
                "lock {} is {:?}; only granted locks move",
                handle, lock.state
            )));
        }
        let blocked = dst.holders().any(|other| {
            other
                .held_mode()
                .is_some_and(|mode| policy.blocks(other, mode, lock))
        });
        if blocked {
            return Err(DlmError::invalid(format!(
                "lock {} conflicts with locks held on {}",
                handle, dst.id
            )));
        }

        let mut lock = src
            .detach(handle)
            .ok_or(DlmError::LockNotFound(handle))?;
        src.refcount = src.refcount.saturating_sub(1);
        lock.resource = dst.id;
        dst.attach(lock);
        dst.insert_granted(handle);
        self.handles.lock().insert(handle, dst.id);

        f.reap.push(src.id);
        self.reprocess_locked(src, policy, f);
        Ok(())
    }

    /// A granted lock of `owner` on an ancestor of `id` whose mode covers
    /// `mode`.
    pub fn covering_ancestor_lock(
        &self,
        id: ResourceId,
        owner: LockOwner,
        mode: LockMode,
    ) -> Option<LockHandle> {
        let start = self.find_resource(id)?;
        let mut current = start.state().parent;
        while let Some(parent_id) = current {
            let parent = self.find_resource(parent_id)?;
            let st = parent.state();
            let covering = st
                .granted
                .iter()
                .filter_map(|h| st.lock(*h))
                .find(|l| {
                    l.owner == owner
                        && l.state == LockState::Granted
                        && l.granted_mode.is_some_and(|held| held.covers(mode))
                })
                .map(|l| l.handle);
            if covering.is_some() {
                return covering;
            }
            current = st.parent;
        }
        None
    }

    /// Visit every resource. The table lock is not held during `f`.
    pub fn for_each_resource(&self, mut f: impl FnMut(&Resource)) {
        let snapshot: Vec<_> = self.table.lock().resources.values().cloned().collect();
        for res in &snapshot {
            f(res);
        }
    }

    /// Visit the locks of one resource in queue order (granted, converting,
    /// waiting). Returns how many were visited.
    pub fn for_each_lock(&self, id: ResourceId, mut f: impl FnMut(&Lock)) -> usize {
        let Some(res) = self.find_resource(id) else {
            return 0;
        };
        let st = res.state();
        let mut visited = 0;
        for handle in st.granted.iter().chain(&st.converting).chain(&st.waiting) {
            if let Some(lock) = st.lock(*handle) {
                f(lock);
                visited += 1;
            }
        }
        visited
    }

    pub fn lock_info(&self, handle: LockHandle) -> Option<LockDesc> {
        self.with_resource_of(handle, |st| st.lock(handle).map(Lock::describe))
            .flatten()
    }

    pub fn resource_snapshot(&self, id: ResourceId) -> Option<ResourceSnapshot> {
        let res = self.find_resource(id)?;
        let st = res.state();
        let describe = |queue: &[LockHandle]| -> Vec<LockDesc> {
            queue
                .iter()
                .filter_map(|h| st.lock(*h))
                .map(Lock::describe)
                .collect()
        };
        let mut children: Vec<_> = st.children.iter().copied().collect();
        children.sort_unstable();
        Some(ResourceSnapshot {
            id: st.id,
            kind: st.kind,
            parent: st.parent,
            children,
            granted: describe(&st.granted),
            converting: describe(&st.converting),
            waiting: describe(&st.waiting),
            refcount: st.refcount,
            value_block: st.value_block,
        })
    }

    /// Cancel every lock in the namespace. Used on namespace removal.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<LockHandle> = self.handles.lock().keys().copied().collect();
        let cancelled = handles.into_iter().filter(|h| self.cancel(*h)).count();
        debug!(namespace = %self.name, cancelled, "cancelled all locks");
        cancelled
    }

    pub fn stats(&self) -> NamespaceStats {
        let (resources, unused) = {
            let table = self.table.lock();
            (table.resources.len(), table.lru.len())
        };
        NamespaceStats {
            name: self.name.clone(),
            side: self.side,
            resources,
            locks: self.live_locks.load(Ordering::Acquire),
            unused,
            pool: self.pool_stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::*;
    use super::super::EnqueueOutcome;
    use super::*;

    fn granted(ns: &Namespace, res: ResourceId, mode: LockMode, pid: u32) -> LockHandle {
        match ns.enqueue(plain(res, mode, owner(pid))).unwrap() {
            EnqueueOutcome::Granted(h) => h,
            other => panic!("expected grant, got {:?}", other),
        }
    }

    #[test]
    fn test_double_cancel_keeps_refcounts() {
        let (ns, _worker) = namespace("mdt0");
        let res = ResourceId::new(1, 1);
        let h1 = granted(&ns, res, LockMode::Pr, 1);
        let _h2 = granted(&ns, res, LockMode::Pr, 2);
        assert_eq!(ns.resource_snapshot(res).unwrap().refcount, 2);

        assert!(ns.cancel(h1));
        assert!(!ns.cancel(h1));
        assert_eq!(ns.resource_snapshot(res).unwrap().refcount, 1);
        assert_eq!(ns.stats().pool.granted, 1);
    }

    #[test]
    fn test_resource_destroyed_when_empty() {
        let (ns, _worker) = namespace("mdt0");
        let res = ResourceId::new(1, 2);
        let h = granted(&ns, res, LockMode::Ex, 1);
        assert_eq!(ns.resource_count(), 1);
        ns.cancel(h);
        assert_eq!(ns.resource_count(), 0);
        assert!(ns.resource_snapshot(res).is_none());
    }

    #[test]
    fn test_child_keeps_parent_alive() {
        let (ns, _worker) = namespace("mdt0");
        let dir = ResourceId::new(2, 1);
        let file = ResourceId::new(2, 2);

        assert!(ns
            .get_or_create_child(dir, file, ResourceKind::Bits)
            .is_err());

        let parent = ns.get_or_create_resource(dir, ResourceKind::Plain).unwrap();
        let child = ns
            .get_or_create_child(dir, file, ResourceKind::Bits)
            .unwrap();
        ns.put_resource(&parent);
        assert_eq!(ns.resource_count(), 2);
        assert_eq!(ns.resource_snapshot(dir).unwrap().children, vec![file]);

        ns.put_resource(&child);
        assert_eq!(ns.resource_count(), 0);
    }

    #[test]
    fn test_covering_ancestor_lock() {
        let (ns, _worker) = namespace("mdt0");
        let dir = ResourceId::new(3, 1);
        let file = ResourceId::new(3, 2);
        let me = owner(7);

        let dir_lock = granted(&ns, dir, LockMode::Pw, 7);
        let child = ns
            .get_or_create_child(dir, file, ResourceKind::Plain)
            .unwrap();

        assert_eq!(ns.covering_ancestor_lock(file, me, LockMode::Pr), Some(dir_lock));
        assert_eq!(ns.covering_ancestor_lock(file, me, LockMode::Ex), None);
        assert_eq!(ns.covering_ancestor_lock(file, owner(8), LockMode::Pr), None);
        ns.put_resource(&child);
    }

    #[test]
    fn test_rehome_moves_compatible_lock() {
        let (ns, _worker) = namespace("mdt0");
        let a = ResourceId::new(4, 1);
        let b = ResourceId::new(4, 2);
        let h = granted(&ns, a, LockMode::Pr, 1);
        granted(&ns, b, LockMode::Pr, 2);

        ns.rehome(h, b).unwrap();
        assert_eq!(ns.lock_info(h).unwrap().resource, b);
        assert!(ns.resource_snapshot(a).is_none());
        assert_eq!(ns.resource_snapshot(b).unwrap().granted.len(), 2);
        assert_eq!(ns.resource_snapshot(b).unwrap().refcount, 2);
    }

    #[test]
    fn test_rehome_rejects_conflict() {
        let (ns, _worker) = namespace("mdt0");
        let a = ResourceId::new(5, 1);
        let b = ResourceId::new(5, 2);
        let h = granted(&ns, a, LockMode::Ex, 1);
        granted(&ns, b, LockMode::Pr, 2);

        assert!(matches!(ns.rehome(h, b), Err(DlmError::Invalid(_))));
        assert_eq!(ns.lock_info(h).unwrap().resource, a);
        assert_eq!(ns.resource_snapshot(b).unwrap().refcount, 1);
    }

    #[test]
    fn test_cancel_follows_rehomed_lock() {
        let (ns, _worker) = namespace("mdt0");
        let homes = [ResourceId::new(7, 1), ResourceId::new(7, 2)];
        for pid in 0..200 {
            let h = granted(&ns, homes[0], LockMode::Pr, pid);
            std::thread::scope(|s| {
                s.spawn(|| {
                    for target in homes.iter().cycle().skip(1).take(8) {
                        if ns.rehome(h, *target).is_err() {
                            break;
                        }
                    }
                });
                std::thread::yield_now();
                assert!(ns.cancel(h), "lock {} reported gone while live", h);
            });
            assert!(ns.lock_info(h).is_none());
        }
        assert_eq!(ns.live_locks(), 0);
        assert_eq!(ns.resource_count(), 0);
    }

    #[test]
    fn test_iteration_and_cancel_all() {
        let (ns, _worker) = namespace("mdt0");
        let res = ResourceId::new(6, 1);
        granted(&ns, res, LockMode::Pr, 1);
        granted(&ns, res, LockMode::Pr, 2);
        granted(&ns, ResourceId::new(6, 2), LockMode::Ex, 3);

        let mut seen = 0;
        ns.for_each_resource(|_| seen += 1);
        assert_eq!(seen, 2);

        let mut owners = Vec::new();
        assert_eq!(ns.for_each_lock(res, |l| owners.push(l.owner.pid)), 2);
        owners.sort_unstable();
        assert_eq!(owners, vec![1, 2]);

        assert_eq!(ns.cancel_all(), 3);
        assert_eq!(ns.stats().locks, 0);
        assert_eq!(ns.resource_count(), 0);
    }
}
