// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # POSIX Byte-Range Locks
//!
//! Flock locks are scoped to an owner (`pid` on an export). A request only
//! conflicts with *other* owners' locks; its overlap with the owner's own
//! locks is reconciled on grant:
//!
//! - same mode, overlapping or adjacent: merged into one lock;
//! - different mode, overlapping: the old lock is trimmed, and split in two
//!   when the request lands strictly inside it.
//!
//! Reconciliation is computed as a [`GrantPlan`] against the current queue
//! before anything changes, so a failed allocation leaves every lock intact.
//!
//! Waiters are recorded in a [`FlockWaitTable`] so that a request closing a
//! cycle of owners waiting on each other is refused with `Deadlock`.

use std::collections::{HashMap, HashSet};

use crate::domain::error::DlmError;
use crate::domain::lock::{ByteRange, Lock, LockFlags, LockHandle, LockOwner, LockState, PolicyData};
use crate::domain::mode::LockMode;
use crate::domain::policy::{wrong_kind, GrantPlan, LockPolicy};
use crate::domain::resource::{ResourceKind, ResourceState};

#[derive(Debug, Default, Clone, Copy)]
pub struct FlockPolicy;

impl LockPolicy for FlockPolicy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Flock
    }

    fn validate(&self, mode: LockMode, data: &PolicyData, _flags: LockFlags) -> Result<(), DlmError> {
        if !matches!(data, PolicyData::Flock { .. }) {
            return Err(wrong_kind(self.kind(), data));
        }
        match mode {
            LockMode::Pr | LockMode::Pw | LockMode::Ex | LockMode::Nl => Ok(()),
            other => Err(DlmError::invalid(format!("{} is not a flock mode", other))),
        }
    }

    fn blocks(&self, other: &Lock, other_mode: LockMode, req: &Lock) -> bool {
        if other.owner == req.owner || other_mode.is_compatible(req.requested_mode) {
            return false;
        }
        match (other.range(), req.range()) {
            (Some(held), Some(wanted)) => held.overlaps(&wanted),
            _ => false,
        }
    }

    fn covers(&self, _held: &PolicyData, _wanted: &PolicyData) -> bool {
        false
    }

    fn checks_waiters(&self) -> bool {
        false
    }

    fn sends_blocking_asts(&self) -> bool {
        false
    }

    fn tracks_waiters(&self) -> bool {
        true
    }

    fn supports_test(&self) -> bool {
        true
    }

    fn plan_grant(&self, res: &ResourceState, req: &Lock) -> GrantPlan {
        let mut plan = GrantPlan::default();
        let Some(wanted) = req.range() else {
            return plan;
        };
        let mode = req.requested_mode;
        let unlock = mode == LockMode::Nl;

        let mut own: Vec<&Lock> = res
            .granted
            .iter()
            .filter_map(|h| res.lock(*h))
            .filter(|l| l.owner == req.owner && l.handle != req.handle && l.state == LockState::Granted)
            .collect();
        own.sort_by_key(|l| l.range().map(|r| r.start));

        // Grow to a fixed point: absorbing one neighbour can make the next
        // one adjacent.
        let mut merged = wanted;
        let mut absorbed: HashSet<LockHandle> = HashSet::new();
        if !unlock {
            loop {
                let mut grew = false;
                for l in &own {
                    if absorbed.contains(&l.handle) || l.granted_mode != Some(mode) {
                        continue;
                    }
                    let Some(range) = l.range() else {
                        continue;
                    };
                    if range.touches(&merged) {
                        merged = merged.union(&range);
                        absorbed.insert(l.handle);
                        grew = true;
                    }
                }
                if !grew {
                    break;
                }
            }
        }

        for l in &own {
            if absorbed.contains(&l.handle) {
                plan.destroy.push(l.handle);
                continue;
            }
            let Some(range) = l.range() else {
                continue;
            };
            if !range.overlaps(&merged) {
                continue;
            }
            match range.subtract(&merged).as_slice() {
                [] => plan.destroy.push(l.handle),
                [rest] => plan.resize.push((l.handle, *rest)),
                [below, above, ..] => {
                    plan.resize.push((l.handle, *below));
                    plan.split.push((l.handle, *above));
                }
            }
        }

        if merged != wanted {
            plan.request_range = Some(merged);
        }
        plan.discard_request = unlock;
        plan
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitEdge {
    owner: LockOwner,
    blocked_on: LockOwner,
}

/// Namespace-wide record of blocked flock requests, as owner → owner edges.
#[derive(Debug, Default)]
pub struct FlockWaitTable {
    edges: HashMap<LockHandle, WaitEdge>,
}

impl FlockWaitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would `requester` waiting on `blocker` close a cycle?
    pub fn would_deadlock(&self, requester: LockOwner, blocker: LockOwner) -> bool {
        let mut stack = vec![blocker];
        let mut seen = HashSet::new();
        while let Some(owner) = stack.pop() {
            if owner == requester {
                return true;
            }
            if !seen.insert(owner) {
                continue;
            }
            stack.extend(
                self.edges
                    .values()
                    .filter(|e| e.owner == owner)
                    .map(|e| e.blocked_on),
            );
        }
        false
    }

    /// Record or refresh the edge for a waiting request.
    pub fn insert(&mut self, handle: LockHandle, owner: LockOwner, blocked_on: LockOwner) {
        self.edges.insert(handle, WaitEdge { owner, blocked_on });
    }

    pub fn remove(&mut self, handle: LockHandle) -> bool {
        self.edges.remove(&handle).is_some()
    }


    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock::ExportId;
    use crate::domain::policy::test_support::{grant, lock};
    use crate::domain::resource::ResourceId;

    fn fl(start: u64, end: u64) -> PolicyData {
        PolicyData::Flock {
            range: ByteRange::new(start, end).unwrap(),
        }
    }

    fn r(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    fn state() -> ResourceState {
        ResourceState::new(ResourceId::new(1, 1), ResourceKind::Flock, None)
    }

    #[test]
    fn test_same_owner_never_conflicts() {
        let p = LockOwner::new(1, ExportId::new());
        let mut st = state();
        grant(&mut st, lock(1, p, LockMode::Ex, fl(0, 100)));
        let req = lock(2, p, LockMode::Ex, fl(0, 100));
        assert!(FlockPolicy.conflicts(&st, &req, &[]).is_empty());
    }

    #[test]
    fn test_same_pid_on_other_export_conflicts() {
        let p = LockOwner::new(1, ExportId::new());
        let q = LockOwner::new(1, ExportId::new());
        let mut st = state();
        grant(&mut st, lock(1, p, LockMode::Ex, fl(0, 100)));
        let req = lock(2, q, LockMode::Pr, fl(50, 60));
        assert_eq!(FlockPolicy.conflicts(&st, &req, &[]), vec![LockHandle(1)]);
    }

    #[test]
    fn test_plan_merges_overlapping_and_adjacent() {
        let p = LockOwner::new(1, ExportId::new());
        let mut st = state();
        grant(&mut st, lock(1, p, LockMode::Pr, fl(0, 100)));
        grant(&mut st, lock(2, p, LockMode::Pr, fl(150, 200)));
        grant(&mut st, lock(3, p, LockMode::Pr, fl(300, 400)));

        let req = lock(9, p, LockMode::Pr, fl(50, 150));
        let plan = FlockPolicy.plan_grant(&st, &req);
        assert_eq!(plan.request_range, Some(r(0, 200)));
        assert_eq!(plan.destroy, vec![LockHandle(1), LockHandle(2)]);
        assert!(plan.resize.is_empty());
        assert!(plan.split.is_empty());
    }

    #[test]
    fn test_plan_splits_enclosing_lock_of_other_mode() {
        let p = LockOwner::new(1, ExportId::new());
        let mut st = state();
        grant(&mut st, lock(1, p, LockMode::Pr, fl(0, 200)));

        let req = lock(9, p, LockMode::Ex, fl(50, 100));
        let plan = FlockPolicy.plan_grant(&st, &req);
        assert_eq!(plan.resize, vec![(LockHandle(1), r(0, 50))]);
        assert_eq!(plan.split, vec![(LockHandle(1), r(100, 200))]);
        assert_eq!(plan.new_locks(), 1);
        assert!(plan.request_range.is_none());
        assert!(!plan.discard_request);
    }

    #[test]
    fn test_plan_trims_and_drops_covered_locks() {
        let p = LockOwner::new(1, ExportId::new());
        let mut st = state();
        grant(&mut st, lock(1, p, LockMode::Pr, fl(0, 60)));
        grant(&mut st, lock(2, p, LockMode::Pr, fl(70, 80)));
        grant(&mut st, lock(3, p, LockMode::Pr, fl(90, 200)));

        let req = lock(9, p, LockMode::Pw, fl(50, 100));
        let plan = FlockPolicy.plan_grant(&st, &req);
        assert_eq!(plan.destroy, vec![LockHandle(2)]);
        assert_eq!(
            plan.resize,
            vec![(LockHandle(1), r(0, 50)), (LockHandle(3), r(100, 200))]
        );
        assert!(plan.split.is_empty());
    }

    #[test]
    fn test_unlock_carves_without_merging() {
        let p = LockOwner::new(1, ExportId::new());
        let mut st = state();
        grant(&mut st, lock(1, p, LockMode::Pr, fl(0, 100)));

        let req = lock(9, p, LockMode::Nl, fl(100, 200));
        let plan = FlockPolicy.plan_grant(&st, &req);
        assert!(plan.destroy.is_empty());
        assert!(plan.resize.is_empty());
        assert!(plan.discard_request);

        let req = lock(10, p, LockMode::Nl, fl(0, 100));
        assert_eq!(FlockPolicy.plan_grant(&st, &req).destroy, vec![LockHandle(1)]);
    }

    #[test]
    fn test_wait_table_detects_cycles() {
        let a = LockOwner::new(1, ExportId::new());
        let b = LockOwner::new(2, ExportId::new());
        let c = LockOwner::new(3, ExportId::new());
        let mut table = FlockWaitTable::new();

        table.insert(LockHandle(1), a, b);
        assert!(table.would_deadlock(b, a));
        assert!(!table.would_deadlock(c, a));

        table.insert(LockHandle(2), b, c);
        assert!(table.would_deadlock(c, a));

        assert!(table.remove(LockHandle(2)));
        assert!(!table.would_deadlock(c, a));
        assert!(!table.remove(LockHandle(2)));
        assert!(table.would_deadlock(b, a));
    }
}
