// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Extent locks: byte ranges over an object, used for data caching.
//!
//! GROUP locks share only with locks of the same group id. A grantable
//! request is widened to the largest range that stays clear of every
//! incompatible lock, so one round trip covers future I/O nearby.

use crate::domain::error::DlmError;
use crate::domain::lock::{ByteRange, Lock, LockFlags, PolicyData};
use crate::domain::mode::LockMode;
use crate::domain::policy::{wrong_kind, LockPolicy};
use crate::domain::resource::{ResourceKind, ResourceState};

#[derive(Debug, Default, Clone, Copy)]
pub struct ExtentPolicy;

fn extent_of(data: &PolicyData) -> Option<(ByteRange, u64)> {
    match data {
        PolicyData::Extent { range, gid } => Some((*range, *gid)),
        _ => None,
    }
}

impl ExtentPolicy {
    fn modes_clash(&self, a: LockMode, a_gid: u64, b: LockMode, b_gid: u64) -> bool {
        if a == LockMode::Group && b == LockMode::Group {
            return a_gid != b_gid;
        }
        !a.is_compatible(b)
    }
}

impl LockPolicy for ExtentPolicy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Extent
    }

    fn validate(&self, mode: LockMode, data: &PolicyData, _flags: LockFlags) -> Result<(), DlmError> {
        let Some((_, gid)) = extent_of(data) else {
            return Err(wrong_kind(self.kind(), data));
        };
        if mode == LockMode::Group && gid == 0 {
            return Err(DlmError::invalid("group extent lock without a group id"));
        }
        Ok(())
    }

    fn blocks(&self, other: &Lock, other_mode: LockMode, req: &Lock) -> bool {
        let (Some((held, held_gid)), Some((wanted, wanted_gid))) =
            (extent_of(&other.policy), extent_of(&req.policy))
        else {
            return false;
        };
        self.modes_clash(other_mode, held_gid, req.requested_mode, wanted_gid)
            && held.overlaps(&wanted)
    }

    fn covers(&self, held: &PolicyData, wanted: &PolicyData) -> bool {
        match (extent_of(held), extent_of(wanted)) {
            (Some((held, held_gid)), Some((wanted, wanted_gid))) => {
                held_gid == wanted_gid && held.contains(&wanted)
            }
            _ => false,
        }
    }

    fn expand(&self, res: &ResourceState, req: &Lock) -> Option<PolicyData> {
        if req.flags.contains(LockFlags::NO_EXPANSION) || req.requested_mode == LockMode::Group {
            return None;
        }
        let (wanted, gid) = extent_of(&req.policy)?;

        let mut start = 0;
        let mut end = ByteRange::EOF;
        let others = res
            .holders()
            .filter_map(|l| l.held_mode().map(|m| (l, m)))
            .chain(
                res.waiting
                    .iter()
                    .chain(res.converting.iter())
                    .filter_map(|h| res.lock(*h))
                    .map(|l| (l, l.requested_mode)),
            );
        for (other, mode) in others {
            if other.handle == req.handle {
                continue;
            }
            let Some((range, other_gid)) = extent_of(&other.policy) else {
                continue;
            };
            if !self.modes_clash(mode, other_gid, req.requested_mode, gid) {
                continue;
            }
            if range.overlaps(&wanted) {
                return None;
            }
            if range.end <= wanted.start {
                start = start.max(range.end);
            } else {
                end = end.min(range.start);
            }
        }

        let grown = ByteRange { start, end };
        (grown != wanted).then_some(PolicyData::Extent { range: grown, gid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock::{ExportId, LockOwner};
    use crate::domain::policy::test_support::{grant, lock};
    use crate::domain::resource::ResourceId;

    fn ext(start: u64, end: u64) -> PolicyData {
        PolicyData::Extent {
            range: ByteRange::new(start, end).unwrap(),
            gid: 0,
        }
    }

    #[test]
    fn test_extent_overlap_conflicts() {
        let a = LockOwner::new(1, ExportId::new());
        let b = LockOwner::new(2, ExportId::new());
        let mut st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Extent, None);
        grant(&mut st, lock(1, a, LockMode::Pw, ext(0, 100)));

        let disjoint = lock(2, b, LockMode::Pw, ext(100, 200));
        assert!(ExtentPolicy.conflicts(&st, &disjoint, &[]).is_empty());

        let overlapping = lock(3, b, LockMode::Pr, ext(50, 150));
        assert_eq!(ExtentPolicy.conflicts(&st, &overlapping, &[]).len(), 1);
    }

    #[test]
    fn test_group_locks_share_by_gid() {
        let a = LockOwner::new(1, ExportId::new());
        let b = LockOwner::new(2, ExportId::new());
        let group = |gid| PolicyData::Extent {
            range: ByteRange::whole(),
            gid,
        };
        let mut st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Extent, None);
        grant(&mut st, lock(1, a, LockMode::Group, group(7)));

        let same = lock(2, b, LockMode::Group, group(7));
        assert!(ExtentPolicy.conflicts(&st, &same, &[]).is_empty());

        let other = lock(3, b, LockMode::Group, group(8));
        assert_eq!(ExtentPolicy.conflicts(&st, &other, &[]).len(), 1);

        assert!(ExtentPolicy
            .validate(LockMode::Group, &group(0), LockFlags::empty())
            .is_err());
    }

    #[test]
    fn test_expansion_stops_at_incompatible_neighbours() {
        let a = LockOwner::new(1, ExportId::new());
        let b = LockOwner::new(2, ExportId::new());
        let mut st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Extent, None);
        grant(&mut st, lock(1, a, LockMode::Pw, ext(0, 100)));
        grant(&mut st, lock(2, a, LockMode::Pw, ext(1000, 2000)));
        grant(&mut st, lock(3, a, LockMode::Pr, ext(500, 600)));

        let req = lock(4, b, LockMode::Pr, ext(200, 300));
        let grown = ExtentPolicy.expand(&st, &req).unwrap();
        assert_eq!(grown.range(), Some(ByteRange::new(100, 1000).unwrap()));
    }

    #[test]
    fn test_no_expansion_flag_respected() {
        let b = LockOwner::new(2, ExportId::new());
        let st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Extent, None);
        let mut req = lock(4, b, LockMode::Pr, ext(200, 300));
        assert_eq!(
            ExtentPolicy.expand(&st, &req).and_then(|d| d.range()),
            Some(ByteRange::whole())
        );
        req.flags.insert(LockFlags::NO_EXPANSION);
        assert!(ExtentPolicy.expand(&st, &req).is_none());
    }
}
