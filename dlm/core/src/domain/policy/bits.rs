// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Inode-bits locks: one resource, independently lockable bit groups
//! (lookup, update, layout, ...). Two locks conflict only when their modes
//! are incompatible and their masks share a bit.

use crate::domain::error::DlmError;
use crate::domain::lock::{Lock, LockFlags, PolicyData};
use crate::domain::mode::LockMode;
use crate::domain::policy::{wrong_kind, LockPolicy};
use crate::domain::resource::ResourceKind;

pub const BIT_LOOKUP: u64 = 0x01;
pub const BIT_UPDATE: u64 = 0x02;
pub const BIT_OPEN: u64 = 0x04;
pub const BIT_LAYOUT: u64 = 0x08;
pub const BIT_PERM: u64 = 0x10;
pub const BIT_XATTR: u64 = 0x20;

#[derive(Debug, Default, Clone, Copy)]
pub struct BitsPolicy;

fn bits_of(data: &PolicyData) -> u64 {
    match data {
        PolicyData::Bits { bits } => *bits,
        _ => 0,
    }
}

impl LockPolicy for BitsPolicy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Bits
    }

    fn validate(&self, _mode: LockMode, data: &PolicyData, _flags: LockFlags) -> Result<(), DlmError> {
        match data {
            PolicyData::Bits { bits: 0 } => Err(DlmError::invalid("empty inode bit mask")),
            PolicyData::Bits { .. } => Ok(()),
            other => Err(wrong_kind(self.kind(), other)),
        }
    }

    fn blocks(&self, other: &Lock, other_mode: LockMode, req: &Lock) -> bool {
        !other_mode.is_compatible(req.requested_mode)
            && bits_of(&other.policy) & bits_of(&req.policy) != 0
    }

    fn covers(&self, held: &PolicyData, wanted: &PolicyData) -> bool {
        let wanted = bits_of(wanted);
        wanted != 0 && bits_of(held) & wanted == wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock::{ExportId, LockOwner};
    use crate::domain::policy::test_support::{grant, lock};
    use crate::domain::resource::{ResourceId, ResourceState};

    #[test]
    fn test_disjoint_bits_do_not_conflict() {
        let a = LockOwner::new(1, ExportId::new());
        let b = LockOwner::new(2, ExportId::new());
        let mut st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Bits, None);
        grant(
            &mut st,
            lock(1, a, LockMode::Ex, PolicyData::Bits { bits: BIT_UPDATE }),
        );

        let lookup = lock(2, b, LockMode::Ex, PolicyData::Bits { bits: BIT_LOOKUP });
        assert!(BitsPolicy.conflicts(&st, &lookup, &[]).is_empty());

        let both = lock(
            3,
            b,
            LockMode::Pr,
            PolicyData::Bits {
                bits: BIT_LOOKUP | BIT_UPDATE,
            },
        );
        assert_eq!(BitsPolicy.conflicts(&st, &both, &[]).len(), 1);
    }

    #[test]
    fn test_bits_cover_subset_only() {
        let held = PolicyData::Bits {
            bits: BIT_LOOKUP | BIT_UPDATE,
        };
        assert!(BitsPolicy.covers(&held, &PolicyData::Bits { bits: BIT_LOOKUP }));
        assert!(!BitsPolicy.covers(&held, &PolicyData::Bits { bits: BIT_LAYOUT }));
    }

    #[test]
    fn test_empty_mask_is_invalid() {
        assert!(BitsPolicy
            .validate(LockMode::Pr, &PolicyData::Bits { bits: 0 }, LockFlags::empty())
            .is_err());
    }
}
