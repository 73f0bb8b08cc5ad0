// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Plain locks: whole-resource, mode compatibility only.

use crate::domain::error::DlmError;
use crate::domain::lock::{Lock, LockFlags, PolicyData};
use crate::domain::mode::LockMode;
use crate::domain::policy::{wrong_kind, LockPolicy};
use crate::domain::resource::ResourceKind;

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPolicy;

impl LockPolicy for PlainPolicy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Plain
    }

    fn validate(&self, _mode: LockMode, data: &PolicyData, _flags: LockFlags) -> Result<(), DlmError> {
        if !matches!(data, PolicyData::Plain) {
            return Err(wrong_kind(self.kind(), data));
        }
        Ok(())
    }

    fn blocks(&self, _other: &Lock, other_mode: LockMode, req: &Lock) -> bool {
        !other_mode.is_compatible(req.requested_mode)
    }

    fn covers(&self, _held: &PolicyData, _wanted: &PolicyData) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock::{ExportId, LockOwner};
    use crate::domain::policy::test_support::{grant, lock};
    use crate::domain::resource::{ResourceId, ResourceState};

    #[test]
    fn test_plain_conflicts_follow_matrix() {
        let a = LockOwner::new(1, ExportId::new());
        let b = LockOwner::new(2, ExportId::new());
        let mut st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Plain, None);
        grant(&mut st, lock(1, a, LockMode::Pr, PolicyData::Plain));

        let reader = lock(2, b, LockMode::Pr, PolicyData::Plain);
        assert!(PlainPolicy.conflicts(&st, &reader, &[]).is_empty());

        let writer = lock(3, b, LockMode::Pw, PolicyData::Plain);
        assert_eq!(PlainPolicy.conflicts(&st, &writer, &[]).len(), 1);
    }

    #[test]
    fn test_plain_waiters_ahead_block_newcomers() {
        let a = LockOwner::new(1, ExportId::new());
        let mut st = ResourceState::new(ResourceId::new(1, 1), ResourceKind::Plain, None);
        st.attach(lock(1, a, LockMode::Ex, PolicyData::Plain));
        st.waiting.push(crate::domain::lock::LockHandle(1));

        let reader = lock(2, a, LockMode::Pr, PolicyData::Plain);
        let ahead = st.waiting.clone();
        assert_eq!(PlainPolicy.conflicts(&st, &reader, &ahead).len(), 1);
    }

    #[test]
    fn test_plain_rejects_foreign_data() {
        let err = PlainPolicy
            .validate(LockMode::Pr, &PolicyData::Bits { bits: 1 }, LockFlags::empty())
            .unwrap_err();
        assert!(matches!(err, DlmError::Invalid(_)));
    }
}
