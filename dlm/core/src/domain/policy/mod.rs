// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lock Policies
//!
//! Each resource kind plugs a [`LockPolicy`] into the generic lock core. The
//! core owns queueing, granting, ASTs and reprocessing; a policy only answers
//! kind-specific questions:
//!
//! | Question | Method |
//! |----------|--------|
//! | Is this request well formed? | [`LockPolicy::validate`] |
//! | Does lock A block request B? | [`LockPolicy::blocks`] |
//! | May the grant be widened? | [`LockPolicy::expand`] |
//! | What must change among the owner's locks on grant? | [`LockPolicy::plan_grant`] |
//! | Does a cached lock satisfy a new need? | [`LockPolicy::covers`] |
//!
//! | Kind | Policy |
//! |------|--------|
//! | `Plain` | [`plain::PlainPolicy`] |
//! | `Extent` | [`extent::ExtentPolicy`] |
//! | `Flock` | [`flock::FlockPolicy`] |
//! | `Bits` | [`bits::BitsPolicy`] |

pub mod bits;
pub mod extent;
pub mod flock;
pub mod plain;

use crate::domain::error::DlmError;
use crate::domain::lock::{ByteRange, Lock, LockFlags, LockHandle, PolicyData};
use crate::domain::mode::LockMode;
use crate::domain::resource::{ResourceKind, ResourceState};

pub use flock::FlockWaitTable;

/// Mutations a grant requires among already-granted locks, computed in full
/// before any of them is applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GrantPlan {
    /// Granted locks that disappear (merged into the request or fully covered).
    pub destroy: Vec<LockHandle>,
    /// Granted locks whose range shrinks.
    pub resize: Vec<(LockHandle, ByteRange)>,
    /// New residual locks, each a copy of the named lock over a new range.
    pub split: Vec<(LockHandle, ByteRange)>,
    /// Final range of the request, when merging changed it.
    pub request_range: Option<ByteRange>,
    /// The request itself is not kept (flock unlock).
    pub discard_request: bool,
}

impl GrantPlan {
    /// Lock records the plan needs to allocate.
    pub fn new_locks(&self) -> usize {
        self.split.len()
    }

    pub fn is_noop(&self) -> bool {
        self.destroy.is_empty()
            && self.resize.is_empty()
            && self.split.is_empty()
            && self.request_range.is_none()
            && !self.discard_request
    }
}

pub trait LockPolicy: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn validate(&self, mode: LockMode, data: &PolicyData, flags: LockFlags) -> Result<(), DlmError>;

    /// Whether `other`, holding or requesting `other_mode`, blocks `req`.
    fn blocks(&self, other: &Lock, other_mode: LockMode, req: &Lock) -> bool;

    /// Whether a cached lock with `held` data satisfies a request for `wanted`.
    fn covers(&self, held: &PolicyData, wanted: &PolicyData) -> bool;

    /// Earlier waiters count as conflicts (FIFO fairness).
    fn checks_waiters(&self) -> bool {
        true
    }

    /// Conflicting holders are asked to release via blocking ASTs.
    fn sends_blocking_asts(&self) -> bool {
        true
    }

    /// Blocked requests are entered into the namespace wait table and checked
    /// for deadlock.
    fn tracks_waiters(&self) -> bool {
        false
    }

    /// `TEST_LOCK` queries are meaningful for this kind.
    fn supports_test(&self) -> bool {
        false
    }

    /// Widened policy data for a grantable request, if any.
    fn expand(&self, _res: &ResourceState, _req: &Lock) -> Option<PolicyData> {
        None
    }

    fn plan_grant(&self, _res: &ResourceState, _req: &Lock) -> GrantPlan {
        GrantPlan::default()
    }

    /// Every lock that stands in the way of `req`: holders first, then the
    /// `ahead` waiters when this kind is fair.
    fn conflicts(&self, res: &ResourceState, req: &Lock, ahead: &[LockHandle]) -> Vec<LockHandle> {
        let mut found = Vec::new();
        for other in res.holders() {
            if other.handle == req.handle {
                continue;
            }
            if let Some(mode) = other.held_mode() {
                if self.blocks(other, mode, req) {
                    found.push(other.handle);
                }
            }
        }
        if self.checks_waiters() {
            for handle in ahead {
                if *handle == req.handle || found.contains(handle) {
                    continue;
                }
                if let Some(other) = res.lock(*handle) {
                    if self.blocks(other, other.requested_mode, req) {
                        found.push(other.handle);
                    }
                }
            }
        }
        found
    }
}

static PLAIN: plain::PlainPolicy = plain::PlainPolicy;
static EXTENT: extent::ExtentPolicy = extent::ExtentPolicy;
static FLOCK: flock::FlockPolicy = flock::FlockPolicy;
static BITS: bits::BitsPolicy = bits::BitsPolicy;

pub fn policy_for(kind: ResourceKind) -> &'static dyn LockPolicy {
    match kind {
        ResourceKind::Plain => &PLAIN,
        ResourceKind::Extent => &EXTENT,
        ResourceKind::Flock => &FLOCK,
        ResourceKind::Bits => &BITS,
    }
}

pub(crate) fn wrong_kind(expected: ResourceKind, data: &PolicyData) -> DlmError {
    DlmError::invalid(format!(
        "{} policy data on a {} resource",
        data.kind(),
        expected
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::ast::NoopAstTarget;
    use crate::domain::lock::{LockOwner, LockState};
    use crate::domain::resource::ResourceId;
    use std::sync::Arc;

    pub fn lock(handle: u64, owner: LockOwner, mode: LockMode, data: PolicyData) -> Lock {
        Lock::new(
            LockHandle(handle),
            ResourceId::new(1, 1),
            owner,
            mode,
            data,
            LockFlags::empty(),
            Arc::new(NoopAstTarget),
        )
    }

    pub fn grant(st: &mut ResourceState, mut lock: Lock) {
        let handle = lock.handle;
        lock.granted_mode = Some(lock.requested_mode);
        lock.set_state(LockState::Granted);
        st.attach(lock);
        st.insert_granted(handle);
        st.refcount += 1;
    }
}
