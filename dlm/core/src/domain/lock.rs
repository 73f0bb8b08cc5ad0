// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lock Records
//!
//! A [`Lock`] is one grant or in-flight request against a resource. Locks are
//! owned by their resource's arena and referenced everywhere else by
//! [`LockHandle`], a stable opaque cookie.
//!
//! ## State Machine
//!
//! ```text
//! Requested ──► Granted ──► Converting ──► Granted
//!     │            │             │
//!     └─► Waiting ─┴──► Cancelling ──► Destroyed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::ast::AstTarget;
use crate::domain::error::DlmError;
use crate::domain::mode::LockMode;
use crate::domain::resource::{ResourceId, ResourceKind};

/// Opaque, namespace-unique lock cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockHandle(pub u64);

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of the remote endpoint (client export) a lock was granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportId(pub Uuid);

impl ExportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The export used for locks taken by the local host itself.
    pub fn local() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for ExportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who holds a lock: a process on a given export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub export: ExportId,
}

impl LockOwner {
    pub fn new(pid: u32, export: ExportId) -> Self {
        Self { pid, export }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.export)
    }
}

/// Half-open byte range `[start, end)`. `end == EOF` means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub const EOF: u64 = u64::MAX;

    pub fn new(start: u64, end: u64) -> Result<Self, DlmError> {
        if start >= end {
            return Err(DlmError::invalid(format!(
                "empty byte range [{}, {})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub const fn whole() -> Self {
        Self {
            start: 0,
            end: Self::EOF,
        }
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or directly adjacent.
    pub fn touches(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn union(&self, other: &ByteRange) -> ByteRange {
        ByteRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// What remains of `self` once `cut` is removed: up to two pieces, lower
    /// piece first.
    pub fn subtract(&self, cut: &ByteRange) -> Vec<ByteRange> {
        if !self.overlaps(cut) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.start < cut.start {
            pieces.push(ByteRange {
                start: self.start,
                end: cut.start,
            });
        }
        if cut.end < self.end {
            pieces.push(ByteRange {
                start: cut.end,
                end: self.end,
            });
        }
        pieces
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == Self::EOF {
            write!(f, "[{}, EOF)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// Kind-specific lock data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyData {
    Plain,
    Extent { range: ByteRange, gid: u64 },
    Flock { range: ByteRange },
    Bits { bits: u64 },
}

impl PolicyData {
    pub fn kind(&self) -> ResourceKind {
        match self {
            PolicyData::Plain => ResourceKind::Plain,
            PolicyData::Extent { .. } => ResourceKind::Extent,
            PolicyData::Flock { .. } => ResourceKind::Flock,
            PolicyData::Bits { .. } => ResourceKind::Bits,
        }
    }

    pub fn range(&self) -> Option<ByteRange> {
        match self {
            PolicyData::Extent { range, .. } | PolicyData::Flock { range } => Some(*range),
            _ => None,
        }
    }

    pub(crate) fn set_range(&mut self, new_range: ByteRange) {
        match self {
            PolicyData::Extent { range, .. } | PolicyData::Flock { range } => *range = new_range,
            _ => {}
        }
    }
}

/// Request and lock flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockFlags(u32);

impl LockFlags {
    /// Fail with `WouldBlock` instead of queueing.
    pub const BLOCK_NOWAIT: LockFlags = LockFlags(0x0001);
    /// Flock query: report the first conflict, never grant.
    pub const TEST_LOCK: LockFlags = LockFlags(0x0002);
    /// Do not grow an extent request beyond what was asked for.
    pub const NO_EXPANSION: LockFlags = LockFlags(0x0004);
    /// A blocking AST has already been sent for this lock.
    pub const AST_SENT: LockFlags = LockFlags(0x0100);
    /// A blocking AST was received: cancel as soon as the lock is idle.
    pub const CB_PENDING: LockFlags = LockFlags(0x0200);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: LockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LockFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: LockFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for LockFlags {
    type Output = LockFlags;

    fn bitor(self, rhs: LockFlags) -> LockFlags {
        LockFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Requested,
    Granted,
    Waiting,
    Converting,
    Cancelling,
    Destroyed,
}

impl LockState {
    /// Holds its granted mode (granted or mid-conversion).
    pub fn is_held(self) -> bool {
        matches!(self, LockState::Granted | LockState::Converting)
    }
}

/// Snapshot of a lock, safe to hand to other hosts or components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDesc {
    pub handle: LockHandle,
    pub resource: ResourceId,
    pub owner: LockOwner,
    pub requested_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub policy: PolicyData,
    pub state: LockState,
}

/// The answer to a `TEST_LOCK` query: the first conflicting lock, or mode NL
/// with the queried range when nothing conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub mode: LockMode,
    pub owner: LockOwner,
    pub range: ByteRange,
}

pub struct Lock {
    pub handle: LockHandle,
    pub resource: ResourceId,
    pub owner: LockOwner,
    pub requested_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub policy: PolicyData,
    pub flags: LockFlags,
    pub state: LockState,
    pub readers: u32,
    pub writers: u32,
    /// Flock waiters: owner of the first lock this request is blocked on.
    pub blocking_owner: Option<LockOwner>,
    /// Where ASTs for this lock go; fixed at creation.
    pub ast: Arc<dyn AstTarget>,
    state_tx: watch::Sender<LockState>,
}

impl Lock {
    pub fn new(
        handle: LockHandle,
        resource: ResourceId,
        owner: LockOwner,
        mode: LockMode,
        policy: PolicyData,
        flags: LockFlags,
        ast: Arc<dyn AstTarget>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LockState::Requested);
        Self {
            handle,
            resource,
            owner,
            requested_mode: mode,
            granted_mode: None,
            policy,
            flags,
            state: LockState::Requested,
            readers: 0,
            writers: 0,
            blocking_owner: None,
            ast,
            state_tx,
        }
    }

    /// A copy of this granted lock covering `range`, used for split residuals.
    pub(crate) fn residual(&self, handle: LockHandle, range: ByteRange) -> Lock {
        let mut policy = self.policy;
        policy.set_range(range);
        let mut lock = Lock::new(
            handle,
            self.resource,
            self.owner,
            self.requested_mode,
            policy,
            LockFlags::empty(),
            self.ast.clone(),
        );
        lock.granted_mode = self.granted_mode;
        lock.set_state(LockState::Granted);
        lock
    }

    pub fn set_state(&mut self, state: LockState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state_tx.subscribe()
    }

    pub fn users(&self) -> u32 {
        self.readers + self.writers
    }

    pub fn add_user(&mut self, mode: LockMode) {
        if mode.is_write() {
            self.writers += 1;
        } else {
            self.readers += 1;
        }
    }

    /// Drop one user reference; returns the users left.
    pub fn remove_user(&mut self, mode: LockMode) -> u32 {
        if mode.is_write() {
            self.writers = self.writers.saturating_sub(1);
        } else {
            self.readers = self.readers.saturating_sub(1);
        }
        self.users()
    }

    /// Re-file existing user references under `mode` after a conversion.
    pub(crate) fn rebalance_users(&mut self, mode: LockMode) {
        let users = self.users();
        if mode.is_write() {
            self.writers = users;
            self.readers = 0;
        } else {
            self.readers = users;
            self.writers = 0;
        }
    }

    /// Mode this lock currently holds against others, if any.
    pub fn held_mode(&self) -> Option<LockMode> {
        if self.state.is_held() {
            self.granted_mode
        } else {
            None
        }
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.policy.range()
    }

    pub fn describe(&self) -> LockDesc {
        LockDesc {
            handle: self.handle,
            resource: self.resource,
            owner: self.owner,
            requested_mode: self.requested_mode,
            granted_mode: self.granted_mode,
            policy: self.policy,
            state: self.state,
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("handle", &self.handle)
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("requested_mode", &self.requested_mode)
            .field("granted_mode", &self.granted_mode)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("readers", &self.readers)
            .field("writers", &self.writers)
            .finish()
    }
}
