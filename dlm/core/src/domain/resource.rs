// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resources
//!
//! A [`Resource`] is the lockable entity. Its mutable part, [`ResourceState`],
//! sits behind the resource's own mutex and owns:
//!
//! - the arena of [`Lock`] records currently attached to the resource;
//! - the `granted`, `converting` and `waiting` queues, as ordered handle lists;
//! - the hierarchy links and the reference count;
//! - the opportunistically cached [`ValueBlock`].
//!
//! # Invariants
//!
//! - Every handle in a queue has a record in the arena, and vice versa.
//! - `refcount >= granted + converting + waiting + children`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::domain::lock::{Lock, LockHandle};

/// Composite, fixed-width resource name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub [u64; 4]);

impl ResourceId {
    pub const fn new(seq: u64, oid: u64) -> Self {
        Self([seq, oid, 0, 0])
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}:{:#x}:{:#x}:{:#x}]",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Lock policy family a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Plain,
    Extent,
    Flock,
    Bits,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Plain => "plain",
            ResourceKind::Extent => "extent",
            ResourceKind::Flock => "flock",
            ResourceKind::Bits => "bits",
        };
        f.write_str(s)
    }
}

/// Object attributes cached alongside a resource and refreshed by glimpses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueBlock {
    pub size: u64,
    pub blocks: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
}

impl ValueBlock {
    /// Fold a fresher view in. Sizes and timestamps only move forward.
    pub fn merge(&mut self, other: &ValueBlock) {
        self.size = self.size.max(other.size);
        self.blocks = self.blocks.max(other.blocks);
        self.mtime = self.mtime.max(other.mtime);
        self.atime = self.atime.max(other.atime);
        self.ctime = self.ctime.max(other.ctime);
    }
}

/// Which queue a lock sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Granted,
    Converting,
    Waiting,
}

#[derive(Debug)]
pub struct ResourceState {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub parent: Option<ResourceId>,
    pub children: HashSet<ResourceId>,
    pub granted: Vec<LockHandle>,
    pub converting: Vec<LockHandle>,
    pub waiting: Vec<LockHandle>,
    pub refcount: usize,
    pub value_block: Option<ValueBlock>,
    locks: HashMap<LockHandle, Lock>,
}

impl ResourceState {
    pub fn new(id: ResourceId, kind: ResourceKind, parent: Option<ResourceId>) -> Self {
        Self {
            id,
            kind,
            parent,
            children: HashSet::new(),
            granted: Vec::new(),
            converting: Vec::new(),
            waiting: Vec::new(),
            refcount: 0,
            value_block: None,
            locks: HashMap::new(),
        }
    }

    pub fn lock(&self, handle: LockHandle) -> Option<&Lock> {
        self.locks.get(&handle)
    }

    pub fn lock_mut(&mut self, handle: LockHandle) -> Option<&mut Lock> {
        self.locks.get_mut(&handle)
    }

    /// Attach a lock record without queueing it.
    pub fn attach(&mut self, lock: Lock) {
        self.locks.insert(lock.handle, lock);
    }

    /// Unqueue and remove a lock record.
    pub fn detach(&mut self, handle: LockHandle) -> Option<Lock> {
        self.unlink(handle);
        self.locks.remove(&handle)
    }

    /// Remove a handle from whichever queue holds it.
    pub fn unlink(&mut self, handle: LockHandle) -> Option<QueueKind> {
        for (kind, queue) in [
            (QueueKind::Granted, &mut self.granted),
            (QueueKind::Converting, &mut self.converting),
            (QueueKind::Waiting, &mut self.waiting),
        ] {
            if let Some(pos) = queue.iter().position(|h| *h == handle) {
                queue.remove(pos);
                return Some(kind);
            }
        }
        None
    }

    /// Locks holding a mode against newcomers: granted plus converting.
    pub fn holders(&self) -> impl Iterator<Item = &Lock> {
        self.granted
            .iter()
            .chain(self.converting.iter())
            .filter_map(|h| self.locks.get(h))
    }

    /// Insert into `granted`, keeping each owner's ranged locks in start
    /// order. Unranged locks are appended.
    pub fn insert_granted(&mut self, handle: LockHandle) {
        let Some(lock) = self.locks.get(&handle) else {
            return;
        };
        let Some(range) = lock.range() else {
            self.granted.push(handle);
            return;
        };
        let owner = lock.owner;

        let mut before = None;
        let mut last_own = None;
        for (i, h) in self.granted.iter().enumerate() {
            let Some(other) = self.locks.get(h) else {
                continue;
            };
            if other.owner != owner {
                continue;
            }
            match other.range() {
                Some(r) if r.start > range.start => {
                    before = Some(i);
                    break;
                }
                _ => last_own = Some(i),
            }
        }
        let at = before
            .or(last_own.map(|i| i + 1))
            .unwrap_or(self.granted.len());
        self.granted.insert(at, handle);
    }

    pub fn queues_empty(&self) -> bool {
        self.granted.is_empty() && self.converting.is_empty() && self.waiting.is_empty()
    }

    /// No queued locks, no children, no references: ready for teardown.
    pub fn is_unused(&self) -> bool {
        self.refcount == 0 && self.queues_empty() && self.children.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.granted.len() + self.converting.len() + self.waiting.len()
    }
}

/// A lockable entity in a namespace.
#[derive(Debug)]
pub struct Resource {
    id: ResourceId,
    kind: ResourceKind,
    state: Mutex<ResourceState>,
}

impl Resource {
    pub fn new(id: ResourceId, kind: ResourceKind, parent: Option<ResourceId>) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(ResourceState::new(id, kind, parent)),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, ResourceState> {
        self.state.lock()
    }
}
