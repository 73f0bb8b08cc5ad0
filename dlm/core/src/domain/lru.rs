// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cache-side list of idle granted locks, oldest first.
//!
//! Entries are only hints: a lock can be re-used or cancelled between the
//! moment it was listed and the moment an eviction pass reaches it, so
//! callers re-check each entry under the resource lock before acting.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::domain::lock::LockHandle;
use crate::domain::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruEntry {
    pub handle: LockHandle,
    pub resource: ResourceId,
    /// When the lock last became idle.
    pub since: Instant,
}

impl LruEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.since)
    }
}

#[derive(Debug, Default)]
pub struct LockLru {
    next_seq: u64,
    order: BTreeMap<u64, LruEntry>,
    index: HashMap<LockHandle, u64>,
}

impl LockLru {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an entry at the young end.
    pub fn insert(&mut self, handle: LockHandle, resource: ResourceId, since: Instant) {
        self.remove(handle);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(
            seq,
            LruEntry {
                handle,
                resource,
                since,
            },
        );
        self.index.insert(handle, seq);
    }

    pub fn remove(&mut self, handle: LockHandle) -> Option<LruEntry> {
        let seq = self.index.remove(&handle)?;
        self.order.remove(&seq)
    }

    pub fn oldest(&self) -> Option<&LruEntry> {
        self.order.values().next()
    }

    pub fn pop_oldest(&mut self) -> Option<LruEntry> {
        let (_, entry) = self.order.pop_first()?;
        self.index.remove(&entry.handle);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
