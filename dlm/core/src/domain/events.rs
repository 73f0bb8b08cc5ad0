// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lock::{LockHandle, LockOwner};
use crate::domain::mode::LockMode;
use crate::domain::pool::{NamespaceSide, PoolStats};
use crate::domain::resource::ResourceId;

/// Lock lifecycle events, published by the lock core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockEvent {
    LockGranted {
        namespace: String,
        resource: ResourceId,
        handle: LockHandle,
        mode: LockMode,
        granted_at: DateTime<Utc>,
    },
    LockBlocked {
        namespace: String,
        resource: ResourceId,
        handle: LockHandle,
        mode: LockMode,
        conflicts: usize,
        blocked_at: DateTime<Utc>,
    },
    LockCancelled {
        namespace: String,
        resource: ResourceId,
        handle: LockHandle,
        cancelled_at: DateTime<Utc>,
    },
    /// A request destroyed before it was ever granted: timed out,
    /// interrupted, or refused for lack of lock records.
    LockAborted {
        namespace: String,
        resource: ResourceId,
        handle: LockHandle,
        aborted_at: DateTime<Utc>,
    },
    DeadlockDetected {
        namespace: String,
        resource: ResourceId,
        requester: LockOwner,
        blocker: LockOwner,
        detected_at: DateTime<Utc>,
    },
}

/// Pool controller and cache eviction events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolEvent {
    PoolRecalculated {
        namespace: String,
        stats: PoolStats,
        recalculated_at: DateTime<Utc>,
    },
    PoolShrunk {
        namespace: String,
        requested: u64,
        remaining: u64,
        shrunk_at: DateTime<Utc>,
    },
    LruCancelled {
        namespace: String,
        cancelled: usize,
        remaining: usize,
        cancelled_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NamespaceEvent {
    NamespaceCreated {
        namespace: String,
        side: NamespaceSide,
        created_at: DateTime<Utc>,
    },
    NamespaceRemoved {
        namespace: String,
        locks_cancelled: usize,
        removed_at: DateTime<Utc>,
    },
}
