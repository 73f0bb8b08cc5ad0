// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lock Namespace
//!
//! A [`Namespace`] is one device instance's lock space: its resource table,
//! the lock core operating on it, the cache-side LRU and the pool.
//!
//! ## Locking
//!
//! | Lock | Protects | Order |
//! |------|----------|-------|
//! | `table` | resource hash table, LRU | first |
//! | `Resource::state` | queues and lock records of one resource | after `table` |
//! | `handles`, `pool`, `flock_waiters` | handle index, pool counters, flock wait graph | leaves |
//!
//! A resource lock is never held while the table lock is taken. Work that
//! needs the table after a resource changed (LRU cleanup, resource teardown,
//! AST dispatch, events) is collected in [`Followups`] and run once the
//! resource lock is released.
//!
//! ## Submodules
//!
//! - `engine`: enqueue, convert, cancel, reprocessing and suspension
//! - `cache`: user references, lock matching, blocking-AST handling, LRU
//! - `pool`: SLV recalculation, shrink, glimpse, tunables
//! - `admin`: hierarchy, re-homing, iteration and snapshots

mod admin;
mod cache;
mod engine;
mod pool;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::ast::{AstMessage, AstTarget};
use crate::domain::config::NamespaceConfig;
use crate::domain::error::{DlmError, DlmStatus};
use crate::domain::events::LockEvent;
use crate::domain::lock::{ConflictDescriptor, LockDesc, LockFlags, LockHandle, LockOwner, PolicyData};
use crate::domain::lru::LockLru;
use crate::domain::mode::LockMode;
use crate::domain::policy::FlockWaitTable;
use crate::domain::pool::{NamespaceSide, Pool, PoolStats};
use crate::domain::resource::{Resource, ResourceId, ResourceKind, ResourceState, ValueBlock};
use crate::infrastructure::ast::AstDispatcher;
use crate::infrastructure::event_bus::EventBus;

pub use self::pool::Tunable;

/// How long a glimpse waits for the holder before falling back to the
/// cached value block.
pub const GLIMPSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An enqueue request as it reaches the lock core.
pub struct LockRequest {
    pub resource: ResourceId,
    pub mode: LockMode,
    pub policy: PolicyData,
    pub flags: LockFlags,
    pub owner: LockOwner,
    /// Where ASTs for the resulting lock are delivered.
    pub ast: Arc<dyn AstTarget>,
}

impl LockRequest {
    pub fn new(
        resource: ResourceId,
        mode: LockMode,
        policy: PolicyData,
        owner: LockOwner,
        ast: Arc<dyn AstTarget>,
    ) -> Self {
        Self {
            resource,
            mode,
            policy,
            flags: LockFlags::empty(),
            owner,
            ast,
        }
    }

    pub fn with_flags(mut self, flags: LockFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.policy.kind()
    }
}

impl std::fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRequest")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .field("policy", &self.policy)
            .field("flags", &self.flags)
            .field("owner", &self.owner)
            .field("locality", &self.ast.locality())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    Granted(LockHandle),
    /// Queued; suspend with [`Namespace::wait_for_grant`].
    Blocked(LockHandle),
    /// `TEST_LOCK` answer; nothing was queued.
    Changed(ConflictDescriptor),
    /// Flock unlock applied; no lock remains for the request.
    Released,
}

impl EnqueueOutcome {
    pub fn handle(&self) -> Option<LockHandle> {
        match self {
            EnqueueOutcome::Granted(h) | EnqueueOutcome::Blocked(h) => Some(*h),
            _ => None,
        }
    }

    pub fn status(&self) -> DlmStatus {
        match self {
            EnqueueOutcome::Changed(_) => DlmStatus::LockChanged,
            _ => DlmStatus::Ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvertOutcome {
    Granted,
    Blocked,
}

/// How a suspended request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    Granted,
    TimedOut,
    Interrupted,
    Destroyed,
}

/// Queues and counters of one resource, copied out under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub parent: Option<ResourceId>,
    pub children: Vec<ResourceId>,
    pub granted: Vec<LockDesc>,
    pub converting: Vec<LockDesc>,
    pub waiting: Vec<LockDesc>,
    pub refcount: usize,
    pub value_block: Option<ValueBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub name: String,
    pub side: NamespaceSide,
    pub resources: usize,
    pub locks: usize,
    pub unused: usize,
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
struct ResourceTable {
    resources: HashMap<ResourceId, Arc<Resource>>,
    lru: LockLru,
}

/// Work deferred until the resource lock is released.
#[derive(Default)]
struct Followups {
    asts: Vec<(Arc<dyn AstTarget>, AstMessage)>,
    destroyed: Vec<LockHandle>,
    reap: Vec<ResourceId>,
    events: Vec<LockEvent>,
}

pub struct Namespace {
    name: String,
    side: NamespaceSide,
    table: Mutex<ResourceTable>,
    handles: Mutex<HashMap<LockHandle, ResourceId>>,
    pool: Mutex<Pool>,
    flock_waiters: Mutex<FlockWaitTable>,
    next_handle: AtomicU64,
    live_locks: AtomicUsize,
    lock_capacity: AtomicUsize,
    unused_max: AtomicUsize,
    max_age: Duration,
    recalc_interval: Duration,
    recalc_now: Notify,
    dispatcher: AstDispatcher,
    events: Arc<EventBus>,
}

impl Namespace {
    pub fn new(
        config: &NamespaceConfig,
        side: NamespaceSide,
        dispatcher: AstDispatcher,
        events: Arc<EventBus>,
    ) -> Self {
        let mut pool = Pool::new(side, config.limit);
        pool.set_grant_step(config.grant_step);
        pool.set_volume_factor(config.volume_factor);

        Self {
            name: config.name.clone(),
            side,
            table: Mutex::new(ResourceTable::default()),
            handles: Mutex::new(HashMap::new()),
            pool: Mutex::new(pool),
            flock_waiters: Mutex::new(FlockWaitTable::new()),
            next_handle: AtomicU64::new(1),
            live_locks: AtomicUsize::new(0),
            lock_capacity: AtomicUsize::new(config.lock_capacity.unwrap_or(usize::MAX)),
            unused_max: AtomicUsize::new(config.unused_max),
            max_age: Duration::from_secs(config.max_age_secs),
            recalc_interval: Duration::from_millis(config.recalc_interval_ms.max(1)),
            recalc_now: Notify::new(),
            dispatcher,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> NamespaceSide {
        self.side
    }

    pub fn recalc_interval(&self) -> Duration {
        self.recalc_interval
    }

    /// Wake the pool controller ahead of its next tick.
    pub fn request_recalc(&self) {
        self.recalc_now.notify_one();
    }

    pub(crate) fn recalc_signal(&self) -> &Notify {
        &self.recalc_now
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ---------------------------------------------------------------------
    // Resource table
    // ---------------------------------------------------------------------

    /// Look up or create a top-level resource, taking a reference on it.
    /// Release it with [`Namespace::put_resource`].
    pub fn get_or_create_resource(
        &self,
        id: ResourceId,
        kind: ResourceKind,
    ) -> Result<Arc<Resource>, DlmError> {
        self.get_or_create(id, kind, None)
    }

    /// Like [`Namespace::get_or_create_resource`], linking the resource
    /// under an existing `parent`. The child holds a reference on it.
    pub fn get_or_create_child(
        &self,
        parent: ResourceId,
        id: ResourceId,
        kind: ResourceKind,
    ) -> Result<Arc<Resource>, DlmError> {
        self.get_or_create(id, kind, Some(parent))
    }

    fn get_or_create(
        &self,
        id: ResourceId,
        kind: ResourceKind,
        parent: Option<ResourceId>,
    ) -> Result<Arc<Resource>, DlmError> {
        let mut table = self.table.lock();
        if let Some(res) = table.resources.get(&id) {
            let mut st = res.state();
            if st.kind != kind {
                return Err(DlmError::invalid(format!(
                    "resource {} is {}, not {}",
                    id, st.kind, kind
                )));
            }
            if parent.is_some() && st.parent != parent {
                return Err(DlmError::invalid(format!(
                    "resource {} already has a different parent",
                    id
                )));
            }
            st.refcount += 1;
            drop(st);
            return Ok(res.clone());
        }

        if let Some(parent_id) = parent {
            if parent_id == id {
                return Err(DlmError::invalid(format!("resource {} cannot parent itself", id)));
            }
            let Some(parent_res) = table.resources.get(&parent_id) else {
                return Err(DlmError::invalid(format!(
                    "parent resource {} does not exist",
                    parent_id
                )));
            };
            let mut pst = parent_res.state();
            pst.children.insert(id);
            pst.refcount += 1;
        }

        let res = Arc::new(Resource::new(id, kind, parent));
        res.state().refcount = 1;
        table.resources.insert(id, res.clone());
        metrics::gauge!("dlm_resources", "namespace" => self.name.clone())
            .set(table.resources.len() as f64);
        debug!(namespace = %self.name, resource = %id, kind = %kind, "resource created");
        Ok(res)
    }

    /// Drop a reference taken by `get_or_create_*`; the resource is torn
    /// down once nothing refers to it.
    pub fn put_resource(&self, res: &Arc<Resource>) {
        let mut table = self.table.lock();
        {
            let mut st = res.state();
            st.refcount = st.refcount.saturating_sub(1);
        }
        self.reap_locked(&mut table, res.id());
    }

    pub fn find_resource(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.table.lock().resources.get(&id).cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.table.lock().resources.len()
    }

    /// Remove `id`, then its ancestors, while they are unused.
    fn reap_locked(&self, table: &mut ResourceTable, id: ResourceId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let Some(res) = table.resources.get(&id).cloned() else {
                break;
            };
            let parent = {
                let st = res.state();
                if !st.is_unused() {
                    break;
                }
                st.parent
            };
            table.resources.remove(&id);
            debug!(namespace = %self.name, resource = %id, "resource destroyed");

            if let Some(parent_id) = parent {
                if let Some(parent_res) = table.resources.get(&parent_id) {
                    let mut pst = parent_res.state();
                    pst.children.remove(&id);
                    pst.refcount = pst.refcount.saturating_sub(1);
                }
                next = Some(parent_id);
            }
        }
        metrics::gauge!("dlm_resources", "namespace" => self.name.clone())
            .set(table.resources.len() as f64);
    }

    fn resource_of(&self, handle: LockHandle) -> Option<Arc<Resource>> {
        let id = self.handles.lock().get(&handle).copied()?;
        self.find_resource(id)
    }

    /// Run `f` under the lock of the resource that holds `handle`. A rehome
    /// can move the handle between the lookup and the lock; the lookup is
    /// then repeated against the new resource.
    fn with_resource_of<T>(
        &self,
        handle: LockHandle,
        f: impl FnOnce(&mut ResourceState) -> T,
    ) -> Option<T> {
        loop {
            let id = self.handles.lock().get(&handle).copied()?;
            let moved = || self.handles.lock().get(&handle).is_some_and(|now| *now != id);
            // The old resource may already be reaped after a move.
            let Some(res) = self.find_resource(id) else {
                if moved() {
                    continue;
                }
                return None;
            };
            let mut st = res.state();
            if st.lock(handle).is_some() {
                return Some(f(&mut st));
            }
            if !moved() {
                return None;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lock records
    // ---------------------------------------------------------------------

    fn next_handle(&self) -> LockHandle {
        LockHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Claim room for `n` more lock records.
    fn reserve(&self, n: usize) -> Result<(), DlmError> {
        if n == 0 {
            return Ok(());
        }
        let capacity = self.lock_capacity.load(Ordering::Acquire);
        self.live_locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(n).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|live| DlmError::NoMemory {
                requested: n,
                available: capacity.saturating_sub(live),
            })
    }

    fn release(&self, n: usize) {
        let _ = self
            .live_locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(n))
            });
    }

    pub fn live_locks(&self) -> usize {
        self.live_locks.load(Ordering::Acquire)
    }

    fn finish(&self, followups: Followups) {
        let Followups {
            asts,
            destroyed,
            mut reap,
            events,
        } = followups;

        if !destroyed.is_empty() || !reap.is_empty() {
            reap.sort_unstable();
            reap.dedup();
            let mut table = self.table.lock();
            for handle in &destroyed {
                table.lru.remove(*handle);
            }
            for id in reap {
                self.reap_locked(&mut table, id);
            }
        }

        for (target, message) in asts {
            self.dispatcher.dispatch(&self.name, target, message);
        }
        for event in events {
            self.events.publish_lock_event(event);
        }
    }
}


impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("side", &self.side)
            .field("live_locks", &self.live_locks())
            .finish()
    }
}
