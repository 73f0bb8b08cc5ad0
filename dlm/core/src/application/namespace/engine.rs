// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Enqueue, conversion, cancellation and queue reprocessing.

use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConvertOutcome, EnqueueOutcome, Followups, LockRequest, Namespace, WaitOutcome};
use crate::domain::ast::AstMessage;
use crate::domain::error::DlmError;
use crate::domain::events::LockEvent;
use crate::domain::lock::{
    ByteRange, ConflictDescriptor, Lock, LockDesc, LockFlags, LockHandle, LockState,
};
use crate::domain::mode::LockMode;
use crate::domain::policy::{policy_for, GrantPlan, LockPolicy};
use crate::domain::resource::{ResourceKind, ResourceState};

/// Result of moving a lock onto the granted queue.
struct Grant {
    kept: bool,
    reshaped: bool,
}

impl Namespace {
    /// Submit a lock request. A blocked request stays queued; pair with
    /// [`Namespace::wait_for_grant`] or use [`Namespace::enqueue_and_wait`].
    pub fn enqueue(&self, req: LockRequest) -> Result<EnqueueOutcome, DlmError> {
        let kind = req.kind();
        let policy = policy_for(kind);
        policy.validate(req.mode, &req.policy, req.flags)?;
        let testing = req.flags.contains(LockFlags::TEST_LOCK);
        if testing && !policy.supports_test() {
            return Err(DlmError::invalid(format!(
                "TEST_LOCK is not supported on {} resources",
                kind
            )));
        }

        let res = self.get_or_create_resource(req.resource, kind)?;
        if !testing {
            if let Err(e) = self.reserve(1) {
                self.put_resource(&res);
                return Err(e);
            }
        }

        let handle = self.next_handle();
        let mut followups = Followups::default();
        let outcome = {
            let mut st = res.state();
            self.enqueue_locked(&mut st, policy, handle, req, &mut followups)
        };
        self.finish(followups);
        outcome
    }

    /// Enqueue and, when blocked, suspend until the request resolves.
    /// A blocked request that times out or is interrupted is cancelled.
    pub async fn enqueue_and_wait(
        &self,
        req: LockRequest,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> Result<EnqueueOutcome, DlmError> {
        match self.enqueue(req)? {
            EnqueueOutcome::Blocked(handle) => {
                match self.wait_for_grant(handle, timeout, interrupt).await {
                    WaitOutcome::Granted => Ok(EnqueueOutcome::Granted(handle)),
                    WaitOutcome::Interrupted => Err(DlmError::Interrupted(handle)),
                    WaitOutcome::TimedOut | WaitOutcome::Destroyed => Err(DlmError::LockAborted),
                }
            }
            outcome => Ok(outcome),
        }
    }

    fn enqueue_locked(
        &self,
        st: &mut ResourceState,
        policy: &dyn LockPolicy,
        handle: LockHandle,
        req: LockRequest,
        f: &mut Followups,
    ) -> Result<EnqueueOutcome, DlmError> {
        let testing = req.flags.contains(LockFlags::TEST_LOCK);
        let mut lock = Lock::new(
            handle,
            st.id,
            req.owner,
            req.mode,
            req.policy,
            req.flags,
            req.ast,
        );

        let ahead: Vec<LockHandle> = if policy.checks_waiters() {
            st.converting.iter().chain(st.waiting.iter()).copied().collect()
        } else {
            Vec::new()
        };
        let conflicts = policy.conflicts(st, &lock, &ahead);

        if testing {
            let whole = ByteRange::whole();
            let descriptor = match conflicts.first().and_then(|h| st.lock(*h)) {
                Some(other) => ConflictDescriptor {
                    mode: other.held_mode().unwrap_or(other.requested_mode),
                    owner: other.owner,
                    range: other.range().unwrap_or(whole),
                },
                None => ConflictDescriptor {
                    mode: LockMode::Nl,
                    owner: lock.owner,
                    range: lock.range().unwrap_or(whole),
                },
            };
            self.drop_unattached(st, false, f);
            return Ok(EnqueueOutcome::Changed(descriptor));
        }

        if conflicts.is_empty() {
            lock.add_user(lock.requested_mode);
            self.attach_locked(st, lock);
            return match self.grant_locked(st, policy, handle, false, f) {
                Ok(grant) => {
                    self.reprocess_locked(st, policy, f);
                    if grant.kept {
                        Ok(EnqueueOutcome::Granted(handle))
                    } else {
                        Ok(EnqueueOutcome::Released)
                    }
                }
                Err(e) => {
                    self.destroy_locked(st, handle, f);
                    Err(e)
                }
            };
        }

        if req.flags.contains(LockFlags::BLOCK_NOWAIT) {
            self.drop_unattached(st, true, f);
            return Err(DlmError::WouldBlock);
        }

        if policy.tracks_waiters() {
            if let Some(blocker) = conflicts.first().and_then(|h| st.lock(*h)).map(|l| l.owner) {
                let mut waiters = self.flock_waiters.lock();
                if waiters.would_deadlock(lock.owner, blocker) {
                    drop(waiters);
                    self.drop_unattached(st, true, f);
                    metrics::counter!("dlm_deadlocks_total").increment(1);
                    info!(
                        namespace = %self.name,
                        resource = %st.id,
                        requester = %lock.owner,
                        blocker = %blocker,
                        "flock deadlock detected"
                    );
                    f.events.push(LockEvent::DeadlockDetected {
                        namespace: self.name.clone(),
                        resource: st.id,
                        requester: lock.owner,
                        blocker,
                        detected_at: Utc::now(),
                    });
                    return Err(DlmError::Deadlock {
                        pid: lock.owner.pid,
                    });
                }
                waiters.insert(handle, lock.owner, blocker);
                lock.blocking_owner = Some(blocker);
            }
        }

        lock.add_user(lock.requested_mode);
        lock.set_state(LockState::Waiting);
        let desc = lock.describe();
        self.attach_locked(st, lock);
        st.waiting.push(handle);

        if policy.sends_blocking_asts() {
            self.send_blocking_locked(st, &conflicts, &desc, f);
        }
        metrics::counter!("dlm_locks_blocked_total").increment(1);
        debug!(
            namespace = %self.name,
            resource = %st.id,
            handle = %handle,
            mode = %desc.requested_mode,
            conflicts = conflicts.len(),
            "lock request blocked"
        );
        f.events.push(LockEvent::LockBlocked {
            namespace: self.name.clone(),
            resource: st.id,
            handle,
            mode: desc.requested_mode,
            conflicts: conflicts.len(),
            blocked_at: Utc::now(),
        });
        Ok(EnqueueOutcome::Blocked(handle))
    }

    /// Change the mode of a granted lock. Flock locks change mode by
    /// re-enqueueing instead.
    pub fn convert(
        &self,
        handle: LockHandle,
        new_mode: LockMode,
    ) -> Result<ConvertOutcome, DlmError> {
        let mut followups = Followups::default();
        let outcome = self
            .with_resource_of(handle, |st| {
                self.convert_locked(st, handle, new_mode, &mut followups)
            })
            .unwrap_or(Err(DlmError::LockNotFound(handle)));
        self.finish(followups);
        outcome
    }

    fn convert_locked(
        &self,
        st: &mut ResourceState,
        handle: LockHandle,
        new_mode: LockMode,
        f: &mut Followups,
    ) -> Result<ConvertOutcome, DlmError> {
        if st.kind == ResourceKind::Flock {
            return Err(DlmError::invalid(
                "flock locks change mode by enqueueing a new request",
            ));
        }
        let policy = policy_for(st.kind);
        let lock = st
            .lock_mut(handle)
            .ok_or(DlmError::LockNotFound(handle))?;
        if lock.state != LockState::Granted {
            return Err(DlmError::invalid(format!(
                "lock {} is {:?}; only granted locks convert",
                handle, lock.state
            )));
        }
        if lock.granted_mode == Some(new_mode) {
            return Ok(ConvertOutcome::Granted);
        }
        policy.validate(new_mode, &lock.policy, LockFlags::empty())?;
        let downgrade = lock.granted_mode.is_some_and(|held| held.covers(new_mode));
        lock.requested_mode = new_mode;

        // Only modes actually held stand in the way; other pending
        // conversions may themselves be waiting on this lock.
        let conflicts = match st.lock(handle) {
            Some(_) if downgrade => Vec::new(),
            Some(lock) => policy.conflicts(st, lock, &[]),
            None => return Err(DlmError::LockNotFound(handle)),
        };

        if conflicts.is_empty() {
            if let Some(lock) = st.lock_mut(handle) {
                lock.granted_mode = Some(new_mode);
                lock.rebalance_users(new_mode);
            }
            f.events.push(LockEvent::LockGranted {
                namespace: self.name.clone(),
                resource: st.id,
                handle,
                mode: new_mode,
                granted_at: Utc::now(),
            });
            debug!(namespace = %self.name, handle = %handle, mode = %new_mode, "lock converted");
            self.reprocess_locked(st, policy, f);
            return Ok(ConvertOutcome::Granted);
        }

        st.unlink(handle);
        let desc = match st.lock_mut(handle) {
            Some(lock) => {
                lock.set_state(LockState::Converting);
                lock.describe()
            }
            None => return Err(DlmError::LockNotFound(handle)),
        };
        st.converting.push(handle);
        if policy.sends_blocking_asts() {
            self.send_blocking_locked(st, &conflicts, &desc, f);
        }
        metrics::counter!("dlm_locks_blocked_total").increment(1);
        debug!(
            namespace = %self.name,
            handle = %handle,
            mode = %new_mode,
            conflicts = conflicts.len(),
            "conversion blocked"
        );
        f.events.push(LockEvent::LockBlocked {
            namespace: self.name.clone(),
            resource: st.id,
            handle,
            mode: new_mode,
            conflicts: conflicts.len(),
            blocked_at: Utc::now(),
        });
        Ok(ConvertOutcome::Blocked)
    }

    /// Destroy a lock in any state and regrant whatever it was blocking.
    /// Returns `false` when the handle is unknown; cancelling twice is a
    /// no-op.
    pub fn cancel(&self, handle: LockHandle) -> bool {
        let mut followups = Followups::default();
        let cancelled = self
            .with_resource_of(handle, |st| {
                let policy = policy_for(st.kind);
                let cancelled = self.destroy_locked(st, handle, &mut followups);
                if cancelled {
                    self.reprocess_locked(st, policy, &mut followups);
                }
                cancelled
            })
            .unwrap_or(false);
        self.finish(followups);
        if cancelled {
            debug!(namespace = %self.name, handle = %handle, "lock cancelled");
        }
        cancelled
    }

    /// Suspend until `handle` is granted, the wait times out, `interrupt`
    /// fires, or the lock is destroyed underneath the waiter. Timeout and
    /// interruption cancel the pending request.
    pub async fn wait_for_grant(
        &self,
        handle: LockHandle,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> WaitOutcome {
        let Some(mut state) = self.subscribe(handle) else {
            return WaitOutcome::Destroyed;
        };
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            match *state.borrow_and_update() {
                LockState::Granted => return WaitOutcome::Granted,
                LockState::Destroyed => return WaitOutcome::Destroyed,
                _ => {}
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return WaitOutcome::Destroyed;
                    }
                }
                _ = interrupt.cancelled() => {
                    self.cancel(handle);
                    info!(namespace = %self.name, handle = %handle, "lock wait interrupted");
                    return WaitOutcome::Interrupted;
                }
                _ = expired => {
                    self.cancel(handle);
                    warn!(namespace = %self.name, handle = %handle, "lock wait timed out");
                    return WaitOutcome::TimedOut;
                }
            }
        }
    }

    fn subscribe(&self, handle: LockHandle) -> Option<tokio::sync::watch::Receiver<LockState>> {
        self.with_resource_of(handle, |st| st.lock(handle).map(Lock::subscribe))
            .flatten()
    }

    // ---------------------------------------------------------------------
    // Helpers run under the resource lock
    // ---------------------------------------------------------------------

    fn attach_locked(&self, st: &mut ResourceState, lock: Lock) {
        self.handles.lock().insert(lock.handle, st.id);
        st.attach(lock);
    }

    /// Give back the table reference (and capacity) of a request that never
    /// got a lock record.
    fn drop_unattached(&self, st: &mut ResourceState, reserved: bool, f: &mut Followups) {
        st.refcount = st.refcount.saturating_sub(1);
        f.reap.push(st.id);
        if reserved {
            self.release(1);
        }
    }

    /// Detach and destroy a lock record. Its resource reference goes with it.
    pub(super) fn destroy_locked(
        &self,
        st: &mut ResourceState,
        handle: LockHandle,
        f: &mut Followups,
    ) -> bool {
        let Some(mut lock) = st.detach(handle) else {
            return false;
        };
        let held = lock.state.is_held();
        if held {
            self.pool.lock().record_cancel();
            lock.set_state(LockState::Cancelling);
        }
        lock.set_state(LockState::Destroyed);
        st.refcount = st.refcount.saturating_sub(1);
        self.flock_waiters.lock().remove(handle);
        self.handles.lock().remove(&handle);
        self.release(1);

        f.destroyed.push(handle);
        f.reap.push(st.id);
        if held {
            metrics::counter!("dlm_locks_cancelled_total").increment(1);
            f.events.push(LockEvent::LockCancelled {
                namespace: self.name.clone(),
                resource: st.id,
                handle,
                cancelled_at: Utc::now(),
            });
        } else {
            metrics::counter!("dlm_locks_aborted_total").increment(1);
            f.events.push(LockEvent::LockAborted {
                namespace: self.name.clone(),
                resource: st.id,
                handle,
                aborted_at: Utc::now(),
            });
        }
        true
    }

    /// Expand, apply the grant plan and move `handle` onto the granted queue.
    fn grant_locked(
        &self,
        st: &mut ResourceState,
        policy: &dyn LockPolicy,
        handle: LockHandle,
        was_blocked: bool,
        f: &mut Followups,
    ) -> Result<Grant, DlmError> {
        let expanded = match st.lock(handle) {
            Some(lock) => policy.expand(st, lock),
            None => return Err(DlmError::LockNotFound(handle)),
        };
        if let (Some(data), Some(lock)) = (expanded, st.lock_mut(handle)) {
            lock.policy = data;
        }

        let plan = match st.lock(handle) {
            Some(lock) => policy.plan_grant(st, lock),
            None => return Err(DlmError::LockNotFound(handle)),
        };
        self.reserve(plan.new_locks())?;
        let reshaped = !plan.is_noop();
        self.apply_plan_locked(st, handle, &plan, f);

        if plan.discard_request {
            self.destroy_locked(st, handle, f);
            return Ok(Grant {
                kept: false,
                reshaped,
            });
        }

        st.unlink(handle);
        let (desc, target) = match st.lock_mut(handle) {
            Some(lock) => {
                lock.granted_mode = Some(lock.requested_mode);
                lock.blocking_owner = None;
                lock.set_state(LockState::Granted);
                (lock.describe(), lock.ast.clone())
            }
            None => return Err(DlmError::LockNotFound(handle)),
        };
        st.insert_granted(handle);
        self.pool.lock().record_grant();
        self.flock_waiters.lock().remove(handle);

        if was_blocked {
            f.asts.push((target, AstMessage::Completion { lock: desc.clone() }));
        }
        metrics::counter!("dlm_locks_granted_total").increment(1);
        debug!(
            namespace = %self.name,
            resource = %st.id,
            handle = %handle,
            mode = %desc.requested_mode,
            "lock granted"
        );
        f.events.push(LockEvent::LockGranted {
            namespace: self.name.clone(),
            resource: st.id,
            handle,
            mode: desc.requested_mode,
            granted_at: Utc::now(),
        });
        Ok(Grant {
            kept: true,
            reshaped,
        })
    }

    fn apply_plan_locked(
        &self,
        st: &mut ResourceState,
        handle: LockHandle,
        plan: &GrantPlan,
        f: &mut Followups,
    ) {
        for victim in &plan.destroy {
            self.destroy_locked(st, *victim, f);
        }
        for (target, range) in &plan.resize {
            if let Some(lock) = st.lock_mut(*target) {
                lock.policy.set_range(*range);
            }
            st.unlink(*target);
            st.insert_granted(*target);
        }
        for (source, range) in &plan.split {
            let new_handle = self.next_handle();
            let Some(residual) = st.lock(*source).map(|l| l.residual(new_handle, *range)) else {
                self.release(1);
                continue;
            };
            self.attach_locked(st, residual);
            st.insert_granted(new_handle);
            st.refcount += 1;
            self.pool.lock().record_grant();
        }
        if let Some(range) = plan.request_range {
            if let Some(lock) = st.lock_mut(handle) {
                lock.policy.set_range(range);
            }
        }
    }

    fn send_blocking_locked(
        &self,
        st: &mut ResourceState,
        conflicts: &[LockHandle],
        conflicting: &LockDesc,
        f: &mut Followups,
    ) {
        for handle in conflicts {
            let Some(holder) = st.lock_mut(*handle) else {
                continue;
            };
            if !holder.state.is_held() || holder.flags.contains(LockFlags::AST_SENT) {
                continue;
            }
            holder.flags.insert(LockFlags::AST_SENT);
            f.asts.push((
                holder.ast.clone(),
                AstMessage::Blocking {
                    lock: holder.describe(),
                    conflicting: conflicting.clone(),
                },
            ));
        }
    }

    /// Grant queued conversions (FIFO), then queued waiters, until a pass
    /// changes nothing among the granted locks.
    pub(super) fn reprocess_locked(
        &self,
        st: &mut ResourceState,
        policy: &dyn LockPolicy,
        f: &mut Followups,
    ) {
        loop {
            let mut reshaped = false;

            // A conversion is checked against held modes only. Completing
            // one changes what is held, so the scan restarts.
            let mut i = 0;
            while i < st.converting.len() {
                let handle = st.converting[i];
                let conflicts = match st.lock(handle) {
                    Some(lock) => policy.conflicts(st, lock, &[]),
                    None => {
                        st.converting.remove(i);
                        continue;
                    }
                };
                if conflicts.is_empty() {
                    self.complete_conversion_locked(st, handle, f);
                    i = 0;
                } else {
                    if policy.sends_blocking_asts() {
                        if let Some(desc) = st.lock(handle).map(Lock::describe) {
                            self.send_blocking_locked(st, &conflicts, &desc, f);
                        }
                    }
                    i += 1;
                }
            }

            let mut i = 0;
            while i < st.waiting.len() {
                let handle = st.waiting[i];
                let ahead: Vec<LockHandle> = if policy.checks_waiters() {
                    st.converting
                        .iter()
                        .chain(st.waiting[..i].iter())
                        .copied()
                        .collect()
                } else {
                    Vec::new()
                };
                let (owner, conflicts) = match st.lock(handle) {
                    Some(lock) => (lock.owner, policy.conflicts(st, lock, &ahead)),
                    None => {
                        st.waiting.remove(i);
                        continue;
                    }
                };

                if conflicts.is_empty() {
                    match self.grant_locked(st, policy, handle, true, f) {
                        Ok(grant) => reshaped |= grant.reshaped,
                        Err(e) => {
                            warn!(
                                namespace = %self.name,
                                handle = %handle,
                                error = %e,
                                "aborting blocked request that can no longer be granted"
                            );
                            self.destroy_locked(st, handle, f);
                        }
                    }
                    continue;
                }

                if policy.tracks_waiters() {
                    let blocker = conflicts.first().and_then(|h| st.lock(*h)).map(|l| l.owner);
                    if let Some(blocker) = blocker {
                        self.flock_waiters.lock().insert(handle, owner, blocker);
                        if let Some(lock) = st.lock_mut(handle) {
                            lock.blocking_owner = Some(blocker);
                        }
                    }
                }
                if policy.sends_blocking_asts() {
                    if let Some(desc) = st.lock(handle).map(Lock::describe) {
                        self.send_blocking_locked(st, &conflicts, &desc, f);
                    }
                }
                i += 1;
            }

            if !reshaped {
                break;
            }
        }
    }

    fn complete_conversion_locked(
        &self,
        st: &mut ResourceState,
        handle: LockHandle,
        f: &mut Followups,
    ) {
        st.unlink(handle);
        let (desc, target) = match st.lock_mut(handle) {
            Some(lock) => {
                let mode = lock.requested_mode;
                lock.granted_mode = Some(mode);
                lock.rebalance_users(mode);
                lock.set_state(LockState::Granted);
                (lock.describe(), lock.ast.clone())
            }
            None => return,
        };
        st.insert_granted(handle);
        metrics::counter!("dlm_locks_granted_total").increment(1);
        debug!(namespace = %self.name, handle = %handle, mode = %desc.requested_mode, "conversion granted");
        f.events.push(LockEvent::LockGranted {
            namespace: self.name.clone(),
            resource: st.id,
            handle,
            mode: desc.requested_mode,
            granted_at: Utc::now(),
        });
        f.asts.push((target, AstMessage::Completion { lock: desc }));
    }
}
