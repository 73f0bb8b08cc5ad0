// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Distributed lock manager core: lock namespaces, the four lock policies,
//! AST delivery and the adaptive lock pool.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Grants, converts and revokes cluster-wide locks

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::{
    ConvertOutcome, DlmService, EnqueueOutcome, LockRequest, Namespace, Tunable, WaitOutcome,
};
pub use domain::error::{DlmError, DlmStatus};
pub use domain::lock::{ByteRange, LockFlags, LockHandle, LockOwner, PolicyData};
pub use domain::mode::{LockMode, ModeSet};
pub use domain::resource::{ResourceId, ResourceKind};
