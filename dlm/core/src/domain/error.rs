// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # DLM Error Taxonomy
//!
//! [`DlmError`] is what the lock core returns to callers. [`DlmStatus`] is the
//! flat, code-carrying form handed to the transport collaborator, which only
//! ever sees numeric statuses.
//!
//! | Status | Code |
//! |--------|------|
//! | `Ok` | 0 |
//! | `LockChanged` | 300 |
//! | `LockAborted` | 301 |
//! | `LockReplaced` | 302 |
//! | `NoLockData` | 303 |
//! | `WouldBlock` | 304 |
//! | `NamespaceExists` | 400 |
//! | `BadNamespace` | 401 |
//! | `Deadlock` | -35 |
//! | `NoMemory` | -12 |
//! | `Invalid` | -22 |
//! | `Interrupted` | -4 |
//! | `LockNotFound` | -2 |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::lock::LockHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DlmError {
    #[error("Lock request aborted")]
    LockAborted,

    #[error("Lock replaced by another lock")]
    LockReplaced,

    #[error("No lock data available")]
    NoLockData,

    #[error("Namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("No such namespace: {0}")]
    BadNamespace(String),

    #[error("Lock request would block")]
    WouldBlock,

    #[error("Deadlock detected for owner pid {pid}")]
    Deadlock { pid: u32 },

    #[error("Out of lock capacity: {requested} more locks requested, {available} available")]
    NoMemory { requested: usize, available: usize },

    #[error("Invalid lock request: {0}")]
    Invalid(String),

    #[error("Wait for lock {0} was interrupted")]
    Interrupted(LockHandle),

    #[error("Lock not found: {0}")]
    LockNotFound(LockHandle),
}

impl DlmError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn status(&self) -> DlmStatus {
        match self {
            DlmError::LockAborted => DlmStatus::LockAborted,
            DlmError::LockReplaced => DlmStatus::LockReplaced,
            DlmError::NoLockData => DlmStatus::NoLockData,
            DlmError::NamespaceExists(_) => DlmStatus::NamespaceExists,
            DlmError::BadNamespace(_) => DlmStatus::BadNamespace,
            DlmError::WouldBlock => DlmStatus::WouldBlock,
            DlmError::Deadlock { .. } => DlmStatus::Deadlock,
            DlmError::NoMemory { .. } => DlmStatus::NoMemory,
            DlmError::Invalid(_) => DlmStatus::Invalid,
            DlmError::Interrupted(_) => DlmStatus::Interrupted,
            DlmError::LockNotFound(_) => DlmStatus::LockNotFound,
        }
    }
}

/// Status codes reported across the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlmStatus {
    Ok,
    LockChanged,
    LockAborted,
    LockReplaced,
    NoLockData,
    WouldBlock,
    NamespaceExists,
    BadNamespace,
    Deadlock,
    NoMemory,
    Invalid,
    Interrupted,
    LockNotFound,
}

impl DlmStatus {
    pub const fn code(self) -> i32 {
        match self {
            DlmStatus::Ok => 0,
            DlmStatus::LockChanged => 300,
            DlmStatus::LockAborted => 301,
            DlmStatus::LockReplaced => 302,
            DlmStatus::NoLockData => 303,
            DlmStatus::WouldBlock => 304,
            DlmStatus::NamespaceExists => 400,
            DlmStatus::BadNamespace => 401,
            DlmStatus::Deadlock => -35,
            DlmStatus::NoMemory => -12,
            DlmStatus::Invalid => -22,
            DlmStatus::Interrupted => -4,
            DlmStatus::LockNotFound => -2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        const ALL: [DlmStatus; 13] = [
            DlmStatus::Ok,
            DlmStatus::LockChanged,
            DlmStatus::LockAborted,
            DlmStatus::LockReplaced,
            DlmStatus::NoLockData,
            DlmStatus::WouldBlock,
            DlmStatus::NamespaceExists,
            DlmStatus::BadNamespace,
            DlmStatus::Deadlock,
            DlmStatus::NoMemory,
            DlmStatus::Invalid,
            DlmStatus::Interrupted,
            DlmStatus::LockNotFound,
        ];
        ALL.into_iter().find(|s| s.code() == code)
    }
}
