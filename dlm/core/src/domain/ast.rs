// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Asynchronous System Traps (ASTs)
//!
//! The three notifications a lock holder can receive, and the single
//! interface they are delivered through. Which implementation a lock uses is
//! decided once, when the lock is created; the lock core itself never looks
//! at holder locality.
//!
//! Implementations live in `crate::infrastructure::ast`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::lock::LockDesc;
use crate::domain::resource::ValueBlock;

/// Outbound callback variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AstMessage {
    /// Please release `lock`; `conflicting` is the request it blocks.
    Blocking {
        lock: LockDesc,
        conflicting: LockDesc,
    },
    /// `lock` has been granted.
    Completion { lock: LockDesc },
    /// Report current attributes for `lock`'s resource without releasing it.
    Glimpse { lock: LockDesc },
}

impl AstMessage {
    pub fn lock(&self) -> &LockDesc {
        match self {
            AstMessage::Blocking { lock, .. }
            | AstMessage::Completion { lock }
            | AstMessage::Glimpse { lock } => lock,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AstMessage::Blocking { .. } => "blocking",
            AstMessage::Completion { .. } => "completion",
            AstMessage::Glimpse { .. } => "glimpse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AstReply {
    Ack,
    ValueBlock(ValueBlock),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AstError {
    #[error("Transport closed")]
    TransportClosed,

    #[error("No reply from holder within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Holder rejected callback: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolderLocality {
    Local,
    Remote,
}

impl fmt::Display for HolderLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HolderLocality::Local => f.write_str("local"),
            HolderLocality::Remote => f.write_str("remote"),
        }
    }
}

/// Delivery endpoint for a lock holder's callbacks.
#[async_trait]
pub trait AstTarget: Send + Sync {
    fn locality(&self) -> HolderLocality;

    async fn deliver(&self, message: AstMessage) -> Result<AstReply, AstError>;
}

/// Target for holders that never need to hear back, e.g. administrative locks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAstTarget;

#[async_trait]
impl AstTarget for NoopAstTarget {
    fn locality(&self) -> HolderLocality {
        HolderLocality::Local
    }

    async fn deliver(&self, _message: AstMessage) -> Result<AstReply, AstError> {
        Ok(AstReply::Ack)
    }
}
