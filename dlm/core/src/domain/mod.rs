// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Lock modes, lock and resource records, kind policies, pool arithmetic and
//! configuration types. Nothing here spawns tasks or performs I/O.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure lock-manager types and state machines

pub mod ast;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod lru;
pub mod mode;
pub mod policy;
pub mod pool;
pub mod resource;
