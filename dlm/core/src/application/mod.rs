// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod namespace;
pub mod pool_controller;
pub mod service;

pub use namespace::{
    ConvertOutcome, EnqueueOutcome, LockRequest, Namespace, NamespaceStats, ResourceSnapshot,
    Tunable, WaitOutcome,
};
pub use pool_controller::PoolController;
pub use service::DlmService;
