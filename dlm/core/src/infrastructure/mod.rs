// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod ast;
pub mod event_bus;
pub mod request_worker;

pub use ast::{AstDeliveryConfig, AstDispatcher, AstFailure, LocalAstTarget, RemoteAstTarget};
pub use event_bus::{DlmEvent, EventBus, EventBusError};
pub use request_worker::{InboundRequest, RequestResult, RequestSender, RequestWorkerPool};
