// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Lock Manager Events
//
// In-memory event streaming on tokio broadcast channels, used by the CLI
// `serve` mode and by tests to observe grants, deadlocks and pool cycles.
// Events are not persisted.

use crate::domain::events::{LockEvent, NamespaceEvent, PoolEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Unified event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DlmEvent {
    Lock(LockEvent),
    Pool(PoolEvent),
    Namespace(NamespaceEvent),
}

impl DlmEvent {
    pub fn namespace(&self) -> &str {
        match self {
            DlmEvent::Lock(
                LockEvent::LockGranted { namespace, .. }
                | LockEvent::LockBlocked { namespace, .. }
                | LockEvent::LockCancelled { namespace, .. }
                | LockEvent::LockAborted { namespace, .. }
                | LockEvent::DeadlockDetected { namespace, .. },
            )
            | DlmEvent::Pool(
                PoolEvent::PoolRecalculated { namespace, .. }
                | PoolEvent::PoolShrunk { namespace, .. }
                | PoolEvent::LruCancelled { namespace, .. },
            )
            | DlmEvent::Namespace(
                NamespaceEvent::NamespaceCreated { namespace, .. }
                | NamespaceEvent::NamespaceRemoved { namespace, .. },
            ) => namespace,
        }
    }
}

/// Event bus for publishing and subscribing to lock manager events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DlmEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Capacity determines how many events can be buffered before the
    /// slowest receiver starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_lock_event(&self, event: LockEvent) {
        self.publish(DlmEvent::Lock(event));
    }

    pub fn publish_pool_event(&self, event: PoolEvent) {
        self.publish(DlmEvent::Pool(event));
    }

    pub fn publish_namespace_event(&self, event: NamespaceEvent) {
        self.publish(DlmEvent::Namespace(event));
    }

    fn publish(&self, event: DlmEvent) {
        trace!("Publishing event: {:?}", event);
        // send() only fails when nobody is subscribed
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events of a single namespace
    pub fn subscribe_namespace(&self, namespace: impl Into<String>) -> NamespaceEventReceiver {
        NamespaceEventReceiver {
            receiver: self.sender.subscribe(),
            namespace: namespace.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DlmEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DlmEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DlmEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one namespace
pub struct NamespaceEventReceiver {
    receiver: broadcast::Receiver<DlmEvent>,
    namespace: String,
}

impl NamespaceEventReceiver {
    pub async fn recv(&mut self) -> Result<DlmEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.namespace() == self.namespace {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
