// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AST Delivery
//!
//! Concrete [`AstTarget`]s and the fire-and-forget delivery path.
//!
//! - [`LocalAstTarget`]: the holder lives in this process; delivery is a
//!   direct call into its handler.
//! - [`RemoteAstTarget`]: the holder is another host; delivery hands an
//!   [`OutboundCallback`] to a [`CallbackTransport`] (the RPC layer).
//!
//! The lock core never awaits blocking or completion ASTs. It pushes them
//! through an [`AstDispatcher`]; an [`AstDeliveryWorker`] drains the queue with
//! bounded concurrency and reports failed deliveries on a separate channel so
//! the owner of the namespace can evict the affected lock.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Callback transport adapters and delivery queue

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ast::{AstError, AstMessage, AstReply, AstTarget, HolderLocality};
use crate::domain::lock::{ExportId, LockHandle};

type Handler = dyn Fn(AstMessage) -> AstReply + Send + Sync;

/// In-process holder: ASTs are plain function calls.
#[derive(Clone)]
pub struct LocalAstTarget {
    handler: Arc<Handler>,
}

impl LocalAstTarget {
    pub fn new(handler: impl Fn(AstMessage) -> AstReply + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for LocalAstTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalAstTarget")
    }
}

#[async_trait]
impl AstTarget for LocalAstTarget {
    fn locality(&self) -> HolderLocality {
        HolderLocality::Local
    }

    async fn deliver(&self, message: AstMessage) -> Result<AstReply, AstError> {
        Ok((self.handler)(message))
    }
}

/// A callback addressed to a remote export, as handed to the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCallback {
    pub export: ExportId,
    pub message: AstMessage,
}

/// The RPC collaborator that carries callbacks to other hosts. Retries and
/// timeouts of the wire protocol are its business.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn send(&self, callback: OutboundCallback) -> Result<AstReply, AstError>;
}

pub struct RemoteAstTarget {
    export: ExportId,
    transport: Arc<dyn CallbackTransport>,
}

impl RemoteAstTarget {
    pub fn new(export: ExportId, transport: Arc<dyn CallbackTransport>) -> Self {
        Self { export, transport }
    }

    pub fn export(&self) -> ExportId {
        self.export
    }
}

#[async_trait]
impl AstTarget for RemoteAstTarget {
    fn locality(&self) -> HolderLocality {
        HolderLocality::Remote
    }

    async fn deliver(&self, message: AstMessage) -> Result<AstReply, AstError> {
        self.transport
            .send(OutboundCallback {
                export: self.export,
                message,
            })
            .await
    }
}

/// A callback waiting for the transport consumer to answer it.
pub struct PendingCallback {
    pub callback: OutboundCallback,
    reply: oneshot::Sender<Result<AstReply, AstError>>,
}

impl PendingCallback {
    pub fn respond(self, reply: Result<AstReply, AstError>) {
        // The sender may have given up (timeout); nothing to do then.
        let _ = self.reply.send(reply);
    }
}

/// [`CallbackTransport`] backed by a bounded channel whose consumer plays
/// the RPC layer.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<PendingCallback>,
}

impl ChannelTransport {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<PendingCallback>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CallbackTransport for ChannelTransport {
    async fn send(&self, callback: OutboundCallback) -> Result<AstReply, AstError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingCallback { callback, reply })
            .await
            .map_err(|_| AstError::TransportClosed)?;
        rx.await.map_err(|_| AstError::TransportClosed)?
    }
}

/// A delivery that did not complete; the lock it names should be evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstFailure {
    pub namespace: String,
    pub handle: LockHandle,
    pub kind: &'static str,
    pub error: AstError,
}

#[derive(Debug, Clone)]
pub struct AstDeliveryConfig {
    /// How long one delivery may take before it counts as failed
    pub timeout: Duration,
    /// Deliveries in flight at once
    pub concurrency: usize,
}

impl Default for AstDeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            concurrency: 64,
        }
    }
}

struct AstEnvelope {
    namespace: String,
    target: Arc<dyn AstTarget>,
    message: AstMessage,
}

/// Producer side of the AST queue, cloned into every namespace.
#[derive(Clone)]
pub struct AstDispatcher {
    tx: mpsc::UnboundedSender<AstEnvelope>,
}

impl AstDispatcher {
    pub fn channel(
        config: AstDeliveryConfig,
    ) -> (Self, AstDeliveryWorker, mpsc::UnboundedReceiver<AstFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let worker = AstDeliveryWorker {
            rx,
            failures,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            timeout: config.timeout,
        };
        (Self { tx }, worker, failure_rx)
    }

    /// Queue an AST and return immediately.
    pub fn dispatch(&self, namespace: &str, target: Arc<dyn AstTarget>, message: AstMessage) {
        metrics::counter!("dlm_asts_sent_total", "kind" => message.kind()).increment(1);
        let envelope = AstEnvelope {
            namespace: namespace.to_string(),
            target,
            message,
        };
        if self.tx.send(envelope).is_err() {
            warn!(namespace, "AST delivery queue is closed, dropping callback");
        }
    }
}

/// Consumer side of the AST queue.
pub struct AstDeliveryWorker {
    rx: mpsc::UnboundedReceiver<AstEnvelope>,
    failures: mpsc::UnboundedSender<AstFailure>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl AstDeliveryWorker {
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        debug!("AST delivery worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping AST delivery");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(envelope) => self.deliver(envelope).await,
                    None => break,
                },
            }
        }
    }

    async fn deliver(&self, envelope: AstEnvelope) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let failures = self.failures.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let _permit = permit;
            let AstEnvelope {
                namespace,
                target,
                message,
            } = envelope;
            let kind = message.kind();
            let handle = message.lock().handle;

            let result = match tokio::time::timeout(timeout, target.deliver(message)).await {
                Ok(result) => result,
                Err(_) => Err(AstError::Timeout(timeout)),
            };
            if let Err(error) = result {
                warn!(
                    namespace = %namespace,
                    handle = %handle,
                    kind,
                    locality = %target.locality(),
                    "AST delivery failed: {}",
                    error
                );
                metrics::counter!("dlm_ast_failures_total", "kind" => kind).increment(1);
                let _ = failures.send(AstFailure {
                    namespace,
                    handle,
                    kind,
                    error,
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock::{LockDesc, LockOwner, LockState, PolicyData};
    use crate::domain::mode::LockMode;
    use crate::domain::resource::ResourceId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn desc(handle: u64) -> LockDesc {
        LockDesc {
            handle: LockHandle(handle),
            resource: ResourceId::new(1, 1),
            owner: LockOwner::new(1, ExportId::local()),
            requested_mode: LockMode::Pr,
            granted_mode: Some(LockMode::Pr),
            policy: PolicyData::Plain,
            state: LockState::Granted,
        }
    }

    #[tokio::test]
    async fn test_local_target_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let target = LocalAstTarget::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            AstReply::Ack
        });
        let reply = target
            .deliver(AstMessage::Completion { lock: desc(1) })
            .await
            .unwrap();
        assert_eq!(reply, AstReply::Ack);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.locality(), HolderLocality::Local);
    }

    #[tokio::test]
    async fn test_remote_target_round_trips_through_transport() {
        let (transport, mut rx) = ChannelTransport::new(4);
        let export = ExportId::new();
        let target = RemoteAstTarget::new(export, Arc::new(transport));

        let rpc = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.callback.export, export);
            assert_eq!(pending.callback.message.kind(), "glimpse");
            pending.respond(Ok(AstReply::Ack));
        });

        let reply = target.deliver(AstMessage::Glimpse { lock: desc(2) }).await;
        assert_eq!(reply, Ok(AstReply::Ack));
        rpc.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_reports_failure() {
        let (dispatcher, worker, mut failures) = AstDispatcher::channel(AstDeliveryConfig::default());
        let shutdown = CancellationToken::new();
        let handle = worker.start(shutdown.clone());

        let (transport, rx) = ChannelTransport::new(1);
        drop(rx);
        let target = Arc::new(RemoteAstTarget::new(ExportId::new(), Arc::new(transport)));
        dispatcher.dispatch("ost0", target, AstMessage::Completion { lock: desc(9) });

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.namespace, "ost0");
        assert_eq!(failure.handle, LockHandle(9));
        assert_eq!(failure.error, AstError::TransportClosed);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_holder_times_out() {
        let config = AstDeliveryConfig {
            timeout: Duration::from_millis(50),
            concurrency: 1,
        };
        let (dispatcher, worker, mut failures) = AstDispatcher::channel(config);
        let shutdown = CancellationToken::new();
        worker.start(shutdown.clone());

        let (transport, _rx) = ChannelTransport::new(1);
        let target = Arc::new(RemoteAstTarget::new(ExportId::new(), Arc::new(transport)));
        dispatcher.dispatch(
            "ost0",
            target,
            AstMessage::Blocking {
                lock: desc(3),
                conflicting: desc(4),
            },
        );

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.kind, "blocking");
        assert_eq!(failure.error, AstError::Timeout(Duration::from_millis(50)));
        shutdown.cancel();
    }
}
