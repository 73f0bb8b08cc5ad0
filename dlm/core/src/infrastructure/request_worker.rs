// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request Workers - Bounded pool serving inbound lock requests
//!
//! The transport pushes decoded requests onto a bounded queue; a fixed set
//! of workers resolves them against the service and answers each through
//! its own reply channel. Workers never suspend on a blocked request: the
//! answer is `Blocked(handle)` and the grant arrives later as a completion
//! AST.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::namespace::{ConvertOutcome, EnqueueOutcome, LockRequest};
use crate::application::service::DlmService;
use crate::domain::config::WorkerConfig;
use crate::domain::error::{DlmError, DlmStatus};
use crate::domain::lock::{ConflictDescriptor, LockHandle};
use crate::domain::mode::LockMode;

/// A request as it comes off the wire, with the channel for its answer.
#[derive(Debug)]
pub enum InboundRequest {
    Enqueue {
        namespace: String,
        request: LockRequest,
        reply: oneshot::Sender<RequestResult>,
    },
    Convert {
        namespace: String,
        handle: LockHandle,
        mode: LockMode,
        reply: oneshot::Sender<RequestResult>,
    },
    Cancel {
        namespace: String,
        handle: LockHandle,
        reply: oneshot::Sender<RequestResult>,
    },
}

impl InboundRequest {
    fn kind(&self) -> &'static str {
        match self {
            InboundRequest::Enqueue { .. } => "enqueue",
            InboundRequest::Convert { .. } => "convert",
            InboundRequest::Cancel { .. } => "cancel",
        }
    }
}

/// Reply sent back to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RequestResult {
    Granted { handle: LockHandle },
    Blocked { handle: LockHandle },
    Changed { conflict: ConflictDescriptor },
    Released,
    Cancelled { existed: bool },
    Error { status: DlmStatus, message: String },
}

impl RequestResult {
    pub fn status(&self) -> DlmStatus {
        match self {
            RequestResult::Changed { .. } => DlmStatus::LockChanged,
            RequestResult::Error { status, .. } => *status,
            _ => DlmStatus::Ok,
        }
    }
}

impl From<DlmError> for RequestResult {
    fn from(e: DlmError) -> Self {
        RequestResult::Error {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

impl From<EnqueueOutcome> for RequestResult {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Granted(handle) => RequestResult::Granted { handle },
            EnqueueOutcome::Blocked(handle) => RequestResult::Blocked { handle },
            EnqueueOutcome::Changed(conflict) => RequestResult::Changed { conflict },
            EnqueueOutcome::Released => RequestResult::Released,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Request queue is closed")]
    QueueClosed,

    #[error("Worker dropped the request without answering")]
    NoReply,
}

/// Cloneable submission side of the worker queue.
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<InboundRequest>,
}

impl RequestSender {
    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<RequestResult>) -> InboundRequest,
    ) -> Result<RequestResult, RequestError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RequestError::QueueClosed)?;
        answer.await.map_err(|_| RequestError::NoReply)
    }

    pub async fn enqueue(
        &self,
        namespace: impl Into<String>,
        request: LockRequest,
    ) -> Result<RequestResult, RequestError> {
        let namespace = namespace.into();
        self.call(|reply| InboundRequest::Enqueue {
            namespace,
            request,
            reply,
        })
        .await
    }

    pub async fn convert(
        &self,
        namespace: impl Into<String>,
        handle: LockHandle,
        mode: LockMode,
    ) -> Result<RequestResult, RequestError> {
        let namespace = namespace.into();
        self.call(|reply| InboundRequest::Convert {
            namespace,
            handle,
            mode,
            reply,
        })
        .await
    }

    pub async fn cancel(
        &self,
        namespace: impl Into<String>,
        handle: LockHandle,
    ) -> Result<RequestResult, RequestError> {
        let namespace = namespace.into();
        self.call(|reply| InboundRequest::Cancel {
            namespace,
            handle,
            reply,
        })
        .await
    }
}

pub struct RequestWorkerPool {
    sender: RequestSender,
    workers: Vec<JoinHandle<()>>,
}

impl RequestWorkerPool {
    pub fn start(
        service: Arc<DlmService>,
        config: &WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let count = config.count.max(1);
        let workers = (0..count)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    service.clone(),
                    rx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        info!(workers = count, queue_depth = config.queue_depth, "Request workers started");
        Self {
            sender: RequestSender { tx },
            workers,
        }
    }

    pub fn sender(&self) -> RequestSender {
        self.sender.clone()
    }

    /// Wait for every worker to exit. Workers stop on shutdown, or once all
    /// senders are gone and the queue is drained.
    pub async fn join(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Request worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    id: usize,
    service: Arc<DlmService>,
    queue: Arc<Mutex<mpsc::Receiver<InboundRequest>>>,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "Request worker started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(request) = next else {
            break;
        };
        metrics::counter!("dlm_requests_total", "kind" => request.kind()).increment(1);
        handle_request(&service, request);
    }
    debug!(worker = id, "Request worker stopped");
}

fn handle_request(service: &DlmService, request: InboundRequest) {
    match request {
        InboundRequest::Enqueue {
            namespace,
            request,
            reply,
        } => {
            let result = service
                .namespace(&namespace)
                .and_then(|ns| ns.enqueue(request))
                .map_or_else(RequestResult::from, RequestResult::from);
            let _ = reply.send(result);
        }
        InboundRequest::Convert {
            namespace,
            handle,
            mode,
            reply,
        } => {
            let result = service
                .namespace(&namespace)
                .and_then(|ns| ns.convert(handle, mode))
                .map_or_else(RequestResult::from, |outcome| match outcome {
                    ConvertOutcome::Granted => RequestResult::Granted { handle },
                    ConvertOutcome::Blocked => RequestResult::Blocked { handle },
                });
            let _ = reply.send(result);
        }
        InboundRequest::Cancel {
            namespace,
            handle,
            reply,
        } => {
            let result = service
                .namespace(&namespace)
                .map_or_else(RequestResult::from, |ns| RequestResult::Cancelled {
                    existed: ns.cancel(handle),
                });
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ast::NoopAstTarget;
    use crate::domain::config::NamespaceConfig;
    use crate::domain::lock::{ExportId, LockOwner, PolicyData};
    use crate::domain::pool::NamespaceSide;
    use crate::domain::resource::ResourceId;
    use crate::infrastructure::ast::AstDeliveryConfig;
    use crate::infrastructure::event_bus::EventBus;

    fn request(pid: u32, mode: LockMode) -> LockRequest {
        LockRequest::new(
            ResourceId::new(1, 1),
            mode,
            PolicyData::Plain,
            LockOwner::new(pid, ExportId::local()),
            Arc::new(NoopAstTarget),
        )
    }

    #[test]
    fn test_result_wire_shape() {
        let json = serde_json::to_value(RequestResult::Granted {
            handle: LockHandle(5),
        })
        .unwrap();
        assert_eq!(json["result"], "granted");

        let err = RequestResult::from(DlmError::WouldBlock);
        assert_eq!(err.status().code(), DlmStatus::WouldBlock.code());
        let back: RequestResult = serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(back, err);
    }

    #[tokio::test]
    async fn test_workers_answer_requests() {
        let service = DlmService::new(
            "node-a",
            NamespaceSide::Server,
            AstDeliveryConfig::default(),
            Arc::new(EventBus::default()),
        );
        service
            .create_namespace(&NamespaceConfig::new("mdt0", NamespaceSide::Server))
            .unwrap();
        let shutdown = CancellationToken::new();
        let pool = RequestWorkerPool::start(
            service.clone(),
            &WorkerConfig {
                count: 2,
                queue_depth: 8,
            },
            shutdown.clone(),
        );
        let client = pool.sender();

        let RequestResult::Granted { handle } =
            client.enqueue("mdt0", request(1, LockMode::Ex)).await.unwrap()
        else {
            panic!("expected grant")
        };
        let blocked = client.enqueue("mdt0", request(2, LockMode::Pr)).await.unwrap();
        assert!(matches!(blocked, RequestResult::Blocked { .. }));

        assert_eq!(
            client.convert("mdt0", handle, LockMode::Pr).await.unwrap(),
            RequestResult::Granted { handle }
        );
        assert_eq!(
            client.cancel("mdt0", handle).await.unwrap(),
            RequestResult::Cancelled { existed: true }
        );

        let missing = client.enqueue("nope", request(3, LockMode::Pr)).await.unwrap();
        assert_eq!(missing.status(), DlmStatus::BadNamespace);

        shutdown.cancel();
        drop(client);
        pool.join().await;
        service.shutdown().await;
    }
}
