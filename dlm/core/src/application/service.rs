// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! DLM Service
//!
//! Owns the namespace registry and every background task the lock manager
//! runs: one pool controller per namespace, the AST delivery worker, and
//! the eviction task that cancels locks whose holders could not be reached.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Namespace lifecycle and task supervision

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::namespace::Namespace;
use crate::application::pool_controller::PoolController;
use crate::domain::config::{ClusterConfigManifest, NamespaceConfig};
use crate::domain::error::DlmError;
use crate::domain::events::NamespaceEvent;
use crate::domain::pool::NamespaceSide;
use crate::infrastructure::ast::{AstDeliveryConfig, AstDispatcher, AstFailure};
use crate::infrastructure::event_bus::EventBus;

struct NamespaceEntry {
    namespace: Arc<Namespace>,
    stop: CancellationToken,
    controller: Option<JoinHandle<()>>,
}

pub struct DlmService {
    node_id: String,
    default_side: NamespaceSide,
    namespaces: RwLock<HashMap<String, NamespaceEntry>>,
    dispatcher: AstDispatcher,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DlmService {
    /// Start an empty service. Must be called from within a Tokio runtime.
    pub fn new(
        node_id: impl Into<String>,
        default_side: NamespaceSide,
        delivery: AstDeliveryConfig,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (dispatcher, worker, failures) = AstDispatcher::channel(delivery);
        let shutdown = CancellationToken::new();
        let service = Arc::new(Self {
            node_id: node_id.into(),
            default_side,
            namespaces: RwLock::new(HashMap::new()),
            dispatcher,
            events,
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let delivery_task = worker.start(shutdown.child_token());
        let eviction_task = tokio::spawn(evict_unreachable_holders(
            Arc::downgrade(&service),
            failures,
            shutdown.child_token(),
        ));
        service.tasks.lock().extend([delivery_task, eviction_task]);

        info!(node = %service.node_id, side = %default_side, "DLM service started");
        service
    }

    /// Start a service and create every namespace the manifest declares.
    pub fn from_config(
        manifest: &ClusterConfigManifest,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>, DlmError> {
        let service = Self::new(
            manifest.spec.node.id.clone(),
            manifest.spec.node.default_side,
            AstDeliveryConfig::default(),
            events,
        );
        for (mut config, side) in manifest.resolved_namespaces() {
            config.side = Some(side);
            service.create_namespace(&config)?;
        }
        Ok(service)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn create_namespace(&self, config: &NamespaceConfig) -> Result<Arc<Namespace>, DlmError> {
        if config.name.is_empty() {
            return Err(DlmError::invalid("namespace name must not be empty"));
        }
        let side = config.side_or(self.default_side);

        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(&config.name) {
            return Err(DlmError::NamespaceExists(config.name.clone()));
        }

        let namespace = Arc::new(Namespace::new(
            config,
            side,
            self.dispatcher.clone(),
            self.events.clone(),
        ));
        let stop = self.shutdown.child_token();
        let controller = Arc::new(PoolController::new(namespace.clone())).start(stop.clone());
        namespaces.insert(
            config.name.clone(),
            NamespaceEntry {
                namespace: namespace.clone(),
                stop,
                controller: Some(controller),
            },
        );
        drop(namespaces);

        info!(namespace = %config.name, side = %side, limit = config.limit, "Namespace created");
        self.events
            .publish_namespace_event(NamespaceEvent::NamespaceCreated {
                namespace: config.name.clone(),
                side,
                created_at: Utc::now(),
            });
        Ok(namespace)
    }

    pub fn namespace(&self, name: &str) -> Result<Arc<Namespace>, DlmError> {
        self.namespaces
            .read()
            .get(name)
            .map(|entry| entry.namespace.clone())
            .ok_or_else(|| DlmError::BadNamespace(name.to_string()))
    }

    /// Names of all namespaces, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every lock in `name`, stop its controller and drop it.
    /// Returns how many locks were cancelled.
    pub async fn remove_namespace(&self, name: &str) -> Result<usize, DlmError> {
        let entry = self
            .namespaces
            .write()
            .remove(name)
            .ok_or_else(|| DlmError::BadNamespace(name.to_string()))?;

        entry.stop.cancel();
        let cancelled = entry.namespace.cancel_all();
        if let Some(controller) = entry.controller {
            if let Err(e) = controller.await {
                warn!(namespace = %name, error = %e, "Pool controller ended abnormally");
            }
        }

        info!(namespace = %name, cancelled, "Namespace removed");
        self.events
            .publish_namespace_event(NamespaceEvent::NamespaceRemoved {
                namespace: name.to_string(),
                locks_cancelled: cancelled,
                removed_at: Utc::now(),
            });
        Ok(cancelled)
    }

    /// Stop every background task and wait for them to finish. Namespaces
    /// stay registered.
    pub async fn shutdown(&self) {
        info!(node = %self.node_id, "Shutting down DLM service");
        self.shutdown.cancel();

        let controllers: Vec<JoinHandle<()>> = {
            let mut namespaces = self.namespaces.write();
            namespaces
                .values_mut()
                .filter_map(|entry| entry.controller.take())
                .collect()
        };
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());

        let results = futures::future::join_all(controllers.into_iter().chain(tasks)).await;
        for e in results.into_iter().filter_map(Result::err) {
            warn!(error = %e, "Background task ended abnormally");
        }
        debug!("DLM service stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Cancel locks whose holders did not take an AST. The transport has
/// already given up on them.
async fn evict_unreachable_holders(
    service: Weak<DlmService>,
    mut failures: mpsc::UnboundedReceiver<AstFailure>,
    shutdown: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = failures.recv() => match next {
                Some(failure) => failure,
                None => break,
            },
        };
        let Some(service) = service.upgrade() else {
            break;
        };
        match service.namespace(&failure.namespace) {
            Ok(ns) => {
                if ns.cancel(failure.handle) {
                    warn!(
                        namespace = %failure.namespace,
                        handle = %failure.handle,
                        kind = failure.kind,
                        error = %failure.error,
                        "Evicted lock after failed AST delivery"
                    );
                }
            }
            Err(_) => debug!(namespace = %failure.namespace, "AST failure for a removed namespace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::namespace::{EnqueueOutcome, LockRequest};
    use crate::domain::ast::{AstError, AstMessage, AstReply, AstTarget, HolderLocality};
    use crate::domain::lock::{ExportId, LockOwner, PolicyData};
    use crate::domain::mode::LockMode;
    use crate::domain::resource::ResourceId;
    use async_trait::async_trait;
    use std::time::Duration;

    fn service() -> Arc<DlmService> {
        DlmService::new(
            "node-a",
            NamespaceSide::Server,
            AstDeliveryConfig {
                timeout: Duration::from_millis(50),
                concurrency: 4,
            },
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn test_namespace_registry() {
        let svc = service();
        svc.create_namespace(&NamespaceConfig::new("mdt0", NamespaceSide::Server))
            .unwrap();
        assert!(matches!(
            svc.create_namespace(&NamespaceConfig::new("mdt0", NamespaceSide::Server)),
            Err(DlmError::NamespaceExists(_))
        ));
        assert!(matches!(
            svc.namespace("nope"),
            Err(DlmError::BadNamespace(_))
        ));
        assert_eq!(svc.namespaces(), vec!["mdt0".to_string()]);
        svc.shutdown().await;
        assert!(svc.is_shut_down());
    }

    #[tokio::test]
    async fn test_remove_namespace_cancels_locks() {
        let svc = service();
        let ns = svc
            .create_namespace(&NamespaceConfig::new("ost0", NamespaceSide::Server))
            .unwrap();
        let owner = LockOwner::new(1, ExportId::local());
        for i in 0..3 {
            ns.enqueue(LockRequest::new(
                ResourceId::new(1, i),
                LockMode::Pr,
                PolicyData::Plain,
                owner,
                Arc::new(crate::domain::ast::NoopAstTarget),
            ))
            .unwrap();
        }

        assert_eq!(svc.remove_namespace("ost0").await.unwrap(), 3);
        assert!(svc.namespace("ost0").is_err());
        assert!(matches!(
            svc.remove_namespace("ost0").await,
            Err(DlmError::BadNamespace(_))
        ));
        svc.shutdown().await;
    }

    struct Unreachable;

    #[async_trait]
    impl AstTarget for Unreachable {
        fn locality(&self) -> HolderLocality {
            HolderLocality::Remote
        }

        async fn deliver(&self, _message: AstMessage) -> Result<AstReply, AstError> {
            Err(AstError::TransportClosed)
        }
    }

    #[tokio::test]
    async fn test_failed_blocking_ast_evicts_holder() {
        let svc = service();
        let ns = svc
            .create_namespace(&NamespaceConfig::new("mdt1", NamespaceSide::Server))
            .unwrap();
        let res = ResourceId::new(9, 9);
        let holder = LockOwner::new(1, ExportId::new());
        let EnqueueOutcome::Granted(h1) = ns
            .enqueue(LockRequest::new(
                res,
                LockMode::Ex,
                PolicyData::Plain,
                holder,
                Arc::new(Unreachable),
            ))
            .unwrap()
        else {
            panic!()
        };

        let waiter = LockRequest::new(
            res,
            LockMode::Ex,
            PolicyData::Plain,
            LockOwner::new(2, ExportId::local()),
            Arc::new(crate::domain::ast::NoopAstTarget),
        );
        let outcome = ns
            .enqueue_and_wait(waiter, Some(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Granted(_)));
        assert!(ns.lock_info(h1).is_none());
        svc.shutdown().await;
    }
}
