// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use std::time::Duration;

use cohort_dlm_core::domain::ast::{AstMessage, AstReply, NoopAstTarget};
use cohort_dlm_core::domain::config::{ClusterConfigManifest, WorkerConfig};
use cohort_dlm_core::domain::events::{LockEvent, NamespaceEvent};
use cohort_dlm_core::domain::lock::ExportId;
use cohort_dlm_core::domain::pool::NamespaceSide;
use cohort_dlm_core::domain::resource::ValueBlock;
use cohort_dlm_core::infrastructure::ast::{AstDeliveryConfig, LocalAstTarget};
use cohort_dlm_core::infrastructure::event_bus::{DlmEvent, EventBus};
use cohort_dlm_core::infrastructure::request_worker::{RequestResult, RequestWorkerPool};
use cohort_dlm_core::{
    ByteRange, DlmService, EnqueueOutcome, LockFlags, LockMode, LockOwner, LockRequest, ModeSet,
    PolicyData, ResourceId, Tunable,
};
use tokio_util::sync::CancellationToken;

const MANIFEST: &str = r#"
apiVersion: cohort.dev/v1
kind: DlmConfig
metadata:
  name: test-node
spec:
  node:
    id: node-7
    default_side: server
  namespaces:
    - name: mdt0
      limit: 64
    - name: osc0
      side: client
      unused_max: 2
  workers:
    count: 2
    queue_depth: 16
"#;

fn owner(pid: u32) -> LockOwner {
    LockOwner::new(pid, ExportId::local())
}

fn plain(res: ResourceId, mode: LockMode, who: LockOwner) -> LockRequest {
    LockRequest::new(res, mode, PolicyData::Plain, who, Arc::new(NoopAstTarget))
}

#[tokio::test]
async fn test_service_from_manifest() {
    let manifest = ClusterConfigManifest::from_yaml_str(MANIFEST).unwrap();
    manifest.validate().unwrap();

    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let service = DlmService::from_config(&manifest, events).unwrap();

    assert_eq!(service.node_id(), "node-7");
    assert_eq!(service.namespaces(), vec!["mdt0".to_string(), "osc0".to_string()]);
    assert_eq!(service.namespace("mdt0").unwrap().side(), NamespaceSide::Server);
    assert_eq!(service.namespace("osc0").unwrap().side(), NamespaceSide::Client);
    assert_eq!(
        service.namespace("mdt0").unwrap().get_tunable(Tunable::Limit),
        64
    );

    let mut created = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let DlmEvent::Namespace(NamespaceEvent::NamespaceCreated { namespace, .. }) = event {
            created.push(namespace);
        }
    }
    created.sort();
    assert_eq!(created, vec!["mdt0".to_string(), "osc0".to_string()]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_waiters_granted_after_holder_cancels() {
    let service = DlmService::new(
        "node-a",
        NamespaceSide::Server,
        AstDeliveryConfig::default(),
        Arc::new(EventBus::default()),
    );
    let ns = service
        .create_namespace(&cohort_dlm_core::domain::config::NamespaceConfig::new(
            "mdt0",
            NamespaceSide::Server,
        ))
        .unwrap();
    let res = ResourceId::new(20, 1);
    let holder = ns
        .enqueue(plain(res, LockMode::Ex, owner(1)))
        .unwrap()
        .handle()
        .unwrap();

    let token = CancellationToken::new();
    let waiters = (2..5).map(|pid| {
        let ns = ns.clone();
        let token = token.clone();
        async move {
            ns.enqueue_and_wait(
                plain(res, LockMode::Pr, owner(pid)),
                Some(Duration::from_secs(5)),
                &token,
            )
            .await
        }
    });
    let release = async {
        tokio::task::yield_now().await;
        assert!(ns.cancel(holder));
    };

    let (outcomes, ()) = tokio::join!(futures::future::join_all(waiters), release);
    for outcome in outcomes {
        assert!(matches!(outcome.unwrap(), EnqueueOutcome::Granted(_)));
    }
    assert_eq!(ns.resource_snapshot(res).unwrap().granted.len(), 3);
    service.shutdown().await;
}

#[tokio::test]
async fn test_client_cache_reuse_and_revocation() {
    let manifest = ClusterConfigManifest::from_yaml_str(MANIFEST).unwrap();
    let service = DlmService::from_config(&manifest, Arc::new(EventBus::default())).unwrap();
    let ns = service.namespace("osc0").unwrap();
    let res = ResourceId::new(21, 1);

    let h = ns
        .enqueue(plain(res, LockMode::Pr, owner(1)))
        .unwrap()
        .handle()
        .unwrap();
    ns.decref(h, LockMode::Pr).unwrap();
    assert_eq!(ns.unused_count(), 1);

    // A cached PR lock satisfies a later CR/PR need without a new request.
    let modes = ModeSet::from_modes(&[LockMode::Pr, LockMode::Cr]);
    assert_eq!(ns.match_lock(res, modes, &PolicyData::Plain), Some(h));
    assert_eq!(ns.unused_count(), 0);

    // Revoked while in use: survives until its last user drops it.
    assert!(!ns.handle_blocking_ast(h));
    assert_eq!(ns.match_lock(res, modes, &PolicyData::Plain), None);
    ns.decref(h, LockMode::Pr).unwrap();
    assert!(ns.lock_info(h).is_none());
    assert_eq!(ns.unused_count(), 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_glimpse_asks_the_writer() {
    let service = DlmService::new(
        "node-a",
        NamespaceSide::Server,
        AstDeliveryConfig::default(),
        Arc::new(EventBus::default()),
    );
    let ns = service
        .create_namespace(&cohort_dlm_core::domain::config::NamespaceConfig::new(
            "ost0",
            NamespaceSide::Server,
        ))
        .unwrap();
    let res = ResourceId::new(22, 1);

    let writer = LocalAstTarget::new(|message| match message {
        AstMessage::Glimpse { .. } => AstReply::ValueBlock(ValueBlock {
            size: 8192,
            blocks: 16,
            mtime: 1_700_000_000,
            ..ValueBlock::default()
        }),
        _ => AstReply::Ack,
    });
    ns.enqueue(LockRequest::new(
        res,
        LockMode::Pw,
        PolicyData::Extent {
            range: ByteRange::new(0, 8192).unwrap(),
            gid: 0,
        },
        owner(1),
        Arc::new(writer),
    ))
    .unwrap();
    ns.update_value_block(
        res,
        ValueBlock {
            size: 4096,
            atime: 1_800_000_000,
            ..ValueBlock::default()
        },
    )
    .unwrap();

    let merged = ns.glimpse(res).await.unwrap();
    assert_eq!(merged.size, 8192);
    assert_eq!(merged.blocks, 16);
    assert_eq!(merged.atime, 1_800_000_000);
    service.shutdown().await;
}

#[tokio::test]
async fn test_request_workers_end_to_end() {
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let manifest = ClusterConfigManifest::from_yaml_str(MANIFEST).unwrap();
    let service = DlmService::from_config(&manifest, events).unwrap();
    let shutdown = CancellationToken::new();
    let pool = RequestWorkerPool::start(
        service.clone(),
        &WorkerConfig {
            count: 2,
            queue_depth: 4,
        },
        shutdown.clone(),
    );
    let client = pool.sender();
    let res = ResourceId::new(23, 1);
    let flock = |mode, start, end, pid| {
        LockRequest::new(
            res,
            mode,
            PolicyData::Flock {
                range: ByteRange::new(start, end).unwrap(),
            },
            owner(pid),
            Arc::new(NoopAstTarget),
        )
    };

    let granted = client.enqueue("mdt0", flock(LockMode::Pw, 0, 100, 1)).await.unwrap();
    assert!(matches!(granted, RequestResult::Granted { .. }));

    let query = flock(LockMode::Pr, 10, 20, 2).with_flags(LockFlags::TEST_LOCK);
    match client.enqueue("mdt0", query).await.unwrap() {
        RequestResult::Changed { conflict } => {
            assert_eq!(conflict.mode, LockMode::Pw);
            assert_eq!(conflict.owner, owner(1));
        }
        other => panic!("expected conflict report, got {:?}", other),
    }

    let unlock = client.enqueue("mdt0", flock(LockMode::Nl, 0, 100, 1)).await.unwrap();
    assert_eq!(unlock, RequestResult::Released);

    let wire = serde_json::to_string(&unlock).unwrap();
    assert!(wire.contains("released"));

    let mut granted_events = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, DlmEvent::Lock(LockEvent::LockGranted { .. })) {
            granted_events += 1;
            assert!(serde_json::to_value(&event).is_ok());
        }
    }
    assert!(granted_events >= 1);

    shutdown.cancel();
    drop(client);
    pool.join().await;
    service.shutdown().await;
}
