//! Unit tests for the reconciler core against the in-memory store

use super::synthesizer::{self, command};
use super::*;
use crate::error::ErrorClass;
use crate::test_utils::{TEST_REQUEUE, create_test_lolcow, create_test_reconciler, test_settings};
use crds::{DEFAULT_NODE_PORT, LolcowState};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use resource_store::{MockFailure, MockOp, MockResourceStore, StoreError, WriteRecord};
use std::collections::BTreeMap;

fn key() -> ObjectKey {
    ObjectKey::new("farm", "cow")
}

fn workload(store: &MockResourceStore) -> Deployment {
    match store.object(ResourceKind::Workload, &key()) {
        Some(ManagedObject::Workload(d)) => d,
        other => panic!("expected workload, got {:?}", other),
    }
}

fn endpoint(store: &MockResourceStore) -> Service {
    match store.object(ResourceKind::Endpoint, &key()) {
        Some(ManagedObject::Endpoint(s)) => s,
        other => panic!("expected endpoint, got {:?}", other),
    }
}

fn workload_command(store: &MockResourceStore) -> Vec<String> {
    let deployment = workload(store);
    let pod = deployment.spec.unwrap().template.spec.unwrap();
    pod.containers.into_iter().find(|c| c.name == "lolcow").unwrap().command.unwrap()
}

fn node_port(store: &MockResourceStore) -> Option<i32> {
    endpoint(store).spec.unwrap().ports.unwrap()[0].node_port
}

/// Reconciles until nothing is written, like the scheduler would
async fn converge(reconciler: &Reconciler) {
    let cancel = CancellationToken::new();
    for _ in 0..5 {
        if reconciler.reconcile(&key(), &cancel).await.unwrap().is_none() {
            return;
        }
    }
    panic!("reconciler did not converge");
}

fn foreign_owner(name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some("cow".to_string()),
        namespace: Some("farm".to_string()),
        owner_references: Some(vec![OwnerReference {
            api_version: "lolcow.microscaler.io/v1alpha1".to_string(),
            kind: "Lolcow".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_first_reconcile_creates_targets() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();
    assert_eq!(requeue, Some(TEST_REQUEUE));

    assert_eq!(workload_command(&store).last().map(String::as_str), Some("G1"));
    assert_eq!(node_port(&store), Some(30000));

    let status = store.lolcow(&key()).unwrap().status.unwrap();
    assert_eq!(status.applied_greeting.as_deref(), Some("G1"));
    assert_eq!(status.applied_port, Some(30000));
    assert_eq!(status.state, LolcowState::Converged);

    let writes: Vec<_> = store.writes().into_iter().map(|w| (w.op, w.kind)).collect();
    assert_eq!(
        writes,
        vec![
            (MockOp::Create, Some(ResourceKind::Workload)),
            (MockOp::Create, Some(ResourceKind::Endpoint)),
            (MockOp::PatchLolcowStatus, None),
        ]
    );
}

#[tokio::test]
async fn test_repeated_reconciles_are_write_free() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;
    store.clear_log();

    for _ in 0..3 {
        let requeue = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();
        assert_eq!(requeue, None);
    }
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_greeting_change_patches_in_place() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;
    let uid_before = workload(&store).metadata.uid;

    store.update_lolcow_spec(&key(), |spec| spec.greeting = "G2".to_string());
    store.clear_log();
    reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();

    assert_eq!(workload_command(&store), command("G2"));
    assert_eq!(workload(&store).metadata.uid, uid_before);
    assert_eq!(
        store.writes()[0],
        WriteRecord {
            op: MockOp::Patch,
            kind: Some(ResourceKind::Workload),
            key: key(),
        }
    );
    assert!(!store.calls().contains(&MockOp::Create));
    assert!(!store.calls().contains(&MockOp::Delete));
    assert_eq!(
        store.lolcow(&key()).unwrap().status.unwrap().applied_greeting.as_deref(),
        Some("G2")
    );
}

#[tokio::test]
async fn test_unset_port_uses_default() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 0));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;

    assert_eq!(node_port(&store), Some(DEFAULT_NODE_PORT));
    assert_eq!(store.lolcow(&key()).unwrap().status.unwrap().applied_port, Some(DEFAULT_NODE_PORT));
}

#[tokio::test]
async fn test_port_change_patches_endpoint_only() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;

    store.update_lolcow_spec(&key(), |spec| spec.port = 31000);
    store.clear_log();
    reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();

    assert_eq!(node_port(&store), Some(31000));
    let patched: Vec<_> = store
        .writes()
        .into_iter()
        .filter(|w| w.op == MockOp::Patch)
        .map(|w| w.kind)
        .collect();
    assert_eq!(patched, vec![Some(ResourceKind::Endpoint)]);
}

#[tokio::test]
async fn test_orphans_are_deleted() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;

    store.remove_lolcow(&key());
    let requeue = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();

    assert_eq!(requeue, None);
    assert!(store.object(ResourceKind::Workload, &key()).is_none());
    assert!(store.object(ResourceKind::Endpoint, &key()).is_none());

    // nothing left: another pass is a quiet no-op
    store.clear_log();
    assert_eq!(reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap(), None);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_orphan_cleanup_leaves_unrelated_objects() {
    let store = MockResourceStore::new();
    store.insert_object(ManagedObject::Workload(Deployment {
        metadata: ObjectMeta {
            name: Some("cow".to_string()),
            namespace: Some("farm".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }));
    store.insert_object(ManagedObject::Endpoint(Service {
        metadata: foreign_owner("another-cow", "uid-x"),
        ..Default::default()
    }));
    let reconciler = create_test_reconciler(&store);

    let removed = reconciler.cleanup_orphans(&key(), None, &CancellationToken::new()).await.unwrap();
    assert_eq!(removed, 0);
    assert!(store.object(ResourceKind::Workload, &key()).is_some());
    assert!(store.object(ResourceKind::Endpoint, &key()).is_some());
    assert!(!store.calls().contains(&MockOp::Delete));
}

#[tokio::test]
async fn test_matching_endpoint_is_not_patched() {
    let store = MockResourceStore::new();
    let lolcow = store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let targets = synthesizer::synthesize(&lolcow, &test_settings()).unwrap();
    store.insert_object(ManagedObject::Endpoint(targets.endpoint));
    let reconciler = create_test_reconciler(&store);

    reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();

    let endpoint_writes = store
        .writes()
        .into_iter()
        .filter(|w| w.kind == Some(ResourceKind::Endpoint))
        .count();
    assert_eq!(endpoint_writes, 0);
    assert!(store.object(ResourceKind::Workload, &key()).is_some());
}

#[tokio::test]
async fn test_tampering_is_reverted() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;

    store.mutate_object(ResourceKind::Workload, &key(), |obj| {
        if let ManagedObject::Workload(d) = obj {
            d.spec.as_mut().unwrap().replicas = Some(3);
        }
    });
    store.mutate_object(ResourceKind::Endpoint, &key(), |obj| {
        if let ManagedObject::Endpoint(s) = obj {
            s.spec.as_mut().unwrap().selector = Some(BTreeMap::from([("app".to_string(), "sheep".to_string())]));
        }
    });

    converge(&reconciler).await;

    assert_eq!(workload(&store).spec.unwrap().replicas, Some(1));
    assert_eq!(endpoint(&store).spec.unwrap().selector, Some(synthesizer::labels("cow")));
}

#[tokio::test]
async fn test_stale_version_is_a_conflict() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;
    store.update_lolcow_spec(&key(), |spec| spec.greeting = "G2".to_string());

    // someone else writes between our read and our patch
    store.fail_next(MockOp::Patch, Some(ResourceKind::Workload), MockFailure::Conflict);
    let err = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Store(StoreError::Conflict(_))));
    assert_eq!(err.class(), ErrorClass::Conflict);

    // the retry picks up from observed state
    converge(&reconciler).await;
    assert_eq!(workload_command(&store), command("G2"));
}

#[tokio::test]
async fn test_invalid_spec_creates_nothing() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "  ", 30000));
    let reconciler = create_test_reconciler(&store);

    let err = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Invalid(_)));
    assert_eq!(err.class(), ErrorClass::Invalid);

    assert!(!store.calls().contains(&MockOp::Create));
    let status = store.lolcow(&key()).unwrap().status.unwrap();
    assert_eq!(status.state, LolcowState::Invalid);
    assert!(status.error.unwrap().contains("greeting"));
}

#[tokio::test]
async fn test_out_of_range_port_is_invalid() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 8080));
    let reconciler = create_test_reconciler(&store);

    let err = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Invalid(_)));
    assert!(store.object(ResourceKind::Endpoint, &key()).is_none());
}

#[tokio::test]
async fn test_cancelled_invocation_does_nothing() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = reconciler.reconcile(&key(), &cancel).await.unwrap_err();
    assert!(matches!(err, ControllerError::Cancelled));
    assert!(store.calls().is_empty());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_unrelated_same_name_object_is_not_adopted() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    store.insert_object(ManagedObject::Workload(Deployment {
        metadata: ObjectMeta {
            name: Some("cow".to_string()),
            namespace: Some("farm".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }));
    let reconciler = create_test_reconciler(&store);

    let err = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(&err, ControllerError::Unmanaged(msg) if msg.contains("not managed")));
    // retried on backoff: removing the foreign object never wakes the Lolcow
    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(!store.calls().contains(&MockOp::Patch));
    assert!(!store.calls().contains(&MockOp::Delete));
    assert!(workload(&store).metadata.owner_references.is_none());

    let status = store.lolcow(&key()).unwrap().status.unwrap();
    assert_eq!(status.state, LolcowState::Invalid);
}

#[tokio::test]
async fn test_leftover_from_previous_incarnation_is_replaced() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    store.insert_object(ManagedObject::Endpoint(Service {
        metadata: foreign_owner("cow", "uid-of-deleted-cow"),
        ..Default::default()
    }));
    let reconciler = create_test_reconciler(&store);

    converge(&reconciler).await;

    let service = endpoint(&store);
    let owner = &service.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.uid, "uid-farm-cow");
    assert_eq!(node_port(&store), Some(30000));
}

#[tokio::test]
async fn test_status_failure_requeues() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;
    store.update_lolcow_spec(&key(), |spec| spec.greeting = "G2".to_string());
    reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();

    // objects converged, but the status write fails
    store.update_lolcow_spec(&key(), |spec| spec.greeting = "G3".to_string());
    store.fail_next(MockOp::PatchLolcowStatus, None, MockFailure::Transient);
    let requeue = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();
    assert_eq!(requeue, Some(TEST_REQUEUE));

    // next pass only writes the status
    store.clear_log();
    let requeue = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap();
    assert_eq!(requeue, None);
    let ops: Vec<_> = store.writes().into_iter().map(|w| w.op).collect();
    assert_eq!(ops, vec![MockOp::PatchLolcowStatus]);
    assert_eq!(
        store.lolcow(&key()).unwrap().status.unwrap().applied_greeting.as_deref(),
        Some("G3")
    );
}

#[tokio::test]
async fn test_transient_failure_aborts_remaining_steps() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    store.fail_next(MockOp::Get, Some(ResourceKind::Endpoint), MockFailure::Transient);
    let reconciler = create_test_reconciler(&store);

    let err = reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Store(StoreError::Transient(_))));
    assert!(store.object(ResourceKind::Workload, &key()).is_some());
    assert!(store.object(ResourceKind::Endpoint, &key()).is_none());
    assert!(store.lolcow(&key()).unwrap().status.is_none());

    converge(&reconciler).await;
    assert!(store.object(ResourceKind::Endpoint, &key()).is_some());
}

#[tokio::test]
async fn test_terminating_lolcow_is_left_alone() {
    let store = MockResourceStore::new();
    let mut lolcow = create_test_lolcow("cow", "farm", "G1", 30000);
    lolcow.metadata.deletion_timestamp = Some(serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap());
    store.insert_lolcow(lolcow);
    let reconciler = create_test_reconciler(&store);

    assert_eq!(reconciler.reconcile(&key(), &CancellationToken::new()).await.unwrap(), None);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_unmanaged_object_is_taken_over_once_removed() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    store.insert_object(ManagedObject::Workload(Deployment {
        metadata: ObjectMeta {
            name: Some("cow".to_string()),
            namespace: Some("farm".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }));
    let reconciler = create_test_reconciler(&store);
    assert!(reconciler.reconcile(&key(), &CancellationToken::new()).await.is_err());

    store.remove_object(ResourceKind::Workload, &key());
    converge(&reconciler).await;

    let owner = &workload(&store).metadata.owner_references.unwrap()[0];
    assert_eq!(owner.uid, "uid-farm-cow");
    assert_eq!(store.lolcow(&key()).unwrap().status.unwrap().state, LolcowState::Converged);
}

#[tokio::test]
async fn test_vanished_cleanup_skips_recreated_lolcow() {
    let store = MockResourceStore::new();
    store.insert_lolcow(create_test_lolcow("cow", "farm", "G1", 30000));
    let reconciler = create_test_reconciler(&store);
    converge(&reconciler).await;
    store.clear_log();

    let removed = reconciler
        .cleanup_vanished(&key(), Some("uid-of-deleted-cow"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(removed, 0);
    assert!(store.writes().is_empty());
    assert!(store.object(ResourceKind::Workload, &key()).is_some());
}

#[tokio::test]
async fn test_vanished_cleanup_only_touches_that_incarnation() {
    let store = MockResourceStore::new();
    store.insert_object(ManagedObject::Workload(Deployment {
        metadata: foreign_owner("cow", "uid-old"),
        ..Default::default()
    }));
    store.insert_object(ManagedObject::Endpoint(Service {
        metadata: foreign_owner("cow", "uid-new"),
        ..Default::default()
    }));
    let reconciler = create_test_reconciler(&store);

    let removed = reconciler
        .cleanup_vanished(&key(), Some("uid-old"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.object(ResourceKind::Workload, &key()).is_none());
    assert!(store.object(ResourceKind::Endpoint, &key()).is_some());
}

#[test]
fn test_managed_kind_selects_its_target() {
    let lolcow = create_test_lolcow("cow", "farm", "G1", 30000);
    let targets = synthesizer::synthesize(&lolcow, &test_settings()).unwrap();

    for kind in ResourceKind::ALL {
        let target = kind.synthesize(&targets);
        assert_eq!(target.kind(), kind);
        assert!(kind.diff(&target, &target).is_empty());
    }

    let drifted = synthesizer::synthesize(&create_test_lolcow("cow", "farm", "G2", 30001), &test_settings()).unwrap();
    let workload_patch = ResourceKind::Workload.diff(
        &ResourceKind::Workload.synthesize(&targets),
        &ResourceKind::Workload.synthesize(&drifted),
    );
    assert_eq!(workload_patch.describe(), "spec.template.spec.containers[].command");
}
