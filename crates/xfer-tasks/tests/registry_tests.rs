//! Registry scenarios: concurrent control calls, the one-active-task rule,
//! stale slots, and TTL expiry of idle tasks.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use xfer_tasks::{
    ActiveSlot, InMemoryStateStore, RegistryConfig, StateStore, TaskError, TaskKind,
    TaskRegistry, TaskState,
};

fn registry_with_store() -> (TaskRegistry, Arc<dyn StateStore>) {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::in_memory());
    (TaskRegistry::new(Arc::clone(&store)), store)
}

fn registry_with_ttl(ttl: Duration) -> TaskRegistry {
    TaskRegistry::new(Arc::new(InMemoryStateStore::in_memory())).with_config(RegistryConfig {
        default_ttl: ttl,
        ..RegistryConfig::default()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_for_one_owner_yield_one_task() {
    let (registry, store) = registry_with_store();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.create_task("owner-1", TaskKind::Upload).await
        }));
    }

    let mut created = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(record) => created.push(record),
            Err(TaskError::AlreadyActive { .. }) => {},
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created.len(), 1);

    let slot = store.active_slot("owner-1").await.unwrap().unwrap();
    assert_eq!(slot.task_id, created[0].task_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_simultaneous_aborts_exactly_one_succeeds() {
    let (registry, _store) = registry_with_store();
    let task = registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();

    let a = {
        let registry = registry.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move { registry.abort(&task_id, "owner-1").await })
    };
    let b = {
        let registry = registry.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move { registry.abort(&task_id, "owner-1").await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let invalid = results
        .iter()
        .filter(|r| matches!(r, Err(TaskError::InvalidTransition { .. })))
        .count();
    assert_eq!((ok, invalid), (1, 1));
}

#[tokio::test]
async fn second_abort_observes_invalid_transition() {
    let (registry, _store) = registry_with_store();
    let task = registry
        .create_task("owner-1", TaskKind::Download)
        .await
        .unwrap();
    registry.abort(&task.task_id, "owner-1").await.unwrap();

    let err = registry.abort(&task.task_id, "owner-1").await.unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert!(matches!(
        err,
        TaskError::InvalidTransition {
            from: TaskState::Aborted,
            ..
        }
    ));
}

#[tokio::test]
async fn delete_conflicts_with_in_flight_upload() {
    let (registry, _store) = registry_with_store();
    let upload = registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
    registry
        .start(&upload.task_id, "owner-1", TaskKind::Upload, "run-1")
        .await
        .unwrap();

    let err = registry
        .create_task("owner-1", TaskKind::Delete)
        .await
        .unwrap_err();
    match err {
        TaskError::AlreadyActive { active_task_id, .. } => {
            assert_eq!(active_task_id, upload.task_id);
        },
        other => panic!("expected AlreadyActive, got: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_racing_progress_writes_loses_nothing() {
    let registry =
        TaskRegistry::new(Arc::new(InMemoryStateStore::in_memory())).with_config(RegistryConfig {
            cas_retries: 64,
            ..RegistryConfig::default()
        });
    let task = registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
    registry
        .start(&task.task_id, "owner-1", TaskKind::Upload, "run-1")
        .await
        .unwrap();

    let writer = {
        let registry = registry.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            for n in 1..=20 {
                registry.record_progress(&task_id, "run-1", n).await.unwrap();
            }
        })
    };
    let pauser = {
        let registry = registry.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move { registry.pause(&task_id, "owner-1").await })
    };

    writer.await.unwrap();
    pauser.await.unwrap().unwrap();

    let record = registry.get(&task.task_id, "owner-1").await.unwrap();
    assert_eq!(record.state, TaskState::Paused);
    assert_eq!(record.progress, 20);
}

#[tokio::test]
async fn stale_slot_pointing_at_missing_task_is_replaced() {
    let (registry, store) = registry_with_store();
    store
        .claim_slot("owner-1", "vanished-task", None, Duration::from_secs(60))
        .await
        .unwrap();

    let task = registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
    let slot: ActiveSlot = store.active_slot("owner-1").await.unwrap().unwrap();
    assert_eq!(slot.task_id, task.task_id);
}

#[tokio::test]
async fn completed_task_frees_the_owner() {
    let (registry, store) = registry_with_store();
    let task = registry
        .create_task("owner-1", TaskKind::Delete)
        .await
        .unwrap();
    registry
        .start(&task.task_id, "owner-1", TaskKind::Delete, "run-1")
        .await
        .unwrap();
    registry.complete(&task.task_id, "run-1").await.unwrap();

    assert!(store.active_slot("owner-1").await.unwrap().is_none());
    registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_paused_task_expires() {
    let registry = registry_with_ttl(Duration::from_secs(30));
    let task = registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
    registry
        .start(&task.task_id, "owner-1", TaskKind::Upload, "run-1")
        .await
        .unwrap();
    registry.pause(&task.task_id, "owner-1").await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;

    assert!(registry.checkpoint(&task.task_id).await.unwrap().is_none());
    let err = registry.get(&task.task_id, "owner-1").await.unwrap_err();
    assert!(err.is_gone());
    assert!(matches!(
        registry.resume(&task.task_id, "owner-1").await,
        Err(TaskError::NotFound { .. })
    ));

    // The owner slot lapsed with the task.
    registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn activity_keeps_task_alive() {
    let registry = registry_with_ttl(Duration::from_secs(30));
    let task = registry
        .create_task("owner-1", TaskKind::Upload)
        .await
        .unwrap();
    registry
        .start(&task.task_id, "owner-1", TaskKind::Upload, "run-1")
        .await
        .unwrap();

    for n in 1..=5 {
        tokio::time::advance(Duration::from_secs(20)).await;
        registry
            .record_progress(&task.task_id, "run-1", n)
            .await
            .unwrap();
    }

    let record = registry.get(&task.task_id, "owner-1").await.unwrap();
    assert_eq!(record.progress, 5);

    // The slot was refreshed along with the record.
    assert!(matches!(
        registry.create_task("owner-1", TaskKind::Delete).await,
        Err(TaskError::AlreadyActive { .. })
    ));
}
