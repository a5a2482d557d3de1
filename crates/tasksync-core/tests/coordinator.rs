use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use tasksync_core::backend::{Backend, BackendError};
use tasksync_core::backends::{MemoryBackend, RemoteCall};
use tasksync_core::cache::{CacheBackend, CacheStore};
use tasksync_core::config::OfflineMode;
use tasksync_core::coordinator::{CoordinatorSettings, SyncCoordinator, SyncTrigger};
use tasksync_core::model::{now, Task};

struct Fixture {
    remote: Arc<MemoryBackend>,
    store: Arc<CacheStore>,
    cache: CacheBackend,
    coordinator: SyncCoordinator,
}

fn fixture(sync_interval: Duration) -> Fixture {
    let remote = Arc::new(MemoryBackend::new("work"));
    let store = Arc::new(CacheStore::open_in_memory().expect("store"));
    let cache = CacheBackend::new(remote.clone() as Arc<dyn Backend>, store.clone());
    let settings = CoordinatorSettings {
        sync_interval,
        offline_mode: OfflineMode::Online,
        ..CoordinatorSettings::default()
    };
    let coordinator = SyncCoordinator::new(store.clone(), remote.clone() as Arc<dyn Backend>, settings);
    Fixture {
        remote,
        store,
        cache,
        coordinator,
    }
}

async fn wait_for_push(coordinator: &SyncCoordinator) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while coordinator.push_in_flight() {
        assert!(std::time::Instant::now() < deadline, "push did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn add_calls(remote: &MemoryBackend) -> usize {
    remote
        .calls()
        .iter()
        .filter(|call| matches!(call, RemoteCall::AddTask { .. }))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn staleness_follows_the_interval() {
    let fx = fixture(Duration::from_secs(300));
    let list_id = fx.remote.seed_list("Work");
    let synced_at = now();
    fx.store
        .mark_list_synced("work", &list_id, synced_at, Some("v1"))
        .expect("mark synced");

    assert!(!fx.coordinator.is_stale_at(&list_id, synced_at + ChronoDuration::seconds(299)));
    assert!(fx.coordinator.is_stale_at(&list_id, synced_at + ChronoDuration::seconds(301)));
    assert!(fx.coordinator.is_stale_at(&list_id, synced_at + ChronoDuration::hours(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_read_pulls_in_the_background() {
    let fx = fixture(Duration::from_secs(300));
    let list_id = fx.remote.seed_list("Work");
    fx.coordinator.manager().pull_only(None).await.expect("initial pull");
    fx.remote
        .add_task(&list_id, &Task::new("Added elsewhere"))
        .await
        .expect("remote add");

    assert!(fx.cache.get_tasks(&list_id, None).await.expect("tasks").is_empty());
    assert!(fx.coordinator.trigger_pull_sync(&list_id));
    let report = fx.coordinator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.abandoned, 0);

    let cached = fx.cache.get_tasks(&list_id, None).await.expect("tasks");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].summary, "Added elsewhere");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_push_triggers_coalesce() {
    let fx = fixture(Duration::from_secs(300));
    let list_id = fx.remote.seed_list("Work");
    fx.coordinator.manager().pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Once")).await.expect("add");

    fx.remote.set_latency(Some(Duration::from_millis(200)));
    assert!(fx.coordinator.trigger_push_sync());
    assert!(!fx.coordinator.trigger_push_sync());
    assert!(!fx.coordinator.trigger_push_sync());
    assert!(fx.coordinator.push_in_flight());

    let report = fx.coordinator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.completed, 1);
    assert_eq!(add_calls(&fx.remote), 1);
    assert_eq!(fx.remote.tasks(&list_id).len(), 1);
    assert_eq!(fx.cache.pending_count().expect("count"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_pull_triggers_for_one_list_coalesce() {
    let fx = fixture(Duration::from_secs(300));
    let list_id = fx.remote.seed_list("Work");
    fx.remote.set_latency(Some(Duration::from_millis(200)));

    assert!(fx.coordinator.trigger_pull_sync(&list_id));
    assert!(!fx.coordinator.trigger_pull_sync(&list_id));
    let report = fx.coordinator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.completed, 1);
    let fetches = fx
        .remote
        .calls()
        .iter()
        .filter(|call| matches!(call, RemoteCall::GetTasks(_)))
        .count();
    assert_eq!(fetches, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_abandons_slow_work_and_keeps_the_journal() {
    let fx = fixture(Duration::from_secs(300));
    let list_id = fx.remote.seed_list("Work");
    fx.coordinator.manager().pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Slow")).await.expect("add");

    fx.remote.set_latency(Some(Duration::from_secs(5)));
    assert!(fx.coordinator.trigger_push_sync());
    let started = std::time::Instant::now();
    let report = fx.coordinator.shutdown(Duration::from_millis(500)).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.abandoned, 1);

    assert_eq!(fx.cache.pending_count().expect("count"), 1);
    assert!(fx.remote.tasks(&list_id).is_empty());
    assert!(!fx.coordinator.trigger_push_sync(), "no new work after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_failure_stops_further_background_syncs() {
    let fx = fixture(Duration::from_secs(300));
    let list_id = fx.remote.seed_list("Work");
    fx.coordinator.manager().pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Locked out")).await.expect("add");
    fx.remote.clear_calls();

    fx.remote.fail_next(BackendError::from_status("add task", 401, "token expired"));
    assert!(fx.coordinator.trigger_push_sync());
    wait_for_push(&fx.coordinator).await;

    assert!(!fx.coordinator.trigger_push_sync());
    assert!(!fx.coordinator.trigger_pull_sync(&list_id));
    let report = fx.coordinator.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.abandoned, 0);
    assert!(fx.remote.calls().is_empty(), "{:?}", fx.remote.calls());

    let ops = fx.store.pending_operations(Some("work")).expect("ops");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].attempts, 0);

    let push = fx.coordinator.manager().push_only().await.expect("foreground push still works");
    assert_eq!(push.pushed, 1);
    assert_eq!(add_calls(&fx.remote), 1);
}
