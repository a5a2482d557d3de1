use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use pretty_assertions::assert_eq;

use tasksync_core::backend::{Backend, BackendError};
use tasksync_core::backends::{MemoryBackend, RemoteCall};
use tasksync_core::cache::{is_temp_id, CacheBackend, CacheStore, OpKind};
use tasksync_core::conflict::{ConflictPolicy, LOCAL_COPY_SUFFIX};
use tasksync_core::model::{now, Task, TaskStatus};
use tasksync_core::sync::SyncManager;

struct Fixture {
    remote: Arc<MemoryBackend>,
    store: Arc<CacheStore>,
    cache: CacheBackend,
    manager: SyncManager,
}

fn fixture(policy: ConflictPolicy) -> Fixture {
    let remote = Arc::new(MemoryBackend::new("work"));
    let store = Arc::new(CacheStore::open_in_memory().expect("store"));
    let cache = CacheBackend::new(remote.clone() as Arc<dyn Backend>, store.clone());
    let manager = SyncManager::new(store.clone(), remote.clone() as Arc<dyn Backend>, policy);
    Fixture {
        remote,
        store,
        cache,
        manager,
    }
}

/// A remote list holding one task, pulled into the cache.
async fn synced_task(fx: &Fixture, summary: &str) -> (String, Task) {
    let list_id = fx.remote.seed_list("Work");
    let uid = fx
        .remote
        .add_task(&list_id, &Task::new(summary))
        .await
        .expect("seed task");
    fx.manager.pull_only(None).await.expect("initial pull");
    fx.remote.clear_calls();
    let task = fx
        .cache
        .get_tasks(&list_id, None)
        .await
        .expect("cached")
        .into_iter()
        .find(|task| task.uid == uid)
        .expect("task cached");
    (list_id, task)
}

fn pending_kinds(fx: &Fixture) -> Vec<OpKind> {
    fx.store
        .pending_operations(Some("work"))
        .expect("ops")
        .iter()
        .map(|op| op.kind())
        .collect()
}

#[tokio::test]
async fn offline_add_is_pushed_on_reconnect() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Groceries");
    fx.manager.pull_only(None).await.expect("pull");

    fx.remote.set_offline(true);
    let local_uid = fx
        .cache
        .add_task(&list_id, &Task::new("Buy milk"))
        .await
        .expect("add while offline");
    assert!(is_temp_id(&local_uid));

    let deferred = fx.manager.push_only().await.expect("push while offline");
    assert_eq!(deferred.pushed, 0);
    assert_eq!(deferred.remaining, 1);
    assert_eq!(deferred.blocked_lists, vec![list_id.clone()]);
    let op = &fx.store.pending_operations(Some("work")).expect("ops")[0];
    assert_eq!(op.attempts, 0);

    fx.remote.set_offline(false);
    let result = fx.manager.sync(None).await.expect("sync");
    assert_eq!(result.push.pushed, 1);
    assert_eq!(result.push.remaining, 0);

    let cached = fx.cache.get_tasks(&list_id, None).await.expect("tasks");
    assert_eq!(cached.len(), 1);
    assert!(cached[0].uid.starts_with("mem-"));
    assert_eq!(cached[0].summary, "Buy milk");
    assert_eq!(fx.remote.tasks(&list_id)[0].uid, cached[0].uid);
}

#[tokio::test]
async fn server_wins_discards_the_local_edit() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let (list_id, task) = synced_task(&fx, "v1").await;

    let mut local = task.clone();
    local.summary = "v2".to_string();
    fx.cache.update_task(&list_id, &local).await.expect("local edit");
    fx.remote.edit_task(&list_id, &task.uid, |remote| remote.summary = "v3".to_string());

    let result = fx.manager.sync(None).await.expect("sync");
    assert_eq!(result.pull.conflicts, 1);
    assert_eq!(result.push.pushed, 0);

    let cached = fx.cache.get_tasks(&list_id, None).await.expect("tasks");
    assert_eq!(cached[0].summary, "v3");
    assert_eq!(fx.remote.tasks(&list_id)[0].summary, "v3");
    assert!(pending_kinds(&fx).is_empty());
    assert!(!fx
        .remote
        .calls()
        .iter()
        .any(|call| matches!(call, RemoteCall::UpdateTask { .. })));
}

#[tokio::test]
async fn local_wins_keeps_the_local_edit_and_pushes_it() {
    let fx = fixture(ConflictPolicy::LocalWins);
    let (list_id, task) = synced_task(&fx, "v1").await;

    let mut local = task.clone();
    local.summary = "mine".to_string();
    fx.cache.update_task(&list_id, &local).await.expect("local edit");
    fx.remote.edit_task(&list_id, &task.uid, |remote| remote.summary = "theirs".to_string());

    let pull = fx.manager.pull_only(Some(&list_id)).await.expect("pull");
    assert_eq!(pull.conflicts, 1);
    let cached = fx.cache.get_tasks(&list_id, None).await.expect("tasks");
    assert_eq!(cached[0].summary, "mine");
    assert_eq!(pending_kinds(&fx), vec![OpKind::UpdateTask]);

    fx.manager.push_only().await.expect("push");
    assert_eq!(fx.remote.tasks(&list_id)[0].summary, "mine");
}

#[tokio::test]
async fn merge_takes_the_newer_side_and_unions_categories() {
    let fx = fixture(ConflictPolicy::Merge);
    let (list_id, task) = synced_task(&fx, "Plan trip").await;

    let mut local = task.clone();
    local.summary = "Plan trip to Lisbon".to_string();
    local.categories.insert("home".to_string());
    fx.cache.update_task(&list_id, &local).await.expect("local edit");
    let later = now() + Duration::hours(1);
    fx.remote.edit_task(&list_id, &task.uid, |remote| {
        remote.description = "book flights".to_string();
        remote.categories.insert("urgent".to_string());
        remote.modified = later;
    });

    let pull = fx.manager.pull_only(Some(&list_id)).await.expect("pull");
    assert_eq!(pull.conflicts, 1);
    let merged = &fx.cache.get_tasks(&list_id, None).await.expect("tasks")[0];
    assert_eq!(merged.summary, "Plan trip");
    assert_eq!(merged.description, "book flights");
    let expected: BTreeSet<String> = ["home", "urgent"].iter().map(|tag| tag.to_string()).collect();
    assert_eq!(merged.categories, expected);
    assert_eq!(pending_kinds(&fx), vec![OpKind::UpdateTask]);

    fx.manager.push_only().await.expect("push");
    assert_eq!(fx.remote.tasks(&list_id)[0].categories, expected);
}

#[tokio::test]
async fn merge_prefers_a_newer_local_edit() {
    let fx = fixture(ConflictPolicy::Merge);
    let (list_id, task) = synced_task(&fx, "Draft").await;

    // The cached copy carries a timestamp ahead of anything the remote writes.
    let mut ahead = task.clone();
    ahead.modified = now() + Duration::hours(1);
    fx.store
        .apply_remote_snapshot("work", &list_id, &[ahead.clone()], ConflictPolicy::Merge)
        .expect("seed cached timestamp");

    let mut local = ahead.clone();
    local.summary = "Final draft".to_string();
    fx.cache.update_task(&list_id, &local).await.expect("local edit");
    fx.remote.edit_task(&list_id, &task.uid, |remote| {
        remote.summary = "Remote draft".to_string();
        remote.categories.insert("review".to_string());
    });

    fx.manager.pull_only(Some(&list_id)).await.expect("pull");
    let merged = &fx.cache.get_tasks(&list_id, None).await.expect("tasks")[0];
    assert_eq!(merged.summary, "Final draft");
    assert!(merged.categories.contains("review"));
}

#[tokio::test]
async fn keep_both_forks_the_local_version() {
    let fx = fixture(ConflictPolicy::KeepBoth);
    let (list_id, task) = synced_task(&fx, "Report").await;

    let mut local = task.clone();
    local.summary = "Report (mine)".to_string();
    fx.cache.update_task(&list_id, &local).await.expect("local edit");
    fx.remote.edit_task(&list_id, &task.uid, |remote| remote.summary = "Report (theirs)".to_string());

    fx.manager.pull_only(Some(&list_id)).await.expect("pull");
    let cached = fx.cache.get_tasks(&list_id, None).await.expect("tasks");
    assert_eq!(cached.len(), 2);
    let original = cached.iter().find(|t| t.uid == task.uid).expect("remote version");
    assert_eq!(original.summary, "Report (theirs)");
    let copy = cached.iter().find(|t| t.uid != task.uid).expect("local copy");
    assert!(is_temp_id(&copy.uid));
    assert_eq!(copy.summary, format!("Report (mine){LOCAL_COPY_SUFFIX}"));
    assert_eq!(pending_kinds(&fx), vec![OpKind::AddTask]);

    fx.manager.push_only().await.expect("push");
    assert_eq!(fx.remote.tasks(&list_id).len(), 2);
}

#[tokio::test]
async fn add_then_delete_offline_never_reaches_the_remote() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");
    fx.remote.set_offline(true);

    let uid = fx.cache.add_task(&list_id, &Task::new("Never mind")).await.expect("add");
    fx.cache.delete_task(&list_id, &uid).await.expect("delete");
    assert!(pending_kinds(&fx).is_empty());

    fx.remote.set_offline(false);
    fx.remote.clear_calls();
    let push = fx.manager.push_only().await.expect("push");
    assert_eq!(push.pushed, 0);
    assert!(fx.remote.calls().is_empty());
    assert!(fx.remote.tasks(&list_id).is_empty());
}

#[tokio::test]
async fn offline_hierarchy_is_pushed_parent_first() {
    let fx = fixture(ConflictPolicy::ServerWins);
    fx.remote.set_offline(true);

    let list_id = fx
        .cache
        .create_task_list("Project", None, None)
        .await
        .expect("create list");
    let parent_uid = fx.cache.add_task(&list_id, &Task::new("Parent")).await.expect("parent");
    let mut child = Task::new("Child");
    child.parent_uid = Some(parent_uid.clone());
    fx.cache.add_task(&list_id, &child).await.expect("child");
    assert_eq!(
        pending_kinds(&fx),
        vec![OpKind::CreateList, OpKind::AddTask, OpKind::AddTask]
    );

    fx.remote.set_offline(false);
    let push = fx.manager.push_only().await.expect("push");
    assert_eq!(push.pushed, 3);

    let remote_list = fx.remote.lists().into_iter().next().expect("remote list");
    assert_eq!(
        fx.remote.calls(),
        vec![
            RemoteCall::CreateList("Project".to_string()),
            RemoteCall::AddTask {
                list_id: remote_list.id.clone(),
                summary: "Parent".to_string()
            },
            RemoteCall::AddTask {
                list_id: remote_list.id.clone(),
                summary: "Child".to_string()
            },
        ]
    );
    let remote_tasks = fx.remote.tasks(&remote_list.id);
    let parent = remote_tasks.iter().find(|t| t.summary == "Parent").expect("parent");
    let child = remote_tasks.iter().find(|t| t.summary == "Child").expect("child");
    assert_eq!(child.parent_uid.as_deref(), Some(parent.uid.as_str()));

    let cached = fx.cache.get_tasks(&remote_list.id, None).await.expect("cached");
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|task| !is_temp_id(&task.uid)));
}

#[tokio::test]
async fn a_claimed_add_is_not_sent_twice() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Exactly once")).await.expect("add");

    // Simulate a crash after the remote accepted the add.
    let op = fx.store.pending_operations(Some("work")).expect("ops").remove(0);
    assert!(fx.store.claim_operation(op.op_id).expect("claim"));
    let cached = fx.cache.get_tasks(&list_id, None).await.expect("cached").remove(0);
    let remote_uid = fx.remote.add_task(&list_id, &cached).await.expect("remote add");
    fx.remote.clear_calls();

    let push = fx.manager.push_only().await.expect("push");
    assert_eq!(push.pushed, 1);
    assert!(!fx
        .remote
        .calls()
        .iter()
        .any(|call| matches!(call, RemoteCall::AddTask { .. })));
    assert_eq!(fx.remote.tasks(&list_id).len(), 1);
    let cached = fx.cache.get_tasks(&list_id, None).await.expect("cached");
    assert_eq!(cached[0].uid, remote_uid);
}

#[tokio::test]
async fn fields_round_trip_through_the_remote() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");

    let mut task = Task::new("Full task");
    task.description = "with every field".to_string();
    task.priority = 2;
    task.status = TaskStatus::InProgress;
    task.start = Some(now());
    task.due = Some(now() + Duration::days(3));
    task.categories.insert("alpha".to_string());
    fx.cache.add_task(&list_id, &task).await.expect("add");
    fx.manager.push_only().await.expect("push");

    let pushed = fx.remote.tasks(&list_id).remove(0);
    assert_eq!(pushed.description, task.description);
    assert_eq!(pushed.priority, 2);
    assert_eq!(pushed.status, TaskStatus::InProgress);
    assert_eq!(pushed.fingerprint(), task.fingerprint());
}

#[tokio::test]
async fn unchanged_etag_skips_the_task_fetch() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.remote.add_task(&list_id, &Task::new("One")).await.expect("seed");

    let first = fx.manager.pull_only(None).await.expect("first pull");
    assert_eq!(first.inserted, 1);
    fx.remote.clear_calls();

    let second = fx.manager.pull_only(None).await.expect("second pull");
    assert_eq!(second.unchanged, 1);
    assert_eq!(fx.remote.calls(), vec![RemoteCall::ListTaskLists]);

    let full = fx.manager.full_sync().await.expect("full sync");
    assert_eq!(full.pull.unchanged, 0);
    assert!(fx.remote.calls().contains(&RemoteCall::GetTasks(list_id)));
}

#[tokio::test]
async fn auth_failure_stops_the_push_and_keeps_the_op() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Locked out")).await.expect("add");

    fx.remote.fail_next(BackendError::from_status("add task", 401, "token expired"));
    let err = fx.manager.push_only().await.unwrap_err();
    assert!(err.is_unauthorized());

    let ops = fx.store.pending_operations(Some("work")).expect("ops");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].attempts, 0);
    assert!(fx.store.failed_operations(None).expect("failed").is_empty());
}

#[tokio::test]
async fn a_failing_list_does_not_block_other_lists() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let flaky = fx.remote.seed_list("Flaky");
    let healthy = fx.remote.seed_list("Healthy");
    fx.manager.pull_only(None).await.expect("pull");
    fx.cache.add_task(&flaky, &Task::new("First")).await.expect("add");
    fx.cache.add_task(&flaky, &Task::new("Second")).await.expect("add");
    fx.cache.add_task(&healthy, &Task::new("Third")).await.expect("add");

    fx.remote.fail_next(BackendError::from_status("add task", 503, "maintenance"));
    let push = fx.manager.push_only().await.expect("push");
    assert_eq!(push.pushed, 1);
    assert_eq!(push.remaining, 2);
    assert_eq!(push.blocked_lists, vec![flaky.clone()]);
    assert_eq!(fx.remote.tasks(&healthy).len(), 1);
    assert!(fx.remote.tasks(&flaky).is_empty());

    let ops = fx.store.pending_operations(Some("work")).expect("ops");
    assert_eq!(ops[0].attempts, 1);
    assert_eq!(ops[1].attempts, 0);
}

#[tokio::test]
async fn permanent_rejections_are_dead_lettered() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Rejected")).await.expect("add");

    fx.remote.fail_next(BackendError::from_status("add task", 422, "bad payload"));
    let push = fx.manager.push_only().await.expect("push");
    assert_eq!(push.failed, 1);
    assert_eq!(push.remaining, 0);
    assert_eq!(fx.cache.get_failed_operations().expect("failed").len(), 1);
}

#[tokio::test]
async fn updates_to_remotely_deleted_tasks_are_dropped() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let (list_id, task) = synced_task(&fx, "Doomed").await;
    let mut local = task.clone();
    local.priority = 1;
    fx.cache.update_task(&list_id, &local).await.expect("edit");
    fx.remote.remove_task(&list_id, &task.uid);

    let push = fx.manager.push_only().await.expect("push");
    assert_eq!(push.dropped, 1);
    assert_eq!(push.remaining, 0);
    assert!(fx.cache.get_tasks(&list_id, None).await.expect("tasks").is_empty());
}

#[tokio::test]
async fn failed_ops_wait_out_their_retry_delay() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("Retry me")).await.expect("add");

    fx.remote
        .fail_next(BackendError::from_status("add task", 503, "maintenance"));
    let first = fx.manager.push_only().await.expect("push");
    assert_eq!(first.pushed, 0);
    assert_eq!(first.remaining, 1);

    let ops = fx.store.pending_operations(Some("work")).expect("ops");
    assert_eq!(ops[0].attempts, 1);
    let next = ops[0].next_attempt_at.expect("retry time set");
    assert!(next > now());
    fx.remote.clear_calls();

    for _ in 0..3 {
        let held = fx.manager.push_only().await.expect("push");
        assert_eq!(held.pushed, 0);
        assert_eq!(held.blocked_lists, vec![list_id.clone()]);
    }
    assert!(fx.remote.calls().is_empty(), "{:?}", fx.remote.calls());

    let ops = fx.store.pending_operations(Some("work")).expect("ops");
    assert_eq!(ops[0].attempts, 1);
    assert!(fx.store.failed_operations(Some("work")).expect("failed").is_empty());
}

#[tokio::test]
async fn pulls_and_pushes_of_one_list_do_not_overlap() {
    let fx = fixture(ConflictPolicy::ServerWins);
    let list_id = fx.remote.seed_list("Work");
    fx.manager.pull_only(None).await.expect("pull");
    fx.cache.add_task(&list_id, &Task::new("First")).await.expect("add");
    fx.cache.add_task(&list_id, &Task::new("Second")).await.expect("add");
    fx.remote.clear_calls();
    fx.remote.set_latency(Some(std::time::Duration::from_millis(100)));

    let (push, pull) = tokio::join!(fx.manager.push_only(), async {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        fx.manager.pull_only(Some(&list_id)).await
    });
    let push = push.expect("push");
    let pull = pull.expect("pull");
    assert_eq!(push.pushed, 2);
    assert_eq!(pull.lists, 1);
    assert_eq!(fx.remote.peak_concurrency(&list_id), 1);

    let calls = fx.remote.calls();
    let fetch = calls
        .iter()
        .position(|call| matches!(call, RemoteCall::GetTasks(_)))
        .expect("tasks fetched");
    let last_add = calls
        .iter()
        .rposition(|call| matches!(call, RemoteCall::AddTask { .. }))
        .expect("tasks added");
    assert!(last_add < fetch, "{calls:?}");

    let cached = fx.store.tasks("work", &list_id).expect("cached");
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|task| !is_temp_id(&task.uid)));
    assert!(fx.store.pending_operations(Some("work")).expect("ops").is_empty());
}
