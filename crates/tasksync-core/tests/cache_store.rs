use chrono::Duration;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use tasksync_core::cache::{is_temp_id, CacheError, CacheStore, OpKind, SyncOutcome, MAX_ATTEMPTS};
use tasksync_core::conflict::ConflictPolicy;
use tasksync_core::model::{now, Task, TaskList};

const BACKEND: &str = "work";

fn store_with_list(store: &CacheStore) -> String {
    let list = TaskList::new("list-1", "Work");
    store.apply_remote_lists(BACKEND, &[list]).expect("lists");
    "list-1".to_string()
}

#[test]
fn writes_survive_reopen() {
    let temp = TempDir::new().expect("tempdir");
    let path = temp.path().join("cache.db");
    let uid = {
        let store = CacheStore::open(&path).expect("open");
        let list_id = store_with_list(&store);
        store
            .insert_local_task(BACKEND, &list_id, &Task::new("Buy milk"))
            .expect("insert")
            .uid
    };

    let reopened = CacheStore::open(&path).expect("reopen");
    let tasks = reopened.tasks(BACKEND, "list-1").expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].uid, uid);
    assert!(is_temp_id(&uid));
    let ops = reopened.pending_operations(Some(BACKEND)).expect("ops");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind(), OpKind::AddTask);
}

#[test]
fn invalid_dates_are_rejected_before_journaling() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let mut task = Task::new("Backwards");
    let at = now();
    task.start = Some(at);
    task.due = Some(at - Duration::days(2));

    let err = store.insert_local_task(BACKEND, &list_id, &task).unwrap_err();
    assert!(matches!(err, CacheError::Validation(_)), "{err:?}");
    assert!(store.tasks(BACKEND, &list_id).expect("tasks").is_empty());
    assert_eq!(store.pending_count(BACKEND).expect("count"), 0);
}

#[test]
fn deleting_an_unsent_add_leaves_nothing_behind() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let stored = store
        .insert_local_task(BACKEND, &list_id, &Task::new("Temporary"))
        .expect("insert");
    let mut edited = stored.clone();
    edited.description = "edited before sync".to_string();
    store.update_local_task(BACKEND, &list_id, &edited).expect("update");

    let ops = store.pending_operations(Some(BACKEND)).expect("ops");
    assert_eq!(ops.len(), 1, "update folds into the pending add");

    store.delete_local_task(BACKEND, &list_id, &stored.uid).expect("delete");
    assert_eq!(store.pending_count(BACKEND).expect("count"), 0);
    assert!(store
        .task_record(BACKEND, &list_id, &stored.uid)
        .expect("record")
        .is_none());
}

#[test]
fn parents_with_live_children_cannot_be_deleted() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let parent = store
        .insert_local_task(BACKEND, &list_id, &Task::new("Parent"))
        .expect("parent");
    let mut child = Task::new("Child");
    child.parent_uid = Some(parent.uid.clone());
    store.insert_local_task(BACKEND, &list_id, &child).expect("child");

    let err = store.delete_local_task(BACKEND, &list_id, &parent.uid).unwrap_err();
    assert!(matches!(err, CacheError::Validation(_)), "{err:?}");
    assert_eq!(store.tasks(BACKEND, &list_id).expect("tasks").len(), 2);
}

#[test]
fn unknown_parent_is_rejected() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let mut orphan = Task::new("Orphan");
    orphan.parent_uid = Some("missing".to_string());
    assert!(store.insert_local_task(BACKEND, &list_id, &orphan).is_err());
    assert_eq!(store.pending_count(BACKEND).expect("count"), 0);
}

#[test]
fn retryable_failures_dead_letter_after_max_attempts() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    store
        .insert_local_task(BACKEND, &list_id, &Task::new("Flaky"))
        .expect("insert");
    let op_id = store.pending_operations(Some(BACKEND)).expect("ops")[0].op_id;

    for attempt in 1..MAX_ATTEMPTS {
        store
            .apply_sync_result(
                op_id,
                &SyncOutcome::Failed {
                    error: "503 service unavailable".to_string(),
                    permanent: false,
                },
            )
            .expect("record failure");
        let op = store.pending_operation(op_id).expect("op").expect("still queued");
        assert_eq!(op.attempts, attempt);
    }
    store
        .apply_sync_result(
            op_id,
            &SyncOutcome::Failed {
                error: "503 service unavailable".to_string(),
                permanent: false,
            },
        )
        .expect("final failure");

    assert!(store.pending_operation(op_id).expect("op").is_none());
    let failed = store.failed_operations(Some(BACKEND)).expect("failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].operation.attempts, MAX_ATTEMPTS);
    assert_eq!(failed[0].operation.last_error.as_deref(), Some("503 service unavailable"));
}

#[test]
fn deferred_results_do_not_count_as_attempts() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    store
        .insert_local_task(BACKEND, &list_id, &Task::new("Offline"))
        .expect("insert");
    let op_id = store.pending_operations(Some(BACKEND)).expect("ops")[0].op_id;

    for _ in 0..(MAX_ATTEMPTS + 2) {
        store
            .apply_sync_result(
                op_id,
                &SyncOutcome::Deferred {
                    error: "connection refused".to_string(),
                },
            )
            .expect("defer");
    }
    let op = store.pending_operation(op_id).expect("op").expect("queued");
    assert_eq!(op.attempts, 0);
    assert_eq!(op.last_error.as_deref(), Some("connection refused"));
    assert!(store.failed_operations(None).expect("failed").is_empty());
}

#[test]
fn snapshot_only_conflicts_when_the_remote_changed() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let mut remote = Task::new("Original");
    remote.uid = "r1".to_string();
    store
        .apply_remote_snapshot(BACKEND, &list_id, &[remote.clone()], ConflictPolicy::ServerWins)
        .expect("seed");

    let mut local = remote.clone();
    local.summary = "Edited locally".to_string();
    store.update_local_task(BACKEND, &list_id, &local).expect("edit");

    let unchanged = store
        .apply_remote_snapshot(BACKEND, &list_id, &[remote.clone()], ConflictPolicy::ServerWins)
        .expect("same snapshot");
    assert_eq!(unchanged.conflicts, 0);
    let cached = store.tasks(BACKEND, &list_id).expect("tasks");
    assert_eq!(cached[0].summary, "Edited locally");
    assert_eq!(store.pending_count(BACKEND).expect("count"), 1);

    remote.summary = "Edited remotely".to_string();
    let changed = store
        .apply_remote_snapshot(BACKEND, &list_id, &[remote], ConflictPolicy::ServerWins)
        .expect("changed snapshot");
    assert_eq!(changed.conflicts, 1);
    let cached = store.tasks(BACKEND, &list_id).expect("tasks");
    assert_eq!(cached[0].summary, "Edited remotely");
    assert_eq!(store.pending_count(BACKEND).expect("count"), 0);
}

#[test]
fn remote_deletions_purge_clean_tasks() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let mut remote = Task::new("Gone soon");
    remote.uid = "r1".to_string();
    store
        .apply_remote_snapshot(BACKEND, &list_id, &[remote], ConflictPolicy::ServerWins)
        .expect("seed");
    let local = store
        .insert_local_task(BACKEND, &list_id, &Task::new("Still queued"))
        .expect("insert");

    let report = store
        .apply_remote_snapshot(BACKEND, &list_id, &[], ConflictPolicy::ServerWins)
        .expect("empty snapshot");
    assert_eq!(report.removed, 1);
    let cached = store.tasks(BACKEND, &list_id).expect("tasks");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].uid, local.uid);
}

#[test]
fn lists_with_pending_ops_survive_remote_removal() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    store
        .insert_local_task(BACKEND, &list_id, &Task::new("Queued"))
        .expect("insert");
    let report = store.apply_remote_lists(BACKEND, &[]).expect("lists");
    assert_eq!(report.removed, 0);
    assert_eq!(store.lists(BACKEND).expect("lists").len(), 1);
}

#[test]
fn back_to_back_edits_advance_modified() {
    let store = CacheStore::open_in_memory().expect("store");
    let list_id = store_with_list(&store);
    let first = store
        .insert_local_task(BACKEND, &list_id, &Task::new("Draft"))
        .expect("insert");

    let mut edit = first.clone();
    edit.summary = "Draft 2".to_string();
    let second = store.update_local_task(BACKEND, &list_id, &edit).expect("update");
    edit.summary = "Draft 3".to_string();
    let third = store.update_local_task(BACKEND, &list_id, &edit).expect("update");

    assert!(second.modified > first.modified);
    assert!(third.modified > second.modified);
    let cached = store.tasks(BACKEND, &list_id).expect("tasks");
    assert_eq!(cached[0].modified, third.modified);
}
