//! SQLite-backed cache: cached lists and tasks per remote, the pending
//! operations journal, per-list sync metadata and the dead-letter table.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::journal::{
    is_temp_id, retry_delay, temp_id, FailedOperation, ListSyncMetadata, OpKind, PendingChange,
    PendingOperation, SyncOutcome, MAX_ATTEMPTS,
};
use crate::backend::BackendError;
use crate::conflict::{self, ConflictPolicy, Resolution};
use crate::model::{check_parent, now, ModelError, Task, TaskList, TaskStatus};

pub const SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid journal payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("unknown pending operation {0}")]
    UnknownOperation(i64),
    #[error("cache schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl From<ModelError> for CacheError {
    fn from(error: ModelError) -> Self {
        CacheError::Validation(error.to_string())
    }
}

impl From<CacheError> for BackendError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::NotFound(message) => BackendError::not_found("cache", message),
            CacheError::Validation(message) => BackendError::validation("cache", message),
            other => {
                let message = other.to_string();
                BackendError::internal("cache", message).with_source(other)
            }
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A cached task row together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task: Task,
    pub tombstone: bool,
    /// Fingerprint of the content last seen on (or pushed to) the remote.
    pub remote_hash: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListsReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub conflicts: usize,
}

/// Held while a pusher drains the journal of one backend.
pub struct PushLock<'a> {
    store: &'a CacheStore,
    backend_name: String,
    file: Option<File>,
}

impl Drop for PushLock<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
        self.store.lock_pushers().remove(&self.backend_name);
    }
}

struct WriteLock(File);

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
  version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS lists (
  backend_name TEXT NOT NULL,
  list_id TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT,
  color TEXT,
  deleted INTEGER NOT NULL DEFAULT 0,
  etag TEXT,
  PRIMARY KEY (backend_name, list_id)
);

CREATE TABLE IF NOT EXISTS tasks (
  backend_name TEXT NOT NULL,
  list_id TEXT NOT NULL,
  uid TEXT NOT NULL,
  summary TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  priority INTEGER NOT NULL DEFAULT 0,
  start_date TEXT,
  due_date TEXT,
  created TEXT NOT NULL,
  modified TEXT NOT NULL,
  completed TEXT,
  parent_uid TEXT,
  tombstone INTEGER NOT NULL DEFAULT 0,
  remote_hash TEXT,
  last_error TEXT,
  PRIMARY KEY (backend_name, list_id, uid)
);

CREATE INDEX IF NOT EXISTS idx_tasks_list ON tasks(backend_name, list_id);

CREATE TABLE IF NOT EXISTS categories (
  backend_name TEXT NOT NULL,
  list_id TEXT NOT NULL,
  uid TEXT NOT NULL,
  tag TEXT NOT NULL,
  PRIMARY KEY (backend_name, list_id, uid, tag),
  FOREIGN KEY (backend_name, list_id, uid)
    REFERENCES tasks(backend_name, list_id, uid)
    ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS pending_ops (
  op_id INTEGER PRIMARY KEY AUTOINCREMENT,
  backend_name TEXT NOT NULL,
  list_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  target_uid TEXT,
  payload BLOB NOT NULL,
  created_at TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  claimed INTEGER NOT NULL DEFAULT 0,
  next_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_ops_backend ON pending_ops(backend_name, op_id);

CREATE TABLE IF NOT EXISTS list_sync_metadata (
  backend_name TEXT NOT NULL,
  list_id TEXT NOT NULL,
  last_full_sync TEXT,
  last_remote_etag TEXT,
  last_error TEXT,
  PRIMARY KEY (backend_name, list_id)
);

CREATE TABLE IF NOT EXISTS dead_letters (
  op_id INTEGER PRIMARY KEY,
  backend_name TEXT NOT NULL,
  list_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  target_uid TEXT,
  payload BLOB NOT NULL,
  created_at TEXT NOT NULL,
  attempts INTEGER NOT NULL,
  last_error TEXT,
  failed_at TEXT NOT NULL
);
"#;

const TASK_COLUMNS: &str = "uid, summary, description, status, priority, start_date, due_date, \
     created, modified, completed, parent_uid, tombstone, remote_hash, last_error";

const OP_COLUMNS: &str =
    "op_id, backend_name, list_id, payload, created_at, attempts, last_error, claimed, next_attempt_at";

pub struct CacheStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    pushers: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").field("path", &self.path).finish()
    }
}

impl CacheStore {
    /// Opens (creating if needed) the cache database at `path`. The parent
    /// directory and the database are restricted to the current user.
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
            restrict_permissions(parent, 0o700)?;
        }
        let conn = Connection::open(&path)?;
        let store = Self::from_connection(conn, Some(path.clone()))?;
        restrict_permissions(&path, 0o600)?;
        debug!(path = ?store.path, "cache store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> CacheResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> CacheResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\nPRAGMA synchronous=NORMAL;\nPRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        let found: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        match found {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(1) => {
                conn.execute_batch(
                    "ALTER TABLE pending_ops ADD COLUMN next_attempt_at TEXT;\n\
                     INSERT INTO schema_version (version) VALUES (2);",
                )?;
                info!("cache schema upgraded to version 2");
            }
            Some(found) if found > SCHEMA_VERSION => {
                return Err(CacheError::SchemaTooNew {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            pushers: Mutex::new(HashSet::new()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> CacheResult<i64> {
        self.read(|conn| {
            Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, i64>(0)
            })?)
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pushers(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pushers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sibling_path(&self, suffix: &str) -> Option<PathBuf> {
        self.path.as_ref().map(|path| {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        })
    }

    fn open_lock_file(path: &Path) -> CacheResult<File> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> CacheResult<T>) -> CacheResult<T> {
        let conn = self.lock_conn();
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction, holding the process mutex
    /// and the cross-process write lock.
    fn write<T>(&self, f: impl FnOnce(&Connection) -> CacheResult<T>) -> CacheResult<T> {
        let mut conn = self.lock_conn();
        let _lock = match self.sibling_path(".lock") {
            Some(path) => {
                let file = Self::open_lock_file(&path)?;
                file.lock_exclusive()?;
                Some(WriteLock(file))
            }
            None => None,
        };
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Takes the single-pusher lock for `backend_name`, or returns `None` if
    /// another pusher (in this or another process) holds it.
    pub fn try_push_lock(&self, backend_name: &str) -> CacheResult<Option<PushLock<'_>>> {
        if !self.lock_pushers().insert(backend_name.to_string()) {
            return Ok(None);
        }
        let mut guard = PushLock {
            store: self,
            backend_name: backend_name.to_string(),
            file: None,
        };
        let suffix = format!(".{}.push.lock", sanitize(backend_name));
        if let Some(path) = self.sibling_path(&suffix) {
            let file = Self::open_lock_file(&path)?;
            if file.try_lock_exclusive().is_err() {
                return Ok(None);
            }
            guard.file = Some(file);
        }
        Ok(Some(guard))
    }

    // ---- reads ----

    pub fn lists(&self, backend_name: &str) -> CacheResult<Vec<TaskList>> {
        self.read(|conn| select_lists(conn, backend_name, false))
    }

    pub fn deleted_lists(&self, backend_name: &str) -> CacheResult<Vec<TaskList>> {
        self.read(|conn| select_lists(conn, backend_name, true))
    }

    pub fn list(&self, backend_name: &str, list_id: &str) -> CacheResult<Option<TaskList>> {
        self.read(|conn| select_list(conn, backend_name, list_id))
    }

    /// Live (non-tombstoned) tasks of a list.
    pub fn tasks(&self, backend_name: &str, list_id: &str) -> CacheResult<Vec<Task>> {
        self.read(|conn| {
            Ok(select_records(conn, backend_name, list_id)?
                .into_iter()
                .filter(|record| !record.tombstone)
                .map(|record| record.task)
                .collect())
        })
    }

    pub fn task_record(
        &self,
        backend_name: &str,
        list_id: &str,
        uid: &str,
    ) -> CacheResult<Option<TaskRecord>> {
        self.read(|conn| select_record(conn, backend_name, list_id, uid))
    }

    // ---- foreground writes ----

    /// Stores a new task under a temporary uid and journals its creation.
    pub fn insert_local_task(&self, backend_name: &str, list_id: &str, task: &Task) -> CacheResult<Task> {
        let mut stored = task.clone();
        stored.validate()?;
        let at = now();
        stored.uid = temp_id();
        stored.created = at;
        stored.modified = at;
        stored.normalize_completion(at);
        self.write(|conn| {
            require_list(conn, backend_name, list_id)?;
            let live = live_tasks(conn, backend_name, list_id)?;
            check_parent(&live, &stored.uid, stored.parent_uid.as_deref())?;
            upsert_task(conn, backend_name, list_id, &stored, false)?;
            let op_id = append_op(
                conn,
                backend_name,
                list_id,
                &PendingChange::AddTask {
                    task: stored.clone(),
                },
            )?;
            debug!(backend = backend_name, list = list_id, uid = %stored.uid, op_id, "queued add");
            Ok(stored)
        })
    }

    /// Overwrites a cached task with `task` and journals the change. An
    /// unclaimed add for the same temporary uid absorbs the update instead.
    pub fn update_local_task(&self, backend_name: &str, list_id: &str, task: &Task) -> CacheResult<Task> {
        task.validate()?;
        self.write(|conn| {
            let current = select_record(conn, backend_name, list_id, &task.uid)?
                .filter(|record| !record.tombstone)
                .ok_or_else(|| task_not_found(list_id, &task.uid))?;
            let live = live_tasks(conn, backend_name, list_id)?;
            check_parent(&live, &task.uid, task.parent_uid.as_deref())?;

            let mut stored = task.clone();
            let at = now();
            stored.created = current.task.created;
            stored.modified = current.task.modified;
            stored.touch(at);
            stored.normalize_completion(at);
            upsert_task(conn, backend_name, list_id, &stored, false)?;

            let pending_add = if is_temp_id(&stored.uid) {
                unclaimed_op_for(conn, backend_name, list_id, &stored.uid, OpKind::AddTask)?
            } else {
                None
            };
            match pending_add {
                Some(op_id) => {
                    rewrite_payload(
                        conn,
                        op_id,
                        &PendingChange::AddTask {
                            task: stored.clone(),
                        },
                    )?;
                    debug!(backend = backend_name, uid = %stored.uid, op_id, "update coalesced into pending add");
                }
                None => {
                    let op_id = append_op(
                        conn,
                        backend_name,
                        list_id,
                        &PendingChange::UpdateTask {
                            task: stored.clone(),
                        },
                    )?;
                    debug!(backend = backend_name, uid = %stored.uid, op_id, "queued update");
                }
            }
            Ok(stored)
        })
    }

    /// Tombstones a task and journals the delete. Deleting a task whose add
    /// has not been dispatched yet removes both without touching the remote.
    pub fn delete_local_task(&self, backend_name: &str, list_id: &str, uid: &str) -> CacheResult<()> {
        self.write(|conn| {
            select_record(conn, backend_name, list_id, uid)?
                .filter(|record| !record.tombstone)
                .ok_or_else(|| task_not_found(list_id, uid))?;
            let children: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE backend_name = ?1 AND list_id = ?2 AND parent_uid = ?3 AND tombstone = 0",
                params![backend_name, list_id, uid],
                |row| row.get(0),
            )?;
            if children > 0 {
                return Err(CacheError::Validation(format!(
                    "task {uid} still has {children} subtask(s); delete or move them first"
                )));
            }
            if unclaimed_op_for(conn, backend_name, list_id, uid, OpKind::AddTask)?.is_some() {
                conn.execute(
                    "DELETE FROM pending_ops WHERE backend_name = ?1 AND list_id = ?2 AND target_uid = ?3",
                    params![backend_name, list_id, uid],
                )?;
                delete_task_row(conn, backend_name, list_id, uid)?;
                debug!(backend = backend_name, uid, "delete cancelled pending add");
                return Ok(());
            }
            conn.execute(
                "UPDATE tasks SET tombstone = 1 WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
                params![backend_name, list_id, uid],
            )?;
            let op_id = append_op(
                conn,
                backend_name,
                list_id,
                &PendingChange::DeleteTask {
                    uid: uid.to_string(),
                },
            )?;
            debug!(backend = backend_name, uid, op_id, "queued delete");
            Ok(())
        })
    }

    pub fn create_local_list(
        &self,
        backend_name: &str,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
    ) -> CacheResult<TaskList> {
        if name.trim().is_empty() {
            return Err(CacheError::Validation("list name must not be empty".to_string()));
        }
        let mut list = TaskList::new(temp_id(), name);
        list.description = description.map(str::to_string);
        list.color = color.map(str::to_string);
        self.write(|conn| {
            upsert_list(conn, backend_name, &list)?;
            append_op(
                conn,
                backend_name,
                &list.id,
                &PendingChange::CreateList { list: list.clone() },
            )?;
            Ok(list)
        })
    }

    pub fn rename_local_list(&self, backend_name: &str, list_id: &str, new_name: &str) -> CacheResult<()> {
        if new_name.trim().is_empty() {
            return Err(CacheError::Validation("list name must not be empty".to_string()));
        }
        self.write(|conn| {
            let mut list = require_list(conn, backend_name, list_id)?;
            list.name = new_name.to_string();
            upsert_list(conn, backend_name, &list)?;
            match unclaimed_list_op(conn, backend_name, list_id, OpKind::CreateList)? {
                Some(op_id) => rewrite_payload(conn, op_id, &PendingChange::CreateList { list })?,
                None => {
                    append_op(
                        conn,
                        backend_name,
                        list_id,
                        &PendingChange::RenameList {
                            name: new_name.to_string(),
                        },
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn delete_local_list(&self, backend_name: &str, list_id: &str) -> CacheResult<()> {
        self.write(|conn| {
            require_list(conn, backend_name, list_id)?;
            if unclaimed_list_op(conn, backend_name, list_id, OpKind::CreateList)?.is_some() {
                purge_list(conn, backend_name, list_id)?;
                conn.execute(
                    "DELETE FROM pending_ops WHERE backend_name = ?1 AND list_id = ?2",
                    params![backend_name, list_id],
                )?;
                return Ok(());
            }
            conn.execute(
                "UPDATE lists SET deleted = 1 WHERE backend_name = ?1 AND list_id = ?2",
                params![backend_name, list_id],
            )?;
            append_op(conn, backend_name, list_id, &PendingChange::DeleteList)?;
            Ok(())
        })
    }

    /// Undoes a list delete that has not been pushed yet.
    pub fn restore_local_list(&self, backend_name: &str, list_id: &str) -> CacheResult<()> {
        self.write(|conn| {
            let op_id = unclaimed_list_op(conn, backend_name, list_id, OpKind::DeleteList)?
                .ok_or_else(|| {
                    CacheError::NotFound(format!("list {list_id} has no pending delete to undo"))
                })?;
            conn.execute("DELETE FROM pending_ops WHERE op_id = ?1", params![op_id])?;
            conn.execute(
                "UPDATE lists SET deleted = 0 WHERE backend_name = ?1 AND list_id = ?2",
                params![backend_name, list_id],
            )?;
            Ok(())
        })
    }

    // ---- journal ----

    pub fn pending_operations(&self, backend_name: Option<&str>) -> CacheResult<Vec<PendingOperation>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {OP_COLUMNS} FROM pending_ops
                 WHERE (?1 IS NULL OR backend_name = ?1) ORDER BY op_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![backend_name], op_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// The first pending operation of `backend_name` with an id above `after`.
    pub fn next_pending_operation(
        &self,
        backend_name: &str,
        after: i64,
    ) -> CacheResult<Option<PendingOperation>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {OP_COLUMNS} FROM pending_ops
                 WHERE backend_name = ?1 AND op_id > ?2 ORDER BY op_id LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![backend_name, after], op_from_row)
                .optional()?)
        })
    }

    pub fn pending_operation(&self, op_id: i64) -> CacheResult<Option<PendingOperation>> {
        self.read(|conn| select_op(conn, op_id))
    }

    pub fn pending_count(&self, backend_name: &str) -> CacheResult<usize> {
        self.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_ops WHERE backend_name = ?1",
                params![backend_name],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Backends that have at least one pending operation.
    pub fn backends_with_pending(&self) -> CacheResult<Vec<String>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT backend_name FROM pending_ops ORDER BY backend_name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
    }

    /// Marks an op as handed to the remote. Returns false if the op is gone.
    pub fn claim_operation(&self, op_id: i64) -> CacheResult<bool> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE pending_ops SET claimed = 1 WHERE op_id = ?1",
                params![op_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Records the outcome of dispatching `op_id` to the remote.
    pub fn apply_sync_result(&self, op_id: i64, outcome: &SyncOutcome) -> CacheResult<()> {
        self.write(|conn| {
            let op = select_op(conn, op_id)?.ok_or(CacheError::UnknownOperation(op_id))?;
            match outcome {
                SyncOutcome::Applied { remote_id } => apply_success(conn, &op, remote_id.as_deref()),
                SyncOutcome::Dropped { reason } => {
                    info!(op_id, kind = %op.kind(), reason = %reason, "dropping pending operation");
                    conn.execute("DELETE FROM pending_ops WHERE op_id = ?1", params![op_id])?;
                    if let Some(uid) = op.change.task_uid() {
                        let remaining = ops_for_task(conn, &op.backend_name, &op.list_id, uid)?;
                        if remaining.is_empty() {
                            delete_task_row(conn, &op.backend_name, &op.list_id, uid)?;
                        }
                    }
                    Ok(())
                }
                SyncOutcome::Deferred { error } => {
                    conn.execute(
                        "UPDATE pending_ops SET last_error = ?2 WHERE op_id = ?1",
                        params![op_id, error],
                    )?;
                    Ok(())
                }
                SyncOutcome::Failed { error, permanent } => {
                    let attempts = if *permanent {
                        (op.attempts + 1).max(MAX_ATTEMPTS)
                    } else {
                        op.attempts + 1
                    };
                    if attempts >= MAX_ATTEMPTS {
                        dead_letter(conn, &op, attempts, error)?;
                        warn!(
                            op_id,
                            kind = %op.kind(),
                            attempts,
                            error = %error,
                            "pending operation moved to dead letters"
                        );
                    } else {
                        let next_attempt_at = now() + retry_delay(attempts);
                        conn.execute(
                            "UPDATE pending_ops SET attempts = ?2, last_error = ?3, next_attempt_at = ?4
                             WHERE op_id = ?1",
                            params![op_id, attempts, error, next_attempt_at],
                        )?;
                        debug!(op_id, attempts, next_attempt_at = %next_attempt_at, "pending operation will be retried");
                    }
                    Ok(())
                }
            }
        })
    }

    /// Finalises a successful add or list create: the temporary id becomes
    /// `remote_id` in the cached rows and in every later queued operation,
    /// and the op is removed, all in one transaction.
    pub fn commit_add_result(&self, op_id: i64, remote_id: &str) -> CacheResult<()> {
        self.write(|conn| {
            let op = select_op(conn, op_id)?.ok_or(CacheError::UnknownOperation(op_id))?;
            commit_add(conn, &op, remote_id)
        })
    }

    pub fn failed_operations(&self, backend_name: Option<&str>) -> CacheResult<Vec<FailedOperation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT op_id, backend_name, list_id, payload, created_at, attempts, last_error, 1, NULL, failed_at
                 FROM dead_letters WHERE (?1 IS NULL OR backend_name = ?1) ORDER BY op_id",
            )?;
            let rows = stmt.query_map(params![backend_name], |row| {
                Ok(FailedOperation {
                    operation: op_from_row(row)?,
                    failed_at: row.get(9)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // ---- pull side ----

    /// Reconciles the cached lists of `backend_name` with the remote's lists.
    pub fn apply_remote_lists(&self, backend_name: &str, remote: &[TaskList]) -> CacheResult<ListsReport> {
        self.write(|conn| {
            let mut report = ListsReport::default();
            let cached: HashMap<String, TaskList> = select_all_lists(conn, backend_name)?
                .into_iter()
                .map(|list| (list.id.clone(), list))
                .collect();
            let mut seen = HashSet::new();
            for list in remote {
                seen.insert(list.id.clone());
                let mut merged = list.clone();
                merged.deleted = false;
                match cached.get(&list.id) {
                    Some(existing) => {
                        if has_list_op(conn, backend_name, &list.id, OpKind::RenameList)? {
                            merged.name = existing.name.clone();
                        }
                        if has_list_op(conn, backend_name, &list.id, OpKind::DeleteList)? {
                            merged.deleted = existing.deleted;
                        }
                        if &merged != existing {
                            upsert_list(conn, backend_name, &merged)?;
                            report.updated += 1;
                        }
                    }
                    None => {
                        upsert_list(conn, backend_name, &merged)?;
                        report.added += 1;
                    }
                }
                conn.execute(
                    "INSERT OR IGNORE INTO list_sync_metadata (backend_name, list_id) VALUES (?1, ?2)",
                    params![backend_name, list.id],
                )?;
            }
            for list_id in cached.keys().filter(|id| !seen.contains(*id)) {
                let pending: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM pending_ops WHERE backend_name = ?1 AND list_id = ?2",
                    params![backend_name, list_id],
                    |row| row.get(0),
                )?;
                if is_temp_id(list_id) || pending > 0 {
                    continue;
                }
                purge_list(conn, backend_name, list_id)?;
                report.removed += 1;
            }
            Ok(report)
        })
    }

    /// Applies a full remote snapshot of one list, resolving conflicts with
    /// tasks that still have pending local operations under `policy`.
    pub fn apply_remote_snapshot(
        &self,
        backend_name: &str,
        list_id: &str,
        remote: &[Task],
        policy: ConflictPolicy,
    ) -> CacheResult<SnapshotReport> {
        self.write(|conn| {
            let mut report = SnapshotReport::default();
            let cached: HashMap<String, TaskRecord> = select_records(conn, backend_name, list_id)?
                .into_iter()
                .map(|record| (record.task.uid.clone(), record))
                .collect();
            let mut seen = HashSet::new();

            for task in remote {
                seen.insert(task.uid.clone());
                let remote_hash = task.fingerprint();
                let Some(record) = cached.get(&task.uid) else {
                    upsert_task(conn, backend_name, list_id, task, false)?;
                    set_remote_hash(conn, backend_name, list_id, &task.uid, &remote_hash)?;
                    report.inserted += 1;
                    continue;
                };
                let ops = ops_for_task(conn, backend_name, list_id, &task.uid)?;
                if ops.is_empty() {
                    if record.task != *task || record.tombstone {
                        upsert_task(conn, backend_name, list_id, task, false)?;
                        report.updated += 1;
                    }
                    set_remote_hash(conn, backend_name, list_id, &task.uid, &remote_hash)?;
                    continue;
                }
                let remote_unchanged = record.remote_hash.as_deref() == Some(remote_hash.as_str())
                    || (record.remote_hash.is_none() && record.task.fingerprint() == remote_hash);
                if remote_unchanged {
                    continue;
                }

                report.conflicts += 1;
                let resolution = conflict::resolve(policy, &record.task, task, record.tombstone);
                info!(
                    backend = backend_name,
                    list = list_id,
                    uid = %task.uid,
                    policy = %policy,
                    "resolving sync conflict"
                );
                match resolution {
                    Resolution::TakeRemote => {
                        drop_task_ops(conn, backend_name, list_id, &task.uid)?;
                        upsert_task(conn, backend_name, list_id, task, false)?;
                    }
                    Resolution::KeepLocal => {}
                    Resolution::Merged(merged) => {
                        drop_task_ops(conn, backend_name, list_id, &task.uid)?;
                        upsert_task(conn, backend_name, list_id, &merged, false)?;
                        append_op(
                            conn,
                            backend_name,
                            list_id,
                            &PendingChange::UpdateTask { task: merged },
                        )?;
                    }
                    Resolution::KeepBoth { mut local_copy } => {
                        drop_task_ops(conn, backend_name, list_id, &task.uid)?;
                        upsert_task(conn, backend_name, list_id, task, false)?;
                        local_copy.uid = temp_id();
                        local_copy.created = now();
                        upsert_task(conn, backend_name, list_id, &local_copy, false)?;
                        append_op(
                            conn,
                            backend_name,
                            list_id,
                            &PendingChange::AddTask { task: local_copy },
                        )?;
                    }
                }
                set_remote_hash(conn, backend_name, list_id, &task.uid, &remote_hash)?;
            }

            for (uid, record) in &cached {
                if seen.contains(uid) || is_temp_id(uid) {
                    continue;
                }
                let ops = ops_for_task(conn, backend_name, list_id, uid)?;
                if ops.iter().any(|(_, kind, _)| *kind == OpKind::AddTask) {
                    continue;
                }
                if !ops.is_empty() {
                    debug!(uid = %uid, tombstone = record.tombstone, "remote deleted a task with local changes");
                }
                drop_task_ops(conn, backend_name, list_id, uid)?;
                delete_task_row(conn, backend_name, list_id, uid)?;
                report.removed += 1;
            }
            Ok(report)
        })
    }

    // ---- metadata ----

    pub fn list_metadata(&self, backend_name: &str, list_id: &str) -> CacheResult<Option<ListSyncMetadata>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT backend_name, list_id, last_full_sync, last_remote_etag, last_error
                     FROM list_sync_metadata WHERE backend_name = ?1 AND list_id = ?2",
                    params![backend_name, list_id],
                    metadata_from_row,
                )
                .optional()?)
        })
    }

    pub fn all_list_metadata(&self, backend_name: &str) -> CacheResult<Vec<ListSyncMetadata>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT backend_name, list_id, last_full_sync, last_remote_etag, last_error
                 FROM list_sync_metadata WHERE backend_name = ?1 ORDER BY list_id",
            )?;
            let rows = stmt.query_map(params![backend_name], metadata_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn mark_list_synced(
        &self,
        backend_name: &str,
        list_id: &str,
        at: DateTime<Utc>,
        etag: Option<&str>,
    ) -> CacheResult<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO list_sync_metadata (backend_name, list_id, last_full_sync, last_remote_etag, last_error)
                 VALUES (?1, ?2, ?3, ?4, NULL)
                 ON CONFLICT(backend_name, list_id) DO UPDATE SET
                   last_full_sync = excluded.last_full_sync,
                   last_remote_etag = excluded.last_remote_etag,
                   last_error = NULL",
                params![backend_name, list_id, at, etag],
            )?;
            Ok(())
        })
    }

    pub fn record_list_error(&self, backend_name: &str, list_id: &str, error: &str) -> CacheResult<()> {
        self.write(|conn| record_list_error(conn, backend_name, list_id, error))
    }

    /// Forgets stored remote etags so the next pull fetches every list.
    pub fn clear_etags(&self, backend_name: &str) -> CacheResult<()> {
        self.write(|conn| {
            conn.execute(
                "UPDATE list_sync_metadata SET last_remote_etag = NULL WHERE backend_name = ?1",
                params![backend_name],
            )?;
            Ok(())
        })
    }

    /// Drops everything cached for `backend_name`, journal included.
    pub fn clear_backend(&self, backend_name: &str) -> CacheResult<()> {
        self.write(|conn| {
            for table in [
                "categories",
                "tasks",
                "lists",
                "pending_ops",
                "list_sync_metadata",
                "dead_letters",
            ] {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE backend_name = ?1"),
                    params![backend_name],
                )?;
            }
            info!(backend = backend_name, "cache cleared");
            Ok(())
        })
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

fn task_not_found(list_id: &str, uid: &str) -> CacheError {
    CacheError::NotFound(format!("task {uid} not found in list {list_id}"))
}

fn conversion_error<E>(index: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, ty, Box::new(err))
}

fn list_from_row(row: &Row<'_>) -> rusqlite::Result<TaskList> {
    Ok(TaskList {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        color: row.get(3)?,
        deleted: row.get(4)?,
        etag: row.get(5)?,
    })
}

fn select_lists(conn: &Connection, backend_name: &str, deleted: bool) -> CacheResult<Vec<TaskList>> {
    let mut stmt = conn.prepare(
        "SELECT list_id, name, description, color, deleted, etag FROM lists
         WHERE backend_name = ?1 AND deleted = ?2 ORDER BY name COLLATE NOCASE, list_id",
    )?;
    let rows = stmt.query_map(params![backend_name, deleted], list_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn select_all_lists(conn: &Connection, backend_name: &str) -> CacheResult<Vec<TaskList>> {
    let mut stmt = conn.prepare(
        "SELECT list_id, name, description, color, deleted, etag FROM lists WHERE backend_name = ?1",
    )?;
    let rows = stmt.query_map(params![backend_name], list_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn select_list(conn: &Connection, backend_name: &str, list_id: &str) -> CacheResult<Option<TaskList>> {
    Ok(conn
        .query_row(
            "SELECT list_id, name, description, color, deleted, etag FROM lists
             WHERE backend_name = ?1 AND list_id = ?2",
            params![backend_name, list_id],
            list_from_row,
        )
        .optional()?)
}

fn require_list(conn: &Connection, backend_name: &str, list_id: &str) -> CacheResult<TaskList> {
    select_list(conn, backend_name, list_id)?
        .filter(|list| !list.deleted)
        .ok_or_else(|| CacheError::NotFound(format!("list {list_id} not found")))
}

fn upsert_list(conn: &Connection, backend_name: &str, list: &TaskList) -> CacheResult<()> {
    conn.execute(
        "INSERT INTO lists (backend_name, list_id, name, description, color, deleted, etag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(backend_name, list_id) DO UPDATE SET
           name = excluded.name,
           description = excluded.description,
           color = excluded.color,
           deleted = excluded.deleted,
           etag = excluded.etag",
        params![
            backend_name,
            list.id,
            list.name,
            list.description,
            list.color,
            list.deleted,
            list.etag
        ],
    )?;
    Ok(())
}

fn purge_list(conn: &Connection, backend_name: &str, list_id: &str) -> CacheResult<()> {
    for table in ["categories", "tasks", "lists", "list_sync_metadata"] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE backend_name = ?1 AND list_id = ?2"),
            params![backend_name, list_id],
        )?;
    }
    Ok(())
}

fn load_categories(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
) -> CacheResult<HashMap<String, BTreeSet<String>>> {
    let mut stmt = conn.prepare(
        "SELECT uid, tag FROM categories WHERE backend_name = ?1 AND list_id = ?2",
    )?;
    let rows = stmt.query_map(params![backend_name, list_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut categories: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in rows {
        let (uid, tag) = row?;
        categories.entry(uid).or_default().insert(tag);
    }
    Ok(categories)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(3)?;
    let status = TaskStatus::parse_token(&status).map_err(|err| conversion_error(3, Type::Text, err))?;
    Ok(TaskRecord {
        task: Task {
            uid: row.get(0)?,
            summary: row.get(1)?,
            description: row.get(2)?,
            status,
            priority: row.get(4)?,
            start: row.get(5)?,
            due: row.get(6)?,
            created: row.get(7)?,
            modified: row.get(8)?,
            completed: row.get(9)?,
            categories: BTreeSet::new(),
            parent_uid: row.get(10)?,
        },
        tombstone: row.get(11)?,
        remote_hash: row.get(12)?,
        last_error: row.get(13)?,
    })
}

fn select_records(conn: &Connection, backend_name: &str, list_id: &str) -> CacheResult<Vec<TaskRecord>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE backend_name = ?1 AND list_id = ?2
         ORDER BY created, uid"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![backend_name, list_id], record_from_row)?;
    let mut records = rows.collect::<Result<Vec<_>, _>>()?;
    let mut categories = load_categories(conn, backend_name, list_id)?;
    for record in &mut records {
        if let Some(tags) = categories.remove(&record.task.uid) {
            record.task.categories = tags;
        }
    }
    Ok(records)
}

fn select_record(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    uid: &str,
) -> CacheResult<Option<TaskRecord>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3"
    );
    let Some(mut record) = conn
        .query_row(&sql, params![backend_name, list_id, uid], record_from_row)
        .optional()?
    else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT tag FROM categories WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
    )?;
    let tags = stmt.query_map(params![backend_name, list_id, uid], |row| row.get::<_, String>(0))?;
    record.task.categories = tags.collect::<Result<BTreeSet<_>, _>>()?;
    Ok(Some(record))
}

fn live_tasks(conn: &Connection, backend_name: &str, list_id: &str) -> CacheResult<Vec<Task>> {
    Ok(select_records(conn, backend_name, list_id)?
        .into_iter()
        .filter(|record| !record.tombstone)
        .map(|record| record.task)
        .collect())
}

/// Inserts or overwrites the content columns of a task. Sync bookkeeping
/// (`remote_hash`, `last_error`) is left as it was.
fn upsert_task(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    task: &Task,
    tombstone: bool,
) -> CacheResult<()> {
    conn.execute(
        "INSERT INTO tasks (backend_name, list_id, uid, summary, description, status, priority,
                            start_date, due_date, created, modified, completed, parent_uid, tombstone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(backend_name, list_id, uid) DO UPDATE SET
           summary = excluded.summary,
           description = excluded.description,
           status = excluded.status,
           priority = excluded.priority,
           start_date = excluded.start_date,
           due_date = excluded.due_date,
           created = excluded.created,
           modified = excluded.modified,
           completed = excluded.completed,
           parent_uid = excluded.parent_uid,
           tombstone = excluded.tombstone",
        params![
            backend_name,
            list_id,
            task.uid,
            task.summary,
            task.description,
            task.status.as_str(),
            task.priority,
            task.start,
            task.due,
            task.created,
            task.modified,
            task.completed,
            task.parent_uid,
            tombstone
        ],
    )?;
    conn.execute(
        "DELETE FROM categories WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
        params![backend_name, list_id, task.uid],
    )?;
    for tag in &task.categories {
        conn.execute(
            "INSERT OR IGNORE INTO categories (backend_name, list_id, uid, tag) VALUES (?1, ?2, ?3, ?4)",
            params![backend_name, list_id, task.uid, tag],
        )?;
    }
    Ok(())
}

fn set_remote_hash(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    uid: &str,
    hash: &str,
) -> CacheResult<()> {
    conn.execute(
        "UPDATE tasks SET remote_hash = ?4, last_error = NULL
         WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
        params![backend_name, list_id, uid, hash],
    )?;
    Ok(())
}

fn delete_task_row(conn: &Connection, backend_name: &str, list_id: &str, uid: &str) -> CacheResult<()> {
    conn.execute(
        "DELETE FROM tasks WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
        params![backend_name, list_id, uid],
    )?;
    Ok(())
}

fn op_from_row(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let payload: Vec<u8> = row.get(3)?;
    let change: PendingChange =
        serde_json::from_slice(&payload).map_err(|err| conversion_error(3, Type::Blob, err))?;
    Ok(PendingOperation {
        op_id: row.get(0)?,
        backend_name: row.get(1)?,
        list_id: row.get(2)?,
        change,
        created_at: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        claimed: row.get(7)?,
        next_attempt_at: row.get(8)?,
    })
}

fn select_op(conn: &Connection, op_id: i64) -> CacheResult<Option<PendingOperation>> {
    let sql = format!("SELECT {OP_COLUMNS} FROM pending_ops WHERE op_id = ?1");
    Ok(conn.query_row(&sql, params![op_id], op_from_row).optional()?)
}

fn append_op(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    change: &PendingChange,
) -> CacheResult<i64> {
    let payload = serde_json::to_vec(change)?;
    conn.execute(
        "INSERT INTO pending_ops (backend_name, list_id, kind, target_uid, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            backend_name,
            list_id,
            change.kind().as_str(),
            change.task_uid(),
            payload,
            now()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn rewrite_payload(conn: &Connection, op_id: i64, change: &PendingChange) -> CacheResult<()> {
    let payload = serde_json::to_vec(change)?;
    conn.execute(
        "UPDATE pending_ops SET payload = ?2, target_uid = ?3 WHERE op_id = ?1",
        params![op_id, payload, change.task_uid()],
    )?;
    Ok(())
}

fn unclaimed_op_for(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    uid: &str,
    kind: OpKind,
) -> CacheResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT op_id FROM pending_ops
             WHERE backend_name = ?1 AND list_id = ?2 AND target_uid = ?3 AND kind = ?4 AND claimed = 0
             ORDER BY op_id LIMIT 1",
            params![backend_name, list_id, uid, kind.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

fn unclaimed_list_op(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    kind: OpKind,
) -> CacheResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT op_id FROM pending_ops
             WHERE backend_name = ?1 AND list_id = ?2 AND kind = ?3 AND claimed = 0
             ORDER BY op_id LIMIT 1",
            params![backend_name, list_id, kind.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

fn has_list_op(conn: &Connection, backend_name: &str, list_id: &str, kind: OpKind) -> CacheResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_ops WHERE backend_name = ?1 AND list_id = ?2 AND kind = ?3",
        params![backend_name, list_id, kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// `(op_id, kind, claimed)` of every pending op targeting `uid`.
fn ops_for_task(
    conn: &Connection,
    backend_name: &str,
    list_id: &str,
    uid: &str,
) -> CacheResult<Vec<(i64, OpKind, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT op_id, kind, claimed FROM pending_ops
         WHERE backend_name = ?1 AND list_id = ?2 AND target_uid = ?3 ORDER BY op_id",
    )?;
    let rows = stmt.query_map(params![backend_name, list_id, uid], |row| {
        let kind: String = row.get(1)?;
        let kind = kind
            .parse::<OpKind>()
            .map_err(|err| conversion_error(1, Type::Text, std::io::Error::other(err)))?;
        Ok((row.get::<_, i64>(0)?, kind, row.get::<_, bool>(2)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn drop_task_ops(conn: &Connection, backend_name: &str, list_id: &str, uid: &str) -> CacheResult<()> {
    conn.execute(
        "DELETE FROM pending_ops WHERE backend_name = ?1 AND list_id = ?2 AND target_uid = ?3",
        params![backend_name, list_id, uid],
    )?;
    Ok(())
}

fn record_list_error(conn: &Connection, backend_name: &str, list_id: &str, error: &str) -> CacheResult<()> {
    conn.execute(
        "INSERT INTO list_sync_metadata (backend_name, list_id, last_error) VALUES (?1, ?2, ?3)
         ON CONFLICT(backend_name, list_id) DO UPDATE SET last_error = excluded.last_error",
        params![backend_name, list_id, error],
    )?;
    Ok(())
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<ListSyncMetadata> {
    Ok(ListSyncMetadata {
        backend_name: row.get(0)?,
        list_id: row.get(1)?,
        last_full_sync: row.get(2)?,
        last_remote_etag: row.get(3)?,
        last_error: row.get(4)?,
    })
}

fn apply_success(conn: &Connection, op: &PendingOperation, remote_id: Option<&str>) -> CacheResult<()> {
    let backend = op.backend_name.as_str();
    let list_id = op.list_id.as_str();
    match &op.change {
        PendingChange::AddTask { task } => {
            let remote_id = remote_id.unwrap_or(task.uid.as_str());
            return commit_add(conn, op, remote_id);
        }
        PendingChange::CreateList { list } => {
            let remote_id = remote_id.unwrap_or(list.id.as_str());
            return commit_add(conn, op, remote_id);
        }
        PendingChange::UpdateTask { task } => {
            set_remote_hash(conn, backend, list_id, &task.uid, &task.fingerprint())?;
        }
        PendingChange::DeleteTask { uid } => {
            let remaining = ops_for_task(conn, backend, list_id, uid)?;
            if remaining.iter().all(|(op_id, _, _)| *op_id == op.op_id) {
                delete_task_row(conn, backend, list_id, uid)?;
            }
        }
        PendingChange::RenameList { .. } => {}
        PendingChange::DeleteList => {
            purge_list(conn, backend, list_id)?;
            conn.execute(
                "DELETE FROM pending_ops WHERE backend_name = ?1 AND list_id = ?2 AND op_id > ?3",
                params![backend, list_id, op.op_id],
            )?;
        }
    }
    conn.execute("DELETE FROM pending_ops WHERE op_id = ?1", params![op.op_id])?;
    Ok(())
}

fn commit_add(conn: &Connection, op: &PendingOperation, remote_id: &str) -> CacheResult<()> {
    let backend = op.backend_name.as_str();
    match &op.change {
        PendingChange::AddTask { task } => {
            let list_id = op.list_id.as_str();
            let local_id = task.uid.as_str();
            if local_id != remote_id {
                // A pull may already have cached the remote copy.
                delete_task_row(conn, backend, list_id, remote_id)?;
                conn.execute(
                    "UPDATE tasks SET uid = ?4 WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
                    params![backend, list_id, local_id, remote_id],
                )?;
                conn.execute(
                    "UPDATE tasks SET parent_uid = ?4
                     WHERE backend_name = ?1 AND list_id = ?2 AND parent_uid = ?3",
                    params![backend, list_id, local_id, remote_id],
                )?;
                rewrite_later_ops(conn, op, |change| change.rewrite_task_uid(local_id, remote_id))?;
            }
            let mut pushed = task.clone();
            pushed.uid = remote_id.to_string();
            set_remote_hash(conn, backend, list_id, remote_id, &pushed.fingerprint())?;
            debug!(backend, list = list_id, local = local_id, remote = remote_id, "add committed");
        }
        PendingChange::CreateList { list } => {
            let local_id = list.id.as_str();
            if local_id != remote_id {
                purge_list(conn, backend, remote_id)?;
                for table in ["lists", "tasks", "pending_ops", "list_sync_metadata", "dead_letters"] {
                    conn.execute(
                        &format!(
                            "UPDATE {table} SET list_id = ?3 WHERE backend_name = ?1 AND list_id = ?2"
                        ),
                        params![backend, local_id, remote_id],
                    )?;
                }
            }
            conn.execute(
                "INSERT OR IGNORE INTO list_sync_metadata (backend_name, list_id) VALUES (?1, ?2)",
                params![backend, remote_id],
            )?;
            debug!(backend, local = local_id, remote = remote_id, "list create committed");
        }
        _ => {
            return Err(CacheError::Validation(format!(
                "operation {} is a {}, not an add",
                op.op_id,
                op.kind()
            )));
        }
    }
    conn.execute("DELETE FROM pending_ops WHERE op_id = ?1", params![op.op_id])?;
    Ok(())
}

fn rewrite_later_ops(
    conn: &Connection,
    op: &PendingOperation,
    mut rewrite: impl FnMut(&mut PendingChange) -> bool,
) -> CacheResult<()> {
    let sql = format!(
        "SELECT {OP_COLUMNS} FROM pending_ops
         WHERE backend_name = ?1 AND list_id = ?2 AND op_id > ?3 ORDER BY op_id"
    );
    let later = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![op.backend_name, op.list_id, op.op_id], op_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for mut later_op in later {
        if rewrite(&mut later_op.change) {
            rewrite_payload(conn, later_op.op_id, &later_op.change)?;
        }
    }
    Ok(())
}

fn dead_letter(conn: &Connection, op: &PendingOperation, attempts: u32, error: &str) -> CacheResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO dead_letters
           (op_id, backend_name, list_id, kind, target_uid, payload, created_at, attempts, last_error, failed_at)
         SELECT op_id, backend_name, list_id, kind, target_uid, payload, created_at, ?2, ?3, ?4
         FROM pending_ops WHERE op_id = ?1",
        params![op.op_id, attempts, error, now()],
    )?;
    conn.execute("DELETE FROM pending_ops WHERE op_id = ?1", params![op.op_id])?;
    match op.change.task_uid() {
        Some(uid) => {
            conn.execute(
                "UPDATE tasks SET last_error = ?4 WHERE backend_name = ?1 AND list_id = ?2 AND uid = ?3",
                params![op.backend_name, op.list_id, uid, error],
            )?;
        }
        None => record_list_error(conn, &op.backend_name, &op.list_id, error)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_version_is_recorded_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache").join("tasks.db");
        {
            let store = CacheStore::open(&path).expect("open");
            assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
        }
        let store = CacheStore::open(&path).expect("reopen");
        let rows: i64 = store
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn version_one_journals_gain_retry_times() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tasks.db");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER NOT NULL);
                 INSERT INTO schema_version (version) VALUES (1);
                 CREATE TABLE pending_ops (
                   op_id INTEGER PRIMARY KEY AUTOINCREMENT,
                   backend_name TEXT NOT NULL,
                   list_id TEXT NOT NULL,
                   kind TEXT NOT NULL,
                   target_uid TEXT,
                   payload BLOB NOT NULL,
                   created_at TEXT NOT NULL,
                   attempts INTEGER NOT NULL DEFAULT 0,
                   last_error TEXT,
                   claimed INTEGER NOT NULL DEFAULT 0
                 );
                 INSERT INTO pending_ops (backend_name, list_id, kind, payload, created_at)
                 VALUES ('work', 'list-1', 'rename_list', X'7B226B696E64223A2272656E616D655F6C697374222C226E616D65223A22486F6D65227D',
                         '2024-01-01 00:00:00+00:00');",
            )
            .expect("v1 schema");
        }
        let store = CacheStore::open(&path).expect("upgrade");
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
        let ops = store.pending_operations(Some("work")).expect("ops");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind(), OpKind::RenameList);
        assert!(ops[0].next_attempt_at.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn database_is_private_to_the_user() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("tasks.db");
        CacheStore::open(&path).expect("open");
        let file_mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        let dir_mode = fs::metadata(path.parent().expect("parent"))
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn push_lock_is_exclusive_per_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::open(dir.path().join("tasks.db")).expect("open");
        let first = store.try_push_lock("work").expect("lock");
        assert!(first.is_some());
        assert!(store.try_push_lock("work").expect("lock").is_none());
        assert!(store.try_push_lock("home").expect("lock").is_some());
        drop(first);
        assert!(store.try_push_lock("work").expect("lock").is_some());
    }
}
