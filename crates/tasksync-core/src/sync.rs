//! Reconciles one remote backend with its cache: pull remote snapshots into
//! the cache, push the pending-operations journal to the remote.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::cache::{CacheError, CacheStore, PendingChange, PendingOperation, SyncOutcome};
use crate::conflict::ConflictPolicy;
use crate::model::{now, Task};

pub const INTERACTIVE_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const BACKGROUND_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SyncCause {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("cancelled")]
    Cancelled,
}

impl SyncCause {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncCause::Backend(err) => err.is_transient(),
            SyncCause::Cache(CacheError::Sqlite(_) | CacheError::Io(_)) => true,
            SyncCause::Cache(_) => false,
            SyncCause::Cancelled => true,
        }
    }
}

#[derive(Debug)]
pub struct SyncError {
    pub operation: &'static str,
    pub backend_name: String,
    pub list_id: Option<String>,
    pub op_id: Option<i64>,
    pub cause: SyncCause,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(&self.cause, SyncCause::Backend(err) if err.is_unauthorized())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, SyncCause::Cancelled)
    }

    pub fn backend_error(&self) -> Option<&BackendError> {
        match &self.cause {
            SyncCause::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for backend '{}'", self.operation, self.backend_name)?;
        if let Some(list_id) = &self.list_id {
            write!(f, " (list {list_id})")?;
        }
        if let Some(op_id) = self.op_id {
            write!(f, " (op {op_id})")?;
        }
        write!(f, " failed: {}", self.cause)
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushResult {
    pub pushed: usize,
    pub dropped: usize,
    pub failed: usize,
    /// Ops left in the journal after this pass.
    pub remaining: usize,
    /// Lists whose ops were held back by a connectivity failure or a retry
    /// delay.
    pub blocked_lists: Vec<String>,
    /// Another pusher held the lock; nothing was attempted.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResult {
    pub lists: usize,
    pub unchanged: usize,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub pull: PullResult,
    pub push: PushResult,
}

/// Per-list async mutexes serialising pulls and pushes of the same list.
#[derive(Debug, Default)]
pub struct ListLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl ListLocks {
    pub fn for_list(&self, backend_name: &str, list_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry((backend_name.to_string(), list_id.to_string()))
            .or_default()
            .clone()
    }
}

pub struct SyncManager {
    cache: Arc<CacheStore>,
    remote: Arc<dyn Backend>,
    policy: ConflictPolicy,
    call_timeout: Duration,
    list_locks: Arc<ListLocks>,
    cancel: Option<watch::Receiver<bool>>,
}

impl SyncManager {
    pub fn new(cache: Arc<CacheStore>, remote: Arc<dyn Backend>, policy: ConflictPolicy) -> Self {
        Self {
            cache,
            remote,
            policy,
            call_timeout: INTERACTIVE_CALL_TIMEOUT,
            list_locks: Arc::new(ListLocks::default()),
            cancel: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_list_locks(mut self, locks: Arc<ListLocks>) -> Self {
        self.list_locks = locks;
        self
    }

    /// Remote calls are abandoned once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn remote(&self) -> &Arc<dyn Backend> {
        &self.remote
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    fn backend_name(&self) -> &str {
        self.remote.name()
    }

    fn error(
        &self,
        operation: &'static str,
        list_id: Option<&str>,
        op_id: Option<i64>,
        cause: impl Into<SyncCause>,
    ) -> SyncError {
        SyncError {
            operation,
            backend_name: self.backend_name().to_string(),
            list_id: list_id.map(str::to_string),
            op_id,
            cause: cause.into(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Runs one remote call under the per-call deadline and the cancellation
    /// signal.
    async fn call<T>(
        &self,
        operation: &str,
        request: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, SyncCause> {
        let deadline = self.call_timeout;
        let timed = async move {
            match tokio::time::timeout(deadline, request).await {
                Ok(result) => result.map_err(SyncCause::from),
                Err(_) => Err(SyncCause::Backend(BackendError::transport(
                    operation,
                    format!("timed out after {}s", deadline.as_secs_f32()),
                ))),
            }
        };
        match &self.cancel {
            Some(cancel) => {
                if *cancel.borrow() {
                    return Err(SyncCause::Cancelled);
                }
                tokio::select! {
                    result = timed => result,
                    _ = wait_cancelled(cancel.clone()) => Err(SyncCause::Cancelled),
                }
            }
            None => timed.await,
        }
    }

    /// Pull then push, so remote changes are seen before local ones land.
    pub async fn sync(&self, list_id: Option<&str>) -> Result<SyncResult, SyncError> {
        let pull = self.pull_only(list_id).await?;
        let push = self.push_only().await?;
        Ok(SyncResult { pull, push })
    }

    /// Like [`SyncManager::sync`] but ignores stored etags.
    pub async fn full_sync(&self) -> Result<SyncResult, SyncError> {
        self.cache
            .clear_etags(self.backend_name())
            .map_err(|err| self.error("full sync", None, None, err))?;
        self.sync(None).await
    }

    pub async fn pull_only(&self, list_id: Option<&str>) -> Result<PullResult, SyncError> {
        let name = self.backend_name().to_string();
        let lists = self
            .call("list task lists", self.remote.list_task_lists())
            .await
            .map_err(|cause| self.error("pull", list_id, None, cause))?;
        self.cache
            .apply_remote_lists(&name, &lists)
            .map_err(|err| self.error("pull", list_id, None, err))?;

        let targets: Vec<_> = match list_id {
            Some(wanted) => {
                let matched: Vec<_> = lists.iter().filter(|list| list.id == wanted).collect();
                if matched.is_empty() && !crate::cache::is_temp_id(wanted) {
                    return Err(self.error(
                        "pull",
                        Some(wanted),
                        None,
                        BackendError::not_found("pull", format!("list {wanted} not found on remote"))
                            .with_list(wanted),
                    ));
                }
                matched
            }
            None => lists.iter().collect(),
        };

        let mut result = PullResult::default();
        for list in targets {
            if self.is_cancelled() {
                return Err(self.error("pull", Some(&list.id), None, SyncCause::Cancelled));
            }
            let lock = self.list_locks.for_list(&name, &list.id);
            let _held = lock.lock().await;
            result.lists += 1;

            let metadata = self
                .cache
                .list_metadata(&name, &list.id)
                .map_err(|err| self.error("pull", Some(&list.id), None, err))?;
            let unchanged = match (&list.etag, &metadata) {
                (Some(etag), Some(metadata)) => {
                    metadata.last_full_sync.is_some()
                        && metadata.last_remote_etag.as_deref() == Some(etag.as_str())
                }
                _ => false,
            };
            if unchanged {
                debug!(backend = %name, list = %list.id, "etag unchanged; skipping fetch");
                result.unchanged += 1;
                self.cache
                    .mark_list_synced(&name, &list.id, now(), list.etag.as_deref())
                    .map_err(|err| self.error("pull", Some(&list.id), None, err))?;
                continue;
            }

            let tasks = match self.call("get tasks", self.remote.get_tasks(&list.id, None)).await {
                Ok(tasks) => tasks,
                Err(cause) => {
                    if let Err(err) = self.cache.record_list_error(&name, &list.id, &cause.to_string()) {
                        warn!(error = %err, "could not record list sync error");
                    }
                    return Err(self.error("pull", Some(&list.id), None, cause));
                }
            };
            let report = self
                .cache
                .apply_remote_snapshot(&name, &list.id, &tasks, self.policy)
                .map_err(|err| self.error("pull", Some(&list.id), None, err))?;
            self.cache
                .mark_list_synced(&name, &list.id, now(), list.etag.as_deref())
                .map_err(|err| self.error("pull", Some(&list.id), None, err))?;
            result.inserted += report.inserted;
            result.updated += report.updated;
            result.removed += report.removed;
            result.conflicts += report.conflicts;
        }
        info!(
            backend = %name,
            lists = result.lists,
            unchanged = result.unchanged,
            conflicts = result.conflicts,
            "pull finished"
        );
        Ok(result)
    }

    /// Drains the journal in op order. A connectivity failure, or an op still
    /// inside its retry delay, holds back the rest of that list's ops; an auth
    /// failure stops the whole pass.
    pub async fn push_only(&self) -> Result<PushResult, SyncError> {
        let name = self.backend_name().to_string();
        let Some(_pusher) = self
            .cache
            .try_push_lock(&name)
            .map_err(|err| self.error("push", None, None, err))?
        else {
            debug!(backend = %name, "another push is in progress");
            return Ok(PushResult {
                skipped: true,
                ..PushResult::default()
            });
        };

        let mut result = PushResult::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut cursor = 0;
        loop {
            if self.is_cancelled() {
                return Err(self.error("push", None, None, SyncCause::Cancelled));
            }
            let Some(next) = self
                .cache
                .next_pending_operation(&name, cursor)
                .map_err(|err| self.error("push", None, None, err))?
            else {
                break;
            };
            cursor = next.op_id;
            if blocked.contains(&next.list_id) {
                continue;
            }

            let lock = self.list_locks.for_list(&name, &next.list_id);
            let _held = lock.lock().await;
            // The op may have been rewritten or removed while we waited.
            let Some(op) = self
                .cache
                .pending_operation(next.op_id)
                .map_err(|err| self.error("push", Some(&next.list_id), Some(next.op_id), err))?
            else {
                continue;
            };
            let list_id = op.list_id.clone();
            if !op.is_due(now()) {
                debug!(backend = %name, op_id = op.op_id, list = %list_id, "retry delay not elapsed; holding list");
                blocked.insert(list_id.clone());
                result.blocked_lists.push(list_id);
                continue;
            }

            let outcome = match self.dispatch(&op).await {
                Ok(outcome) => outcome,
                Err(SyncCause::Cancelled) => {
                    return Err(self.error("push", Some(&list_id), Some(op.op_id), SyncCause::Cancelled));
                }
                Err(SyncCause::Cache(err)) => {
                    return Err(self.error("push", Some(&list_id), Some(op.op_id), err));
                }
                Err(SyncCause::Backend(err)) if err.is_unauthorized() => {
                    self.record(&op, &SyncOutcome::Deferred {
                        error: err.to_string(),
                    })?;
                    warn!(backend = %name, op_id = op.op_id, "authentication failed; push stopped");
                    return Err(self.error("push", Some(&list_id), Some(op.op_id), err));
                }
                Err(SyncCause::Backend(err)) if err.is_transient() => {
                    blocked.insert(list_id.clone());
                    result.blocked_lists.push(list_id.clone());
                    if err.status.is_some() {
                        SyncOutcome::Failed {
                            error: err.to_string(),
                            permanent: false,
                        }
                    } else {
                        SyncOutcome::Deferred {
                            error: err.to_string(),
                        }
                    }
                }
                Err(SyncCause::Backend(err)) => SyncOutcome::Failed {
                    error: err.to_string(),
                    permanent: true,
                },
            };

            match &outcome {
                SyncOutcome::Applied { .. } => result.pushed += 1,
                SyncOutcome::Dropped { .. } => result.dropped += 1,
                SyncOutcome::Failed { permanent: true, .. } => result.failed += 1,
                SyncOutcome::Failed { .. } | SyncOutcome::Deferred { .. } => {}
            }
            self.record(&op, &outcome)?;
        }

        result.remaining = self
            .cache
            .pending_count(&name)
            .map_err(|err| self.error("push", None, None, err))?;
        info!(
            backend = %name,
            pushed = result.pushed,
            dropped = result.dropped,
            failed = result.failed,
            remaining = result.remaining,
            "push finished"
        );
        Ok(result)
    }

    fn record(&self, op: &PendingOperation, outcome: &SyncOutcome) -> Result<(), SyncError> {
        self.cache
            .apply_sync_result(op.op_id, outcome)
            .map_err(|err| self.error("push", Some(&op.list_id), Some(op.op_id), err))
    }

    async fn dispatch(&self, op: &PendingOperation) -> Result<SyncOutcome, SyncCause> {
        let list_id = op.list_id.as_str();
        let previously_claimed = op.claimed;
        self.cache.claim_operation(op.op_id)?;
        debug!(op_id = op.op_id, kind = %op.kind(), list = list_id, "dispatching");

        match &op.change {
            PendingChange::AddTask { task } => {
                let outbound = self.remote.translate_outbound(task.clone());
                if previously_claimed {
                    if let Some(uid) = self.find_pushed_task(list_id, &outbound).await? {
                        info!(op_id = op.op_id, uid = %uid, "add already reached the remote");
                        return Ok(SyncOutcome::Applied {
                            remote_id: Some(uid),
                        });
                    }
                }
                let uid = self
                    .call("add task", self.remote.add_task(list_id, &outbound))
                    .await?;
                Ok(SyncOutcome::Applied {
                    remote_id: Some(uid),
                })
            }
            PendingChange::UpdateTask { task } => {
                let outbound = self.remote.translate_outbound(task.clone());
                match self
                    .call("update task", self.remote.update_task(list_id, &outbound))
                    .await
                {
                    Ok(()) => Ok(SyncOutcome::Applied { remote_id: None }),
                    Err(SyncCause::Backend(err)) if err.is_not_found() => {
                        warn!(uid = %task.uid, "task was deleted remotely; dropping local update");
                        Ok(SyncOutcome::Dropped {
                            reason: "task no longer exists on the remote".to_string(),
                        })
                    }
                    Err(cause) => Err(cause),
                }
            }
            PendingChange::DeleteTask { uid } => {
                match self
                    .call("delete task", self.remote.delete_task(list_id, uid))
                    .await
                {
                    Ok(()) => Ok(SyncOutcome::Applied { remote_id: None }),
                    Err(SyncCause::Backend(err)) if err.is_not_found() => {
                        Ok(SyncOutcome::Applied { remote_id: None })
                    }
                    Err(cause) => Err(cause),
                }
            }
            PendingChange::CreateList { list } => {
                if previously_claimed {
                    let existing = self
                        .call("list task lists", self.remote.list_task_lists())
                        .await?
                        .into_iter()
                        .find(|remote| remote.name == list.name);
                    if let Some(existing) = existing {
                        info!(op_id = op.op_id, list = %existing.id, "list create already reached the remote");
                        return Ok(SyncOutcome::Applied {
                            remote_id: Some(existing.id),
                        });
                    }
                }
                let id = self
                    .call(
                        "create task list",
                        self.remote.create_task_list(
                            &list.name,
                            list.description.as_deref(),
                            list.color.as_deref(),
                        ),
                    )
                    .await?;
                Ok(SyncOutcome::Applied { remote_id: Some(id) })
            }
            PendingChange::RenameList { name } => {
                match self
                    .call("rename task list", self.remote.rename_task_list(list_id, name))
                    .await
                {
                    Ok(()) => Ok(SyncOutcome::Applied { remote_id: None }),
                    Err(SyncCause::Backend(err)) if err.is_not_found() => Ok(SyncOutcome::Dropped {
                        reason: "list no longer exists on the remote".to_string(),
                    }),
                    Err(cause) => Err(cause),
                }
            }
            PendingChange::DeleteList => {
                match self
                    .call("delete task list", self.remote.delete_task_list(list_id))
                    .await
                {
                    Ok(()) => Ok(SyncOutcome::Applied { remote_id: None }),
                    Err(SyncCause::Backend(err)) if err.is_not_found() => {
                        Ok(SyncOutcome::Applied { remote_id: None })
                    }
                    Err(cause) => Err(cause),
                }
            }
        }
    }

    /// Looks for a task matching `task` by summary and content, used when an
    /// add may have reached the remote before the process died.
    async fn find_pushed_task(&self, list_id: &str, task: &Task) -> Result<Option<String>, SyncCause> {
        let candidates = match self
            .call(
                "find tasks",
                self.remote.find_tasks_by_summary(list_id, &task.summary),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(SyncCause::Backend(err)) if err.is_not_found() => return Ok(None),
            Err(cause) => return Err(cause),
        };
        let fingerprint = task.fingerprint();
        Ok(candidates
            .into_iter()
            .find(|candidate| candidate.summary == task.summary && candidate.fingerprint() == fingerprint)
            .map(|candidate| candidate.uid))
    }
}

async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
