//! The local cache backend. Reads come from the store; writes land in the
//! store together with a journal entry that the sync manager later pushes to
//! the remote this cache fronts.

pub mod journal;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;

pub use journal::{
    is_temp_id, retry_delay, temp_id, FailedOperation, ListSyncMetadata, OpKind, PendingChange,
    PendingOperation, SyncOutcome, MAX_ATTEMPTS, TEMP_PREFIX,
};
pub use store::{CacheError, CacheResult, CacheStore, ListsReport, SnapshotReport, TaskRecord};

use crate::backend::{Backend, BackendError, BackendResult, Detection};
use crate::model::{Task, TaskFilter, TaskList, TaskStatus};

pub const CACHE_BACKEND_TYPE: &str = "cache";

pub struct CacheBackend {
    remote: Arc<dyn Backend>,
    store: Arc<CacheStore>,
}

impl CacheBackend {
    pub fn new(remote: Arc<dyn Backend>, store: Arc<CacheStore>) -> Self {
        Self { remote, store }
    }

    pub fn remote(&self) -> &Arc<dyn Backend> {
        &self.remote
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Whether anything has been cached for the remote yet.
    pub fn is_populated(&self) -> BackendResult<bool> {
        Ok(!self.store.lists(self.remote.name())?.is_empty())
    }

    pub fn get_pending_sync_operations(&self) -> BackendResult<Vec<PendingOperation>> {
        Ok(self.store.pending_operations(Some(self.remote.name()))?)
    }

    pub fn pending_count(&self) -> BackendResult<usize> {
        Ok(self.store.pending_count(self.remote.name())?)
    }

    pub fn get_failed_operations(&self) -> BackendResult<Vec<FailedOperation>> {
        Ok(self.store.failed_operations(Some(self.remote.name()))?)
    }

    pub fn apply_sync_result(&self, op_id: i64, outcome: &SyncOutcome) -> BackendResult<()> {
        Ok(self.store.apply_sync_result(op_id, outcome)?)
    }

    pub fn list_metadata(&self, list_id: &str) -> BackendResult<Option<ListSyncMetadata>> {
        Ok(self.store.list_metadata(self.remote.name(), list_id)?)
    }

    pub fn clear(&self) -> BackendResult<()> {
        Ok(self.store.clear_backend(self.remote.name())?)
    }

    fn tag(&self, error: CacheError, operation: &str) -> BackendError {
        let mut error = BackendError::from(error);
        error.operation = operation.to_string();
        error
    }
}

#[async_trait]
impl Backend for CacheBackend {
    fn name(&self) -> &str {
        self.remote.name()
    }

    fn backend_type(&self) -> &str {
        CACHE_BACKEND_TYPE
    }

    fn display_name(&self) -> String {
        format!("{} (cached {})", self.remote.name(), self.remote.backend_type())
    }

    fn context(&self) -> String {
        format!("local cache for {}", self.remote.context())
    }

    async fn can_detect(&self) -> BackendResult<Detection> {
        Ok(Detection::found(format!(
            "local cache fronting {}",
            self.remote.display_name()
        )))
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        self.store
            .lists(self.remote.name())
            .map_err(|err| self.tag(err, "list task lists"))
    }

    async fn get_tasks(&self, list_id: &str, filter: Option<&TaskFilter>) -> BackendResult<Vec<Task>> {
        let tasks = self
            .store
            .tasks(self.remote.name(), list_id)
            .map_err(|err| self.tag(err, "get tasks"))?;
        Ok(match filter {
            Some(filter) => filter.apply(tasks),
            None => tasks,
        })
    }

    async fn add_task(&self, list_id: &str, task: &Task) -> BackendResult<String> {
        self.store
            .insert_local_task(self.remote.name(), list_id, task)
            .map(|stored| stored.uid)
            .map_err(|err| self.tag(err, "add task").with_list(list_id))
    }

    async fn update_task(&self, list_id: &str, task: &Task) -> BackendResult<()> {
        self.store
            .update_local_task(self.remote.name(), list_id, task)
            .map(|_| ())
            .map_err(|err| self.tag(err, "update task").with_list(list_id).with_task(&task.uid))
    }

    async fn delete_task(&self, list_id: &str, uid: &str) -> BackendResult<()> {
        self.store
            .delete_local_task(self.remote.name(), list_id, uid)
            .map_err(|err| self.tag(err, "delete task").with_list(list_id).with_task(uid))
    }

    async fn create_task_list(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
    ) -> BackendResult<String> {
        self.store
            .create_local_list(self.remote.name(), name, description, color)
            .map(|list| list.id)
            .map_err(|err| self.tag(err, "create task list"))
    }

    async fn rename_task_list(&self, list_id: &str, new_name: &str) -> BackendResult<()> {
        self.store
            .rename_local_list(self.remote.name(), list_id, new_name)
            .map_err(|err| self.tag(err, "rename task list").with_list(list_id))
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.store
            .delete_local_list(self.remote.name(), list_id)
            .map_err(|err| self.tag(err, "delete task list").with_list(list_id))
    }

    /// Lists deleted locally whose delete has not reached the remote yet.
    async fn get_deleted_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        self.store
            .deleted_lists(self.remote.name())
            .map_err(|err| self.tag(err, "get deleted task lists"))
    }

    async fn restore_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.store
            .restore_local_list(self.remote.name(), list_id)
            .map_err(|err| self.tag(err, "restore task list").with_list(list_id))
    }

    fn parse_status_flag(&self, token: &str) -> BackendResult<TaskStatus> {
        self.remote.parse_status_flag(token)
    }

    fn status_to_display_name(&self, status: TaskStatus) -> String {
        self.remote.status_to_display_name(status)
    }
}
