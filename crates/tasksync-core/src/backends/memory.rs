//! In-process backend. Behaves like a remote service (server-assigned ids,
//! per-list etags, trash) and can be told to fail, stall or go offline.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;

use crate::backend::{Backend, BackendError, BackendResult, Detection};
use crate::model::{check_parent, now, Task, TaskFilter, TaskList};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    ListTaskLists,
    GetTasks(String),
    AddTask { list_id: String, summary: String },
    UpdateTask { list_id: String, uid: String },
    DeleteTask { list_id: String, uid: String },
    CreateList(String),
    RenameList(String),
    DeleteList(String),
}

impl RemoteCall {
    /// The existing list the call works on, if any.
    pub fn list_id(&self) -> Option<&str> {
        match self {
            RemoteCall::GetTasks(list_id)
            | RemoteCall::RenameList(list_id)
            | RemoteCall::DeleteList(list_id)
            | RemoteCall::AddTask { list_id, .. }
            | RemoteCall::UpdateTask { list_id, .. }
            | RemoteCall::DeleteTask { list_id, .. } => Some(list_id),
            RemoteCall::ListTaskLists | RemoteCall::CreateList(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    list: TaskList,
    tasks: Vec<Task>,
    version: u64,
}

impl ListEntry {
    fn bump(&mut self) {
        self.version += 1;
        self.list.etag = Some(format!("v{}", self.version));
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    lists: BTreeMap<String, ListEntry>,
    trash: BTreeMap<String, ListEntry>,
    next_id: u64,
    calls: Vec<RemoteCall>,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn list_mut(&mut self, operation: &str, list_id: &str) -> BackendResult<&mut ListEntry> {
        self.lists.get_mut(list_id).ok_or_else(|| {
            BackendError::not_found(operation, format!("list {list_id} not found")).with_list(list_id)
        })
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    queued: VecDeque<BackendError>,
    latency: Option<Duration>,
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// Counts a call as in flight against its list until dropped.
struct InFlight<'a> {
    backend: &'a MemoryBackend,
    list_id: Option<String>,
}

impl<'a> InFlight<'a> {
    fn start(backend: &'a MemoryBackend, list_id: Option<&str>) -> Self {
        if let Some(list_id) = list_id {
            let mut faults = backend.lock_faults();
            let active = faults.active.entry(list_id.to_string()).or_default();
            *active += 1;
            let now_active = *active;
            let peak = faults.peak.entry(list_id.to_string()).or_default();
            *peak = (*peak).max(now_active);
        }
        Self {
            backend,
            list_id: list_id.map(str::to_string),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(list_id) = &self.list_id {
            if let Some(active) = self.backend.lock_faults().active.get_mut(list_id) {
                *active = active.saturating_sub(1);
            }
        }
    }
}

pub struct MemoryBackend {
    name: String,
    state: Mutex<MemoryState>,
    faults: Mutex<Faults>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Creates a list directly on the "server", bypassing the call log.
    pub fn seed_list(&self, name: &str) -> String {
        let mut state = self.lock_state();
        let id = state.next_id("list");
        let mut entry = ListEntry {
            list: TaskList::new(id.clone(), name),
            tasks: Vec::new(),
            version: 0,
        };
        entry.bump();
        state.lists.insert(id.clone(), entry);
        id
    }

    /// Applies an edit as another client would, advancing `modified`.
    pub fn edit_task(&self, list_id: &str, uid: &str, edit: impl FnOnce(&mut Task)) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.lists.get_mut(list_id) else {
            return false;
        };
        let Some(task) = entry.tasks.iter_mut().find(|task| task.uid == uid) else {
            return false;
        };
        edit(task);
        task.modified = advance(task.modified);
        entry.bump();
        true
    }

    /// Removes a task as another client would.
    pub fn remove_task(&self, list_id: &str, uid: &str) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.lists.get_mut(list_id) else {
            return false;
        };
        let before = entry.tasks.len();
        entry.tasks.retain(|task| task.uid != uid);
        let removed = entry.tasks.len() != before;
        if removed {
            entry.bump();
        }
        removed
    }

    pub fn tasks(&self, list_id: &str) -> Vec<Task> {
        self.lock_state()
            .lists
            .get(list_id)
            .map(|entry| entry.tasks.clone())
            .unwrap_or_default()
    }

    pub fn lists(&self) -> Vec<TaskList> {
        self.lock_state()
            .lists
            .values()
            .map(|entry| entry.list.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock_state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock_state().calls.clear();
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock_faults().offline = offline;
    }

    /// The next call fails with `error`; queued errors are consumed in order.
    pub fn fail_next(&self, error: BackendError) {
        self.lock_faults().queued.push_back(error);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock_faults().latency = latency;
    }

    /// Most calls that were ever in flight at once against `list_id`.
    pub fn peak_concurrency(&self, list_id: &str) -> usize {
        self.lock_faults().peak.get(list_id).copied().unwrap_or(0)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, operation: &str, call: RemoteCall) -> BackendResult<()> {
        let latency = self.lock_faults().latency;
        let in_flight = InFlight::start(self, call.list_id());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        drop(in_flight);
        {
            let mut faults = self.lock_faults();
            if faults.offline {
                return Err(BackendError::transport(operation, "connection refused"));
            }
            if let Some(error) = faults.queued.pop_front() {
                return Err(error);
            }
        }
        self.lock_state().calls.push(call);
        Ok(())
    }
}

fn advance(previous: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
    let current = now();
    if current > previous {
        current
    } else {
        previous + ChronoDuration::seconds(1)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "memory"
    }

    fn context(&self) -> String {
        format!("in-memory store {}", self.name)
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn can_detect(&self) -> BackendResult<Detection> {
        Ok(Detection::missing("in-memory backends are never auto-detected"))
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        self.enter("list task lists", RemoteCall::ListTaskLists).await?;
        Ok(self.lists())
    }

    async fn get_tasks(&self, list_id: &str, filter: Option<&TaskFilter>) -> BackendResult<Vec<Task>> {
        self.enter("get tasks", RemoteCall::GetTasks(list_id.to_string()))
            .await?;
        let mut state = self.lock_state();
        let tasks = state.list_mut("get tasks", list_id)?.tasks.clone();
        Ok(match filter {
            Some(filter) => filter.apply(tasks),
            None => tasks,
        })
    }

    async fn add_task(&self, list_id: &str, task: &Task) -> BackendResult<String> {
        self.enter(
            "add task",
            RemoteCall::AddTask {
                list_id: list_id.to_string(),
                summary: task.summary.clone(),
            },
        )
        .await?;
        task.validate()?;
        let mut state = self.lock_state();
        let uid = state.next_id("mem");
        let entry = state.list_mut("add task", list_id)?;
        check_parent(&entry.tasks, &uid, task.parent_uid.as_deref())?;
        let mut stored = task.clone();
        stored.uid = uid.clone();
        stored.created = now();
        stored.modified = stored.created;
        stored.normalize_completion(stored.modified);
        entry.tasks.push(stored);
        entry.bump();
        Ok(uid)
    }

    async fn update_task(&self, list_id: &str, task: &Task) -> BackendResult<()> {
        self.enter(
            "update task",
            RemoteCall::UpdateTask {
                list_id: list_id.to_string(),
                uid: task.uid.clone(),
            },
        )
        .await?;
        task.validate()?;
        let mut state = self.lock_state();
        let entry = state.list_mut("update task", list_id)?;
        check_parent(&entry.tasks, &task.uid, task.parent_uid.as_deref())?;
        let Some(stored) = entry.tasks.iter_mut().find(|stored| stored.uid == task.uid) else {
            return Err(BackendError::not_found("update task", "task not found")
                .with_list(list_id)
                .with_task(&task.uid));
        };
        let created = stored.created;
        let modified = advance(stored.modified);
        *stored = task.clone();
        stored.created = created;
        stored.modified = modified;
        stored.normalize_completion(modified);
        entry.bump();
        Ok(())
    }

    async fn delete_task(&self, list_id: &str, uid: &str) -> BackendResult<()> {
        self.enter(
            "delete task",
            RemoteCall::DeleteTask {
                list_id: list_id.to_string(),
                uid: uid.to_string(),
            },
        )
        .await?;
        let mut state = self.lock_state();
        let entry = state.list_mut("delete task", list_id)?;
        let before = entry.tasks.len();
        entry.tasks.retain(|task| task.uid != uid);
        if entry.tasks.len() == before {
            return Err(BackendError::not_found("delete task", "task not found")
                .with_list(list_id)
                .with_task(uid));
        }
        entry.bump();
        Ok(())
    }

    async fn create_task_list(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
    ) -> BackendResult<String> {
        self.enter("create task list", RemoteCall::CreateList(name.to_string()))
            .await?;
        if name.trim().is_empty() {
            return Err(BackendError::validation("create task list", "list name must not be empty"));
        }
        let mut state = self.lock_state();
        let id = state.next_id("list");
        let mut list = TaskList::new(id.clone(), name);
        list.description = description.map(str::to_string);
        list.color = color.map(str::to_string);
        let mut entry = ListEntry {
            list,
            tasks: Vec::new(),
            version: 0,
        };
        entry.bump();
        state.lists.insert(id.clone(), entry);
        Ok(id)
    }

    async fn rename_task_list(&self, list_id: &str, new_name: &str) -> BackendResult<()> {
        self.enter("rename task list", RemoteCall::RenameList(list_id.to_string()))
            .await?;
        let mut state = self.lock_state();
        let entry = state.list_mut("rename task list", list_id)?;
        entry.list.name = new_name.to_string();
        entry.bump();
        Ok(())
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.enter("delete task list", RemoteCall::DeleteList(list_id.to_string()))
            .await?;
        let mut state = self.lock_state();
        let mut entry = state.lists.remove(list_id).ok_or_else(|| {
            BackendError::not_found("delete task list", "list not found").with_list(list_id)
        })?;
        entry.list.deleted = true;
        state.trash.insert(list_id.to_string(), entry);
        Ok(())
    }

    async fn get_deleted_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        Ok(self
            .lock_state()
            .trash
            .values()
            .map(|entry| entry.list.clone())
            .collect())
    }

    async fn restore_task_list(&self, list_id: &str) -> BackendResult<()> {
        let mut state = self.lock_state();
        let mut entry = state.trash.remove(list_id).ok_or_else(|| {
            BackendError::not_found("restore task list", "list not in trash").with_list(list_id)
        })?;
        entry.list.deleted = false;
        entry.bump();
        state.lists.insert(list_id.to_string(), entry);
        Ok(())
    }

    async fn permanently_delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        let mut state = self.lock_state();
        state.trash.remove(list_id).map(|_| ()).ok_or_else(|| {
            BackendError::not_found("permanently delete task list", "list not in trash")
                .with_list(list_id)
        })
    }
}
