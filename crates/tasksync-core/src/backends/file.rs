//! Flat-file backend: one JSON document holding every list and task.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::backend::{Backend, BackendError, BackendResult, Detection};
use crate::model::{check_parent, now, Task, TaskFilter, TaskList};

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileDocument {
    #[serde(default)]
    lists: Vec<StoredList>,
    #[serde(default)]
    trash: Vec<StoredList>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredList {
    list: TaskList,
    #[serde(default)]
    tasks: Vec<Task>,
}

impl StoredList {
    fn etag(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.list.name.as_bytes());
        for task in &self.tasks {
            hasher.update(task.uid.as_bytes());
            hasher.update(task.modified.to_rfc3339().as_bytes());
            hasher.update(task.fingerprint().as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    fn with_etag(&self) -> TaskList {
        let mut list = self.list.clone();
        list.etag = Some(self.etag());
        list
    }
}

impl FileDocument {
    fn list_mut(&mut self, operation: &str, list_id: &str) -> BackendResult<&mut StoredList> {
        self.lists
            .iter_mut()
            .find(|stored| stored.list.id == list_id)
            .ok_or_else(|| {
                BackendError::not_found(operation, format!("list {list_id} not found"))
                    .with_list(list_id)
            })
    }
}

pub struct FileBackend {
    name: String,
    path: PathBuf,
    shared: bool,
}

impl FileBackend {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            shared: false,
        }
    }

    /// Marks the file as living on shared storage, which makes it a remote.
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn ensure_reachable(&self, operation: &str) -> BackendResult<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                Err(BackendError::transport(
                    operation,
                    format!("store directory {} is unavailable", parent.display()),
                ))
            }
            _ => Ok(()),
        }
    }

    fn open_lock(&self, operation: &str) -> BackendResult<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|err| io_error(operation, err))
    }

    fn load(&self, operation: &str) -> BackendResult<FileDocument> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(FileDocument::default()),
            Ok(text) => serde_json::from_str(&text).map_err(|err| {
                BackendError::internal(operation, format!("corrupt task file: {err}"))
                    .with_source(err)
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(FileDocument::default()),
            Err(err) => Err(io_error(operation, err)),
        }
    }

    fn store(&self, operation: &str, document: &FileDocument) -> BackendResult<()> {
        let body = serde_json::to_string_pretty(document)
            .map_err(|err| BackendError::internal(operation, err.to_string()))?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body).map_err(|err| io_error(operation, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| io_error(operation, err))?;
        debug!(path = %self.path.display(), operation, "task file written");
        Ok(())
    }

    fn read<T>(&self, operation: &str, f: impl FnOnce(&FileDocument) -> BackendResult<T>) -> BackendResult<T> {
        self.ensure_reachable(operation)?;
        let lock = self.open_lock(operation)?;
        lock.lock_shared().map_err(|err| io_error(operation, err))?;
        let result = self.load(operation).and_then(|document| f(&document));
        let _ = FileExt::unlock(&lock);
        result
    }

    fn modify<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut FileDocument) -> BackendResult<T>,
    ) -> BackendResult<T> {
        self.ensure_reachable(operation)?;
        let lock = self.open_lock(operation)?;
        lock.lock_exclusive().map_err(|err| io_error(operation, err))?;
        let result = self.load(operation).and_then(|mut document| {
            let value = f(&mut document)?;
            self.store(operation, &document)?;
            Ok(value)
        });
        let _ = FileExt::unlock(&lock);
        result
    }
}

fn io_error(operation: &str, err: std::io::Error) -> BackendError {
    let message = err.to_string();
    BackendError::internal(operation, message).with_source(err)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "file"
    }

    fn context(&self) -> String {
        format!("task file {}", self.path.display())
    }

    fn is_remote(&self) -> bool {
        self.shared
    }

    async fn can_detect(&self) -> BackendResult<Detection> {
        if self.path.is_file() {
            Ok(Detection::found(format!("task file at {}", self.path.display())))
        } else {
            Ok(Detection::missing(format!("{} does not exist", self.path.display())))
        }
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        self.read("list task lists", |document| {
            Ok(document.lists.iter().map(StoredList::with_etag).collect())
        })
    }

    async fn get_tasks(&self, list_id: &str, filter: Option<&TaskFilter>) -> BackendResult<Vec<Task>> {
        let tasks = self.read("get tasks", |document| {
            document
                .lists
                .iter()
                .find(|stored| stored.list.id == list_id)
                .map(|stored| stored.tasks.clone())
                .ok_or_else(|| {
                    BackendError::not_found("get tasks", format!("list {list_id} not found"))
                        .with_list(list_id)
                })
        })?;
        Ok(match filter {
            Some(filter) => filter.apply(tasks),
            None => tasks,
        })
    }

    async fn add_task(&self, list_id: &str, task: &Task) -> BackendResult<String> {
        task.validate()?;
        self.modify("add task", |document| {
            let stored = document.list_mut("add task", list_id)?;
            let uid = new_id();
            check_parent(&stored.tasks, &uid, task.parent_uid.as_deref())?;
            let mut task = task.clone();
            task.uid = uid.clone();
            task.created = now();
            task.modified = task.created;
            task.normalize_completion(task.modified);
            stored.tasks.push(task);
            Ok(uid)
        })
    }

    async fn update_task(&self, list_id: &str, task: &Task) -> BackendResult<()> {
        task.validate()?;
        self.modify("update task", |document| {
            let stored = document.list_mut("update task", list_id)?;
            check_parent(&stored.tasks, &task.uid, task.parent_uid.as_deref())?;
            let existing = stored
                .tasks
                .iter_mut()
                .find(|existing| existing.uid == task.uid)
                .ok_or_else(|| {
                    BackendError::not_found("update task", "task not found")
                        .with_list(list_id)
                        .with_task(&task.uid)
                })?;
            let created = existing.created;
            let previous = existing.modified;
            *existing = task.clone();
            existing.created = created;
            existing.modified = previous.max(now());
            existing.normalize_completion(existing.modified);
            Ok(())
        })
    }

    async fn delete_task(&self, list_id: &str, uid: &str) -> BackendResult<()> {
        self.modify("delete task", |document| {
            let stored = document.list_mut("delete task", list_id)?;
            let before = stored.tasks.len();
            stored.tasks.retain(|task| task.uid != uid);
            if stored.tasks.len() == before {
                return Err(BackendError::not_found("delete task", "task not found")
                    .with_list(list_id)
                    .with_task(uid));
            }
            Ok(())
        })
    }

    async fn create_task_list(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
    ) -> BackendResult<String> {
        if name.trim().is_empty() {
            return Err(BackendError::validation("create task list", "list name must not be empty"));
        }
        self.modify("create task list", |document| {
            if document.lists.iter().any(|stored| stored.list.name == name) {
                return Err(BackendError::new(
                    crate::backend::BackendErrorKind::Conflict,
                    "create task list",
                    format!("a list named {name} already exists"),
                ));
            }
            let id = new_id();
            let mut list = TaskList::new(id.clone(), name);
            list.description = description.map(str::to_string);
            list.color = color.map(str::to_string);
            document.lists.push(StoredList {
                list,
                tasks: Vec::new(),
            });
            Ok(id)
        })
    }

    async fn rename_task_list(&self, list_id: &str, new_name: &str) -> BackendResult<()> {
        self.modify("rename task list", |document| {
            document.list_mut("rename task list", list_id)?.list.name = new_name.to_string();
            Ok(())
        })
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.modify("delete task list", |document| {
            let index = document
                .lists
                .iter()
                .position(|stored| stored.list.id == list_id)
                .ok_or_else(|| {
                    BackendError::not_found("delete task list", "list not found").with_list(list_id)
                })?;
            let mut stored = document.lists.remove(index);
            stored.list.deleted = true;
            document.trash.push(stored);
            Ok(())
        })
    }

    async fn get_deleted_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        self.read("get deleted task lists", |document| {
            Ok(document.trash.iter().map(|stored| stored.list.clone()).collect())
        })
    }

    async fn restore_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.modify("restore task list", |document| {
            let index = document
                .trash
                .iter()
                .position(|stored| stored.list.id == list_id)
                .ok_or_else(|| {
                    BackendError::not_found("restore task list", "list not in trash")
                        .with_list(list_id)
                })?;
            let mut stored = document.trash.remove(index);
            stored.list.deleted = false;
            document.lists.push(stored);
            Ok(())
        })
    }

    async fn permanently_delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.modify("permanently delete task list", |document| {
            let before = document.trash.len();
            document.trash.retain(|stored| stored.list.id != list_id);
            if document.trash.len() == before {
                return Err(BackendError::not_found(
                    "permanently delete task list",
                    "list not in trash",
                )
                .with_list(list_id));
            }
            Ok(())
        })
    }
}
