//! The contract every task backend satisfies.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{find_by_summary, ModelError, Task, TaskFilter, TaskList, TaskStatus};

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Transport,
    Auth,
    NotFound,
    Conflict,
    NotSupported,
    Validation,
    Internal,
}

impl BackendErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorKind::Transport => "transport",
            BackendErrorKind::Auth => "auth",
            BackendErrorKind::NotFound => "not found",
            BackendErrorKind::Conflict => "conflict",
            BackendErrorKind::NotSupported => "not supported",
            BackendErrorKind::Validation => "validation",
            BackendErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub operation: String,
    pub message: String,
    pub status: Option<u16>,
    pub retryable: bool,
    pub list_id: Option<String>,
    pub task_uid: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl BackendError {
    pub fn new(
        kind: BackendErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
            status: None,
            retryable: kind == BackendErrorKind::Transport,
            list_id: None,
            task_uid: None,
            source: None,
        }
    }

    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transport, operation, message)
    }

    pub fn auth(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Auth, operation, message)
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, operation, message)
    }

    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Validation, operation, message)
    }

    pub fn internal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Internal, operation, message)
    }

    pub fn not_supported(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let message = format!("{operation} is not supported by this backend");
        Self::new(BackendErrorKind::NotSupported, operation, message)
    }

    /// Maps an HTTP-like status code onto an error kind.
    pub fn from_status(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => BackendErrorKind::Auth,
            404 | 410 => BackendErrorKind::NotFound,
            409 | 412 => BackendErrorKind::Conflict,
            400 | 422 => BackendErrorKind::Validation,
            408 | 429 | 500..=599 => BackendErrorKind::Transport,
            _ => BackendErrorKind::Internal,
        };
        let body = body.into();
        let message = if body.trim().is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {}", body.trim())
        };
        let mut error = Self::new(kind, operation, message);
        error.status = Some(status);
        error
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_list(mut self, list_id: impl Into<String>) -> Self {
        self.list_id = Some(list_id.into());
        self
    }

    pub fn with_task(mut self, uid: impl Into<String>) -> Self {
        self.task_uid = Some(uid.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == BackendErrorKind::Auth || matches!(self.status, Some(401 | 403))
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.retryable
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status, Some(500..=599))
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({})", self.operation, self.kind.as_str())?;
        if let Some(list_id) = &self.list_id {
            write!(f, " [list {list_id}]")?;
        }
        if let Some(uid) = &self.task_uid {
            write!(f, " [task {uid}]")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

impl From<ModelError> for BackendError {
    fn from(error: ModelError) -> Self {
        BackendError::validation("validate", error.to_string())
    }
}

/// Result of a backend's self-check against the current environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub detected: bool,
    pub detail: Option<String>,
}

impl Detection {
    pub fn found(detail: impl Into<String>) -> Self {
        Self {
            detected: true,
            detail: Some(detail.into()),
        }
    }

    pub fn missing(detail: impl Into<String>) -> Self {
        Self {
            detected: false,
            detail: Some(detail.into()),
        }
    }
}

/// Default user-facing status names.
pub fn default_status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "TODO",
        TaskStatus::InProgress => "PROCESSING",
        TaskStatus::Done => "DONE",
        TaskStatus::Cancelled => "CANCELLED",
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Logical name of this instance (the key in the `backends` config map).
    fn name(&self) -> &str;
    fn backend_type(&self) -> &str;

    fn display_name(&self) -> String {
        format!("{} ({})", self.name(), self.backend_type())
    }

    /// Free-form description of what this backend is talking to.
    fn context(&self) -> String {
        self.display_name()
    }

    /// Remote backends get a cache companion when sync is enabled.
    fn is_remote(&self) -> bool {
        false
    }

    async fn can_detect(&self) -> BackendResult<Detection> {
        Ok(Detection::missing("auto-detection not supported"))
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskList>>;

    async fn get_tasks(&self, list_id: &str, filter: Option<&TaskFilter>) -> BackendResult<Vec<Task>>;

    async fn find_tasks_by_summary(&self, list_id: &str, needle: &str) -> BackendResult<Vec<Task>> {
        let tasks = self.get_tasks(list_id, None).await?;
        Ok(find_by_summary(tasks, needle))
    }

    /// Returns the UID the backend stored the task under.
    async fn add_task(&self, list_id: &str, task: &Task) -> BackendResult<String>;

    async fn update_task(&self, list_id: &str, task: &Task) -> BackendResult<()>;

    async fn delete_task(&self, list_id: &str, uid: &str) -> BackendResult<()>;

    async fn create_task_list(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
    ) -> BackendResult<String>;

    async fn rename_task_list(&self, list_id: &str, new_name: &str) -> BackendResult<()>;

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()>;

    async fn get_deleted_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        Err(BackendError::not_supported("get deleted task lists"))
    }

    async fn restore_task_list(&self, _list_id: &str) -> BackendResult<()> {
        Err(BackendError::not_supported("restore task list"))
    }

    async fn permanently_delete_task_list(&self, _list_id: &str) -> BackendResult<()> {
        Err(BackendError::not_supported("permanently delete task list"))
    }

    fn parse_status_flag(&self, token: &str) -> BackendResult<TaskStatus> {
        TaskStatus::parse_token(token).map_err(BackendError::from)
    }

    fn status_to_display_name(&self, status: TaskStatus) -> String {
        default_status_name(status).to_string()
    }

    /// Adapts a canonical task to what this backend can represent before it is
    /// sent. The default is the identity.
    fn translate_outbound(&self, task: Task) -> Task {
        task
    }
}
