//! Todoist REST v2 remote. Projects are lists; only open tasks are visible.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::backend::{Backend, BackendError, BackendResult, Detection};
use crate::model::{format_day, local_midnight, now, Task, TaskFilter, TaskList, TaskStatus};

pub const DEFAULT_BASE_URL: &str = "https://api.todoist.com/rest/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiProject {
    id: String,
    name: String,
    #[serde(default)]
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiDue {
    date: String,
    #[serde(default)]
    datetime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTask {
    id: String,
    content: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    is_completed: bool,
    #[serde(default = "lowest_priority")]
    priority: u8,
    #[serde(default)]
    due: Option<ApiDue>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

fn lowest_priority() -> u8 {
    1
}

#[derive(Debug, Serialize)]
struct TaskPayload<'a> {
    content: &'a str,
    description: &'a str,
    priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    labels: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
}

/// Todoist priority (4 = urgent) to ours (1 = highest).
pub fn priority_from_todoist(priority: u8) -> u8 {
    match priority {
        4 => 1,
        3 => 3,
        2 => 5,
        _ => 7,
    }
}

pub fn priority_to_todoist(priority: u8) -> u8 {
    match priority {
        1 | 2 => 4,
        3 | 4 => 3,
        5 | 6 => 2,
        _ => 1,
    }
}

fn parse_due(due: &ApiDue) -> Option<DateTime<Utc>> {
    if let Some(datetime) = &due.datetime {
        if let Ok(value) = DateTime::parse_from_rfc3339(datetime) {
            return Some(value.with_timezone(&Utc));
        }
    }
    NaiveDate::parse_from_str(&due.date, "%Y-%m-%d")
        .ok()
        .and_then(local_midnight)
}

impl ApiTask {
    fn into_task(self) -> Task {
        let created = self
            .created_at
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_else(now);
        let mut task = Task::new(self.content);
        task.uid = self.id;
        task.description = self.description;
        task.status = if self.is_completed {
            TaskStatus::Done
        } else {
            TaskStatus::Todo
        };
        task.priority = priority_from_todoist(self.priority);
        task.due = self.due.as_ref().and_then(parse_due);
        task.categories = self.labels.into_iter().collect();
        task.parent_uid = self.parent_id;
        task.created = created;
        task.modified = created;
        task.normalize_completion(created);
        task
    }
}

pub struct TodoistBackend {
    name: String,
    base_url: String,
    token: String,
    client: Client,
}

impl TodoistBackend {
    pub fn new(name: impl Into<String>, token: impl Into<String>, base_url: Option<&str>) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| BackendError::internal("build http client", err.to_string()).with_source(err))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            token: token.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> BackendResult<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| transport_error(operation, err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(operation, status = status.as_u16(), "todoist request failed");
        Err(BackendError::from_status(operation, status.as_u16(), body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(&self, operation: &str, request: RequestBuilder) -> BackendResult<T> {
        let response = self.send(operation, request).await?;
        response.json::<T>().await.map_err(|err| {
            BackendError::internal(operation, format!("unexpected response: {err}")).with_source(err)
        })
    }

    async fn sync_completion(&self, uid: &str, status: TaskStatus) -> BackendResult<()> {
        let action = if status.is_terminal() { "close" } else { "reopen" };
        let url = self.url(&format!("/tasks/{uid}/{action}"));
        self.send("set task completion", self.client.post(url))
            .await
            .map(|_| ())
            .map_err(|err| err.with_task(uid))
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> BackendError {
    let message = if err.is_timeout() {
        format!("timeout: {err}")
    } else if err.is_connect() {
        format!("connection refused or unreachable: {err}")
    } else {
        err.to_string()
    };
    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
    BackendError::transport(operation, message)
        .with_retryable(retryable)
        .with_source(err)
}

fn payload<'a>(task: &'a Task, project_id: Option<&'a str>) -> TaskPayload<'a> {
    TaskPayload {
        content: &task.summary,
        description: &task.description,
        priority: priority_to_todoist(task.priority),
        due_date: task.due.as_ref().map(format_day),
        labels: task.categories.iter().map(String::as_str).collect(),
        parent_id: task.parent_uid.as_deref(),
        project_id,
    }
}

#[async_trait]
impl Backend for TodoistBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "todoist"
    }

    fn display_name(&self) -> String {
        format!("Todoist ({})", self.name)
    }

    fn context(&self) -> String {
        format!("Todoist API at {}", self.base_url)
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn can_detect(&self) -> BackendResult<Detection> {
        if self.token.trim().is_empty() {
            Ok(Detection::missing("no Todoist API token"))
        } else {
            Ok(Detection::found("Todoist API token configured"))
        }
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        let projects: Vec<ApiProject> = self
            .json("list task lists", self.client.get(self.url("/projects")))
            .await?;
        Ok(projects
            .into_iter()
            .map(|project| {
                let mut list = TaskList::new(project.id, project.name);
                list.color = project.color;
                list
            })
            .collect())
    }

    async fn get_tasks(&self, list_id: &str, filter: Option<&TaskFilter>) -> BackendResult<Vec<Task>> {
        let request = self
            .client
            .get(self.url("/tasks"))
            .query(&[("project_id", list_id)]);
        let tasks: Vec<ApiTask> = self
            .json("get tasks", request)
            .await
            .map_err(|err| err.with_list(list_id))?;
        let tasks: Vec<Task> = tasks.into_iter().map(ApiTask::into_task).collect();
        Ok(match filter {
            Some(filter) => filter.apply(tasks),
            None => tasks,
        })
    }

    async fn add_task(&self, list_id: &str, task: &Task) -> BackendResult<String> {
        task.validate()?;
        let request = self
            .client
            .post(self.url("/tasks"))
            .json(&payload(task, Some(list_id)));
        let created: ApiTask = self
            .json("add task", request)
            .await
            .map_err(|err| err.with_list(list_id))?;
        if task.status.is_terminal() {
            self.sync_completion(&created.id, task.status).await?;
        }
        Ok(created.id)
    }

    async fn update_task(&self, list_id: &str, task: &Task) -> BackendResult<()> {
        task.validate()?;
        let url = self.url(&format!("/tasks/{}", task.uid));
        let request = self.client.post(url).json(&payload(task, None));
        self.send("update task", request)
            .await
            .map_err(|err| err.with_list(list_id).with_task(&task.uid))?;
        self.sync_completion(&task.uid, task.status).await
    }

    async fn delete_task(&self, list_id: &str, uid: &str) -> BackendResult<()> {
        let url = self.url(&format!("/tasks/{uid}"));
        let response = self
            .send("delete task", self.client.delete(url))
            .await
            .map_err(|err| err.with_list(list_id).with_task(uid))?;
        if response.status() != StatusCode::NO_CONTENT && !response.status().is_success() {
            return Err(BackendError::from_status("delete task", response.status().as_u16(), ""));
        }
        Ok(())
    }

    async fn create_task_list(
        &self,
        name: &str,
        _description: Option<&str>,
        color: Option<&str>,
    ) -> BackendResult<String> {
        let mut body = json!({ "name": name });
        if let Some(color) = color {
            body["color"] = json!(color);
        }
        let project: ApiProject = self
            .json("create task list", self.client.post(self.url("/projects")).json(&body))
            .await?;
        Ok(project.id)
    }

    async fn rename_task_list(&self, list_id: &str, new_name: &str) -> BackendResult<()> {
        let url = self.url(&format!("/projects/{list_id}"));
        self.send("rename task list", self.client.post(url).json(&json!({ "name": new_name })))
            .await
            .map(|_| ())
            .map_err(|err| err.with_list(list_id))
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        let url = self.url(&format!("/projects/{list_id}"));
        self.send("delete task list", self.client.delete(url))
            .await
            .map(|_| ())
            .map_err(|err| err.with_list(list_id))
    }

    fn status_to_display_name(&self, status: TaskStatus) -> String {
        match status {
            TaskStatus::Done | TaskStatus::Cancelled => "Completed".to_string(),
            TaskStatus::Todo | TaskStatus::InProgress => "Open".to_string(),
        }
    }

    fn translate_outbound(&self, mut task: Task) -> Task {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Todo;
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping_round_trips_the_buckets() {
        assert_eq!(priority_from_todoist(4), 1);
        assert_eq!(priority_from_todoist(1), 7);
        assert_eq!(priority_to_todoist(1), 4);
        assert_eq!(priority_to_todoist(2), 4);
        assert_eq!(priority_to_todoist(5), 2);
        assert_eq!(priority_to_todoist(9), 1);
        assert_eq!(priority_to_todoist(0), 1);
        for todoist in 1..=4u8 {
            assert_eq!(priority_to_todoist(priority_from_todoist(todoist)), todoist);
        }
    }

    #[test]
    fn api_task_maps_to_canonical_task() {
        let raw = r#"{
            "id": "123",
            "content": "Buy milk",
            "description": "2 litres",
            "is_completed": false,
            "priority": 4,
            "due": {"date": "2026-03-01", "datetime": null},
            "labels": ["errand"],
            "parent_id": null,
            "created_at": "2026-02-01T10:00:00Z"
        }"#;
        let task = serde_json::from_str::<ApiTask>(raw).expect("parse").into_task();
        assert_eq!(task.uid, "123");
        assert_eq!(task.priority, 1);
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.categories.contains("errand"));
        assert_eq!(format_day(&task.due.expect("due")), "2026-03-01");
        assert_eq!(task.created, task.modified);
    }

    #[test]
    fn outbound_translation_drops_in_progress() {
        let backend = TodoistBackend::new("todoist", "token", None).expect("backend");
        let mut task = Task::new("x");
        task.status = TaskStatus::InProgress;
        assert_eq!(backend.translate_outbound(task).status, TaskStatus::Todo);
    }
}
