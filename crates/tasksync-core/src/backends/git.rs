//! Repo-text backend: tasks kept in a markdown file at the root of a git
//! repository. The file must carry [`MARKER`] to be picked up.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, BackendErrorKind, BackendResult, Detection};
use crate::model::{check_parent, format_day, now, parse_date, Task, TaskFilter, TaskList, TaskStatus};

pub const MARKER: &str = "<!-- tasksync:enabled -->";
const DEFAULT_FILES: [&str; 3] = ["TODO.md", "todo.md", ".tasksync.md"];

fn checkbox_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^-\s+\[([ xX>\-])\]\s+(.+)$").expect("regex"))
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@(\w+):(\S+)").expect("regex"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkdownDocument {
    preamble: Vec<String>,
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq)]
struct Section {
    name: String,
    tasks: Vec<Task>,
}

impl MarkdownDocument {
    pub fn parse(content: &str) -> Self {
        let mut document = MarkdownDocument::default();
        let mut description: Vec<String> = Vec::new();
        let mut in_task = false;

        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(header) = trimmed.strip_prefix("## ") {
                document.flush_description(&mut description);
                in_task = false;
                let name = header.trim();
                let name = if name.is_empty() {
                    format!("List-{}", document.sections.len() + 1)
                } else {
                    name.to_string()
                };
                document.sections.push(Section {
                    name,
                    tasks: Vec::new(),
                });
                continue;
            }
            if document.sections.is_empty() {
                document.preamble.push(line.to_string());
                continue;
            }
            if let Some(captures) = checkbox_pattern().captures(trimmed) {
                document.flush_description(&mut description);
                let status = parse_checkbox(&captures[1]);
                if let Some(section) = document.sections.last_mut() {
                    let task = parse_task_line(&section.name, section.tasks.len(), status, &captures[2]);
                    section.tasks.push(task);
                    in_task = true;
                }
                continue;
            }
            if in_task && (line.starts_with("  ") || line.starts_with('\t')) {
                if !trimmed.is_empty() {
                    description.push(trimmed.to_string());
                }
                continue;
            }
            document.flush_description(&mut description);
            in_task = false;
        }
        document.flush_description(&mut description);
        document
    }

    fn flush_description(&mut self, lines: &mut Vec<String>) {
        if lines.is_empty() {
            return;
        }
        if let Some(task) = self
            .sections
            .last_mut()
            .and_then(|section| section.tasks.last_mut())
        {
            task.description = lines.join("\n");
        }
        lines.clear();
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut preamble = self.preamble.clone();
        while preamble.last().is_some_and(|line| line.trim().is_empty()) {
            preamble.pop();
        }
        if !preamble.iter().any(|line| line.contains(MARKER)) {
            preamble.insert(0, MARKER.to_string());
        }
        for line in &preamble {
            out.push_str(line);
            out.push('\n');
        }
        for section in &self.sections {
            out.push('\n');
            out.push_str("## ");
            out.push_str(&section.name);
            out.push_str("\n\n");
            for task in &section.tasks {
                out.push_str(&render_task(task));
            }
        }
        out
    }

    fn section(&self, list_id: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == list_id)
    }

    fn section_mut(&mut self, operation: &str, list_id: &str) -> BackendResult<&mut Section> {
        self.sections
            .iter_mut()
            .find(|section| section.name == list_id)
            .ok_or_else(|| {
                BackendError::not_found(operation, format!("list {list_id} not found"))
                    .with_list(list_id)
            })
    }
}

fn parse_checkbox(marker: &str) -> TaskStatus {
    match marker {
        "x" | "X" => TaskStatus::Done,
        ">" => TaskStatus::InProgress,
        "-" => TaskStatus::Cancelled,
        _ => TaskStatus::Todo,
    }
}

fn checkbox(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "[ ]",
        TaskStatus::InProgress => "[>]",
        TaskStatus::Done => "[x]",
        TaskStatus::Cancelled => "[-]",
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    parse_date(value).ok()
}

fn parse_task_line(list: &str, index: usize, status: TaskStatus, rest: &str) -> Task {
    let summary = tag_pattern().replace_all(rest, "").trim().to_string();
    let mut task = Task::new(summary);
    task.status = status;
    let mut created = None;
    let mut modified = None;
    for captures in tag_pattern().captures_iter(rest) {
        let value = &captures[2];
        match captures[1].to_ascii_lowercase().as_str() {
            "uid" => task.uid = value.to_string(),
            "priority" => task.priority = value.parse().unwrap_or(0),
            "due" => task.due = parse_timestamp(value),
            "start" => task.start = parse_timestamp(value),
            "created" => created = parse_timestamp(value),
            "modified" => modified = parse_timestamp(value),
            "completed" => task.completed = parse_timestamp(value),
            "parent" => task.parent_uid = Some(value.to_string()),
            "tags" => {
                task.categories = value
                    .split(',')
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            }
            "status" => {
                if let Ok(parsed) = TaskStatus::parse_token(value) {
                    task.status = parsed;
                }
            }
            _ => {}
        }
    }
    if task.uid.is_empty() {
        task.uid = derived_uid(list, index, &task.summary);
    }
    let created = created.unwrap_or(task.created);
    task.created = created;
    task.modified = modified.unwrap_or(created);
    task
}

/// Stable id for hand-written lines that carry no `@uid:` yet.
fn derived_uid(list: &str, index: usize, summary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(list.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(summary.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("md-{}", &digest[..12])
}

fn render_task(task: &Task) -> String {
    let mut line = format!("- {} {}", checkbox(task.status), task.summary);
    line.push_str(&format!(" @uid:{}", task.uid));
    if task.priority > 0 {
        line.push_str(&format!(" @priority:{}", task.priority));
    }
    if let Some(start) = &task.start {
        line.push_str(&format!(" @start:{}", format_day(start)));
    }
    if let Some(due) = &task.due {
        line.push_str(&format!(" @due:{}", format_day(due)));
    }
    if !task.categories.is_empty() {
        let tags: Vec<&str> = task.categories.iter().map(String::as_str).collect();
        line.push_str(&format!(" @tags:{}", tags.join(",")));
    }
    if let Some(parent) = &task.parent_uid {
        line.push_str(&format!(" @parent:{parent}"));
    }
    line.push_str(&format!(" @created:{}", task.created.to_rfc3339()));
    line.push_str(&format!(" @modified:{}", task.modified.to_rfc3339()));
    if let Some(completed) = &task.completed {
        line.push_str(&format!(" @completed:{}", completed.to_rfc3339()));
    }
    line.push('\n');
    for description in task.description.lines() {
        line.push_str("  ");
        line.push_str(description);
        line.push('\n');
    }
    line
}

pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|candidate| candidate.join(".git").exists())
        .map(Path::to_path_buf)
}

pub struct GitBackend {
    name: String,
    start_dir: PathBuf,
    files: Vec<String>,
    auto_commit: bool,
    write_guard: Mutex<()>,
}

impl GitBackend {
    pub fn new(name: impl Into<String>, start_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            start_dir: start_dir.into(),
            files: Vec::new(),
            auto_commit: false,
            write_guard: Mutex::new(()),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    fn candidates(&self) -> Vec<String> {
        if self.files.is_empty() {
            DEFAULT_FILES.iter().map(|name| name.to_string()).collect()
        } else {
            self.files.clone()
        }
    }

    /// Locates `(repo_root, task_file)`.
    fn locate(&self, operation: &str) -> BackendResult<(PathBuf, PathBuf)> {
        let repo = find_repo_root(&self.start_dir).ok_or_else(|| {
            BackendError::not_found(
                operation,
                format!("{} is not inside a git repository", self.start_dir.display()),
            )
        })?;
        let candidates = self.candidates();
        for name in &candidates {
            let path = repo.join(name);
            if let Ok(content) = fs::read_to_string(&path) {
                if content.contains(MARKER) {
                    return Ok((repo, path));
                }
            }
        }
        Err(BackendError::not_found(
            operation,
            format!(
                "no task file with the {MARKER} marker found (tried: {})",
                candidates.join(", ")
            ),
        ))
    }

    fn load(&self, operation: &str) -> BackendResult<MarkdownDocument> {
        let (_, path) = self.locate(operation)?;
        let content = fs::read_to_string(&path).map_err(|err| {
            BackendError::internal(operation, err.to_string()).with_source(err)
        })?;
        Ok(MarkdownDocument::parse(&content))
    }

    fn modify<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut MarkdownDocument) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (repo, path) = self.locate(operation)?;
        let content = fs::read_to_string(&path).map_err(|err| {
            BackendError::internal(operation, err.to_string()).with_source(err)
        })?;
        let mut document = MarkdownDocument::parse(&content);
        let value = f(&mut document)?;
        fs::write(&path, document.render()).map_err(|err| {
            BackendError::internal(operation, err.to_string()).with_source(err)
        })?;
        if self.auto_commit {
            self.commit(&repo, &path, operation);
        }
        Ok(value)
    }

    fn commit(&self, repo: &Path, path: &Path, operation: &str) {
        let relative = path.strip_prefix(repo).unwrap_or(path);
        let staged = Command::new("git")
            .arg("-C")
            .arg(repo)
            .arg("add")
            .arg(relative)
            .status();
        let committed = staged.and_then(|_| {
            Command::new("git")
                .arg("-C")
                .arg(repo)
                .args(["commit", "--quiet", "-m"])
                .arg(format!("tasksync: {operation}"))
                .status()
        });
        match committed {
            Ok(status) if status.success() => debug!(operation, "task file committed"),
            Ok(status) => warn!(operation, %status, "git commit of task file failed"),
            Err(err) => warn!(operation, error = %err, "could not run git"),
        }
    }
}

#[async_trait]
impl Backend for GitBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "git"
    }

    fn context(&self) -> String {
        match self.locate("context") {
            Ok((repo, path)) => format!(
                "git repository {} (task file {})",
                repo.display(),
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
            Err(_) => format!("git repository near {}", self.start_dir.display()),
        }
    }

    async fn can_detect(&self) -> BackendResult<Detection> {
        match self.locate("detect") {
            Ok((repo, path)) => {
                let mut detail = format!(
                    "git repository at {} with task file {}",
                    repo.display(),
                    path.display()
                );
                if self.auto_commit && which::which("git").is_err() {
                    detail.push_str(" (git executable not on PATH; auto-commit disabled)");
                }
                Ok(Detection::found(detail))
            }
            Err(err) if err.is_not_found() => Ok(Detection::missing(err.message)),
            Err(err) => Err(err),
        }
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskList>> {
        let document = self.load("list task lists")?;
        Ok(document
            .sections
            .iter()
            .map(|section| TaskList::new(section.name.clone(), section.name.clone()))
            .collect())
    }

    async fn get_tasks(&self, list_id: &str, filter: Option<&TaskFilter>) -> BackendResult<Vec<Task>> {
        let document = self.load("get tasks")?;
        let section = document.section(list_id).ok_or_else(|| {
            BackendError::not_found("get tasks", format!("list {list_id} not found")).with_list(list_id)
        })?;
        let tasks = section.tasks.clone();
        Ok(match filter {
            Some(filter) => filter.apply(tasks),
            None => tasks,
        })
    }

    async fn add_task(&self, list_id: &str, task: &Task) -> BackendResult<String> {
        task.validate()?;
        self.modify("add task", |document| {
            let section = document.section_mut("add task", list_id)?;
            let uid = uuid::Uuid::new_v4().simple().to_string();
            check_parent(&section.tasks, &uid, task.parent_uid.as_deref())?;
            let mut stored = task.clone();
            stored.uid = uid.clone();
            stored.created = now();
            stored.modified = stored.created;
            stored.normalize_completion(stored.modified);
            section.tasks.push(stored);
            Ok(uid)
        })
    }

    async fn update_task(&self, list_id: &str, task: &Task) -> BackendResult<()> {
        task.validate()?;
        self.modify("update task", |document| {
            let section = document.section_mut("update task", list_id)?;
            check_parent(&section.tasks, &task.uid, task.parent_uid.as_deref())?;
            let stored = section
                .tasks
                .iter_mut()
                .find(|stored| stored.uid == task.uid)
                .ok_or_else(|| {
                    BackendError::not_found("update task", "task not found")
                        .with_list(list_id)
                        .with_task(&task.uid)
                })?;
            let created = stored.created;
            let previous = stored.modified;
            *stored = task.clone();
            stored.created = created;
            stored.modified = previous.max(now());
            stored.normalize_completion(stored.modified);
            Ok(())
        })
    }

    async fn delete_task(&self, list_id: &str, uid: &str) -> BackendResult<()> {
        self.modify("delete task", |document| {
            let section = document.section_mut("delete task", list_id)?;
            let before = section.tasks.len();
            section.tasks.retain(|task| task.uid != uid);
            if section.tasks.len() == before {
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
        _description: Option<&str>,
        _color: Option<&str>,
    ) -> BackendResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BackendError::validation("create task list", "list name must not be empty"));
        }
        self.modify("create task list", |document| {
            if document.section(name).is_some() {
                return Err(BackendError::new(
                    BackendErrorKind::Conflict,
                    "create task list",
                    format!("a list named {name} already exists"),
                ));
            }
            document.sections.push(Section {
                name: name.to_string(),
                tasks: Vec::new(),
            });
            Ok(name.to_string())
        })
    }

    async fn rename_task_list(&self, list_id: &str, new_name: &str) -> BackendResult<()> {
        self.modify("rename task list", |document| {
            document.section_mut("rename task list", list_id)?.name = new_name.trim().to_string();
            Ok(())
        })
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.modify("delete task list", |document| {
            let before = document.sections.len();
            document.sections.retain(|section| section.name != list_id);
            if document.sections.len() == before {
                return Err(BackendError::not_found("delete task list", "list not found")
                    .with_list(list_id));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "<!-- tasksync:enabled -->\n# Project tasks\n\n## Work\n\n- [ ] Write paper @priority:2 @due:2026-01-15 @tags:writing,urgent\n  Draft the intro\n  Then the rest\n- [x] Submit form @uid:abc\n- [>] Review @uid:def @parent:abc\n\n## Home\n- [-] Paint fence\n";

    #[test]
    fn parses_sections_checkboxes_and_tags() {
        let document = MarkdownDocument::parse(SAMPLE);
        assert_eq!(document.sections.len(), 2);
        let work = &document.sections[0];
        assert_eq!(work.name, "Work");
        assert_eq!(work.tasks.len(), 3);
        let first = &work.tasks[0];
        assert_eq!(first.summary, "Write paper");
        assert_eq!(first.priority, 2);
        assert!(first.due.is_some());
        assert_eq!(first.description, "Draft the intro\nThen the rest");
        assert!(first.categories.contains("urgent"));
        assert!(first.uid.starts_with("md-"));
        assert_eq!(work.tasks[1].status, TaskStatus::Done);
        assert_eq!(work.tasks[2].status, TaskStatus::InProgress);
        assert_eq!(work.tasks[2].parent_uid.as_deref(), Some("abc"));
        assert_eq!(document.sections[1].tasks[0].status, TaskStatus::Cancelled);
    }

    #[test]
    fn render_then_parse_keeps_tasks() {
        let document = MarkdownDocument::parse(SAMPLE);
        let rendered = document.render();
        assert!(rendered.starts_with(MARKER));
        let reparsed = MarkdownDocument::parse(&rendered);
        assert_eq!(reparsed.sections, document.sections);
    }

    #[tokio::test]
    async fn operates_on_marked_file_in_repo() {
        let repo = TempDir::new().expect("repo");
        fs::create_dir(repo.path().join(".git")).expect("git dir");
        fs::write(repo.path().join("TODO.md"), SAMPLE).expect("todo");
        let nested = repo.path().join("src");
        fs::create_dir(&nested).expect("nested");

        let backend = GitBackend::new("repo", &nested);
        assert!(backend.can_detect().await.expect("detect").detected);
        let lists = backend.list_task_lists().await.expect("lists");
        assert_eq!(lists.len(), 2);

        let uid = backend
            .add_task("Home", &Task::new("Fix sink"))
            .await
            .expect("add");
        let tasks = backend.get_tasks("Home", None).await.expect("tasks");
        assert!(tasks.iter().any(|task| task.uid == uid && task.summary == "Fix sink"));
    }

    #[tokio::test]
    async fn unmarked_file_is_not_detected() {
        let repo = TempDir::new().expect("repo");
        fs::create_dir(repo.path().join(".git")).expect("git dir");
        fs::write(repo.path().join("TODO.md"), "## Work\n- [ ] a\n").expect("todo");
        let backend = GitBackend::new("repo", repo.path());
        assert!(!backend.can_detect().await.expect("detect").detected);
    }
}
