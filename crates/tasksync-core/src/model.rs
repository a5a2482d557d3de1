use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_PRIORITY: u8 = 9;
pub const FIND_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("invalid status flag: {0} (use TODO/T, IN-PROGRESS/P, DONE/D, CANCELLED/C)")]
    InvalidStatus(String),
    #[error("task summary must not be empty")]
    EmptySummary,
    #[error("invalid priority: {0} (must be between 0 and 9)")]
    InvalidPriority(u8),
    #[error("start date {start} is after due date {due}")]
    StartAfterDue { start: String, due: String },
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("parent task {0} does not exist in this list")]
    MissingParent(String),
    #[error("making {parent} the parent of {uid} would create a cycle")]
    ParentCycle { uid: String, parent: String },
}

/// Canonical task status shared by every backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "TODO")]
    Todo,
    #[serde(rename = "IN-PROGRESS")]
    InProgress,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN-PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    /// Parses a user supplied status token. Accepts abbreviations, the
    /// canonical names and the calendar-style aliases, ignoring case.
    pub fn parse_token(token: &str) -> Result<Self, ModelError> {
        let normalized = token.trim().to_ascii_uppercase().replace('_', "-");
        match normalized.as_str() {
            "T" | "TODO" | "NEEDS-ACTION" | "OPEN" => Ok(TaskStatus::Todo),
            "P" | "I" | "IN-PROGRESS" | "INPROGRESS" | "IN-PROCESS" | "PROCESSING" => {
                Ok(TaskStatus::InProgress)
            }
            "D" | "DONE" | "COMPLETED" => Ok(TaskStatus::Done),
            "C" | "CANCELLED" | "CANCELED" => Ok(TaskStatus::Cancelled),
            _ => Err(ModelError::InvalidStatus(token.to_string())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::parse_token(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    /// Opaque change token supplied by the owning backend, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl TaskList {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub uid: String,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uid: Option<String>,
}

impl Task {
    pub fn new(summary: impl Into<String>) -> Self {
        let now = now();
        Self {
            uid: String::new(),
            summary: summary.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: 0,
            start: None,
            due: None,
            created: now,
            modified: now,
            completed: None,
            categories: BTreeSet::new(),
            parent_uid: None,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.summary.trim().is_empty() {
            return Err(ModelError::EmptySummary);
        }
        if self.priority > MAX_PRIORITY {
            return Err(ModelError::InvalidPriority(self.priority));
        }
        if let (Some(start), Some(due)) = (self.start, self.due) {
            if start > due {
                return Err(ModelError::StartAfterDue {
                    start: start.format("%Y-%m-%d").to_string(),
                    due: due.format("%Y-%m-%d").to_string(),
                });
            }
        }
        Ok(())
    }

    /// Keeps `completed` consistent with the status.
    pub fn normalize_completion(&mut self, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            if self.completed.is_none() {
                self.completed = Some(at);
            }
        } else {
            self.completed = None;
        }
    }

    /// Advances `modified` to `at`, or one second past its current value
    /// when `at` would not move it forward.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.modified = if at > self.modified {
            at
        } else {
            self.modified + chrono::Duration::seconds(1)
        };
    }

    /// Hash of the user-visible content, ignoring identity and server-managed
    /// timestamps. Two tasks with the same fingerprint look identical to a user.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.summary.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.description.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.status.as_str().as_bytes());
        hasher.update([self.priority]);
        for date in [self.start, self.due] {
            let day = date
                .map(|value| value.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            hasher.update(day.as_bytes());
            hasher.update([0u8]);
        }
        for tag in &self.categories {
            hasher.update(tag.as_bytes());
            hasher.update([1u8]);
        }
        hasher.update(self.parent_uid.as_deref().unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Status filter. Exclusions win over inclusions; an empty include set
/// matches every status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub include: Vec<TaskStatus>,
    pub exclude: Vec<TaskStatus>,
}

impl TaskFilter {
    pub fn from_tokens(include: &[String], exclude: &[String]) -> Result<Self, ModelError> {
        Ok(Self {
            include: parse_status_list(include)?,
            exclude: parse_status_list(exclude)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.exclude.contains(&task.status) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&task.status)
    }

    pub fn apply(&self, tasks: Vec<Task>) -> Vec<Task> {
        tasks.into_iter().filter(|task| self.matches(task)).collect()
    }
}

fn parse_status_list(tokens: &[String]) -> Result<Vec<TaskStatus>, ModelError> {
    let mut statuses = Vec::new();
    for token in tokens.iter().flat_map(|value| value.split(',')) {
        if token.trim().is_empty() {
            continue;
        }
        let status = TaskStatus::parse_token(token)?;
        if !statuses.contains(&status) {
            statuses.push(status);
        }
    }
    Ok(statuses)
}

/// Case-insensitive substring search, bounded by [`FIND_LIMIT`].
pub fn find_by_summary(tasks: Vec<Task>, needle: &str) -> Vec<Task> {
    let needle = needle.to_lowercase();
    tasks
        .into_iter()
        .filter(|task| task.summary.to_lowercase().contains(&needle))
        .take(FIND_LIMIT)
        .collect()
}

/// Verifies that `parent` exists among `tasks` and that linking `uid` under it
/// keeps the parent graph a forest.
pub fn check_parent(tasks: &[Task], uid: &str, parent: Option<&str>) -> Result<(), ModelError> {
    let Some(parent) = parent else {
        return Ok(());
    };
    let parents: HashMap<&str, Option<&str>> = tasks
        .iter()
        .map(|task| (task.uid.as_str(), task.parent_uid.as_deref()))
        .collect();
    if !parents.contains_key(parent) {
        return Err(ModelError::MissingParent(parent.to_string()));
    }
    let mut cursor = Some(parent);
    let mut steps = 0usize;
    while let Some(current) = cursor {
        if current == uid || steps > parents.len() {
            return Err(ModelError::ParentCycle {
                uid: uid.to_string(),
                parent: parent.to_string(),
            });
        }
        cursor = parents.get(current).copied().flatten();
        steps += 1;
    }
    Ok(())
}

/// Orders tasks so that every parent precedes its children. Orphans (parent
/// not present) are treated as roots.
pub fn order_by_hierarchy(tasks: Vec<Task>) -> Vec<(usize, Task)> {
    let uids: BTreeSet<String> = tasks.iter().map(|task| task.uid.clone()).collect();
    let mut children: HashMap<Option<String>, Vec<Task>> = HashMap::new();
    for task in tasks {
        let key = task.parent_uid.clone().filter(|parent| uids.contains(parent));
        children.entry(key).or_default().push(task);
    }
    let mut ordered = Vec::new();
    let mut stack: Vec<(usize, Task)> = children
        .remove(&None)
        .unwrap_or_default()
        .into_iter()
        .rev()
        .map(|task| (0, task))
        .collect();
    while let Some((depth, task)) = stack.pop() {
        if let Some(kids) = children.remove(&Some(task.uid.clone())) {
            stack.extend(kids.into_iter().rev().map(|child| (depth + 1, child)));
        }
        ordered.push((depth, task));
    }
    // Whatever is left is part of a cycle; surface it rather than drop it.
    for (_, rest) in children {
        ordered.extend(rest.into_iter().map(|task| (0, task)));
    }
    ordered
}

/// Current time truncated to whole seconds.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Parses `YYYY-MM-DD` (local midnight) or an RFC 3339 timestamp.
pub fn parse_date(input: &str) -> Result<DateTime<Utc>, ModelError> {
    let trimmed = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return local_midnight(date).ok_or_else(|| ModelError::InvalidDate(input.to_string()));
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| ModelError::InvalidDate(input.to_string()))
}

pub fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|value| value.with_timezone(&Utc))
}

pub fn format_day(value: &DateTime<Utc>) -> String {
    value.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(uid: &str, parent: Option<&str>) -> Task {
        let mut task = Task::new(uid);
        task.uid = uid.to_string();
        task.parent_uid = parent.map(str::to_string);
        task
    }

    #[test]
    fn parse_status_accepts_abbreviations_and_aliases() {
        assert_eq!(TaskStatus::parse_token("t").unwrap(), TaskStatus::Todo);
        assert_eq!(TaskStatus::parse_token("Needs-Action").unwrap(), TaskStatus::Todo);
        assert_eq!(TaskStatus::parse_token("processing").unwrap(), TaskStatus::InProgress);
        assert_eq!(TaskStatus::parse_token("in_progress").unwrap(), TaskStatus::InProgress);
        assert_eq!(TaskStatus::parse_token("COMPLETED").unwrap(), TaskStatus::Done);
        assert_eq!(TaskStatus::parse_token(" c ").unwrap(), TaskStatus::Cancelled);
        let err = TaskStatus::parse_token("later").unwrap_err();
        assert!(err.to_string().contains("use TODO/T"));
    }

    #[test]
    fn validate_rejects_start_after_due() {
        let mut task = Task::new("Plan");
        let due = now();
        task.due = Some(due);
        task.start = Some(due + Duration::days(1));
        assert!(matches!(task.validate(), Err(ModelError::StartAfterDue { .. })));
        task.start = Some(due);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_summary_and_bad_priority() {
        assert_eq!(Task::new("  ").validate(), Err(ModelError::EmptySummary));
        let mut task = Task::new("x");
        task.priority = 10;
        assert_eq!(task.validate(), Err(ModelError::InvalidPriority(10)));
    }

    #[test]
    fn completion_follows_status() {
        let mut task = Task::new("x");
        let at = now();
        task.status = TaskStatus::Done;
        task.normalize_completion(at);
        assert_eq!(task.completed, Some(at));
        task.status = TaskStatus::Todo;
        task.normalize_completion(at);
        assert_eq!(task.completed, None);
    }

    #[test]
    fn filter_exclusion_wins() {
        let filter = TaskFilter::from_tokens(&["todo,done".to_string()], &["D".to_string()])
            .expect("filter");
        let mut done = Task::new("a");
        done.status = TaskStatus::Done;
        assert!(!filter.matches(&done));
        assert!(filter.matches(&Task::new("b")));
        let mut started = Task::new("c");
        started.status = TaskStatus::InProgress;
        assert!(!filter.matches(&started));
    }

    #[test]
    fn check_parent_detects_missing_and_cycles() {
        let tasks = vec![task("a", None), task("b", Some("a")), task("c", Some("b"))];
        assert!(check_parent(&tasks, "d", Some("c")).is_ok());
        assert_eq!(
            check_parent(&tasks, "d", Some("zz")),
            Err(ModelError::MissingParent("zz".to_string()))
        );
        assert!(matches!(
            check_parent(&tasks, "a", Some("c")),
            Err(ModelError::ParentCycle { .. })
        ));
    }

    #[test]
    fn hierarchy_order_places_parents_first() {
        let ordered = order_by_hierarchy(vec![
            task("child", Some("root")),
            task("other", None),
            task("root", None),
        ]);
        let uids: Vec<(usize, &str)> = ordered
            .iter()
            .map(|(depth, task)| (*depth, task.uid.as_str()))
            .collect();
        assert_eq!(uids, vec![(0, "other"), (0, "root"), (1, "child")]);
    }

    #[test]
    fn fingerprint_ignores_server_fields() {
        let mut a = Task::new("same");
        let mut b = a.clone();
        b.uid = "remote-1".to_string();
        b.modified = a.modified + Duration::hours(1);
        assert_eq!(a.fingerprint(), b.fingerprint());
        a.categories.insert("work".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn parse_date_accepts_day_and_rfc3339() {
        assert!(parse_date("2026-01-15").is_ok());
        assert!(parse_date("2026-01-15T10:00:00Z").is_ok());
        assert!(matches!(parse_date("15/01/2026"), Err(ModelError::InvalidDate(_))));
    }

    #[test]
    fn touch_always_advances_modified() {
        let mut task = Task::new("Edit twice");
        let at = now();
        task.modified = at;
        task.touch(at);
        assert_eq!(task.modified, at + Duration::seconds(1));
        task.touch(at);
        assert_eq!(task.modified, at + Duration::seconds(2));
        task.touch(at + Duration::hours(1));
        assert_eq!(task.modified, at + Duration::hours(1));
    }

    #[test]
    fn find_by_summary_is_case_insensitive() {
        let found = find_by_summary(vec![Task::new("Write Paper"), Task::new("read")], "paper");
        assert_eq!(found.len(), 1);
    }
}
