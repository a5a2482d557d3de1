
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Task, TaskList};

/// Attempts after which an operation is moved to the dead-letter table.
pub const MAX_ATTEMPTS: u32 = 5;
/// Upper bound on the wait between retries of a failed operation.
pub const MAX_RETRY_DELAY_SECS: i64 = 300;
pub const TEMP_PREFIX: &str = "tmp-";

pub fn temp_id() -> String {
    format!("{TEMP_PREFIX}{}", Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_PREFIX)
}

/// Wait before the next try of an op that has failed `attempts` times:
/// 2, 4, 8, ... seconds, capped at [`MAX_RETRY_DELAY_SECS`].
pub fn retry_delay(attempts: u32) -> chrono::Duration {
    let secs = 1i64
        .checked_shl(attempts.min(16))
        .unwrap_or(MAX_RETRY_DELAY_SECS)
        .min(MAX_RETRY_DELAY_SECS);
    chrono::Duration::seconds(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    AddTask,
    UpdateTask,
    DeleteTask,
    CreateList,
    RenameList,
    DeleteList,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::AddTask => "add_task",
            OpKind::UpdateTask => "update_task",
            OpKind::DeleteTask => "delete_task",
            OpKind::CreateList => "create_list",
            OpKind::RenameList => "rename_list",
            OpKind::DeleteList => "delete_list",
        }
    }

    pub fn is_task_op(&self) -> bool {
        matches!(self, OpKind::AddTask | OpKind::UpdateTask | OpKind::DeleteTask)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add_task" => Ok(OpKind::AddTask),
            "update_task" => Ok(OpKind::UpdateTask),
            "delete_task" => Ok(OpKind::DeleteTask),
            "create_list" => Ok(OpKind::CreateList),
            "rename_list" => Ok(OpKind::RenameList),
            "delete_list" => Ok(OpKind::DeleteList),
            other => Err(format!("unknown operation kind {other}")),
        }
    }
}

/// The journaled intent. Serialized as the op's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingChange {
    AddTask { task: Task },
    UpdateTask { task: Task },
    DeleteTask { uid: String },
    CreateList { list: TaskList },
    RenameList { name: String },
    DeleteList,
}

impl PendingChange {
    pub fn kind(&self) -> OpKind {
        match self {
            PendingChange::AddTask { .. } => OpKind::AddTask,
            PendingChange::UpdateTask { .. } => OpKind::UpdateTask,
            PendingChange::DeleteTask { .. } => OpKind::DeleteTask,
            PendingChange::CreateList { .. } => OpKind::CreateList,
            PendingChange::RenameList { .. } => OpKind::RenameList,
            PendingChange::DeleteList => OpKind::DeleteList,
        }
    }

    /// The task uid for task ops, `None` for list ops.
    pub fn task_uid(&self) -> Option<&str> {
        match self {
            PendingChange::AddTask { task } | PendingChange::UpdateTask { task } => Some(&task.uid),
            PendingChange::DeleteTask { uid } => Some(uid),
            _ => None,
        }
    }

    /// Replaces every reference to `from` (as uid or parent) with `to`.
    /// Returns whether anything changed.
    pub fn rewrite_task_uid(&mut self, from: &str, to: &str) -> bool {
        match self {
            PendingChange::AddTask { task } | PendingChange::UpdateTask { task } => {
                let mut changed = false;
                if task.uid == from {
                    task.uid = to.to_string();
                    changed = true;
                }
                if task.parent_uid.as_deref() == Some(from) {
                    task.parent_uid = Some(to.to_string());
                    changed = true;
                }
                changed
            }
            PendingChange::DeleteTask { uid } if uid == from => {
                *uid = to.to_string();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub op_id: i64,
    pub backend_name: String,
    pub list_id: String,
    pub change: PendingChange,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set while (or after) the op has been handed to the remote.
    pub claimed: bool,
    /// Earliest time a failed op may be sent again.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn kind(&self) -> OpKind {
        self.change.kind()
    }

    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |next| at >= next)
    }
}

/// How a dispatched operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The remote accepted the op; `remote_id` carries the id it assigned to
    /// a new task or list.
    Applied { remote_id: Option<String> },
    /// The op no longer makes sense remotely and is discarded.
    Dropped { reason: String },
    /// The remote could not be reached. The error is recorded but does not
    /// count as an attempt.
    Deferred { error: String },
    /// The remote rejected the op. Permanent failures are dead-lettered at
    /// once, others after [`MAX_ATTEMPTS`].
    Failed { error: String, permanent: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub operation: PendingOperation,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSyncMetadata {
    pub backend_name: String,
    pub list_id: String,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_remote_etag: Option<String>,
    pub last_error: Option<String>,
}
