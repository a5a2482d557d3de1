//! Conflict policies applied when a pull finds a remote change to a task that
//! also has unpushed local changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::Task;

pub const LOCAL_COPY_SUFFIX: &str = " (local copy)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    ServerWins,
    LocalWins,
    Merge,
    KeepBoth,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server_wins",
            ConflictPolicy::LocalWins => "local_wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::KeepBoth => "keep_both",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "server_wins" => Ok(ConflictPolicy::ServerWins),
            "local_wins" => Ok(ConflictPolicy::LocalWins),
            "merge" => Ok(ConflictPolicy::Merge),
            "keep_both" => Ok(ConflictPolicy::KeepBoth),
            other => Err(format!(
                "unknown conflict policy '{other}' (use server_wins, local_wins, merge or keep_both)"
            )),
        }
    }
}

/// What the cache should do with a conflicting task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the cached row with the remote task and drop pending ops.
    TakeRemote,
    /// Leave the cached row and its pending ops alone.
    KeepLocal,
    /// Store the merged task and replace pending ops with one update.
    Merged(Task),
    /// Take the remote task and queue `local_copy` as a new task.
    KeepBoth { local_copy: Task },
}

/// Decides a conflict between the cached `local` task (which has pending ops)
/// and the changed `remote` task. `local_deleted` is set when the pending
/// local change is a delete.
pub fn resolve(policy: ConflictPolicy, local: &Task, remote: &Task, local_deleted: bool) -> Resolution {
    if local_deleted {
        return match policy {
            ConflictPolicy::ServerWins | ConflictPolicy::KeepBoth => Resolution::TakeRemote,
            ConflictPolicy::LocalWins => Resolution::KeepLocal,
            ConflictPolicy::Merge if local.modified > remote.modified => Resolution::KeepLocal,
            ConflictPolicy::Merge => Resolution::TakeRemote,
        };
    }
    match policy {
        ConflictPolicy::ServerWins => Resolution::TakeRemote,
        ConflictPolicy::LocalWins => Resolution::KeepLocal,
        ConflictPolicy::Merge => Resolution::Merged(merge(local, remote)),
        ConflictPolicy::KeepBoth => {
            if local.parent_uid != remote.parent_uid {
                warn!(
                    uid = %local.uid,
                    "keep_both cannot fork a task whose parent changed on both sides; taking the server version"
                );
                return Resolution::TakeRemote;
            }
            let mut local_copy = local.clone();
            local_copy.summary.push_str(LOCAL_COPY_SUFFIX);
            Resolution::KeepBoth { local_copy }
        }
    }
}

/// Field-wise merge: every field comes from whichever side was modified
/// later (the remote on ties); categories are the union of both sides.
pub fn merge(local: &Task, remote: &Task) -> Task {
    let (newer, older) = if local.modified > remote.modified {
        (local, remote)
    } else {
        (remote, local)
    };
    let mut merged = newer.clone();
    merged.uid = remote.uid.clone();
    merged.created = remote.created.min(local.created);
    merged.categories = newer
        .categories
        .union(&older.categories)
        .cloned()
        .collect();
    merged.modified = local.modified.max(remote.modified);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now, TaskStatus};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn pair() -> (Task, Task) {
        let mut local = Task::new("local summary");
        local.uid = "u1".to_string();
        local.categories.insert("home".to_string());
        let mut remote = local.clone();
        remote.summary = "remote summary".to_string();
        remote.categories = ["work".to_string()].into_iter().collect();
        (local, remote)
    }

    #[test]
    fn merge_takes_later_side_and_unions_categories() {
        let (mut local, mut remote) = pair();
        let base = now();
        local.modified = base + Duration::minutes(5);
        local.status = TaskStatus::InProgress;
        remote.modified = base;
        let merged = merge(&local, &remote);
        assert_eq!(merged.summary, "local summary");
        assert_eq!(merged.status, TaskStatus::InProgress);
        assert_eq!(merged.modified, local.modified);
        let tags: Vec<&str> = merged.categories.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["home", "work"]);

        remote.modified = base + Duration::minutes(10);
        let merged = merge(&local, &remote);
        assert_eq!(merged.summary, "remote summary");
        assert_eq!(merged.status, TaskStatus::Todo);
    }

    #[test]
    fn keep_both_renames_local_copy() {
        let (local, remote) = pair();
        match resolve(ConflictPolicy::KeepBoth, &local, &remote, false) {
            Resolution::KeepBoth { local_copy } => {
                assert_eq!(local_copy.summary, "local summary (local copy)");
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }

    #[test]
    fn keep_both_with_parent_change_falls_back_to_server() {
        let (local, mut remote) = pair();
        remote.parent_uid = Some("elsewhere".to_string());
        assert_eq!(
            resolve(ConflictPolicy::KeepBoth, &local, &remote, false),
            Resolution::TakeRemote
        );
    }

    #[test]
    fn local_delete_conflicts() {
        let (mut local, remote) = pair();
        assert_eq!(resolve(ConflictPolicy::ServerWins, &local, &remote, true), Resolution::TakeRemote);
        assert_eq!(resolve(ConflictPolicy::LocalWins, &local, &remote, true), Resolution::KeepLocal);
        local.modified = remote.modified + Duration::minutes(1);
        assert_eq!(resolve(ConflictPolicy::Merge, &local, &remote, true), Resolution::KeepLocal);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("keep-both".parse::<ConflictPolicy>(), Ok(ConflictPolicy::KeepBoth));
        assert!("newest".parse::<ConflictPolicy>().is_err());
    }
}
