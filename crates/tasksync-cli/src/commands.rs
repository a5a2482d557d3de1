use std::collections::BTreeSet;
use std::io::{BufRead, Write};

use serde_json::json;
use tasksync_core::app::App;
use tasksync_core::backend::Backend;
use tasksync_core::credentials::CredentialResolver;
use tasksync_core::error::{AppError, ErrorKind};
use tasksync_core::model::{format_day, now, order_by_hierarchy, parse_date, Task, TaskFilter, TaskStatus};
use tasksync_core::registry::Registry;
use tasksync_core::selector::Selector;

use crate::{CredentialsCommand, ListCommand, SyncArgs, SyncCommand, TaskFields};

type CmdResult = Result<(), AppError>;

fn print_json(value: &serde_json::Value) -> CmdResult {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::new(ErrorKind::Internal, format!("encode json: {err}")))?;
    println!("{text}");
    Ok(())
}

fn queued_note(app: &App) -> &'static str {
    if app.write_is_queued() {
        " (queued for sync)"
    } else {
        ""
    }
}

/// Finds a task by uid or, failing that, by a unique summary match.
async fn resolve_task(backend: &dyn Backend, list_id: &str, key: &str) -> Result<Task, AppError> {
    let tasks = backend.get_tasks(list_id, None).await?;
    if let Some(task) = tasks.iter().find(|task| task.uid == key) {
        return Ok(task.clone());
    }
    let mut matches = backend.find_tasks_by_summary(list_id, key).await?;
    if let Some(pos) = matches.iter().position(|task| task.summary.eq_ignore_ascii_case(key)) {
        return Ok(matches.swap_remove(pos));
    }
    match matches.len() {
        0 => Err(AppError::new(ErrorKind::NotFound, format!("no task matching '{key}'"))),
        1 => Ok(matches.remove(0)),
        _ => {
            let candidates: Vec<String> = matches
                .iter()
                .map(|task| format!("{} ({})", task.summary, task.uid))
                .collect();
            Err(AppError::new(
                ErrorKind::Validation,
                format!("'{key}' matches several tasks: {}", candidates.join(", ")),
            )
            .with_suggestion("Use the task uid instead."))
        }
    }
}

fn is_clear(value: &str) -> bool {
    value.trim().is_empty() || value.eq_ignore_ascii_case("none")
}

/// Applies command-line fields to `task`.
async fn apply_fields(
    app: &App,
    list_id: &str,
    task: &mut Task,
    fields: &TaskFields,
) -> Result<(), AppError> {
    let backend = app.backend();
    if let Some(description) = &fields.description {
        task.description = description.clone();
    }
    if let Some(priority) = fields.priority {
        task.priority = priority;
    }
    if let Some(status) = &fields.status {
        task.status = backend.parse_status_flag(status)?;
    }
    if let Some(due) = &fields.due {
        task.due = if is_clear(due) { None } else { Some(parse_date(due)?) };
    }
    if let Some(start) = &fields.start {
        task.start = if is_clear(start) { None } else { Some(parse_date(start)?) };
    }
    if let Some(tags) = &fields.tags {
        task.categories = tags
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<String>>();
    }
    if let Some(parent) = &fields.parent {
        task.parent_uid = if is_clear(parent) {
            None
        } else {
            Some(resolve_task(backend.as_ref(), list_id, parent).await?.uid)
        };
    }
    Ok(())
}

fn task_json(task: &Task, depth: usize, backend: &dyn Backend) -> serde_json::Value {
    json!({
        "uid": task.uid,
        "summary": task.summary,
        "description": task.description,
        "status": backend.status_to_display_name(task.status),
        "priority": task.priority,
        "start": task.start.as_ref().map(format_day),
        "due": task.due.as_ref().map(format_day),
        "completed": task.completed.map(|at| at.to_rfc3339()),
        "categories": task.categories,
        "parent_uid": task.parent_uid,
        "depth": depth,
    })
}

fn status_mark(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "[ ]",
        TaskStatus::InProgress => "[>]",
        TaskStatus::Done => "[x]",
        TaskStatus::Cancelled => "[-]",
    }
}

pub async fn lists(app: &App, as_json: bool) -> CmdResult {
    app.prepare_lists().await?;
    let lists = app.backend().list_task_lists().await?;
    if as_json {
        return print_json(&json!(lists));
    }
    if lists.is_empty() {
        println!("No lists.");
    }
    for list in lists {
        match &list.description {
            Some(description) => println!("{}  {}  ({})", list.id, list.name, description),
            None => println!("{}  {}", list.id, list.name),
        }
    }
    Ok(())
}

pub async fn get(app: &App, list: &str, status: &[String], exclude: &[String], as_json: bool) -> CmdResult {
    app.prepare_lists().await?;
    let list = app.resolve_list(list).await?;
    app.prepare_read(&list.id).await?;
    let backend = app.backend();
    let status = status
        .iter()
        .map(|token| backend.parse_status_flag(token))
        .collect::<Result<Vec<_>, _>>()?;
    let exclude = exclude
        .iter()
        .map(|token| backend.parse_status_flag(token))
        .collect::<Result<Vec<_>, _>>()?;
    let filter = TaskFilter {
        include: status,
        exclude,
    };
    let tasks = backend
        .get_tasks(&list.id, if filter.is_empty() { None } else { Some(&filter) })
        .await?;
    let ordered = order_by_hierarchy(tasks);
    if as_json {
        let rows: Vec<serde_json::Value> = ordered
            .iter()
            .map(|(depth, task)| task_json(task, *depth, backend.as_ref()))
            .collect();
        return print_json(&json!({ "list": list, "tasks": rows }));
    }
    println!("{}", list.name);
    if ordered.is_empty() {
        println!("  (no tasks)");
    }
    for (depth, task) in ordered {
        let indent = "  ".repeat(depth + 1);
        let mut line = format!("{indent}{} {}", status_mark(task.status), task.summary);
        if task.priority > 0 {
            line.push_str(&format!("  !{}", task.priority));
        }
        if let Some(due) = &task.due {
            line.push_str(&format!("  due {}", format_day(due)));
        }
        if !task.categories.is_empty() {
            let tags: Vec<&str> = task.categories.iter().map(String::as_str).collect();
            line.push_str(&format!("  #{}", tags.join(" #")));
        }
        println!("{line}");
    }
    Ok(())
}

pub async fn add(app: &App, list: &str, summary: &str, fields: &TaskFields) -> CmdResult {
    app.prepare_lists().await?;
    let list = app.resolve_list(list).await?;
    let mut task = Task::new(summary);
    apply_fields(app, &list.id, &mut task, fields).await?;
    task.normalize_completion(now());
    task.validate()?;
    let uid = app.backend().add_task(&list.id, &task).await?;
    app.after_write();
    println!("Added '{}' to {} [{}]{}", task.summary, list.name, uid, queued_note(app));
    Ok(())
}

pub async fn update(app: &App, list: &str, key: &str, summary: Option<&str>, fields: &TaskFields) -> CmdResult {
    app.prepare_lists().await?;
    let list = app.resolve_list(list).await?;
    let backend = app.backend();
    let mut task = resolve_task(backend.as_ref(), &list.id, key).await?;
    if let Some(summary) = summary {
        task.summary = summary.to_string();
    }
    apply_fields(app, &list.id, &mut task, fields).await?;
    let at = now();
    task.normalize_completion(at);
    task.touch(at);
    task.validate()?;
    backend.update_task(&list.id, &task).await?;
    app.after_write();
    println!("Updated '{}'{}", task.summary, queued_note(app));
    Ok(())
}

pub async fn complete(app: &App, list: &str, key: &str, status: Option<&str>) -> CmdResult {
    app.prepare_lists().await?;
    let list = app.resolve_list(list).await?;
    let backend = app.backend();
    let mut task = resolve_task(backend.as_ref(), &list.id, key).await?;
    task.status = match status {
        Some(token) => backend.parse_status_flag(token)?,
        None => TaskStatus::Done,
    };
    let at = now();
    task.normalize_completion(at);
    task.touch(at);
    backend.update_task(&list.id, &task).await?;
    app.after_write();
    println!(
        "Marked '{}' {}{}",
        task.summary,
        backend.status_to_display_name(task.status),
        queued_note(app)
    );
    Ok(())
}

pub async fn delete(app: &App, list: &str, key: &str) -> CmdResult {
    app.prepare_lists().await?;
    let list = app.resolve_list(list).await?;
    let backend = app.backend();
    let task = resolve_task(backend.as_ref(), &list.id, key).await?;
    backend.delete_task(&list.id, &task.uid).await?;
    app.after_write();
    println!("Deleted '{}'{}", task.summary, queued_note(app));
    Ok(())
}

pub async fn list_command(app: &App, command: &ListCommand) -> CmdResult {
    app.prepare_lists().await?;
    let backend = app.backend();
    match command {
        ListCommand::Create {
            name,
            description,
            color,
        } => {
            let id = backend
                .create_task_list(name, description.as_deref(), color.as_deref())
                .await?;
            app.after_write();
            println!("Created list '{name}' [{id}]{}", queued_note(app));
        }
        ListCommand::Rename { list, new_name } => {
            let list = app.resolve_list(list).await?;
            backend.rename_task_list(&list.id, new_name).await?;
            app.after_write();
            println!("Renamed '{}' to '{new_name}'{}", list.name, queued_note(app));
        }
        ListCommand::Delete { list } => {
            let list = app.resolve_list(list).await?;
            backend.delete_task_list(&list.id).await?;
            app.after_write();
            println!("Deleted list '{}'{}", list.name, queued_note(app));
        }
        ListCommand::Trash => {
            let lists = backend.get_deleted_task_lists().await?;
            if lists.is_empty() {
                println!("Trash is empty.");
            }
            for list in lists {
                println!("{}  {}", list.id, list.name);
            }
        }
        ListCommand::Restore { list } => {
            let deleted = backend.get_deleted_task_lists().await?;
            let target = deleted
                .iter()
                .find(|entry| entry.id == *list || entry.name.eq_ignore_ascii_case(list))
                .ok_or_else(|| AppError::new(ErrorKind::NotFound, format!("list '{list}' is not in the trash")))?;
            backend.restore_task_list(&target.id).await?;
            app.after_write();
            println!("Restored list '{}'", target.name);
        }
        ListCommand::Purge { list } => {
            let deleted = backend.get_deleted_task_lists().await?;
            let target = deleted
                .iter()
                .find(|entry| entry.id == *list || entry.name.eq_ignore_ascii_case(list))
                .ok_or_else(|| AppError::new(ErrorKind::NotFound, format!("list '{list}' is not in the trash")))?;
            backend.permanently_delete_task_list(&target.id).await?;
            println!("Permanently deleted list '{}'", target.name);
        }
    }
    Ok(())
}

pub async fn sync(app: &App, args: &SyncArgs) -> CmdResult {
    let manager = app.sync_manager().ok_or_else(|| {
        AppError::new(
            ErrorKind::Config,
            format!("sync is not enabled for backend '{}'", app.backend_name()),
        )
        .with_suggestion("Set sync.enabled = true and use a remote backend.")
    })?;

    if let Some(SyncCommand::Status) = args.command {
        return sync_status(app);
    }

    let list_id = match &args.list {
        Some(list) => Some(app.resolve_list(list).await?.id),
        None => None,
    };
    if args.push_only {
        let result = manager.push_only().await?;
        report_push(&result);
    } else if args.pull_only {
        let result = manager.pull_only(list_id.as_deref()).await?;
        report_pull(&result);
    } else if args.full {
        let result = manager.full_sync().await?;
        report_pull(&result.pull);
        report_push(&result.push);
    } else {
        let result = manager.sync(list_id.as_deref()).await?;
        report_pull(&result.pull);
        report_push(&result.push);
    }
    Ok(())
}

fn report_pull(result: &tasksync_core::sync::PullResult) {
    println!(
        "Pulled {} list(s): {} new, {} updated, {} removed, {} conflict(s), {} unchanged",
        result.lists, result.inserted, result.updated, result.removed, result.conflicts, result.unchanged
    );
}

fn report_push(result: &tasksync_core::sync::PushResult) {
    if result.skipped {
        println!("Another sync is pushing; skipped.");
        return;
    }
    println!(
        "Pushed {} operation(s), {} dropped, {} failed, {} remaining",
        result.pushed, result.dropped, result.failed, result.remaining
    );
}

fn sync_status(app: &App) -> CmdResult {
    let Some(cache) = app.cache() else {
        return Ok(());
    };
    let pending = cache.get_pending_sync_operations()?;
    let failed = cache.get_failed_operations()?;
    println!("Backend: {}", app.backend_name());
    println!("Pending operations: {}", pending.len());
    for op in &pending {
        let mut line = format!("  #{} {} list {}", op.op_id, op.kind(), op.list_id);
        if let Some(uid) = op.change.task_uid() {
            line.push_str(&format!(" task {uid}"));
        }
        if op.attempts > 0 {
            line.push_str(&format!(" (attempts {})", op.attempts));
        }
        if let Some(error) = &op.last_error {
            line.push_str(&format!(" last error: {error}"));
        }
        println!("{line}");
    }
    println!("Failed operations: {}", failed.len());
    for entry in &failed {
        println!(
            "  #{} {} list {} at {}: {}",
            entry.operation.op_id,
            entry.operation.kind(),
            entry.operation.list_id,
            entry.failed_at.to_rfc3339(),
            entry.operation.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    let metadata = cache.store().all_list_metadata(app.backend_name())?;
    for meta in metadata {
        let synced = meta
            .last_full_sync
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let mut line = format!("List {}: last sync {synced}", meta.list_id);
        if app.trigger().is_stale(&meta.list_id) {
            line.push_str(" (stale)");
        }
        if let Some(error) = &meta.last_error {
            line.push_str(&format!(", last error: {error}"));
        }
        println!("{line}");
    }
    Ok(())
}

pub async fn backends(registry: &Registry, detect: bool) -> CmdResult {
    for info in registry.list_backends(detect).await {
        println!("{info}");
    }
    if detect {
        let detected = Selector::new(registry).detect_all().await;
        match detected.first() {
            Some(first) => println!("Auto-detect would pick: {}", first.name),
            None => println!("No backend detected."),
        }
    }
    Ok(())
}

pub fn credentials(command: &CredentialsCommand, resolver: &CredentialResolver) -> CmdResult {
    match command {
        CredentialsCommand::Set {
            backend,
            username,
            secret,
        } => {
            let secret = match secret {
                Some(secret) => secret.clone(),
                None => read_secret()?,
            };
            if secret.is_empty() {
                return Err(AppError::new(ErrorKind::Validation, "secret must not be empty"));
            }
            let service = CredentialResolver::service_name(backend);
            resolver.store().set(&service, username, &secret)?;
            println!("Stored credentials for {backend} ({username}) in the keyring");
        }
        CredentialsCommand::Get { backend, username } => {
            let service = CredentialResolver::service_name(backend);
            match resolver.store().get(&service, username)? {
                Some(secret) => println!("{backend} ({username}): {}", redact(&secret)),
                None => {
                    return Err(AppError::new(
                        ErrorKind::NotFound,
                        format!("no keyring entry for {backend} ({username})"),
                    ))
                }
            }
        }
        CredentialsCommand::Delete { backend, username } => {
            let service = CredentialResolver::service_name(backend);
            if resolver.store().delete(&service, username)? {
                println!("Removed credentials for {backend} ({username})");
            } else {
                println!("No credentials stored for {backend} ({username})");
            }
        }
    }
    Ok(())
}

fn read_secret() -> Result<String, AppError> {
    eprint!("Secret: ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| AppError::new(ErrorKind::Internal, format!("read secret: {err}")))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub fn redact(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = secret.chars().skip(count - 2).collect();
    format!("{}{tail}", "*".repeat(count - 2))
}
