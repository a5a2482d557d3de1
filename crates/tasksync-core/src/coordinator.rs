use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cache::CacheStore;
use crate::config::{BackgroundMode, OfflineMode, SyncConfig};
use crate::conflict::ConflictPolicy;
use crate::sync::{ListLocks, SyncManager, BACKGROUND_CALL_TIMEOUT};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Set in the environment of a detached worker.
pub const BACKGROUND_CHILD_ENV: &str = "TASKSYNC_BACKGROUND_CHILD";
pub const BACKGROUND_LOG_ENV: &str = "TASKSYNC_BACKGROUND_LOG";
pub const BACKGROUND_COMMAND: &str = "_internal_background_sync";

/// Capability handed to foreground operations so they can request syncs
/// without depending on the coordinator itself.
pub trait SyncTrigger: Send + Sync {
    /// Returns whether a new push was scheduled.
    fn trigger_push_sync(&self) -> bool;
    /// Returns whether a new pull of `list_id` was scheduled.
    fn trigger_pull_sync(&self, list_id: &str) -> bool;
    fn is_stale(&self, list_id: &str) -> bool;
}

/// Used when sync is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrigger;

impl SyncTrigger for NoopTrigger {
    fn trigger_push_sync(&self) -> bool {
        false
    }

    fn trigger_pull_sync(&self, _list_id: &str) -> bool {
        false
    }

    fn is_stale(&self, _list_id: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub policy: ConflictPolicy,
    /// Zero disables staleness-driven pulls.
    pub sync_interval: Duration,
    pub offline_mode: OfflineMode,
    pub background_mode: BackgroundMode,
    pub call_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::default(),
            sync_interval: Duration::from_secs(5 * 60),
            offline_mode: OfflineMode::Auto,
            background_mode: BackgroundMode::InProcess,
            call_timeout: BACKGROUND_CALL_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            policy: sync.conflict_resolution,
            sync_interval: Duration::from_secs(sync.sync_interval.saturating_mul(60)),
            offline_mode: sync.offline_mode,
            background_mode: sync.background_mode,
            ..Self::default()
        }
    }
}

/// How to launch a detached worker of the current executable.
#[derive(Debug, Clone)]
pub struct DetachedWorker {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub log: bool,
}

impl DetachedWorker {
    /// A worker running `<current exe> [--config <path>] _internal_background_sync`.
    pub fn current_exe(config_path: Option<PathBuf>, log: bool) -> std::io::Result<Self> {
        let program = std::env::current_exe()?;
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push(OsString::from("--config"));
            args.push(path.into_os_string());
        }
        args.push(OsString::from(BACKGROUND_COMMAND));
        Ok(Self { program, args, log })
    }

    pub fn spawn(&self) -> std::io::Result<u32> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(BACKGROUND_CHILD_ENV, "1");
        if self.log {
            command.env(BACKGROUND_LOG_ENV, "1");
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn()?;
        Ok(child.id())
    }
}

/// Whether this process is a detached background worker.
pub fn is_background_child() -> bool {
    std::env::var(BACKGROUND_CHILD_ENV).map(|value| value == "1").unwrap_or(false)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub abandoned: usize,
}

struct Inner {
    cache: Arc<CacheStore>,
    remote: Arc<dyn Backend>,
    settings: CoordinatorSettings,
    list_locks: Arc<ListLocks>,
    push_in_flight: AtomicBool,
    pulls_in_flight: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
    auth_failed: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    cancel: watch::Sender<bool>,
    runtime: Option<Handle>,
    detached: Option<DetachedWorker>,
    detached_spawned: AtomicBool,
}

impl Inner {
    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pulls(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pulls_in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn manager(&self) -> SyncManager {
        SyncManager::new(self.cache.clone(), self.remote.clone(), self.settings.policy)
            .with_call_timeout(self.settings.call_timeout)
            .with_list_locks(self.list_locks.clone())
            .with_cancellation(self.cancel.subscribe())
    }

    /// Lightweight reachability check before a background sync.
    async fn probe(&self) -> bool {
        if self.settings.offline_mode == OfflineMode::Online {
            return true;
        }
        match tokio::time::timeout(self.settings.probe_timeout, self.remote.list_task_lists()).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(backend = self.remote.name(), error = %err, "remote unreachable; skipping sync");
                if err.is_unauthorized() {
                    self.auth_failed.store(true, Ordering::SeqCst);
                }
                false
            }
            Err(_) => {
                debug!(backend = self.remote.name(), "probe timed out; skipping sync");
                false
            }
        }
    }

    fn accepting(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst)
            && !self.auth_failed.load(Ordering::SeqCst)
            && self.settings.offline_mode != OfflineMode::Offline
    }

    fn note_failure(&self, err: &crate::sync::SyncError) {
        if err.is_unauthorized() {
            self.auth_failed.store(true, Ordering::SeqCst);
            warn!(backend = self.remote.name(), error = %err, "background sync stopped: authentication failed");
        } else if err.is_cancelled() {
            debug!(backend = self.remote.name(), "background sync cancelled");
        } else {
            warn!(backend = self.remote.name(), error = %err, "background sync failed");
        }
    }
}

/// Clears an in-flight flag when the task owning it ends, including on
/// panic or abort.
enum FlagGuard {
    Push(Arc<Inner>),
    Pull(Arc<Inner>, String),
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        match self {
            FlagGuard::Push(inner) => inner.push_in_flight.store(false, Ordering::SeqCst),
            FlagGuard::Pull(inner, list_id) => {
                inner.lock_pulls().remove(list_id.as_str());
            }
        }
    }
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Must be created inside a Tokio runtime for in-process background work.
    pub fn new(cache: Arc<CacheStore>, remote: Arc<dyn Backend>, settings: CoordinatorSettings) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cache,
                remote,
                settings,
                list_locks: Arc::new(ListLocks::default()),
                push_in_flight: AtomicBool::new(false),
                pulls_in_flight: Mutex::new(HashSet::new()),
                shutting_down: AtomicBool::new(false),
                auth_failed: AtomicBool::new(false),
                tasks: Mutex::new(JoinSet::new()),
                cancel,
                runtime: Handle::try_current().ok(),
                detached: None,
                detached_spawned: AtomicBool::new(false),
            }),
        }
    }

    /// Pushes run in a detached worker process instead of in-process.
    pub fn with_detached_worker(self, worker: DetachedWorker) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => return Self { inner: shared },
        };
        inner.detached = Some(worker);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_list_locks(self, locks: Arc<ListLocks>) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => return Self { inner: shared },
        };
        inner.list_locks = locks;
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub fn remote(&self) -> &Arc<dyn Backend> {
        &self.inner.remote
    }

    pub fn list_locks(&self) -> Arc<ListLocks> {
        self.inner.list_locks.clone()
    }

    /// A manager sharing this coordinator's list locks, for foreground use.
    pub fn manager(&self) -> SyncManager {
        SyncManager::new(
            self.inner.cache.clone(),
            self.inner.remote.clone(),
            self.inner.settings.policy,
        )
        .with_list_locks(self.inner.list_locks.clone())
    }

    pub fn push_in_flight(&self) -> bool {
        self.inner.push_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock_tasks().len()
    }

    pub fn is_stale_at(&self, list_id: &str, at: DateTime<Utc>) -> bool {
        let interval = self.inner.settings.sync_interval;
        if interval.is_zero() {
            return false;
        }
        let metadata = match self.inner.cache.list_metadata(self.inner.remote.name(), list_id) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(list = list_id, error = %err, "could not read sync metadata");
                return true;
            }
        };
        let Some(last) = metadata.and_then(|metadata| metadata.last_full_sync) else {
            return true;
        };
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        at.signed_duration_since(last) > interval
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) -> bool {
        let Some(runtime) = &self.inner.runtime else {
            warn!("no async runtime available; background sync disabled");
            return false;
        };
        let mut tasks = self.inner.lock_tasks();
        // Shutdown flips the flag under this lock.
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, runtime);
        true
    }

    fn spawn_detached(&self, worker: &DetachedWorker) -> bool {
        if self.inner.detached_spawned.swap(true, Ordering::SeqCst) {
            return false;
        }
        match worker.spawn() {
            Ok(pid) => {
                info!(pid, "spawned detached background sync");
                true
            }
            Err(err) => {
                self.inner.detached_spawned.store(false, Ordering::SeqCst);
                warn!(error = %err, "could not spawn detached background sync");
                false
            }
        }
    }

    /// Waits for in-flight background work for up to `timeout`, then cancels
    /// whatever is left. New triggers are refused from the first call on.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let mut tasks = {
            let mut guard = self.inner.lock_tasks();
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            std::mem::take(&mut *guard)
        };
        let mut report = ShutdownReport::default();
        let drained = tokio::time::timeout(timeout, async {
            let mut completed = 0;
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    if err.is_panic() {
                        warn!("background sync task panicked");
                    }
                }
                completed += 1;
            }
            completed
        })
        .await;
        match drained {
            Ok(completed) => report.completed = completed,
            Err(_) => {
                report.abandoned = tasks.len();
                warn!(
                    remaining = report.abandoned,
                    "background sync still running at shutdown; cancelling"
                );
                let _ = self.inner.cancel.send(true);
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }
        report
    }
}

impl SyncTrigger for SyncCoordinator {
    fn trigger_push_sync(&self) -> bool {
        if !self.inner.accepting() {
            return false;
        }
        if let Some(worker) = &self.inner.detached {
            return self.spawn_detached(worker);
        }
        if self
            .inner
            .push_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("push already in flight; trigger dropped");
            return false;
        }
        let guard = FlagGuard::Push(self.inner.clone());
        let inner = self.inner.clone();
        self.spawn(async move {
            let _guard = guard;
            if !inner.probe().await {
                return;
            }
            match inner.manager().push_only().await {
                Ok(result) => debug!(pushed = result.pushed, remaining = result.remaining, "background push done"),
                Err(err) => inner.note_failure(&err),
            }
        })
    }

    fn trigger_pull_sync(&self, list_id: &str) -> bool {
        if !self.inner.accepting() {
            return false;
        }
        if !self.inner.lock_pulls().insert(list_id.to_string()) {
            debug!(list = list_id, "pull already in flight; trigger dropped");
            return false;
        }
        let guard = FlagGuard::Pull(self.inner.clone(), list_id.to_string());
        let inner = self.inner.clone();
        let list_id = list_id.to_string();
        self.spawn(async move {
            let _guard = guard;
            if !inner.probe().await {
                return;
            }
            match inner.manager().sync(Some(&list_id)).await {
                Ok(result) => debug!(
                    list = %list_id,
                    conflicts = result.pull.conflicts,
                    pushed = result.push.pushed,
                    "background pull done"
                ),
                Err(err) => inner.note_failure(&err),
            }
        })
    }

    fn is_stale(&self, list_id: &str) -> bool {
        self.is_stale_at(list_id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    fn coordinator(settings: CoordinatorSettings) -> (Arc<MemoryBackend>, Arc<CacheStore>, SyncCoordinator) {
        let remote = Arc::new(MemoryBackend::new("work"));
        let cache = Arc::new(CacheStore::open_in_memory().expect("store"));
        let coordinator = SyncCoordinator::new(cache.clone(), remote.clone(), settings);
        (remote, cache, coordinator)
    }

    #[test]
    fn settings_follow_sync_config() {
        let mut sync = SyncConfig::default();
        sync.sync_interval = 0;
        sync.conflict_resolution = ConflictPolicy::Merge;
        let settings = CoordinatorSettings::from_config(&sync);
        assert!(settings.sync_interval.is_zero());
        assert_eq!(settings.policy, ConflictPolicy::Merge);
        assert_eq!(settings.call_timeout, BACKGROUND_CALL_TIMEOUT);
    }

    #[tokio::test]
    async fn offline_mode_refuses_triggers() {
        let settings = CoordinatorSettings {
            offline_mode: OfflineMode::Offline,
            ..CoordinatorSettings::default()
        };
        let (remote, _cache, coordinator) = coordinator(settings);
        assert!(!coordinator.trigger_push_sync());
        assert!(!coordinator.trigger_pull_sync("list-1"));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn nothing_is_spawned_after_shutdown() {
        let (_remote, _cache, coordinator) = coordinator(CoordinatorSettings::default());
        let report = coordinator.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report, ShutdownReport::default());
        assert!(!coordinator.spawn(async {}));
        assert_eq!(coordinator.in_flight(), 0);
        assert!(!coordinator.push_in_flight());
    }

    #[tokio::test]
    async fn auth_failure_on_the_reachability_check_stops_triggers() {
        let (remote, _cache, coordinator) = coordinator(CoordinatorSettings::default());
        remote.fail_next(crate::backend::BackendError::from_status("list task lists", 401, "bad token"));
        assert!(coordinator.trigger_pull_sync("list-1"));
        coordinator.shutdown(Duration::from_secs(5)).await;
        assert!(coordinator.inner.auth_failed.load(Ordering::SeqCst));
        assert!(!coordinator.inner.accepting());
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn zero_interval_is_never_stale() {
        let settings = CoordinatorSettings {
            sync_interval: Duration::ZERO,
            ..CoordinatorSettings::default()
        };
        let (_remote, _cache, coordinator) = coordinator(settings);
        assert!(!coordinator.is_stale("anything"));
    }

    #[tokio::test]
    async fn missing_metadata_is_stale() {
        let (_remote, _cache, coordinator) = coordinator(CoordinatorSettings::default());
        assert!(coordinator.is_stale("never-synced"));
    }
}
