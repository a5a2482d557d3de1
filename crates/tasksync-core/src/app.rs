
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::CacheBackend;
use crate::config::{find_config_path, load_config_from, AppConfig, BackgroundMode, ConfigError, OfflineMode};
use crate::coordinator::{
    is_background_child, CoordinatorSettings, DetachedWorker, NoopTrigger, ShutdownReport, SyncCoordinator,
    SyncTrigger, PROBE_TIMEOUT,
};
use crate::credentials::CredentialResolver;
use crate::error::{AppError, ErrorKind};
use crate::model::TaskList;
use crate::registry::Registry;
use crate::selector::{SelectOptions, Selection, Selector};
use crate::sync::{SyncManager, INTERACTIVE_CALL_TIMEOUT};

#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub config_path: Option<PathBuf>,
    pub backend: Option<String>,
}

pub struct App {
    config: AppConfig,
    config_path: PathBuf,
    registry: Registry,
    selection: Selection,
    coordinator: Option<SyncCoordinator>,
}

impl App {
    pub async fn open(options: &AppOptions) -> Result<Self, AppError> {
        let config_path = find_config_path(options.config_path.as_deref()).ok_or_else(|| {
            AppError::from(ConfigError::NotFound(
                options
                    .config_path
                    .as_deref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "TASKSYNC_CONFIG, $XDG_CONFIG_HOME/tasksync, ~/.config/tasksync".to_string()),
            ))
            .with_suggestion("Create ~/.config/tasksync/config.toml with at least one [backends.<name>] entry.")
        })?;
        let config = load_config_from(&config_path)?;
        Self::from_config(config, config_path, options.backend.as_deref(), &CredentialResolver::new()).await
    }

    pub async fn from_config(
        config: AppConfig,
        config_path: PathBuf,
        backend: Option<&str>,
        credentials: &CredentialResolver,
    ) -> Result<Self, AppError> {
        let registry = Registry::from_config(&config, credentials)?;
        Self::with_registry(config, config_path, registry, backend).await
    }

    pub async fn with_registry(
        config: AppConfig,
        config_path: PathBuf,
        registry: Registry,
        backend: Option<&str>,
    ) -> Result<Self, AppError> {
        let options = SelectOptions::from_config(&config, backend);
        let selection = Selector::new(&registry).select(&options).await?;

        let coordinator = match (&selection.cache, registry.store()) {
            (Some(_), Some(store)) => {
                let settings = CoordinatorSettings::from_config(&config.sync);
                let mut coordinator = SyncCoordinator::new(store.clone(), selection.remote.clone(), settings);
                if config.sync.background_mode == BackgroundMode::Detached && !is_background_child() {
                    match DetachedWorker::current_exe(Some(config_path.clone()), config.sync.background_log) {
                        Ok(worker) => coordinator = coordinator.with_detached_worker(worker),
                        Err(err) => warn!(error = %err, "cannot locate executable; syncing in-process"),
                    }
                }
                Some(coordinator)
            }
            _ => None,
        };

        let app = Self {
            config,
            config_path,
            registry,
            selection,
            coordinator,
        };
        app.check_online().await?;
        Ok(app)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn backend_name(&self) -> &str {
        &self.selection.name
    }

    /// What commands read from and write to.
    pub fn backend(&self) -> Arc<dyn Backend> {
        self.selection.backend.clone()
    }

    pub fn remote(&self) -> Arc<dyn Backend> {
        self.selection.remote.clone()
    }

    pub fn cache(&self) -> Option<&Arc<CacheBackend>> {
        self.selection.cache.as_ref()
    }

    pub fn coordinator(&self) -> Option<&SyncCoordinator> {
        self.coordinator.as_ref()
    }

    pub fn trigger(&self) -> &dyn SyncTrigger {
        match &self.coordinator {
            Some(coordinator) => coordinator as &dyn SyncTrigger,
            None => &NoopTrigger,
        }
    }

    /// A foreground sync manager, or `None` when the backend is not cached.
    pub fn sync_manager(&self) -> Option<SyncManager> {
        self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.manager().with_call_timeout(INTERACTIVE_CALL_TIMEOUT))
    }

    /// With `offline_mode = online` an unreachable remote is an error up front.
    async fn check_online(&self) -> Result<(), AppError> {
        if self.selection.cache.is_none() || self.config.sync.offline_mode != OfflineMode::Online {
            return Ok(());
        }
        match tokio::time::timeout(PROBE_TIMEOUT, self.selection.remote.list_task_lists()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if err.is_transient() => Err(AppError::offline(&self.selection.name, err)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(AppError::offline(&self.selection.name, "probe timed out")),
        }
    }

    fn may_contact_remote(&self) -> bool {
        self.config.sync.offline_mode != OfflineMode::Offline
    }

    /// Before listing lists: an empty cache is filled in the foreground.
    pub async fn prepare_lists(&self) -> Result<(), AppError> {
        let Some(cache) = self.cache() else {
            return Ok(());
        };
        if cache.is_populated()? || !self.may_contact_remote() {
            return Ok(());
        }
        if let Some(manager) = self.sync_manager() {
            debug!(backend = %self.selection.name, "cache empty; pulling lists");
            manager.pull_only(None).await?;
        }
        Ok(())
    }

    /// Before reading a list: pull in the foreground on a cache miss,
    /// otherwise schedule a background pull when the list is stale.
    pub async fn prepare_read(&self, list_id: &str) -> Result<(), AppError> {
        let Some(cache) = self.cache() else {
            return Ok(());
        };
        if !self.may_contact_remote() {
            return Ok(());
        }
        let synced = cache
            .list_metadata(list_id)?
            .and_then(|metadata| metadata.last_full_sync)
            .is_some();
        if !synced && !crate::cache::is_temp_id(list_id) {
            if let Some(manager) = self.sync_manager() {
                debug!(list = list_id, "list never synced; pulling in the foreground");
                manager.pull_only(Some(list_id)).await?;
            }
            return Ok(());
        }
        if self.config.sync.auto_sync && self.trigger().is_stale(list_id) {
            self.trigger().trigger_pull_sync(list_id);
        }
        Ok(())
    }

    /// After a write: push in the background when auto-sync is on.
    pub fn after_write(&self) -> bool {
        if !self.config.sync.auto_sync {
            return false;
        }
        self.trigger().trigger_push_sync()
    }

    /// Whether the last write is still waiting for the remote.
    pub fn write_is_queued(&self) -> bool {
        self.cache()
            .and_then(|cache| cache.pending_count().ok())
            .map(|count| count > 0)
            .unwrap_or(false)
    }

    /// Finds a list by id or, case-insensitively, by name.
    pub async fn resolve_list(&self, key: &str) -> Result<TaskList, AppError> {
        let lists = self.backend().list_task_lists().await?;
        if let Some(list) = lists.iter().find(|list| list.id == key) {
            return Ok(list.clone());
        }
        let matches: Vec<&TaskList> = lists
            .iter()
            .filter(|list| list.name.eq_ignore_ascii_case(key))
            .collect();
        match matches.as_slice() {
            [list] => Ok((*list).clone()),
            [] => Err(AppError::new(ErrorKind::NotFound, format!("list '{key}' not found"))),
            _ => Err(AppError::new(
                ErrorKind::Validation,
                format!("list name '{key}' is ambiguous; use the list id"),
            )),
        }
    }

    /// Waits for background syncs up to `sync.shutdown_timeout_secs`.
    pub async fn shutdown(&self) -> ShutdownReport {
        match &self.coordinator {
            Some(coordinator) => {
                coordinator
                    .shutdown(Duration::from_secs(self.config.sync.shutdown_timeout_secs))
                    .await
            }
            None => ShutdownReport::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::cache::CacheStore;
    use crate::config::BackendConfig;
    use crate::model::Task;
    use crate::registry::{BackendFactory, BackendSpec};

    async fn app_with(remote: Arc<MemoryBackend>, sync: bool, offline_mode: OfflineMode) -> App {
        let mut config = AppConfig::default();
        config.sync.enabled = sync;
        config.sync.offline_mode = offline_mode;
        config.backends.insert("work".to_string(), BackendConfig::new("shared-memory"));
        let mut factory = BackendFactory::default();
        factory.register("shared-memory", move |_spec: &BackendSpec<'_>| {
            Ok(remote.clone() as Arc<dyn Backend>)
        });
        let resolver = CredentialResolver::with_sources(Arc::new(crate::credentials::OsKeyring), |_| None);
        let mut registry = Registry::new(&config, &factory, &resolver, Path::new(".")).expect("registry");
        if sync {
            registry.attach_cache(Arc::new(CacheStore::open_in_memory().expect("store")));
        }
        App::with_registry(config, PathBuf::from("config.toml"), registry, None)
            .await
            .expect("app")
    }

    #[tokio::test]
    async fn direct_backend_without_sync() {
        let remote = Arc::new(MemoryBackend::new("work"));
        let app = app_with(remote, false, OfflineMode::Auto).await;
        assert!(app.cache().is_none());
        assert_eq!(app.backend().backend_type(), "memory");
        assert!(!app.after_write());
    }

    #[tokio::test]
    async fn first_read_pulls_in_foreground() {
        let remote = Arc::new(MemoryBackend::new("work"));
        let list_id = remote.seed_list("Work");
        remote.add_task(&list_id, &Task::new("Existing")).await.expect("seed task");
        let app = app_with(remote, true, OfflineMode::Auto).await;
        assert_eq!(app.backend().backend_type(), "cache");

        app.prepare_lists().await.expect("lists");
        let list = app.resolve_list("work").await.expect("resolve by name");
        app.prepare_read(&list.id).await.expect("read");
        let tasks = app.backend().get_tasks(&list.id, None).await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].summary, "Existing");
        assert!(app.cache().expect("cache").list_metadata(&list.id).expect("meta").is_some());
    }

    #[tokio::test]
    async fn online_mode_fails_fast_when_unreachable() {
        let remote = Arc::new(MemoryBackend::new("work"));
        remote.set_offline(true);
        let mut config = AppConfig::default();
        config.sync.enabled = true;
        config.sync.offline_mode = OfflineMode::Online;
        config.backends.insert("work".to_string(), BackendConfig::new("shared-memory"));
        let mut factory = BackendFactory::default();
        let shared = remote.clone();
        factory.register("shared-memory", move |_spec: &BackendSpec<'_>| {
            Ok(shared.clone() as Arc<dyn Backend>)
        });
        let resolver = CredentialResolver::with_sources(Arc::new(crate::credentials::OsKeyring), |_| None);
        let mut registry = Registry::new(&config, &factory, &resolver, Path::new(".")).expect("registry");
        registry.attach_cache(Arc::new(CacheStore::open_in_memory().expect("store")));
        let err = App::with_registry(config, PathBuf::from("config.toml"), registry, None)
            .await
            .err()
            .expect("offline");
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn offline_mode_reads_cache_only() {
        let remote = Arc::new(MemoryBackend::new("work"));
        remote.seed_list("Work");
        let app = app_with(remote.clone(), true, OfflineMode::Offline).await;
        app.prepare_lists().await.expect("lists");
        assert!(app.backend().list_task_lists().await.expect("lists").is_empty());
        assert!(remote.calls().is_empty());
    }
}
