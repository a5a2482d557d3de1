//! Builds backends from configuration and keeps them for the life of the
//! process. When sync is enabled every remote also gets a cache companion
//! backed by one shared store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{Backend, BackendError};
use crate::backends::{FileBackend, GitBackend, MemoryBackend, TodoistBackend};
use crate::cache::{CacheBackend, CacheError, CacheStore};
use crate::config::{AppConfig, BackendConfig, ConfigError};
use crate::credentials::{CredentialError, CredentialRequest, CredentialResolver};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Backend '{0}' not found")]
    NotFound(String),
    #[error("Backend '{name}' credentials: {source}")]
    Credentials {
        name: String,
        #[source]
        source: CredentialError,
    },
    #[error("Backend '{name}' could not be created: {source}")]
    Backend {
        name: String,
        #[source]
        source: BackendError,
    },
    #[error("Cache store: {0}")]
    Cache(#[from] CacheError),
}

/// Everything a constructor gets for one config entry.
pub struct BackendSpec<'a> {
    pub name: &'a str,
    pub config: &'a BackendConfig,
    pub credentials: &'a CredentialResolver,
    /// Directory relative lookups start from.
    pub work_dir: &'a Path,
}

pub type BackendConstructor =
    Arc<dyn Fn(&BackendSpec<'_>) -> Result<Arc<dyn Backend>, RegistryError> + Send + Sync>;

/// Type-indexed table of backend constructors.
#[derive(Clone)]
pub struct BackendFactory {
    constructors: BTreeMap<String, BackendConstructor>,
}

impl Default for BackendFactory {
    fn default() -> Self {
        let mut factory = Self::empty();
        factory.register("memory", |spec: &BackendSpec<'_>| {
            Ok(Arc::new(MemoryBackend::new(spec.name)) as Arc<dyn Backend>)
        });
        factory.register("file", build_file);
        factory.register("git", build_git);
        factory.register("todoist", build_todoist);
        factory
    }
}

impl BackendFactory {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Adds or replaces the constructor for `backend_type`.
    pub fn register<F>(&mut self, backend_type: impl Into<String>, constructor: F)
    where
        F: Fn(&BackendSpec<'_>) -> Result<Arc<dyn Backend>, RegistryError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(backend_type.into(), Arc::new(constructor));
    }

    pub fn supports(&self, backend_type: &str) -> bool {
        self.constructors.contains_key(backend_type)
    }

    pub fn types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, spec: &BackendSpec<'_>) -> Result<Arc<dyn Backend>, RegistryError> {
        let constructor = self
            .constructors
            .get(&spec.config.backend_type)
            .ok_or_else(|| unknown_type(spec.name, &spec.config.backend_type, self))?;
        constructor(spec)
    }
}

fn unknown_type(name: &str, backend_type: &str, factory: &BackendFactory) -> RegistryError {
    ConfigError::InvalidBackend {
        name: name.to_string(),
        reason: format!(
            "unknown type '{backend_type}' (supported: {})",
            factory.types().join(", ")
        ),
    }
    .into()
}

fn invalid(name: &str, reason: impl Into<String>) -> RegistryError {
    ConfigError::InvalidBackend {
        name: name.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Type-specific checks, run for every enabled entry before anything is built.
fn validate_entry(name: &str, config: &BackendConfig, factory: &BackendFactory) -> Result<(), RegistryError> {
    if !factory.supports(&config.backend_type) {
        return Err(unknown_type(name, &config.backend_type, factory));
    }
    match config.backend_type.as_str() {
        "file" => {
            let path = config.path.as_deref().or(config.file.as_deref()).unwrap_or("");
            if path.trim().is_empty() {
                return Err(invalid(name, "file backends need a 'path'"));
            }
        }
        "todoist" => {
            if let Some(url) = config.url.as_deref() {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(name, format!("url '{url}' must be http(s)")));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_path(raw: &str, work_dir: &Path) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        work_dir.join(path)
    }
}

fn build_file(spec: &BackendSpec<'_>) -> Result<Arc<dyn Backend>, RegistryError> {
    let raw = spec
        .config
        .path
        .as_deref()
        .or(spec.config.file.as_deref())
        .ok_or_else(|| invalid(spec.name, "file backends need a 'path'"))?;
    let backend = FileBackend::new(spec.name, resolve_path(raw, spec.work_dir)).shared(spec.config.shared);
    Ok(Arc::new(backend))
}

fn build_git(spec: &BackendSpec<'_>) -> Result<Arc<dyn Backend>, RegistryError> {
    let start = spec
        .config
        .path
        .as_deref()
        .map(|raw| resolve_path(raw, spec.work_dir))
        .unwrap_or_else(|| spec.work_dir.to_path_buf());
    let mut files = Vec::new();
    if let Some(file) = &spec.config.file {
        files.push(file.clone());
    }
    files.extend(spec.config.fallback_files.iter().cloned());
    let mut backend = GitBackend::new(spec.name, start).with_auto_commit(spec.config.auto_commit);
    if !files.is_empty() {
        backend = backend.with_files(files);
    }
    Ok(Arc::new(backend))
}

fn build_todoist(spec: &BackendSpec<'_>) -> Result<Arc<dyn Backend>, RegistryError> {
    let request = CredentialRequest {
        backend_name: spec.name,
        username: spec.config.username.as_deref(),
        secret_only: true,
        ..CredentialRequest::default()
    };
    let token = match spec.credentials.resolve(&request) {
        Ok(credentials) => {
            debug!(backend = spec.name, source = %credentials.source, "resolved API token");
            credentials.secret
        }
        // Built anyway so detection can report the missing token.
        Err(CredentialError::NotFound(_)) => String::new(),
        Err(source) => {
            return Err(RegistryError::Credentials {
                name: spec.name.to_string(),
                source,
            })
        }
    };
    let backend = TodoistBackend::new(spec.name, token, spec.config.url.as_deref()).map_err(|source| {
        RegistryError::Backend {
            name: spec.name.to_string(),
            source,
        }
    })?;
    Ok(Arc::new(backend))
}

/// One row of `tasksync backends`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    pub backend_type: String,
    pub enabled: bool,
    /// Instantiated and usable.
    pub ready: bool,
    /// `None` when detection was not run.
    pub detected: Option<bool>,
    pub detail: Option<String>,
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.enabled, self.ready) {
            (false, _) => "disabled",
            (true, true) => "ready",
            (true, false) => "unavailable",
        };
        let detection = match (self.detected, &self.detail) {
            (None, _) => "not checked".to_string(),
            (Some(true), Some(detail)) => format!("yes ({detail})"),
            (Some(true), None) => "yes".to_string(),
            (Some(false), Some(detail)) => format!("no ({detail})"),
            (Some(false), None) => "no".to_string(),
        };
        write!(
            f,
            "Name: {} | Type: {} | Status: {} | Detection: {}",
            self.name, self.backend_type, status, detection
        )
    }
}

pub struct Registry {
    configs: BTreeMap<String, BackendConfig>,
    backends: BTreeMap<String, Arc<dyn Backend>>,
    caches: BTreeMap<String, Arc<CacheBackend>>,
    store: Option<Arc<CacheStore>>,
    priority: Vec<String>,
}

impl Registry {
    /// Validates every enabled entry, then builds them all.
    pub fn new(
        config: &AppConfig,
        factory: &BackendFactory,
        credentials: &CredentialResolver,
        work_dir: &Path,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        for (name, backend) in config.backends.iter().filter(|(_, backend)| backend.enabled) {
            validate_entry(name, backend, factory)?;
        }

        let mut backends = BTreeMap::new();
        for (name, backend_config) in config.backends.iter().filter(|(_, backend)| backend.enabled) {
            let spec = BackendSpec {
                name,
                config: backend_config,
                credentials,
                work_dir,
            };
            let backend = factory.build(&spec)?;
            debug!(backend = %name, backend_type = %backend_config.backend_type, "backend ready");
            backends.insert(name.clone(), backend);
        }

        Ok(Self {
            configs: config.backends.clone(),
            backends,
            caches: BTreeMap::new(),
            store: None,
            priority: config.backend_priority.clone(),
        })
    }

    /// Builds the registry and, when sync is enabled, opens the cache store
    /// at the configured location.
    pub fn from_config(config: &AppConfig, credentials: &CredentialResolver) -> Result<Self, RegistryError> {
        let work_dir = std::env::current_dir().map_err(ConfigError::Io)?;
        let mut registry = Self::new(config, &BackendFactory::default(), credentials, &work_dir)?;
        if config.sync.enabled {
            let path = config.cache_db_path()?;
            let store = CacheStore::open(&path)?;
            info!(path = %path.display(), "opened cache store");
            registry.attach_cache(Arc::new(store));
        }
        Ok(registry)
    }

    /// Creates a cache companion for every remote backend, all sharing `store`.
    pub fn attach_cache(&mut self, store: Arc<CacheStore>) {
        self.caches.clear();
        for (name, backend) in &self.backends {
            if backend.is_remote() {
                self.caches.insert(
                    name.clone(),
                    Arc::new(CacheBackend::new(backend.clone(), store.clone())),
                );
            }
        }
        self.store = Some(store);
    }

    pub fn store(&self) -> Option<&Arc<CacheStore>> {
        self.store.as_ref()
    }

    pub fn get_backend(&self, name: &str) -> Result<Arc<dyn Backend>, RegistryError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// The cache fronting remote `name`, if sync is enabled and it is remote.
    pub fn cache_for(&self, name: &str) -> Option<Arc<CacheBackend>> {
        self.caches.get(name).cloned()
    }

    pub fn caches(&self) -> impl Iterator<Item = &Arc<CacheBackend>> {
        self.caches.values()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Enabled backend names: priority entries first, then the rest
    /// alphabetically.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .priority
            .iter()
            .filter(|name| self.backends.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in self.backends.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Every configured backend, in the same order as [`Registry::names`]
    /// followed by disabled entries. Detection runs only when `detect` is set.
    pub async fn list_backends(&self, detect: bool) -> Vec<BackendInfo> {
        let mut infos = Vec::new();
        for name in self.names() {
            let Some(backend) = self.backends.get(&name) else {
                continue;
            };
            let (detected, detail) = if detect {
                match backend.can_detect().await {
                    Ok(detection) => (Some(detection.detected), detection.detail),
                    Err(err) => (Some(false), Some(err.to_string())),
                }
            } else {
                (None, None)
            };
            infos.push(BackendInfo {
                name: name.clone(),
                backend_type: backend.backend_type().to_string(),
                enabled: true,
                ready: true,
                detected,
                detail,
            });
        }
        for (name, config) in self.configs.iter().filter(|(_, config)| !config.enabled) {
            infos.push(BackendInfo {
                name: name.clone(),
                backend_type: config.backend_type.clone(),
                enabled: false,
                ready: false,
                detected: None,
                detail: None,
            });
        }
        infos
    }
}
