use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::ConflictPolicy;

pub const APP_NAME: &str = "tasksync";
pub const CONFIG_ENV: &str = "TASKSYNC_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to parse config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config file found (looked in: {0})")]
    NotFound(String),
    #[error("Invalid backend '{name}': {reason}")]
    InvalidBackend { name: String, reason: String },
    #[error("Backend '{0}' is not configured")]
    UnknownBackend(String),
    #[error("Backend '{0}' is disabled")]
    DisabledBackend(String),
    #[error("No backend configured; set default_backend or backend_priority")]
    NoBackendConfigured,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_priority: Vec<String>,
    #[serde(default)]
    pub auto_detect_backend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
    /// Overrides the cache database location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<String>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_files: Vec<String>,
    #[serde(default)]
    pub auto_commit: bool,
    /// For file backends: the file sits on shared storage and is treated as a remote.
    #[serde(default)]
    pub shared: bool,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            enabled: true,
            url: None,
            username: None,
            path: None,
            file: None,
            fallback_files: Vec::new(),
            auto_commit: false,
            shared: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalBackendKind {
    #[default]
    #[serde(alias = "sqlite")]
    DurableKv,
    FlatFile,
    RepoText,
}

impl LocalBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalBackendKind::DurableKv => "durable-kv",
            LocalBackendKind::FlatFile => "flat-file",
            LocalBackendKind::RepoText => "repo-text",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineMode {
    #[default]
    Auto,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    #[default]
    InProcess,
    Detached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub local_backend: LocalBackendKind,
    #[serde(default)]
    pub conflict_resolution: ConflictPolicy,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Minutes between pulls; 0 disables staleness-driven pulls.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default)]
    pub offline_mode: OfflineMode,
    #[serde(default)]
    pub background_mode: BackgroundMode,
    #[serde(default)]
    pub background_log: bool,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_backend: LocalBackendKind::default(),
            conflict_resolution: ConflictPolicy::default(),
            auto_sync: true,
            sync_interval: default_sync_interval(),
            offline_mode: OfflineMode::default(),
            background_mode: BackgroundMode::default(),
            background_log: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl AppConfig {
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    pub fn enabled_backend_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .filter(|(_, backend)| backend.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Expands `~` and `$HOME` in every path-bearing field.
    pub fn expand_paths(&mut self) {
        let home = resolve_user_home_dir();
        let expand = |value: &mut Option<String>| {
            if let Some(raw) = value.as_mut() {
                *raw = expand_path_with(raw, home.as_deref());
            }
        };
        expand(&mut self.cache_path);
        for backend in self.backends.values_mut() {
            expand(&mut backend.path);
            expand(&mut backend.file);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, backend) in &self.backends {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("backend names must not be empty".to_string()));
            }
            if backend.backend_type.trim().is_empty() {
                return Err(ConfigError::InvalidBackend {
                    name: name.clone(),
                    reason: "missing type".to_string(),
                });
            }
        }
        if let Some(default) = &self.default_backend {
            if !self.backends.contains_key(default) {
                return Err(ConfigError::UnknownBackend(default.clone()));
            }
        }
        for name in &self.backend_priority {
            if !self.backends.contains_key(name) {
                return Err(ConfigError::UnknownBackend(name.clone()));
            }
        }
        if self.sync.enabled && self.sync.local_backend != LocalBackendKind::DurableKv {
            return Err(ConfigError::Invalid(format!(
                "sync.local_backend '{}' cannot hold the sync cache; use 'durable-kv'",
                self.sync.local_backend.as_str()
            )));
        }
        Ok(())
    }

    /// Location of the cache database.
    pub fn cache_db_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.cache_path {
            return Ok(PathBuf::from(path));
        }
        resolve_data_dir()
            .map(|dir| dir.join("cache.db"))
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "unable to resolve a data directory; set cache_path or XDG_DATA_HOME".to_string(),
                )
            })
    }
}

pub fn config_filename_candidates() -> [&'static str; 3] {
    ["config.toml", "config.yaml", "config.yml"]
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    non_empty_env("HOME")
        .or_else(|| non_empty_env("USERPROFILE"))
        .map(PathBuf::from)
}

pub fn resolve_config_dir() -> Option<PathBuf> {
    if let Some(value) = non_empty_env("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(value).join(APP_NAME));
    }
    resolve_user_home_dir().map(|home| home.join(".config").join(APP_NAME))
}

/// Per-user data directory (`$XDG_DATA_HOME/tasksync` or the platform equivalent).
pub fn resolve_data_dir() -> Option<PathBuf> {
    if let Some(value) = non_empty_env("XDG_DATA_HOME") {
        return Some(PathBuf::from(value).join(APP_NAME));
    }
    if cfg!(windows) {
        if let Some(value) = non_empty_env("LOCALAPPDATA") {
            return Some(PathBuf::from(value).join(APP_NAME));
        }
    }
    let home = resolve_user_home_dir()?;
    if cfg!(target_os = "macos") {
        return Some(home.join("Library").join("Application Support").join(APP_NAME));
    }
    Some(home.join(".local").join("share").join(APP_NAME))
}

/// Finds the config file: explicit path, then `TASKSYNC_CONFIG`, then the
/// candidates in the config directory.
pub fn find_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = non_empty_env(CONFIG_ENV) {
        return Some(PathBuf::from(value));
    }
    let dir = resolve_config_dir()?;
    config_filename_candidates()
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

pub fn parse_config(path: &Path, text: &str) -> Result<AppConfig, ConfigError> {
    if is_yaml(path) {
        Ok(serde_yaml::from_str(text)?)
    } else {
        Ok(toml::from_str(text)?)
    }
}

/// Reads, expands and validates a config file.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    let mut config = parse_config(path, &text)?;
    config.expand_paths();
    config.validate()?;
    Ok(config)
}

pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match find_config_path(explicit) {
        Some(path) if path.is_file() => load_config_from(&path),
        Some(path) => Err(ConfigError::NotFound(path.display().to_string())),
        None => {
            let looked = resolve_config_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| CONFIG_ENV.to_string());
            Err(ConfigError::NotFound(looked))
        }
    }
}

pub fn write_config(path: &Path, config: &AppConfig) -> Result<PathBuf, ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = if is_yaml(path) {
        serde_yaml::to_string(config)?
    } else {
        toml::to_string_pretty(config)?
    };
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

pub fn expand_path(input: &str) -> String {
    expand_path_with(input, resolve_user_home_dir().as_deref())
}

/// Replaces a leading `~` and any `$HOME` with `home`. A backslash in front
/// of either keeps it literal.
pub fn expand_path_with(input: &str, home: Option<&Path>) -> String {
    let Some(home) = home.map(|home| home.to_string_lossy().into_owned()) else {
        return input.to_string();
    };
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    if let Some(after) = input.strip_prefix("\\~") {
        out.push('~');
        rest = after;
    } else if input == "~" || input.starts_with("~/") || input.starts_with("~\\") {
        out.push_str(&home);
        rest = &input[1..];
    }
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("\\$HOME") {
            out.push_str("$HOME");
            rest = after;
        } else if let Some(after) = rest.strip_prefix("$HOME") {
            out.push_str(&home);
            rest = after;
        } else {
            let mut chars = rest.chars();
            if let Some(ch) = chars.next() {
                out.push(ch);
            }
            rest = chars.as_str();
        }
    }
    out
}
