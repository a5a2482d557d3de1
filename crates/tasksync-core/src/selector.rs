
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::CacheBackend;
use crate::config::AppConfig;
use crate::registry::Registry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("Backend '{0}' is not configured")]
    Unknown(String),
    #[error("Backend '{0}' is disabled")]
    Disabled(String),
    #[error("No backend configured; set default_backend or backend_priority")]
    NoBackendConfigured,
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub explicit: Option<String>,
    pub auto_detect: bool,
    pub default_backend: Option<String>,
    pub priority: Vec<String>,
    pub sync_enabled: bool,
}

impl SelectOptions {
    pub fn from_config(config: &AppConfig, explicit: Option<&str>) -> Self {
        Self {
            explicit: explicit.map(str::to_string),
            auto_detect: config.auto_detect_backend,
            default_backend: config.default_backend.clone(),
            priority: config.backend_priority.clone(),
            sync_enabled: config.sync.enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Explicit,
    Detected,
    Default,
    Priority,
    OnlyEnabled,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionReason::Explicit => "explicit",
            SelectionReason::Detected => "auto-detected",
            SelectionReason::Default => "default_backend",
            SelectionReason::Priority => "backend_priority",
            SelectionReason::OnlyEnabled => "only enabled backend",
        })
    }
}

pub struct Selection {
    pub name: String,
    /// What commands talk to: the cache when one fronts the remote.
    pub backend: Arc<dyn Backend>,
    pub remote: Arc<dyn Backend>,
    pub cache: Option<Arc<CacheBackend>>,
    pub reason: SelectionReason,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("name", &self.name)
            .field("backend", &self.backend.display_name())
            .field("cached", &self.cache.is_some())
            .field("reason", &self.reason)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBackend {
    pub name: String,
    pub backend_type: String,
    pub detail: Option<String>,
}

pub struct Selector<'a> {
    registry: &'a Registry,
}

impl<'a> Selector<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    pub async fn select(&self, options: &SelectOptions) -> Result<Selection, SelectError> {
        let (name, reason) = self.choose_remote(options).await?;
        let remote = self
            .registry
            .get_backend(&name)
            .map_err(|_| SelectError::Unknown(name.clone()))?;
        let cache = if options.sync_enabled {
            self.registry.cache_for(&name)
        } else {
            None
        };
        if options.sync_enabled && cache.is_none() {
            debug!(backend = %name, "backend is local; serving it without a cache");
        }
        let backend: Arc<dyn Backend> = match &cache {
            Some(cache) => cache.clone(),
            None => remote.clone(),
        };
        debug!(backend = %name, %reason, cached = cache.is_some(), "selected backend");
        Ok(Selection {
            name,
            backend,
            remote,
            cache,
            reason,
        })
    }

    async fn choose_remote(&self, options: &SelectOptions) -> Result<(String, SelectionReason), SelectError> {
        if let Some(name) = &options.explicit {
            self.check_enabled(name)?;
            return Ok((name.clone(), SelectionReason::Explicit));
        }
        if options.auto_detect {
            if let Some(found) = self.detect_all_ordered(&options.priority, true).await.into_iter().next() {
                return Ok((found.name, SelectionReason::Detected));
            }
            debug!("auto-detection found nothing; falling back");
        }
        if let Some(name) = &options.default_backend {
            self.check_enabled(name)?;
            return Ok((name.clone(), SelectionReason::Default));
        }
        if let Some(name) = options
            .priority
            .iter()
            .find(|name| self.registry.is_enabled(name.as_str()))
        {
            return Ok((name.clone(), SelectionReason::Priority));
        }
        let enabled = self.registry.names();
        if enabled.len() == 1 {
            return Ok((enabled[0].clone(), SelectionReason::OnlyEnabled));
        }
        Err(SelectError::NoBackendConfigured)
    }

    fn check_enabled(&self, name: &str) -> Result<(), SelectError> {
        if self.registry.is_enabled(name) {
            Ok(())
        } else if self.registry.is_configured(name) {
            Err(SelectError::Disabled(name.to_string()))
        } else {
            Err(SelectError::Unknown(name.to_string()))
        }
    }

    /// Every enabled backend whose detection succeeds, ordered like
    /// [`Registry::names`]: `backend_priority` entries first.
    pub async fn detect_all(&self) -> Vec<DetectedBackend> {
        self.detect_all_ordered(&[], false).await
    }

    async fn detect_all_ordered(&self, priority: &[String], first_only: bool) -> Vec<DetectedBackend> {
        let mut order: Vec<String> = priority
            .iter()
            .filter(|name| self.registry.is_enabled(name.as_str()))
            .cloned()
            .collect();
        for name in self.registry.names() {
            if !order.contains(&name) {
                order.push(name);
            }
        }

        let mut found = Vec::new();
        for name in order {
            let Ok(backend) = self.registry.get_backend(&name) else {
                continue;
            };
            match backend.can_detect().await {
                Ok(detection) if detection.detected => {
                    found.push(DetectedBackend {
                        name,
                        backend_type: backend.backend_type().to_string(),
                        detail: detection.detail,
                    });
                    if first_only {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(backend = %name, error = %err, "detection failed"),
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::config::BackendConfig;
    use crate::credentials::CredentialResolver;
    use crate::registry::BackendFactory;

    fn registry(dir: &Path, names: &[&str]) -> Registry {
        let mut config = AppConfig::default();
        for name in names {
            config.backends.insert(name.to_string(), BackendConfig::new("memory"));
        }
        let mut file = BackendConfig::new("file");
        file.path = Some(dir.join("present.json").display().to_string());
        config.backends.insert("present".to_string(), file);
        std::fs::write(dir.join("present.json"), "{}").expect("seed file");
        let resolver = CredentialResolver::with_sources(Arc::new(crate::credentials::OsKeyring), |_| None);
        Registry::new(&config, &BackendFactory::default(), &resolver, dir).expect("registry")
    }

    #[tokio::test]
    async fn explicit_wins_and_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path(), &["a", "b"]);
        let selector = Selector::new(&registry);
        let options = SelectOptions {
            explicit: Some("b".to_string()),
            default_backend: Some("a".to_string()),
            ..SelectOptions::default()
        };
        let selection = selector.select(&options).await.expect("select");
        assert_eq!(selection.name, "b");
        assert_eq!(selection.reason, SelectionReason::Explicit);

        let options = SelectOptions {
            explicit: Some("missing".to_string()),
            ..SelectOptions::default()
        };
        assert_eq!(
            selector.select(&options).await.err(),
            Some(SelectError::Unknown("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn auto_detect_picks_detected_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path(), &["a"]);
        let selector = Selector::new(&registry);
        let options = SelectOptions {
            auto_detect: true,
            default_backend: Some("a".to_string()),
            ..SelectOptions::default()
        };
        let selection = selector.select(&options).await.expect("select");
        assert_eq!(selection.name, "present");
        assert_eq!(selection.reason, SelectionReason::Detected);

        let detected = selector.detect_all().await;
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].backend_type, "file");
    }

    #[tokio::test]
    async fn priority_then_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path(), &["a", "b"]);
        let selector = Selector::new(&registry);
        let options = SelectOptions {
            priority: vec!["b".to_string(), "a".to_string()],
            ..SelectOptions::default()
        };
        let selection = selector.select(&options).await.expect("select");
        assert_eq!(selection.name, "b");
        assert_eq!(selection.reason, SelectionReason::Priority);

        assert_eq!(
            selector.select(&SelectOptions::default()).await.err(),
            Some(SelectError::NoBackendConfigured)
        );
    }

    #[tokio::test]
    async fn detection_follows_configured_priority() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        for name in ["alpha", "zeta"] {
            let path = dir.path().join(format!("{name}.json"));
            std::fs::write(&path, "{}").expect("seed file");
            let mut file = BackendConfig::new("file");
            file.path = Some(path.display().to_string());
            config.backends.insert(name.to_string(), file);
        }
        config.backend_priority = vec!["zeta".to_string()];
        let resolver = CredentialResolver::with_sources(Arc::new(crate::credentials::OsKeyring), |_| None);
        let registry = Registry::new(&config, &BackendFactory::default(), &resolver, dir.path()).expect("registry");

        let detected: Vec<_> = Selector::new(&registry)
            .detect_all()
            .await
            .into_iter()
            .map(|found| found.name)
            .collect();
        assert_eq!(detected, vec!["zeta".to_string(), "alpha".to_string()]);

        let options = SelectOptions::from_config(&config, None);
        let options = SelectOptions {
            auto_detect: true,
            ..options
        };
        let selection = Selector::new(&registry).select(&options).await.expect("select");
        assert_eq!(selection.name, "zeta");
    }
}
