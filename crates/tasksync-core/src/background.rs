use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::{load_config, AppConfig, OfflineMode};
use crate::coordinator::PROBE_TIMEOUT;
use crate::credentials::CredentialResolver;
use crate::registry::Registry;
use crate::sync::{PushResult, SyncManager, BACKGROUND_CALL_TIMEOUT};

/// Time one remote gets before the worker moves on.
pub const PER_BACKEND_BUDGET: Duration = Duration::from_secs(30);

pub fn log_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("tasksync-background-sync-{pid}.log"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Pushed(PushResult),
    NothingPending,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub backends: Vec<(String, PassOutcome)>,
}

impl PassReport {
    pub fn pushed(&self) -> usize {
        self.backends
            .iter()
            .map(|(_, outcome)| match outcome {
                PassOutcome::Pushed(result) => result.pushed,
                _ => 0,
            })
            .sum()
    }
}

/// Pushes the journal of every cached remote once. Ops that do not make it
/// stay queued for the next pass.
pub async fn run_push_pass(config: &AppConfig, registry: &Registry, budget: Duration) -> PassReport {
    let mut report = PassReport::default();
    if !config.sync.enabled || !config.sync.auto_sync || config.sync.offline_mode == OfflineMode::Offline {
        debug!("background sync disabled; nothing to do");
        return report;
    }
    let Some(store) = registry.store() else {
        return report;
    };

    for cache in registry.caches() {
        let name = cache.name().to_string();
        let pending = match cache.pending_count() {
            Ok(pending) => pending,
            Err(err) => {
                warn!(backend = %name, error = %err, "could not read pending operations");
                report.backends.push((name, PassOutcome::Failed(err.to_string())));
                continue;
            }
        };
        if pending == 0 {
            report.backends.push((name, PassOutcome::NothingPending));
            continue;
        }
        if config.sync.offline_mode != OfflineMode::Online {
            match tokio::time::timeout(PROBE_TIMEOUT, cache.remote().list_task_lists()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(backend = %name, error = %err, "remote unreachable; operations stay queued");
                    report.backends.push((name, PassOutcome::Failed(err.to_string())));
                    continue;
                }
                Err(_) => {
                    warn!(backend = %name, "remote probe timed out; operations stay queued");
                    report.backends.push((name, PassOutcome::TimedOut));
                    continue;
                }
            }
        }
        info!(backend = %name, pending, "pushing pending operations");
        let manager = SyncManager::new(store.clone(), cache.remote().clone(), config.sync.conflict_resolution)
            .with_call_timeout(BACKGROUND_CALL_TIMEOUT);
        let outcome = match tokio::time::timeout(budget, manager.push_only()).await {
            Ok(Ok(result)) => {
                info!(backend = %name, pushed = result.pushed, remaining = result.remaining, "push finished");
                PassOutcome::Pushed(result)
            }
            Ok(Err(err)) => {
                warn!(backend = %name, error = %err, "push failed");
                PassOutcome::Failed(err.to_string())
            }
            Err(_) => {
                warn!(backend = %name, "push timed out; operations stay queued");
                PassOutcome::TimedOut
            }
        };
        report.backends.push((name, outcome));
    }
    report
}

/// Entry point of `_internal_background_sync`.
pub async fn run_background_sync(config_path: Option<&Path>) -> anyhow::Result<PassReport> {
    // Let the parent CLI finish its own cache writes first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let config = load_config(config_path).context("load config for background sync")?;
    let registry = Registry::from_config(&config, &CredentialResolver::new())
        .context("build backends for background sync")?;
    let report = run_push_pass(&config, &registry, PER_BACKEND_BUDGET).await;
    info!(pushed = report.pushed(), backends = report.backends.len(), "background sync finished");
    Ok(report)
}
