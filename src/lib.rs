pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod history;
pub mod memory;
pub mod models;
pub mod process;
pub mod redaction;
pub mod runner;
pub mod scheduler;

use crate::config::{ActivationMode, RuntimePaths, SchedulerConfig};
use crate::errors::{AppError, AppResult};
use crate::history::HistoryLog;
use crate::memory::{MemoryStore, SnapshotCache, VcsContext};
use crate::process::{Launcher, Registry};
use crate::redaction::Redactor;
use crate::runner::SyncRunner;
use crate::scheduler::{ProcessBackend, Scheduler};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Runtime root; `CONDUCTOR_HOME` or `~/.conductor-kit` when unset.
    pub root: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub activation: ActivationMode,
    pub redact_prompts: bool,
    /// Directory the memory snapshot is bound to. `None` disables persistence.
    pub project_dir: Option<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            root: None,
            scheduler: SchedulerConfig::default().with_env_overrides(),
            activation: ActivationMode::network_from_env(),
            redact_prompts: true,
            project_dir: std::env::current_dir().ok(),
        }
    }
}

/// Owns every long-lived component; callers share it behind an `Arc`.
pub struct RuntimeCore {
    paths: RuntimePaths,
    launcher: Launcher,
    registry: Registry,
    history: Arc<HistoryLog>,
    memory: Arc<MemoryStore>,
    runner: SyncRunner,
    scheduler: Scheduler,
}

impl RuntimeCore {
    pub fn new(options: RuntimeOptions) -> AppResult<Arc<Self>> {
        let paths = RuntimePaths::resolve(options.root.as_deref())?;
        for dir in [paths.tasks_dir(), paths.memory_dir(), paths.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|error| AppError::Io(format!("{}: {}", dir.display(), error)))?;
        }

        let redactor = if options.redact_prompts {
            Redactor::default()
        } else {
            Redactor::disabled()
        };
        let history = Arc::new(HistoryLog::new(paths.history_file()));
        let launcher = Launcher::new(paths.clone(), redactor.clone()).with_history(history.clone());
        let registry = Registry::new(paths.clone());
        let memory = Arc::new(match options.project_dir.as_deref() {
            Some(dir) => {
                let cache = SnapshotCache::new(&paths.memory_dir(), VcsContext::detect(dir));
                MemoryStore::with_cache(Arc::new(cache))
            }
            None => MemoryStore::in_memory(),
        });
        let redact_prompts = redactor.is_enabled();
        let runner = SyncRunner::new(history.clone(), redactor);
        let backend = Arc::new(ProcessBackend::new(launcher.clone(), registry.clone()));
        let scheduler = Scheduler::new(
            options.scheduler,
            options.activation,
            backend,
            Some(history.clone()),
        );

        tracing::info!(root = %paths.root().display(), redact_prompts, "runtime initialized");
        Ok(Arc::new(Self {
            paths,
            launcher,
            registry,
            history,
            memory,
            runner,
            scheduler,
        }))
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.history
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn runner(&self) -> &SyncRunner {
        &self.runner
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stops scheduling and writes any throttled memory snapshot. Detached
    /// runs are left alone.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.memory.flush();
    }
}

pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "runtime.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{RuntimeCore, RuntimeOptions};
    use crate::config::{ActivationMode, SchedulerConfig};

    fn options(dir: &tempfile::TempDir) -> RuntimeOptions {
        RuntimeOptions {
            root: Some(dir.path().join("home")),
            scheduler: SchedulerConfig::default(),
            activation: ActivationMode::Embedded,
            redact_prompts: true,
            project_dir: Some(dir.path().join("project")),
        }
    }

    #[tokio::test]
    async fn core_creates_layout_and_reports_health() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("project")).expect("project dir");
        let core = RuntimeCore::new(options(&dir)).expect("core");

        assert!(core.paths().tasks_dir().is_dir());
        assert!(core.paths().memory_dir().is_dir());
        let health = core.scheduler().health().await;
        assert!(health.ok);
        assert_eq!(health.activation, "embedded");
        assert_eq!(health.host, None);
        assert_eq!(health.max_parallel, 4);
    }

    #[tokio::test]
    async fn memory_survives_core_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("project")).expect("project dir");

        let core = RuntimeCore::new(options(&dir)).expect("core");
        core.memory().set("plan", "ship it").expect("set");
        core.memory().set("notes", "later").expect("set");
        core.shutdown().await;

        let restarted = RuntimeCore::new(options(&dir)).expect("restarted core");
        assert_eq!(restarted.memory().get("notes").expect("notes").value, "later");
    }
}
