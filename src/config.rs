use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";
pub const DEFAULT_DAEMON_PORT: u16 = 51842;

const HOME_ENV: &str = "CONDUCTOR_HOME";
const MAX_PARALLEL_ENV: &str = "CONDUCTOR_MAX_PARALLEL";
const ON_MODE_CHANGE_ENV: &str = "CONDUCTOR_ON_MODE_CHANGE";
const DAEMON_HOST_ENV: &str = "CONDUCTOR_DAEMON_HOST";
const DAEMON_PORT_ENV: &str = "CONDUCTOR_DAEMON_PORT";

/// Filesystem layout of the runtime root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl RuntimePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Explicit root, then `CONDUCTOR_HOME`, then `~/.conductor-kit`.
    pub fn resolve(explicit: Option<&Path>) -> AppResult<Self> {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        if let Ok(value) = std::env::var(HOME_ENV) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Ok(Self::new(trimmed));
            }
        }
        let home = dirs::home_dir()
            .ok_or_else(|| AppError::Internal("Unable to resolve home directory".to_string()))?;
        Ok(Self::new(home.join(".conductor-kit")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.tasks_dir().join(run_id)
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("runs").join("run-history.jsonl")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeChangePolicy {
    #[default]
    None,
    CancelPending,
    CancelRunning,
}

impl ModeChangePolicy {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "cancel_pending" => Ok(Self::CancelPending),
            "cancel_running" => Ok(Self::CancelRunning),
            other => Err(AppError::InvalidInput(format!(
                "Unknown mode change policy '{}'",
                other
            ))),
        }
    }

    pub fn cancels_pending(self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn cancels_running(self) -> bool {
        matches!(self, Self::CancelRunning)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    pub required: bool,
    pub roles: Vec<String>,
    pub agents: Vec<String>,
}

impl ApprovalPolicy {
    pub fn matches(&self, role: &str, agent: &str) -> bool {
        if self.required {
            return true;
        }
        let role = role.trim();
        let agent = agent.trim();
        (!role.is_empty() && self.roles.iter().any(|candidate| candidate.trim() == role))
            || (!agent.is_empty() && self.agents.iter().any(|candidate| candidate.trim() == agent))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    pub on_mode_change: ModeChangePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub approval: ApprovalPolicy,
    pub queue: QueuePolicy,
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            approval: ApprovalPolicy::default(),
            queue: QueuePolicy::default(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn normalized(mut self) -> Self {
        if self.max_parallel == 0 {
            self.max_parallel = DEFAULT_MAX_PARALLEL;
        }
        if self.tick_interval_ms == 0 {
            self.tick_interval_ms = DEFAULT_TICK_INTERVAL_MS;
        }
        self
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(MAX_PARALLEL_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => self.max_parallel = value,
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", MAX_PARALLEL_ENV),
            }
        }
        if let Some(raw) = lookup(ON_MODE_CHANGE_ENV) {
            match ModeChangePolicy::parse(&raw) {
                Ok(policy) => self.queue.on_mode_change = policy,
                Err(error) => tracing::warn!(error = %error, "ignoring {}", ON_MODE_CHANGE_ENV),
            }
        }
        self.normalized()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationMode {
    Network { host: String, port: u16 },
    Embedded,
}

impl Default for ActivationMode {
    fn default() -> Self {
        Self::Network {
            host: DEFAULT_DAEMON_HOST.to_string(),
            port: DEFAULT_DAEMON_PORT,
        }
    }
}

impl ActivationMode {
    pub fn network_from_env() -> Self {
        let host = std::env::var(DAEMON_HOST_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_DAEMON_HOST.to_string());
        let port = std::env::var(DAEMON_PORT_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .filter(|port| *port > 0)
            .unwrap_or(DEFAULT_DAEMON_PORT);
        Self::Network { host, port }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Embedded => "embedded",
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Network { host, .. } => Some(host.as_str()),
            Self::Embedded => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Network { port, .. } => Some(*port),
            Self::Embedded => None,
        }
    }
}
