use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_TAIL_BYTES: usize = 4_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct CommandSpec {
    pub agent: String,
    pub role: String,
    pub model: String,
    pub reasoning: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub retry: u32,
    pub retry_backoff_ms: u64,
    pub ready_cmd: Option<String>,
    pub ready_args: Vec<String>,
    pub ready_timeout_ms: u64,
    pub log_prompt: bool,
}

impl CommandSpec {
    pub fn new(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
            ..Self::default()
        }
    }

    pub fn label(&self) -> &str {
        if self.role.is_empty() {
            &self.agent
        } else {
            &self.role
        }
    }

    pub fn attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    AwaitingApproval,
    Running,
    Done,
    Error,
    Canceled,
    Rejected,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled | Self::Rejected)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::AwaitingApproval | Self::Running)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::AwaitingApproval => {
                matches!(next, Self::Queued | Self::Canceled | Self::Rejected)
            }
            Self::Queued => matches!(next, Self::Running | Self::Canceled | Self::Rejected),
            Self::Running => matches!(next, Self::Done | Self::Error | Self::Canceled),
            Self::Done | Self::Error | Self::Canceled | Self::Rejected => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunDescriptor {
    pub id: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub reasoning: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub prompt: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub ended_at: DateTime<Utc>,
    /// Set when the supervisor stopped the run itself (deadline or silence).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LaunchedRun {
    pub run_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: ProcessStatus,
    pub agent: String,
    pub role: String,
    pub model: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl RunSnapshot {
    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    /// Maps an exited process onto the scheduler's terminal statuses.
    ///
    /// An unknown exit code (the launcher did not survive to observe the
    /// child) is reported as `done`.
    pub fn terminal_status(&self) -> (RunStatus, Option<String>) {
        if self.is_running() {
            return (RunStatus::Running, None);
        }
        let clean_exit = self.exit_code == Some(0);
        if self.cancel_requested && !clean_exit {
            return (RunStatus::Canceled, None);
        }
        if let Some(error) = &self.error {
            return (RunStatus::Error, Some(error.clone()));
        }
        match (self.exit_code, self.signal) {
            (Some(0), _) | (None, None) => (RunStatus::Done, None),
            (Some(code), _) => (RunStatus::Error, Some(format!("exit status {}", code))),
            (None, Some(signal)) => (
                RunStatus::Error,
                Some(format!("terminated by signal {}", signal)),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    Canceled,
    NotRunning,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CancelResponse {
    pub run_id: String,
    pub status: CancelStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubmitResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub mode_hash: String,
    pub approval_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunView {
    pub run_id: String,
    pub status: RunStatus,
    pub agent: String,
    pub role: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode_hash: String,
    pub approval_required: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthReport {
    pub ok: bool,
    pub pid: u32,
    pub activation: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: i64,
    pub queued: usize,
    pub awaiting: usize,
    pub running: usize,
    pub completed: usize,
    pub max_parallel: usize,
    pub mode_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Ok,
    Error,
    Timeout,
    Canceled,
    NotReady,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::NotReady => "not_ready",
        }
    }

    pub fn as_run_status(self) -> RunStatus {
        match self {
            Self::Ok => RunStatus::Done,
            Self::Canceled => RunStatus::Canceled,
            Self::Error | Self::Timeout | Self::NotReady => RunStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub status: HistoryStatus,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt_hash: String,
    #[serde(default)]
    pub prompt_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: usize,
    pub status: Option<HistoryStatus>,
    pub role: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncRunResult {
    pub run_id: String,
    pub status: HistoryStatus,
    pub agent: String,
    pub role: String,
    pub model: String,
    pub attempt: u32,
    pub attempts: u32,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{ProcessStatus, RunSnapshot, RunStatus};
    use chrono::Utc;

    fn exited(exit_code: Option<i32>, cancel_requested: bool) -> RunSnapshot {
        RunSnapshot {
            run_id: "run-1".to_string(),
            status: ProcessStatus::Done,
            agent: "codex".to_string(),
            role: String::new(),
            model: String::new(),
            pid: 42,
            exit_code,
            signal: None,
            cancel_requested,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            error: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn transition_graph_never_moves_backward() {
        let all = [
            RunStatus::Queued,
            RunStatus::AwaitingApproval,
            RunStatus::Running,
            RunStatus::Done,
            RunStatus::Error,
            RunStatus::Canceled,
            RunStatus::Rejected,
        ];
        for status in all {
            assert!(!status.can_transition_to(RunStatus::AwaitingApproval));
            if status.is_terminal() {
                assert!(all.iter().all(|next| !status.can_transition_to(*next)));
            }
        }
        assert!(RunStatus::AwaitingApproval.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::AwaitingApproval.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn exit_codes_map_to_terminal_statuses() {
        assert_eq!(exited(Some(0), false).terminal_status().0, RunStatus::Done);
        assert_eq!(exited(None, false).terminal_status().0, RunStatus::Done);

        let (status, error) = exited(Some(3), false).terminal_status();
        assert_eq!(status, RunStatus::Error);
        assert_eq!(error.as_deref(), Some("exit status 3"));

        assert_eq!(exited(Some(143), true).terminal_status().0, RunStatus::Canceled);
        assert_eq!(exited(Some(0), true).terminal_status().0, RunStatus::Done);

        let mut expired = exited(None, false);
        expired.signal = Some(15);
        expired.error = Some("TIMEOUT: codex CLI timed out".to_string());
        let (status, error) = expired.terminal_status();
        assert_eq!(status, RunStatus::Error);
        assert_eq!(error.as_deref(), Some("TIMEOUT: codex CLI timed out"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let raw = serde_json::to_string(&RunStatus::AwaitingApproval).expect("serialize");
        assert_eq!(raw, "\"awaiting_approval\"");
    }
}
