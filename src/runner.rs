use crate::errors::AppResult;
use crate::history::HistoryLog;
use crate::models::{CommandSpec, HistoryRecord, HistoryStatus, SyncRunResult};
use crate::process::idle::{self, IdleRunOptions, IdleRunOutcome, Termination};
use crate::process::launcher::{new_run_id, resolve_executable};
use crate::redaction::Redactor;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Request/response runs: ready check, retries, and exactly one history
/// record per call.
#[derive(Clone)]
pub struct SyncRunner {
    history: Arc<HistoryLog>,
    redactor: Redactor,
}

struct AttemptReport {
    status: HistoryStatus,
    exit_code: i32,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

impl SyncRunner {
    pub fn new(history: Arc<HistoryLog>, redactor: Redactor) -> Self {
        Self { history, redactor }
    }

    pub async fn run(&self, spec: &CommandSpec, prompt: &str) -> AppResult<SyncRunResult> {
        let cwd = non_empty_path(&spec.cwd);
        let executable = resolve_executable(&spec.cmd, cwd.as_deref())?;
        let run_id = new_run_id();
        let started_at = Utc::now();
        let attempts = spec.attempts();

        if let Some(report) = self.ready_check(spec, cwd.as_deref()).await {
            tracing::warn!(run_id = %run_id, error = ?report.error, "ready check failed");
            return self.finish(&run_id, spec, prompt, started_at, 0, attempts, report);
        }

        let mut attempt = 0;
        let report = loop {
            attempt += 1;
            let mut options = IdleRunOptions::new(
                executable.to_string_lossy().to_string(),
                spec.args.clone(),
                Duration::from_millis(spec.idle_timeout_ms),
            );
            options.name = spec.label().to_string();
            options.cwd = cwd.clone();
            options.env = spec.env.clone();
            options.deadline = (spec.timeout_ms > 0).then(|| Duration::from_millis(spec.timeout_ms));

            let report = match idle::execute(options).await {
                Ok(outcome) => report_outcome(spec.label(), outcome),
                Err(error) => AttemptReport {
                    status: HistoryStatus::Error,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(error.to_string()),
                },
            };
            if report.status == HistoryStatus::Ok || attempt >= attempts {
                break report;
            }
            tracing::info!(run_id = %run_id, attempt, attempts, error = ?report.error, "retrying synchronous run");
            tokio::time::sleep(Duration::from_millis(retry_backoff_ms(spec))).await;
        };

        self.finish(&run_id, spec, prompt, started_at, attempt, attempts, report)
    }

    /// `None` when there is no ready command or it succeeded.
    async fn ready_check(&self, spec: &CommandSpec, cwd: Option<&Path>) -> Option<AttemptReport> {
        let error = idle::check_ready(spec, cwd).await.err()?;
        Some(AttemptReport {
            status: HistoryStatus::NotReady,
            exit_code: error.exit_code().unwrap_or(-1),
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("ready check failed: {}", error)),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: &str,
        spec: &CommandSpec,
        prompt: &str,
        started_at: DateTime<Utc>,
        attempt: u32,
        attempts: u32,
        report: AttemptReport,
    ) -> AppResult<SyncRunResult> {
        let record = HistoryRecord::for_run(run_id, spec, prompt, &self.redactor, started_at).finish(
            report.status,
            report.exit_code,
            Utc::now(),
            report.error.clone(),
        );
        if let Err(error) = self.history.append(&record) {
            tracing::warn!(run_id = %run_id, error = %error, "history append failed");
        }

        Ok(SyncRunResult {
            run_id: run_id.to_string(),
            status: report.status,
            agent: spec.agent.clone(),
            role: spec.role.clone(),
            model: spec.model.clone(),
            attempt,
            attempts,
            exit_code: report.exit_code,
            stdout: report.stdout.trim().to_string(),
            stderr: report.stderr.trim().to_string(),
            duration_ms: record.duration_ms,
            started_at,
            ended_at: record.ended_at,
            error: report.error,
        })
    }
}

fn report_outcome(name: &str, outcome: IdleRunOutcome) -> AttemptReport {
    let status = match outcome.termination {
        Termination::Exited if outcome.success => HistoryStatus::Ok,
        Termination::Exited => HistoryStatus::Error,
        Termination::IdleTimeout | Termination::Deadline => HistoryStatus::Timeout,
        Termination::Canceled => HistoryStatus::Canceled,
    };
    let exit_code = outcome.exit_code.unwrap_or(-1);
    let stdout = outcome.stdout.clone();
    let stderr = outcome.stderr.clone();
    let error = outcome.into_result(name).err().map(|error| error.to_string());
    AttemptReport {
        status,
        exit_code,
        stdout,
        stderr,
        error,
    }
}

fn retry_backoff_ms(spec: &CommandSpec) -> u64 {
    if spec.retry_backoff_ms == 0 {
        DEFAULT_RETRY_BACKOFF_MS
    } else {
        spec.retry_backoff_ms
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}
