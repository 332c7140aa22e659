use crate::config::RuntimePaths;
use crate::errors::{AppError, AppResult};
use crate::history::HistoryLog;
use crate::models::{
    CommandSpec, ExitRecord, HistoryRecord, HistoryStatus, LaunchedRun, RunDescriptor,
};
use crate::process::diagnostics::format_duration;
use crate::process::idle::{self, Termination};
use crate::process::signal;
use crate::redaction::Redactor;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};

pub const DESCRIPTOR_FILE: &str = "meta.json";
pub const EXIT_FILE: &str = "exit.json";
pub const CANCEL_MARKER_FILE: &str = "cancel_requested";
pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";
const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const SILENCE_POLL_MIN: Duration = Duration::from_millis(50);
const SILENCE_POLL_MAX: Duration = Duration::from_secs(1);

pub fn new_run_id() -> String {
    format!(
        "run-{}-{:04x}",
        Utc::now().timestamp_millis(),
        rand::random::<u16>()
    )
}

/// Resolves `cmd` to an existing file before anything touches disk.
///
/// Values containing a path separator are taken relative to `cwd`; bare
/// names are searched on `PATH`.
pub fn resolve_executable(cmd: &str, cwd: Option<&Path>) -> AppResult<PathBuf> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(AppError::InvalidInput("Command is required".to_string()));
    }

    let candidate = Path::new(cmd);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        let resolved = match cwd {
            Some(dir) if !candidate.is_absolute() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        };
        if is_executable_file(&resolved) {
            return Ok(resolved);
        }
        return Err(AppError::MissingExecutable(format!(
            "'{}' does not exist or is not executable",
            cmd
        )));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        for name in executable_names(cmd) {
            let full = dir.join(&name);
            if is_executable_file(&full) {
                return Ok(full);
            }
        }
    }
    Err(AppError::MissingExecutable(format!(
        "'{}' was not found on PATH",
        cmd
    )))
}

#[cfg(unix)]
fn executable_names(cmd: &str) -> Vec<String> {
    vec![cmd.to_string()]
}

#[cfg(windows)]
fn executable_names(cmd: &str) -> Vec<String> {
    if Path::new(cmd).extension().is_some() {
        return vec![cmd.to_string()];
    }
    ["exe", "cmd", "bat"]
        .iter()
        .map(|ext| format!("{}.{}", cmd, ext))
        .collect()
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Writes `value` as JSON next to its final location, syncs it, then renames
/// it into place so readers never observe a partial file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Starts detached runs and records their descriptors.
#[derive(Debug, Clone)]
pub struct Launcher {
    paths: RuntimePaths,
    redactor: Redactor,
    history: Option<Arc<HistoryLog>>,
}

impl Launcher {
    pub fn new(paths: RuntimePaths, redactor: Redactor) -> Self {
        Self {
            paths,
            redactor,
            history: None,
        }
    }

    /// Appends one history record per launch attempt that reaches an outcome.
    pub fn with_history(mut self, history: Arc<HistoryLog>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub async fn launch(&self, spec: &CommandSpec, prompt: &str) -> AppResult<LaunchedRun> {
        self.launch_with_id(&new_run_id(), spec, prompt).await
    }

    /// Spawns `spec` in its own session. The descriptor is on disk before
    /// this returns, so the run id resolves even if this process exits next.
    ///
    /// `timeout_ms` and `idle_timeout_ms` are enforced by the supervisor for
    /// as long as this process lives. Retries need a caller that waits, so a
    /// non-zero `retry` is rejected here.
    pub async fn launch_with_id(
        &self,
        run_id: &str,
        spec: &CommandSpec,
        prompt: &str,
    ) -> AppResult<LaunchedRun> {
        if spec.retry > 0 {
            return Err(AppError::InvalidInput(
                "retry is only supported for synchronous runs".to_string(),
            ));
        }
        let cwd = non_empty(&spec.cwd).map(PathBuf::from);
        let executable = resolve_executable(&spec.cmd, cwd.as_deref())?;

        if let Err(error) = idle::check_ready(spec, cwd.as_deref()).await {
            let message = format!("ready check failed: {}", error);
            tracing::warn!(run_id = %run_id, cmd = %spec.cmd, error = %error, "ready check failed; not launching");
            let now = Utc::now();
            self.record_history(
                HistoryRecord::for_run(run_id, spec, prompt, &self.redactor, now).finish(
                    HistoryStatus::NotReady,
                    error.exit_code().unwrap_or(-1),
                    now,
                    Some(message.clone()),
                ),
            );
            return Err(AppError::execution(message));
        }

        let run_dir = self.paths.run_dir(run_id);
        std::fs::create_dir_all(&run_dir)?;
        let stdout = open_append(&run_dir.join(STDOUT_FILE))?;
        let stderr = open_append(&run_dir.join(STDERR_FILE))?;

        let mut command = Command::new(&executable);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = cwd.as_ref() {
            command.current_dir(dir);
        }
        detach(&mut command);

        let mut child = command.spawn().map_err(|error| {
            tracing::warn!(run_id = %run_id, cmd = %spec.cmd, error = %error, "detached spawn failed");
            AppError::execution(format!("Failed to start '{}': {}", spec.cmd, error))
        })?;
        let pid = child.id().unwrap_or_default();

        let descriptor = RunDescriptor {
            id: run_id.to_string(),
            agent: spec.agent.clone(),
            role: spec.role.clone(),
            model: spec.model.clone(),
            reasoning: spec.reasoning.clone(),
            cmd: spec.cmd.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env.clone(),
            prompt: self.redactor.scrub(prompt),
            pid,
            started_at: Utc::now(),
        };
        if let Err(error) = write_json_atomic(&run_dir.join(DESCRIPTOR_FILE), &descriptor) {
            tracing::error!(run_id = %run_id, error = %error, "descriptor write failed; killing orphan");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(error);
        }

        tracing::info!(run_id = %run_id, pid, agent = %spec.agent, role = %spec.role, "run launched");
        let history = self.history.clone().map(|log| {
            let entry =
                HistoryRecord::for_run(run_id, spec, prompt, &self.redactor, descriptor.started_at);
            (log, entry)
        });
        supervise(
            Supervision {
                run_id: run_id.to_string(),
                run_dir,
                label: spec.label().to_string(),
                deadline: non_zero_millis(spec.timeout_ms),
                idle_timeout: non_zero_millis(spec.idle_timeout_ms),
                history,
            },
            child,
        );

        Ok(LaunchedRun {
            run_id: run_id.to_string(),
            pid,
        })
    }

    fn record_history(&self, record: HistoryRecord) {
        let Some(history) = self.history.as_ref() else {
            return;
        };
        if let Err(error) = history.append(&record) {
            tracing::warn!(run_id = %record.id, error = %error, "history append failed");
        }
    }
}

fn non_zero_millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn open_append(path: &Path) -> AppResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    // SAFETY: setsid is async-signal-safe and only touches the forked child.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

struct Supervision {
    run_id: String,
    run_dir: PathBuf,
    label: String,
    deadline: Option<Duration>,
    idle_timeout: Option<Duration>,
    history: Option<(Arc<HistoryLog>, HistoryRecord)>,
}

/// Waits on the child in the background, stops it when it outlives its
/// deadline or goes silent, and records how it ended. The task dies with the
/// runtime; the registry then falls back to probing the pid.
fn supervise(run: Supervision, mut child: Child) {
    tokio::spawn(async move {
        let (status, expired) = match watch(&mut child, &run).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(run_id = %run.run_id, error = %error, "waiting on detached run failed");
                return;
            }
        };
        let failure = expired.map(|reason| expiry_error(&run.label, reason, run.idle_timeout));
        let mut record = exit_record(status);
        record.error = failure.as_ref().map(ToString::to_string);
        tracing::info!(
            run_id = %run.run_id,
            exit_code = ?record.exit_code,
            signal = ?record.signal,
            error = ?record.error,
            "run exited"
        );
        if let Err(error) = write_json_atomic(&run.run_dir.join(EXIT_FILE), &record) {
            tracing::warn!(run_id = %run.run_id, error = %error, "exit record write failed");
        }

        let Some((history, entry)) = run.history else {
            return;
        };
        let canceled = run.run_dir.join(CANCEL_MARKER_FILE).exists();
        let clean_exit = failure.is_none() && record.exit_code == Some(0);
        let history_status = if canceled && !clean_exit {
            HistoryStatus::Canceled
        } else if failure.as_ref().is_some_and(AppError::is_timeout) {
            HistoryStatus::Timeout
        } else if clean_exit {
            HistoryStatus::Ok
        } else {
            HistoryStatus::Error
        };
        let error = match (&record.error, record.exit_code, record.signal) {
            (Some(error), _, _) => Some(error.clone()),
            (None, Some(0), _) => None,
            (None, Some(code), _) => Some(format!("exit status {}", code)),
            (None, None, Some(signal)) => Some(format!("terminated by signal {}", signal)),
            (None, None, None) => None,
        };
        let entry = entry.finish(
            history_status,
            record.exit_code.unwrap_or(-1),
            record.ended_at,
            error,
        );
        if let Err(error) = history.append(&entry) {
            tracing::warn!(run_id = %run.run_id, error = %error, "history append failed");
        }
    });
}

/// Returns the exit status and, when the supervisor had to stop the run, why.
async fn watch(
    child: &mut Child,
    run: &Supervision,
) -> std::io::Result<(ExitStatus, Option<Termination>)> {
    let expired = tokio::select! {
        status = child.wait() => return Ok((status?, None)),
        _ = sleep_or_forever(run.deadline) => Termination::Deadline,
        _ = wait_for_silence(&run.run_dir, run.idle_timeout) => Termination::IdleTimeout,
    };
    tracing::warn!(run_id = %run.run_id, reason = ?expired, "stopping detached run");
    if let Some(pid) = child.id() {
        let _ = signal::terminate(pid);
    }
    if let Ok(status) = timeout(TERMINATE_GRACE, child.wait()).await {
        return Ok((status?, Some(expired)));
    }
    if let Some(pid) = child.id() {
        let _ = signal::kill(pid);
    }
    let _ = child.start_kill();
    Ok((child.wait().await?, Some(expired)))
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once neither log has grown for `idle`. The child writes its logs
/// directly, so growth on disk is the only activity signal.
async fn wait_for_silence(run_dir: &Path, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending::<()>().await;
    };
    let poll = (idle / 4).clamp(SILENCE_POLL_MIN, SILENCE_POLL_MAX);
    let mut last_size = log_size(run_dir);
    let mut last_activity = Instant::now();
    loop {
        tokio::time::sleep(poll).await;
        let size = log_size(run_dir);
        if size != last_size {
            last_size = size;
            last_activity = Instant::now();
        } else if last_activity.elapsed() >= idle {
            return;
        }
    }
}

fn log_size(run_dir: &Path) -> u64 {
    [STDOUT_FILE, STDERR_FILE]
        .iter()
        .filter_map(|name| std::fs::metadata(run_dir.join(name)).ok())
        .map(|metadata| metadata.len())
        .sum()
}

fn expiry_error(label: &str, reason: Termination, idle_timeout: Option<Duration>) -> AppError {
    match (reason, idle_timeout) {
        (Termination::IdleTimeout, Some(idle)) => AppError::IdleTimeout(format!(
            "{} CLI idle timed out (no output for {})",
            label,
            format_duration(idle)
        )),
        _ => AppError::Timeout(format!("{} CLI timed out", label)),
    }
}

fn exit_record(status: ExitStatus) -> ExitRecord {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitRecord {
        exit_code: status.code(),
        signal,
        ended_at: Utc::now(),
        error: None,
    }
}
