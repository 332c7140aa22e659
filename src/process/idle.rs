use crate::errors::{AppError, AppResult};
use crate::models::CommandSpec;
use crate::process::diagnostics::{concise_error, format_duration};
use crate::process::signal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(120_000);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(5_000);
const READ_CHUNK_BYTES: usize = 4096;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct IdleRunOptions {
    /// Label used in failure messages, e.g. `codex`.
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub idle_timeout: Duration,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl IdleRunOptions {
    pub fn new(executable: impl Into<String>, args: Vec<String>, idle_timeout: Duration) -> Self {
        let executable = executable.into();
        Self {
            name: executable.clone(),
            executable,
            args,
            cwd: None,
            env: BTreeMap::new(),
            idle_timeout,
            deadline: None,
            cancel: None,
        }
    }

    fn effective_idle_timeout(&self) -> Duration {
        if self.idle_timeout.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            self.idle_timeout
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    IdleTimeout,
    Deadline,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct IdleRunOutcome {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub success: bool,
    /// stdout and stderr interleaved in arrival order.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub idle_timeout: Duration,
}

impl IdleRunOutcome {
    pub fn into_result(self, name: &str) -> AppResult<String> {
        match self.termination {
            Termination::Exited if self.success => Ok(self.output.trim().to_string()),
            Termination::Exited => {
                let fallback = match self.exit_code {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                };
                let summary = concise_error(&self.output, &fallback);
                Err(AppError::Execution {
                    message: format!("{} CLI failed: {}", name, summary),
                    exit_code: self.exit_code,
                    output: self.output,
                })
            }
            Termination::IdleTimeout => Err(AppError::IdleTimeout(format!(
                "{} CLI idle timed out (no output for {})",
                name,
                format_duration(self.idle_timeout)
            ))),
            Termination::Deadline => Err(AppError::Timeout(format!("{} CLI timed out", name))),
            Termination::Canceled => Err(AppError::Execution {
                message: format!("{} CLI canceled", name),
                exit_code: self.exit_code,
                output: self.output,
            }),
        }
    }
}

#[derive(Default)]
struct OutputBuffer {
    combined: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Runs `executable` attached and returns its trimmed combined output.
pub async fn run(executable: &str, args: &[String], idle_timeout: Duration) -> AppResult<String> {
    run_with(IdleRunOptions::new(executable, args.to_vec(), idle_timeout)).await
}

pub async fn run_with(options: IdleRunOptions) -> AppResult<String> {
    let name = options.name.clone();
    execute(options).await?.into_result(&name)
}

/// Runs the command's ready command, if it has one. Any failure, including the
/// command outliving its ready timeout, means the agent is not ready.
pub async fn check_ready(spec: &CommandSpec, cwd: Option<&Path>) -> AppResult<()> {
    let Some(ready_cmd) = spec
        .ready_cmd
        .as_deref()
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
    else {
        return Ok(());
    };
    let limit = if spec.ready_timeout_ms == 0 {
        DEFAULT_READY_TIMEOUT
    } else {
        Duration::from_millis(spec.ready_timeout_ms)
    };
    let mut options = IdleRunOptions::new(ready_cmd, spec.ready_args.clone(), limit);
    options.cwd = cwd.map(Path::to_path_buf);
    options.env = spec.env.clone();
    options.deadline = Some(limit);
    run_with(options).await.map(|_| ())
}

/// Runs to completion and reports how the process ended. Only spawn failures
/// are errors here; callers decide what a non-zero exit or timeout means.
pub async fn execute(options: IdleRunOptions) -> AppResult<IdleRunOutcome> {
    let idle_timeout = options.effective_idle_timeout();
    let started = Instant::now();

    let mut command = Command::new(&options.executable);
    command
        .args(&options.args)
        .envs(&options.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = options.cwd.as_ref() {
        command.current_dir(dir);
    }
    own_process_group(&mut command);

    let mut child = command.spawn().map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            AppError::MissingExecutable(format!("{} CLI not found: {}", options.name, options.executable))
        } else {
            AppError::execution(format!("Failed to start {} CLI: {}", options.name, error))
        }
    })?;
    let pid = child.id().unwrap_or_default();

    let lifetime = match options.cancel.as_ref() {
        Some(parent) => parent.child_token(),
        None => CancellationToken::new(),
    };
    let activity = Arc::new(Notify::new());
    let buffer = Arc::new(Mutex::new(OutputBuffer::default()));

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, buffer.clone(), activity.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, buffer.clone(), activity.clone()));
    }
    let watchdog = spawn_idle_watchdog(idle_timeout, lifetime.clone(), activity.clone());

    let deadline = async {
        match options.deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut exit_status = None;
    let termination = tokio::select! {
        status = child.wait() => {
            exit_status = Some(status?);
            Termination::Exited
        }
        _ = lifetime.cancelled() => Termination::Canceled,
        _ = &mut deadline => Termination::Deadline,
    };
    lifetime.cancel();
    let idle_fired = watchdog.await.unwrap_or(false);
    let termination = match termination {
        Termination::Canceled if idle_fired => Termination::IdleTimeout,
        other => other,
    };

    if termination != Termination::Exited {
        tracing::warn!(
            cli = %options.name,
            pid,
            idle_timeout_ms = idle_timeout.as_millis() as u64,
            termination = ?termination,
            "stopping attached CLI"
        );
        signal::kill_group(pid);
        let _ = child.start_kill();
        if let Ok(Ok(status)) = timeout(DRAIN_TIMEOUT, child.wait()).await {
            exit_status = Some(status);
        }
    }

    for reader in readers {
        match timeout(DRAIN_TIMEOUT, reader).await {
            Ok(_) => {}
            Err(_) => {
                // A grandchild still holds the pipe open.
                signal::kill_group(pid);
            }
        }
    }

    let buffer = buffer.lock().await;
    let exit_code = exit_status.and_then(|status| status.code());
    Ok(IdleRunOutcome {
        termination,
        exit_code,
        success: termination == Termination::Exited
            && exit_status.map(|status| status.success()).unwrap_or(false),
        output: String::from_utf8_lossy(&buffer.combined).to_string(),
        stdout: String::from_utf8_lossy(&buffer.stdout).to_string(),
        stderr: String::from_utf8_lossy(&buffer.stderr).to_string(),
        duration: started.elapsed(),
        idle_timeout,
    })
}

fn spawn_reader<R>(
    stream: R,
    kind: Stream,
    buffer: Arc<Mutex<OutputBuffer>>,
    activity: Arc<Notify>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => {
                    {
                        let mut buffer = buffer.lock().await;
                        buffer.combined.extend_from_slice(&chunk[..size]);
                        match kind {
                            Stream::Stdout => buffer.stdout.extend_from_slice(&chunk[..size]),
                            Stream::Stderr => buffer.stderr.extend_from_slice(&chunk[..size]),
                        }
                    }
                    activity.notify_one();
                }
                Err(error) => {
                    tracing::debug!(error = %error, "attached CLI stream read failed");
                    break;
                }
            }
        }
    })
}

/// Cancels `lifetime` once `idle_timeout` passes without activity. Resolves
/// to `true` only when it fired.
fn spawn_idle_watchdog(
    idle_timeout: Duration,
    lifetime: CancellationToken,
    activity: Arc<Notify>,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = lifetime.cancelled() => return false,
                _ = activity.notified() => continue,
                _ = tokio::time::sleep(idle_timeout) => {
                    lifetime.cancel();
                    return true;
                }
            }
        }
    })
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    // SAFETY: setpgid is async-signal-safe and only touches the forked child.
    unsafe {
        command.pre_exec(|| {
            use nix::unistd::{setpgid, Pid};
            setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(windows)]
fn own_process_group(command: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}
