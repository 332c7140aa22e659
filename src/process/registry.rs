use crate::config::RuntimePaths;
use crate::errors::{AppError, AppResult};
use crate::models::{CancelStatus, ExitRecord, ProcessStatus, RunDescriptor, RunSnapshot};
use crate::process::launcher::{
    CANCEL_MARKER_FILE, DESCRIPTOR_FILE, EXIT_FILE, STDERR_FILE, STDOUT_FILE,
};
use crate::process::signal;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const FORCE_KILL_GRACE: Duration = Duration::from_millis(500);
const EXIT_RECORD_GRACE: Duration = Duration::from_millis(100);

/// Resolves run ids to live status from the on-disk run directories.
#[derive(Debug, Clone)]
pub struct Registry {
    paths: RuntimePaths,
}

impl Registry {
    pub fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    fn run_dir(&self, run_id: &str) -> AppResult<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id != "."
            && run_id != ".."
            && !run_id.contains(|c: char| c == '/' || c == '\\');
        if !valid {
            return Err(AppError::InvalidInput(format!("Invalid run id '{}'", run_id)));
        }
        Ok(self.paths.run_dir(run_id))
    }

    pub fn descriptor(&self, run_id: &str) -> AppResult<RunDescriptor> {
        let path = self.run_dir(run_id)?.join(DESCRIPTOR_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("Run {} not found", run_id)));
            }
            Err(error) => return Err(error.into()),
        };
        serde_json::from_str(&raw).map_err(|error| {
            AppError::Internal(format!("Corrupt descriptor for {}: {}", run_id, error))
        })
    }

    pub async fn status(&self, run_id: &str, tail_bytes: usize) -> AppResult<RunSnapshot> {
        let descriptor = self.descriptor(run_id)?;
        let run_dir = self.run_dir(run_id)?;

        let mut exit = read_exit_record(&run_dir)?;
        let mut running = false;
        if exit.is_none() {
            running = signal::is_alive(descriptor.pid);
            if !running {
                // The supervisor reaps before it writes; give it a moment.
                tokio::time::sleep(EXIT_RECORD_GRACE).await;
                exit = read_exit_record(&run_dir)?;
            }
        }

        Ok(RunSnapshot {
            run_id: descriptor.id.clone(),
            status: if running {
                ProcessStatus::Running
            } else {
                ProcessStatus::Done
            },
            agent: descriptor.agent.clone(),
            role: descriptor.role.clone(),
            model: descriptor.model.clone(),
            pid: descriptor.pid,
            exit_code: exit.as_ref().and_then(|record| record.exit_code),
            signal: exit.as_ref().and_then(|record| record.signal),
            cancel_requested: run_dir.join(CANCEL_MARKER_FILE).exists(),
            started_at: descriptor.started_at,
            ended_at: exit.as_ref().map(|record| record.ended_at),
            error: exit.as_ref().and_then(|record| record.error.clone()),
            stdout: read_tail(&run_dir.join(STDOUT_FILE), tail_bytes)?,
            stderr: read_tail(&run_dir.join(STDERR_FILE), tail_bytes)?,
        })
    }

    /// Polls until the run leaves `running` or `timeout` elapses. Timing out
    /// is not an error; the last snapshot is returned either way.
    pub async fn wait(
        &self,
        run_id: &str,
        timeout: Duration,
        tail_bytes: usize,
    ) -> AppResult<RunSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.status(run_id, tail_bytes).await?;
            if !snapshot.is_running() {
                return Ok(snapshot);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(snapshot);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Requests termination; with `force`, escalates to a kill after a short
    /// grace window without waiting for the process to exit.
    pub async fn cancel(&self, run_id: &str, force: bool) -> AppResult<CancelStatus> {
        let descriptor = match self.descriptor(run_id) {
            Ok(descriptor) => descriptor,
            Err(AppError::NotFound(_)) => return Ok(CancelStatus::NotFound),
            Err(error) => return Err(error),
        };
        let run_dir = self.run_dir(run_id)?;
        if read_exit_record(&run_dir)?.is_some() || !signal::is_alive(descriptor.pid) {
            return Ok(CancelStatus::NotRunning);
        }

        std::fs::write(run_dir.join(CANCEL_MARKER_FILE), chrono::Utc::now().to_rfc3339())?;
        if let Err(error) = signal::terminate(descriptor.pid) {
            tracing::warn!(run_id = %run_id, pid = descriptor.pid, error = %error, "cancel signal failed");
            return Ok(CancelStatus::NotRunning);
        }
        tracing::info!(run_id = %run_id, pid = descriptor.pid, force, "run cancel requested");

        if force {
            tokio::time::sleep(FORCE_KILL_GRACE).await;
            if signal::is_alive(descriptor.pid) {
                let _ = signal::kill(descriptor.pid);
            }
        }
        Ok(CancelStatus::Canceled)
    }
}

fn read_exit_record(run_dir: &Path) -> AppResult<Option<ExitRecord>> {
    match std::fs::read_to_string(run_dir.join(EXIT_FILE)) {
        Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Last `bytes` bytes of a log, trimmed. The cut is a byte offset, so a
/// multi-byte character at the boundary decodes lossily.
pub fn read_tail(path: &Path, bytes: usize) -> AppResult<String> {
    if bytes == 0 {
        return Ok(String::new());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(error) => return Err(error.into()),
    };
    let size = file.metadata()?.len();
    let start = size.saturating_sub(bytes as u64);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).trim().to_string())
}
