use crate::errors::{AppError, AppResult};
use crate::fingerprint::prompt_hash;
use crate::models::{CommandSpec, HistoryQuery, HistoryRecord, HistoryStatus};
use crate::redaction::Redactor;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// One writer per process; separate processes rely on O_APPEND alone.
static HISTORY_WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

impl HistoryRecord {
    /// Identity and prompt fields for a run of `spec`. The prompt itself is
    /// kept, redacted, only when the spec opts in with `log_prompt`.
    pub fn for_run(
        run_id: &str,
        spec: &CommandSpec,
        prompt: &str,
        redactor: &Redactor,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: run_id.to_string(),
            agent: spec.agent.clone(),
            role: spec.role.clone(),
            model: spec.model.clone(),
            cmd: spec.cmd.clone(),
            args: spec.args.clone(),
            status: HistoryStatus::Ok,
            exit_code: 0,
            started_at,
            ended_at: started_at,
            duration_ms: 0,
            prompt_hash: prompt_hash(prompt),
            prompt_len: prompt.len(),
            prompt: spec.log_prompt.then(|| redactor.scrub(prompt)),
            error: None,
        }
    }

    pub fn finish(
        mut self,
        status: HistoryStatus,
        exit_code: i32,
        ended_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        self.status = status;
        self.exit_code = exit_code;
        self.ended_at = ended_at;
        self.duration_ms = (ended_at - self.started_at).num_milliseconds();
        self.error = error;
        self
    }
}

/// Append-only JSONL log of completed runs.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &HistoryRecord) -> AppResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = HISTORY_WRITE_LOCK
            .lock()
            .map_err(|_| AppError::Internal("history write lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn read_all(&self) -> AppResult<Vec<HistoryRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<HistoryRecord>(&line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::debug!(line = index + 1, error = %error, "skipping malformed history line");
                }
            }
        }
        Ok(records)
    }

    /// Most recent first. A `limit` of 0 returns every match.
    pub fn query(&self, query: &HistoryQuery) -> AppResult<Vec<HistoryRecord>> {
        let role = query.role.as_deref().map(str::trim).filter(|value| !value.is_empty());
        let agent = query.agent.as_deref().map(str::trim).filter(|value| !value.is_empty());

        let mut matches = self
            .read_all()?
            .into_iter()
            .filter(|record| query.status.map_or(true, |status| record.status == status))
            .filter(|record| role.map_or(true, |role| record.role == role))
            .filter(|record| agent.map_or(true, |agent| record.agent == agent))
            .collect::<Vec<_>>();
        matches.reverse();
        if query.limit > 0 {
            matches.truncate(query.limit);
        }
        Ok(matches)
    }

    pub fn find_by_id(&self, id: &str) -> AppResult<HistoryRecord> {
        self.read_all()?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found in history", id)))
    }
}
