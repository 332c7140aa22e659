use crate::config::{ActivationMode, SchedulerConfig};
use crate::errors::{AppError, AppResult};
use crate::fingerprint::mode_hash;
use crate::history::HistoryLog;
use crate::models::{
    CancelResponse, CancelStatus, CommandSpec, HealthReport, LaunchedRun, RunSnapshot, RunStatus,
    RunView, SubmitResponse,
};
use crate::process::{Launcher, Registry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const COMPLETED_CAP: usize = 200;
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const MODE_CHANGED_ERROR: &str = "mode_changed";

/// What the scheduler needs from the process layer.
#[async_trait]
pub trait RunBackend: Send + Sync {
    async fn launch(&self, run_id: &str, spec: &CommandSpec, prompt: &str) -> AppResult<LaunchedRun>;
    async fn status(&self, run_id: &str, tail_bytes: usize) -> AppResult<RunSnapshot>;
    async fn cancel(&self, run_id: &str, force: bool) -> AppResult<CancelStatus>;
}

/// Detached launches tracked through their run directories.
pub struct ProcessBackend {
    launcher: Launcher,
    registry: Registry,
}

impl ProcessBackend {
    pub fn new(launcher: Launcher, registry: Registry) -> Self {
        Self { launcher, registry }
    }
}

#[async_trait]
impl RunBackend for ProcessBackend {
    async fn launch(&self, run_id: &str, spec: &CommandSpec, prompt: &str) -> AppResult<LaunchedRun> {
        self.launcher.launch_with_id(run_id, spec, prompt).await
    }

    async fn status(&self, run_id: &str, tail_bytes: usize) -> AppResult<RunSnapshot> {
        self.registry.status(run_id, tail_bytes).await
    }

    async fn cancel(&self, run_id: &str, force: bool) -> AppResult<CancelStatus> {
        self.registry.cancel(run_id, force).await
    }
}

#[derive(Debug, Clone)]
pub struct RunItem {
    pub run_id: String,
    pub status: RunStatus,
    pub spec: CommandSpec,
    pub prompt: String,
    pub mode_hash: String,
    pub approval_required: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` while the launch is still in flight.
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Cancel requested mid-launch; delivered once the pid is known.
    pending_cancel: Option<bool>,
}

impl RunItem {
    /// Applies `next` only along the legal transition graph.
    fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::debug!(run_id = %self.run_id, from = %self.status, to = %next, "ignoring illegal transition");
            return false;
        }
        self.status = next;
        if next == RunStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    pub fn view(&self) -> RunView {
        RunView {
            run_id: self.run_id.clone(),
            status: self.status,
            agent: self.spec.agent.clone(),
            role: self.spec.role.clone(),
            model: self.spec.model.clone(),
            mode_hash: self.mode_hash.clone(),
            approval_required: self.approval_required,
            created_at: Some(self.created_at),
            started_at: self.started_at,
            ended_at: self.ended_at,
            exit_code: self.exit_code,
            error: self.error.clone(),
            pid: self.pid,
            stdout: None,
            stderr: None,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: Vec<RunItem>,
    running: HashMap<String, RunItem>,
    completed: VecDeque<RunItem>,
    last_mode_hash: Option<String>,
}

impl SchedulerState {
    fn push_completed(&mut self, item: RunItem) {
        self.completed.push_back(item);
        while self.completed.len() > COMPLETED_CAP {
            self.completed.pop_front();
        }
    }

    fn count(&self, status: RunStatus) -> usize {
        self.queue.iter().filter(|item| item.status == status).count()
    }

    fn find(&self, run_id: &str) -> Option<&RunItem> {
        self.queue
            .iter()
            .find(|item| item.run_id == run_id)
            .or_else(|| self.running.get(run_id))
            .or_else(|| self.completed.iter().rev().find(|item| item.run_id == run_id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reconciled: usize,
    pub launched: usize,
    pub launch_failures: usize,
}

/// Bounded run queue with an approval gate and mode-change invalidation.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    backend: Arc<dyn RunBackend>,
    history: Option<Arc<HistoryLog>>,
    config: SchedulerConfig,
    activation: ActivationMode,
    started_at: DateTime<Utc>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        activation: ActivationMode,
        backend: Arc<dyn RunBackend>,
        history: Option<Arc<HistoryLog>>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            backend,
            history,
            config: config.normalized(),
            activation,
            started_at: Utc::now(),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            loop_handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn submit(
        &self,
        spec: CommandSpec,
        prompt: &str,
        mode_tag: Option<&str>,
        require_approval: bool,
    ) -> AppResult<SubmitResponse> {
        if prompt.trim().is_empty() {
            return Err(AppError::InvalidInput("prompt is required".to_string()));
        }
        if spec.cmd.trim().is_empty() {
            return Err(AppError::InvalidInput("command is required".to_string()));
        }
        if spec.retry > 0 {
            return Err(AppError::InvalidInput(
                "retry is only supported for synchronous runs".to_string(),
            ));
        }

        let hash = mode_hash(&spec, mode_tag);
        let approval_required =
            require_approval || self.config.approval.matches(&spec.role, &spec.agent);
        let mut item = RunItem {
            run_id: String::new(),
            status: if approval_required {
                RunStatus::AwaitingApproval
            } else {
                RunStatus::Queued
            },
            spec,
            prompt: prompt.to_string(),
            mode_hash: hash.clone(),
            approval_required,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            pid: None,
            exit_code: None,
            error: None,
            pending_cancel: None,
        };
        let (response, stale_running) = {
            let mut state = self.state.lock().await;
            item.run_id = loop {
                let candidate = crate::process::new_run_id();
                if state.find(&candidate).is_none() {
                    break candidate;
                }
            };
            let response = SubmitResponse {
                run_id: item.run_id.clone(),
                status: item.status,
                mode_hash: hash.clone(),
                approval_required,
            };
            let stale = self.apply_mode_change(&mut state, &hash);
            state.queue.push(item);
            (response, stale)
        };
        tracing::info!(
            run_id = %response.run_id,
            status = %response.status,
            mode_hash = %response.mode_hash,
            "run submitted"
        );

        for run_id in stale_running {
            match self.backend.cancel(&run_id, false).await {
                Ok(outcome) => tracing::info!(run_id = %run_id, outcome = ?outcome, "canceled stale running run"),
                Err(error) => tracing::warn!(run_id = %run_id, error = %error, "stale run cancel failed"),
            }
        }
        self.notify.notify_one();
        Ok(response)
    }

    /// Records the new fingerprint and abandons stale work per policy.
    /// Returns running ids the caller must cancel after releasing the lock.
    fn apply_mode_change(&self, state: &mut SchedulerState, hash: &str) -> Vec<String> {
        if hash.is_empty() {
            return Vec::new();
        }
        let previous = state.last_mode_hash.replace(hash.to_string());
        let changed = matches!(previous.as_deref(), Some(prev) if prev != hash);
        let policy = self.config.queue.on_mode_change;
        if !changed || !policy.cancels_pending() {
            return Vec::new();
        }

        let pending = std::mem::take(&mut state.queue);
        let canceled = pending.len();
        for mut item in pending {
            item.transition(RunStatus::Canceled);
            item.error = Some(MODE_CHANGED_ERROR.to_string());
            state.push_completed(item);
        }

        let mut stale = Vec::new();
        if policy.cancels_running() {
            for item in state.running.values_mut() {
                item.error = Some(MODE_CHANGED_ERROR.to_string());
                if item.pid.is_some() {
                    stale.push(item.run_id.clone());
                } else {
                    item.pending_cancel = Some(false);
                }
            }
        }
        tracing::info!(
            policy = ?policy,
            canceled_pending = canceled,
            canceled_running = stale.len(),
            "mode changed"
        );
        stale
    }

    pub async fn approve(&self, run_id: &str) -> bool {
        let approved = {
            let mut state = self.state.lock().await;
            match state
                .queue
                .iter_mut()
                .find(|item| item.run_id == run_id && item.status == RunStatus::AwaitingApproval)
            {
                Some(item) => item.transition(RunStatus::Queued),
                None => false,
            }
        };
        if approved {
            tracing::info!(run_id = %run_id, "run approved");
            self.notify.notify_one();
        }
        approved
    }

    pub async fn reject(&self, run_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.queue.iter().position(|item| item.run_id == run_id) else {
            return false;
        };
        let mut item = state.queue.remove(index);
        item.transition(RunStatus::Rejected);
        state.push_completed(item);
        tracing::info!(run_id = %run_id, "run rejected");
        true
    }

    pub async fn cancel(&self, run_id: &str, force: bool) -> AppResult<CancelResponse> {
        let response = |status| CancelResponse {
            run_id: run_id.to_string(),
            status,
        };
        {
            let mut state = self.state.lock().await;
            if let Some(index) = state.queue.iter().position(|item| item.run_id == run_id) {
                let mut item = state.queue.remove(index);
                item.transition(RunStatus::Canceled);
                state.push_completed(item);
                tracing::info!(run_id = %run_id, "queued run canceled");
                return Ok(response(CancelStatus::Canceled));
            }
            let launching = state.running.get(run_id).map(|item| item.pid.is_none());
            match launching {
                Some(true) => {
                    if let Some(item) = state.running.get_mut(run_id) {
                        item.pending_cancel = Some(force);
                    }
                    tracing::info!(run_id = %run_id, force, "cancel held until launch completes");
                    return Ok(response(CancelStatus::Canceled));
                }
                Some(false) => {}
                None => {
                    let status = if state.completed.iter().any(|item| item.run_id == run_id) {
                        CancelStatus::NotRunning
                    } else {
                        CancelStatus::NotFound
                    };
                    return Ok(response(status));
                }
            }
        }
        let status = self.backend.cancel(run_id, force).await?;
        tracing::info!(run_id = %run_id, force, outcome = ?status, "running run cancel delegated");
        Ok(response(status))
    }

    /// Reconciles running runs, then launches queued runs up to the ceiling.
    /// Status reads and launches happen outside the state lock; a slot is
    /// reserved in the running set before its launch starts.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        let running_ids = {
            let state = self.state.lock().await;
            state
                .running
                .values()
                .filter(|item| item.pid.is_some())
                .map(|item| item.run_id.clone())
                .collect::<Vec<_>>()
        };
        let mut observed = Vec::with_capacity(running_ids.len());
        for run_id in running_ids {
            let result = self.backend.status(&run_id, 0).await;
            observed.push((run_id, result));
        }

        let mut state = self.state.lock().await;
        for (run_id, result) in observed {
            let finished = match &result {
                Ok(snapshot) => !snapshot.is_running(),
                Err(AppError::NotFound(_)) => true,
                Err(error) => {
                    tracing::warn!(run_id = %run_id, error = %error, "status read failed");
                    false
                }
            };
            if !finished {
                continue;
            }
            let Some(mut item) = state.running.remove(&run_id) else {
                continue;
            };
            match result {
                Ok(snapshot) => {
                    let (status, error) = snapshot.terminal_status();
                    item.transition(status);
                    item.exit_code = snapshot.exit_code;
                    if let Some(ended_at) = snapshot.ended_at {
                        item.ended_at = Some(ended_at);
                    }
                    if item.error.is_none() {
                        item.error = error;
                    }
                }
                Err(error) => {
                    item.transition(RunStatus::Error);
                    item.error = Some(error.to_string());
                }
            }
            tracing::info!(run_id = %item.run_id, status = %item.status, exit_code = ?item.exit_code, "run finished");
            state.push_completed(item);
            summary.reconciled += 1;
        }

        let mut launches = Vec::new();
        while state.running.len() < self.config.max_parallel {
            let Some(index) = state
                .queue
                .iter()
                .position(|item| item.status == RunStatus::Queued)
            else {
                break;
            };
            let mut item = state.queue.remove(index);
            item.transition(RunStatus::Running);
            launches.push((item.run_id.clone(), item.spec.clone(), item.prompt.clone()));
            state.running.insert(item.run_id.clone(), item);
        }
        drop(state);

        let mut results = Vec::with_capacity(launches.len());
        for (run_id, spec, prompt) in launches {
            let result = self.backend.launch(&run_id, &spec, &prompt).await;
            results.push((run_id, result));
        }

        let mut held_cancels = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (run_id, result) in results {
                match result {
                    Ok(launched) => {
                        summary.launched += 1;
                        if let Some(item) = state.running.get_mut(&run_id) {
                            item.pid = Some(launched.pid);
                            if let Some(force) = item.pending_cancel.take() {
                                held_cancels.push((run_id, force));
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(run_id = %run_id, error = %error, "launch failed");
                        summary.launch_failures += 1;
                        let Some(mut item) = state.running.remove(&run_id) else {
                            continue;
                        };
                        if item.pending_cancel.is_some() {
                            item.transition(RunStatus::Canceled);
                        } else {
                            item.transition(RunStatus::Error);
                            item.error = Some(error.to_string());
                        }
                        state.push_completed(item);
                    }
                }
            }
        }

        for (run_id, force) in held_cancels {
            match self.backend.cancel(&run_id, force).await {
                Ok(outcome) => tracing::info!(run_id = %run_id, outcome = ?outcome, "held cancel delivered"),
                Err(error) => tracing::warn!(run_id = %run_id, error = %error, "held cancel failed"),
            }
        }
        summary
    }

    /// Queue, then running, then completed newest first. `limit` bounds the
    /// completed part; 0 means all of it.
    pub async fn list(&self, status: Option<RunStatus>, limit: usize) -> Vec<RunView> {
        let state = self.state.lock().await;
        let matches = |item: &&RunItem| status.map_or(true, |status| item.status == status);

        let mut views = state.queue.iter().filter(matches).map(RunItem::view).collect::<Vec<_>>();
        let mut running = state.running.values().filter(matches).collect::<Vec<_>>();
        running.sort_by_key(|item| item.started_at);
        views.extend(running.into_iter().map(RunItem::view));

        let completed = state.completed.iter().rev().filter(matches).map(RunItem::view);
        if limit > 0 {
            views.extend(completed.take(limit));
        } else {
            views.extend(completed);
        }
        views
    }

    pub async fn approvals(&self) -> Vec<RunView> {
        self.list(Some(RunStatus::AwaitingApproval), 0).await
    }

    /// Scheduler state first, then the run directory, then history.
    pub async fn status(&self, run_id: &str, tail_bytes: usize) -> AppResult<RunView> {
        let known = {
            let state = self.state.lock().await;
            state.find(run_id).cloned()
        };
        if let Some(item) = known {
            let mut view = item.view();
            if item.pid.is_some() && tail_bytes > 0 {
                if let Ok(snapshot) = self.backend.status(run_id, tail_bytes).await {
                    view.stdout = Some(snapshot.stdout);
                    view.stderr = Some(snapshot.stderr);
                }
            }
            return Ok(view);
        }

        match self.backend.status(run_id, tail_bytes).await {
            Ok(snapshot) => return Ok(detached_view(snapshot)),
            Err(AppError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }

        let Some(history) = self.history.as_ref() else {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        };
        let record = history.find_by_id(run_id)?;
        Ok(RunView {
            run_id: record.id,
            status: record.status.as_run_status(),
            agent: record.agent,
            role: record.role,
            model: record.model,
            mode_hash: String::new(),
            approval_required: false,
            created_at: None,
            started_at: Some(record.started_at),
            ended_at: Some(record.ended_at),
            exit_code: Some(record.exit_code),
            error: record.error,
            pid: None,
            stdout: None,
            stderr: None,
        })
    }

    /// Polls `status` until the run leaves queued/awaiting/running or the
    /// timeout elapses. Timing out only stops polling.
    pub async fn wait(&self, run_id: &str, timeout: Duration, tail_bytes: usize) -> AppResult<RunView> {
        let deadline = Instant::now() + timeout;
        loop {
            let view = self.status(run_id, tail_bytes).await?;
            if !view.status.is_pending() {
                return Ok(view);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(view);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.state.lock().await;
        let now = Utc::now();
        HealthReport {
            ok: true,
            pid: std::process::id(),
            activation: self.activation.as_str().to_string(),
            host: self.activation.host().map(str::to_string),
            port: self.activation.port(),
            started_at: self.started_at,
            uptime_ms: (now - self.started_at).num_milliseconds(),
            queued: state.count(RunStatus::Queued),
            awaiting: state.count(RunStatus::AwaitingApproval),
            running: state.running.len(),
            completed: state.completed.len(),
            max_parallel: self.config.max_parallel,
            mode_hash: state.last_mode_hash.clone(),
        }
    }

    /// Spawns the periodic tick loop. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move {
            scheduler.run_loop().await;
        }));
        tracing::info!(
            activation = self.activation.as_str(),
            max_parallel = self.config.max_parallel,
            "scheduler started"
        );
    }

    async fn run_loop(self) {
        let interval = self.config.tick_interval();
        loop {
            let summary = self.tick().await;
            if summary != TickSummary::default() {
                tracing::debug!(?summary, "scheduler tick");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Stops the tick loop. Launched runs keep going.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("scheduler stopped");
    }
}

fn detached_view(snapshot: RunSnapshot) -> RunView {
    let (status, error) = snapshot.terminal_status();
    RunView {
        run_id: snapshot.run_id,
        status,
        agent: snapshot.agent,
        role: snapshot.role,
        model: snapshot.model,
        mode_hash: String::new(),
        approval_required: false,
        created_at: None,
        started_at: Some(snapshot.started_at),
        ended_at: snapshot.ended_at,
        exit_code: snapshot.exit_code,
        error,
        pid: Some(snapshot.pid),
        stdout: Some(snapshot.stdout),
        stderr: Some(snapshot.stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::{RunBackend, Scheduler, TickSummary, COMPLETED_CAP, MODE_CHANGED_ERROR};
    use crate::config::{ActivationMode, ModeChangePolicy, SchedulerConfig};
    use crate::errors::{AppError, AppResult};
    use crate::models::{
        CancelStatus, CommandSpec, LaunchedRun, ProcessStatus, RunSnapshot, RunStatus,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBackend {
        // run id -> exit code once finished
        runs: Mutex<HashMap<String, Option<i32>>>,
        canceled: Mutex<Vec<String>>,
        fail_launch: bool,
        // launches park here until notified
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl FakeBackend {
        fn finish(&self, run_id: &str, code: i32) {
            self.runs
                .lock()
                .expect("runs lock")
                .insert(run_id.to_string(), Some(code));
        }

        fn launched(&self) -> usize {
            self.runs.lock().expect("runs lock").len()
        }
    }

    #[async_trait]
    impl RunBackend for FakeBackend {
        async fn launch(&self, run_id: &str, _spec: &CommandSpec, _prompt: &str) -> AppResult<LaunchedRun> {
            if let Some(gate) = self.gate.as_ref() {
                gate.notified().await;
            }
            if self.fail_launch {
                return Err(AppError::MissingExecutable("codex".to_string()));
            }
            self.runs
                .lock()
                .expect("runs lock")
                .insert(run_id.to_string(), None);
            Ok(LaunchedRun {
                run_id: run_id.to_string(),
                pid: 4242,
            })
        }

        async fn status(&self, run_id: &str, _tail_bytes: usize) -> AppResult<RunSnapshot> {
            let runs = self.runs.lock().expect("runs lock");
            let Some(exit) = runs.get(run_id) else {
                return Err(AppError::NotFound(run_id.to_string()));
            };
            let canceled = self
                .canceled
                .lock()
                .expect("canceled lock")
                .iter()
                .any(|id| id == run_id);
            Ok(RunSnapshot {
                run_id: run_id.to_string(),
                status: if exit.is_some() {
                    ProcessStatus::Done
                } else {
                    ProcessStatus::Running
                },
                agent: "codex".to_string(),
                role: String::new(),
                model: String::new(),
                pid: 4242,
                exit_code: *exit,
                signal: None,
                cancel_requested: canceled,
                started_at: Utc::now(),
                ended_at: exit.map(|_| Utc::now()),
                error: None,
                stdout: "tail".to_string(),
                stderr: String::new(),
            })
        }

        async fn cancel(&self, run_id: &str, _force: bool) -> AppResult<CancelStatus> {
            if !self.runs.lock().expect("runs lock").contains_key(run_id) {
                return Ok(CancelStatus::NotFound);
            }
            self.canceled
                .lock()
                .expect("canceled lock")
                .push(run_id.to_string());
            Ok(CancelStatus::Canceled)
        }
    }

    fn scheduler_with(config: SchedulerConfig, backend: Arc<FakeBackend>) -> Scheduler {
        Scheduler::new(config, ActivationMode::Embedded, backend, None)
    }

    fn spec(model: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("codex", vec!["exec".to_string()]);
        spec.agent = "codex".to_string();
        spec.model = model.to_string();
        spec
    }

    #[tokio::test]
    async fn queued_run_launches_and_completes() {
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_with(SchedulerConfig::default(), backend.clone());

        let submitted = scheduler
            .submit(spec("gpt"), "do the thing", None, false)
            .await
            .expect("submit");
        assert_eq!(submitted.status, RunStatus::Queued);
        assert_eq!(submitted.mode_hash.len(), 64);

        let summary = scheduler.tick().await;
        assert_eq!(summary.launched, 1);
        let view = scheduler.status(&submitted.run_id, 100).await.expect("status");
        assert_eq!(view.status, RunStatus::Running);
        assert_eq!(view.pid, Some(4242));
        assert_eq!(view.stdout.as_deref(), Some("tail"));

        backend.finish(&submitted.run_id, 0);
        scheduler.tick().await;
        let view = scheduler.status(&submitted.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Done);
        assert_eq!(view.exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_with(SchedulerConfig::default(), backend.clone());
        let submitted = scheduler.submit(spec("gpt"), "p", None, false).await.expect("submit");
        scheduler.tick().await;
        backend.finish(&submitted.run_id, 2);
        scheduler.tick().await;

        let view = scheduler.status(&submitted.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Error);
        assert_eq!(view.error.as_deref(), Some("exit status 2"));
    }

    #[tokio::test]
    async fn running_set_never_exceeds_ceiling() {
        let backend = Arc::new(FakeBackend::default());
        let config = SchedulerConfig {
            max_parallel: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(config, backend.clone());
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(scheduler.submit(spec("gpt"), "p", None, false).await.expect("submit").run_id);
        }

        for round in 0..6 {
            scheduler.tick().await;
            let health = scheduler.health().await;
            assert!(health.running <= 2, "round {} had {} running", round, health.running);
            for id in &ids {
                let launched = backend.runs.lock().expect("runs lock").contains_key(id);
                if launched {
                    backend.finish(id, 0);
                }
            }
        }
        assert_eq!(backend.launched(), 5);
        let done = scheduler.list(Some(RunStatus::Done), 0).await;
        assert_eq!(done.len(), 5);
    }

    #[tokio::test]
    async fn approval_gate_holds_until_approved() {
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_with(SchedulerConfig::default(), backend.clone());
        let submitted = scheduler.submit(spec("gpt"), "p", None, true).await.expect("submit");
        assert_eq!(submitted.status, RunStatus::AwaitingApproval);
        assert!(submitted.approval_required);

        scheduler.tick().await;
        assert_eq!(backend.launched(), 0);
        assert_eq!(scheduler.approvals().await.len(), 1);

        assert!(scheduler.approve(&submitted.run_id).await);
        assert!(!scheduler.approve(&submitted.run_id).await);
        scheduler.tick().await;
        assert_eq!(backend.launched(), 1);
        assert!(!scheduler.approve(&submitted.run_id).await);
    }

    #[tokio::test]
    async fn policy_match_requires_approval() {
        let backend = Arc::new(FakeBackend::default());
        let mut config = SchedulerConfig::default();
        config.approval.agents = vec!["codex".to_string()];
        let scheduler = scheduler_with(config, backend);
        let submitted = scheduler.submit(spec("gpt"), "p", None, false).await.expect("submit");
        assert_eq!(submitted.status, RunStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn cancel_before_approval_never_launches() {
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_with(SchedulerConfig::default(), backend.clone());
        let submitted = scheduler.submit(spec("gpt"), "p", None, true).await.expect("submit");

        let response = scheduler.cancel(&submitted.run_id, false).await.expect("cancel");
        assert_eq!(response.status, CancelStatus::Canceled);
        scheduler.tick().await;

        assert_eq!(backend.launched(), 0);
        let view = scheduler.status(&submitted.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Canceled);
        assert!(!scheduler.approve(&submitted.run_id).await);
    }

    #[tokio::test]
    async fn reject_moves_pending_items_to_completed() {
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_with(SchedulerConfig::default(), backend);
        let submitted = scheduler.submit(spec("gpt"), "p", None, true).await.expect("submit");
        assert!(scheduler.reject(&submitted.run_id).await);
        assert!(!scheduler.reject(&submitted.run_id).await);
        let view = scheduler.status(&submitted.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Rejected);
    }

    #[tokio::test]
    async fn unknown_cancel_is_not_found_without_side_effects() {
        let backend = Arc::new(FakeBackend::default());
        let scheduler = scheduler_with(SchedulerConfig::default(), backend.clone());
        let response = scheduler.cancel("run-0-dead", true).await.expect("cancel");
        assert_eq!(response.status, CancelStatus::NotFound);
        assert!(backend.canceled.lock().expect("canceled lock").is_empty());
        let health = scheduler.health().await;
        assert_eq!(health.completed, 0);
        assert!(matches!(
            scheduler.status("run-0-dead", 0).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mode_change_cancels_pending_work() {
        let backend = Arc::new(FakeBackend::default());
        let mut config = SchedulerConfig::default();
        config.queue.on_mode_change = ModeChangePolicy::CancelPending;
        let scheduler = scheduler_with(config, backend);

        let first = scheduler.submit(spec("gpt"), "p", None, false).await.expect("first");
        let same = scheduler.submit(spec("gpt"), "p", None, false).await.expect("same mode");
        assert_eq!(first.mode_hash, same.mode_hash);
        assert_eq!(scheduler.list(Some(RunStatus::Queued), 0).await.len(), 2);

        let second = scheduler.submit(spec("other"), "p", None, false).await.expect("second");
        assert_ne!(first.mode_hash, second.mode_hash);

        let view = scheduler.status(&first.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Canceled);
        assert_eq!(view.error.as_deref(), Some(MODE_CHANGED_ERROR));
        let queued = scheduler.list(Some(RunStatus::Queued), 0).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].run_id, second.run_id);
    }

    #[tokio::test]
    async fn cancel_running_policy_signals_running_runs() {
        let backend = Arc::new(FakeBackend::default());
        let mut config = SchedulerConfig::default();
        config.queue.on_mode_change = ModeChangePolicy::CancelRunning;
        let scheduler = scheduler_with(config, backend.clone());

        let first = scheduler.submit(spec("gpt"), "p", None, false).await.expect("first");
        scheduler.tick().await;
        scheduler.submit(spec("other"), "p", Some("v2"), false).await.expect("second");
        assert_eq!(
            backend.canceled.lock().expect("canceled lock").as_slice(),
            &[first.run_id.clone()]
        );

        backend.finish(&first.run_id, 143);
        scheduler.tick().await;
        let view = scheduler.status(&first.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Canceled);
        assert_eq!(view.error.as_deref(), Some(MODE_CHANGED_ERROR));
    }

    #[tokio::test]
    async fn launch_failure_becomes_error_item() {
        let backend = Arc::new(FakeBackend {
            fail_launch: true,
            ..FakeBackend::default()
        });
        let scheduler = scheduler_with(SchedulerConfig::default(), backend);
        let submitted = scheduler.submit(spec("gpt"), "p", None, false).await.expect("submit");
        let summary = scheduler.tick().await;
        assert_eq!(
            summary,
            TickSummary {
                reconciled: 0,
                launched: 0,
                launch_failures: 1
            }
        );
        let view = scheduler.status(&submitted.run_id, 0).await.expect("status");
        assert_eq!(view.status, RunStatus::Error);
        assert!(view.error.as_deref().unwrap_or_default().starts_with("MISSING_EXECUTABLE"));
    }

    #[tokio::test]
    async fn slow_launch_does_not_hold_the_state_lock() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let backend = Arc::new(FakeBackend {
            gate: Some(gate.clone()),
            ..FakeBackend::default()
        });
        let scheduler = scheduler_with(SchedulerConfig::default(), backend.clone());
        let first = scheduler.submit(spec("gpt"), "p", None, false).await.expect("submit");

        let ticking = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.tick().await })
        };
        for _ in 0..100 {
            if !scheduler.list(Some(RunStatus::Running), 0).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let health = tokio::time::timeout(Duration::from_secs(1), scheduler.health())
            .await
            .expect("health answers while a launch is in flight");
        assert_eq!(health.running, 1);
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.submit(spec("gpt"), "p", None, false),
        )
        .await
        .expect("submit answers while a launch is in flight")
        .expect("submit");
        assert_eq!(second.status, RunStatus::Queued);

        let canceled = scheduler.cancel(&first.run_id, true).await.expect("cancel");
        assert_eq!(canceled.status, CancelStatus::Canceled);
        assert!(backend.canceled.lock().expect("canceled lock").is_empty());

        gate.notify_one();
        let summary = ticking.await.expect("tick task");
        assert_eq!(summary.launched, 1);
        assert_eq!(
            *backend.canceled.lock().expect("canceled lock"),
            vec![first.run_id.clone()]
        );
    }

    #[tokio::test]
    async fn detached_retry_is_rejected_at_submit() {
        let scheduler = scheduler_with(SchedulerConfig::default(), Arc::new(FakeBackend::default()));
        let mut retrying = spec("gpt");
        retrying.retry = 2;
        assert!(matches!(
            scheduler.submit(retrying, "p", None, false).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(scheduler.list(None, 0).await.is_empty());
    }

    #[tokio::test]
    async fn empty_prompt_or_command_is_rejected() {
        let scheduler = scheduler_with(SchedulerConfig::default(), Arc::new(FakeBackend::default()));
        assert!(matches!(
            scheduler.submit(spec("gpt"), "  ", None, false).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            scheduler.submit(CommandSpec::default(), "p", None, false).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn completed_ring_is_bounded() {
        let scheduler = scheduler_with(SchedulerConfig::default(), Arc::new(FakeBackend::default()));
        for _ in 0..(COMPLETED_CAP + 5) {
            let submitted = scheduler.submit(spec("gpt"), "p", None, true).await.expect("submit");
            scheduler.reject(&submitted.run_id).await;
        }
        let health = scheduler.health().await;
        assert_eq!(health.completed, COMPLETED_CAP);
        assert_eq!(scheduler.list(None, 10).await.len(), 10);
    }

    #[tokio::test]
    async fn started_loop_drives_runs_until_shutdown() {
        let backend = Arc::new(FakeBackend::default());
        let config = SchedulerConfig {
            tick_interval_ms: 20,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(config, backend.clone());
        scheduler.start().await;

        let submitted = scheduler.submit(spec("gpt"), "p", None, false).await.expect("submit");
        let view = scheduler
            .wait(&submitted.run_id, std::time::Duration::from_millis(300), 0)
            .await
            .expect("wait");
        assert_eq!(view.status, RunStatus::Running);

        backend.finish(&submitted.run_id, 0);
        let view = scheduler
            .wait(&submitted.run_id, std::time::Duration::from_secs(5), 0)
            .await
            .expect("wait");
        assert_eq!(view.status, RunStatus::Done);
        scheduler.shutdown().await;
    }
}
