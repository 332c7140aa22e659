use conductor_runtime_lib::config::{ActivationMode, SchedulerConfig};
use conductor_runtime_lib::models::{CommandSpec, RunStatus, RunView, DEFAULT_TAIL_BYTES};
use conductor_runtime_lib::{RuntimeCore, RuntimeOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("mock-agent.sh")
}

fn agent_spec(mode: &[&str]) -> CommandSpec {
    let mut args = vec![fixture().to_string_lossy().to_string()];
    args.extend(mode.iter().map(|arg| arg.to_string()));
    let mut spec = CommandSpec::new("sh", args);
    spec.agent = "mock".to_string();
    spec.role = "oracle".to_string();
    spec.idle_timeout_ms = 5_000;
    spec
}

fn core(dir: &tempfile::TempDir) -> Arc<RuntimeCore> {
    RuntimeCore::new(RuntimeOptions {
        root: Some(dir.path().join("home")),
        scheduler: SchedulerConfig::default(),
        activation: ActivationMode::Embedded,
        redact_prompts: true,
        project_dir: None,
    })
    .expect("runtime core")
}

async fn tick_until_settled(core: &RuntimeCore, run_id: &str) -> RunView {
    for _ in 0..100 {
        core.scheduler().tick().await;
        let view = core
            .scheduler()
            .status(run_id, DEFAULT_TAIL_BYTES)
            .await
            .expect("status");
        if !view.status.is_pending() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {} never settled", run_id);
}

#[test]
fn fixture_script_exists() {
    assert!(fixture().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn queued_run_goes_running_then_done() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);

    let submitted = core
        .scheduler()
        .submit(agent_spec(&["answer"]), "summarize the repo", None, false)
        .await
        .expect("submit");
    assert_eq!(submitted.status, RunStatus::Queued);

    let summary = core.scheduler().tick().await;
    assert_eq!(summary.launched, 1);
    let meta = core.paths().run_dir(&submitted.run_id).join("meta.json");
    assert!(meta.exists());

    let view = tick_until_settled(&core, &submitted.run_id).await;
    assert_eq!(view.status, RunStatus::Done);
    assert_eq!(view.exit_code, Some(0));
    assert_eq!(view.stdout.as_deref(), Some("final result from mock-agent"));
    assert_eq!(view.stderr.as_deref(), Some("progress: thinking"));
}

#[cfg(unix)]
#[tokio::test]
async fn failing_run_is_reported_as_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let submitted = core
        .scheduler()
        .submit(agent_spec(&["fail", "3"]), "p", None, false)
        .await
        .expect("submit");

    let view = tick_until_settled(&core, &submitted.run_id).await;
    assert_eq!(view.status, RunStatus::Error);
    assert_eq!(view.exit_code, Some(3));
    assert_eq!(view.error.as_deref(), Some("exit status 3"));
}

#[cfg(unix)]
#[tokio::test]
async fn cancel_before_approval_never_launches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let submitted = core
        .scheduler()
        .submit(agent_spec(&["answer"]), "p", None, true)
        .await
        .expect("submit");
    assert_eq!(submitted.status, RunStatus::AwaitingApproval);

    let canceled = core
        .scheduler()
        .cancel(&submitted.run_id, false)
        .await
        .expect("cancel");
    assert_eq!(
        canceled.status,
        conductor_runtime_lib::models::CancelStatus::Canceled
    );
    core.scheduler().tick().await;

    let view = core
        .scheduler()
        .status(&submitted.run_id, 0)
        .await
        .expect("status");
    assert_eq!(view.status, RunStatus::Canceled);
    assert!(!core.paths().run_dir(&submitted.run_id).exists());
}

#[cfg(unix)]
#[tokio::test]
async fn running_run_can_be_canceled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let submitted = core
        .scheduler()
        .submit(agent_spec(&["sleep", "30"]), "p", None, false)
        .await
        .expect("submit");
    core.scheduler().tick().await;

    let canceled = core
        .scheduler()
        .cancel(&submitted.run_id, true)
        .await
        .expect("cancel");
    assert_eq!(
        canceled.status,
        conductor_runtime_lib::models::CancelStatus::Canceled
    );

    let view = tick_until_settled(&core, &submitted.run_id).await;
    assert_eq!(view.status, RunStatus::Canceled);
}

#[cfg(unix)]
#[tokio::test]
async fn detached_run_resolves_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launched = {
        let first = core(&dir);
        first
            .launcher()
            .launch(&agent_spec(&["answer"]), "p")
            .await
            .expect("launch")
    };

    let restarted = core(&dir);
    let snapshot = restarted
        .registry()
        .wait(&launched.run_id, Duration::from_secs(10), 4_000)
        .await
        .expect("wait");
    assert!(!snapshot.is_running());
    assert_eq!(snapshot.stdout, "final result from mock-agent");

    let view = restarted
        .scheduler()
        .status(&launched.run_id, 100)
        .await
        .expect("status via registry");
    assert_eq!(view.status, RunStatus::Done);
}

#[cfg(unix)]
#[tokio::test]
async fn idle_runner_separates_chatty_from_silent() {
    use conductor_runtime_lib::errors::AppError;
    use conductor_runtime_lib::process::idle;

    let chatty = vec![fixture().to_string_lossy().to_string(), "chatty".to_string()];
    let output = idle::run("sh", &chatty, Duration::from_millis(200))
        .await
        .expect("chatty agent should finish");
    assert!(output.starts_with("tick 0"));
    assert!(output.ends_with("tick 7"));

    let silent = vec![
        fixture().to_string_lossy().to_string(),
        "silent".to_string(),
        "0.3".to_string(),
    ];
    let error = idle::run("sh", &silent, Duration::from_millis(200))
        .await
        .expect_err("silent agent should idle out");
    assert!(matches!(error, AppError::IdleTimeout(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn synchronous_run_feeds_history_and_memory() {
    use conductor_runtime_lib::memory::prompt::{apply_shared_memory, remember_output};
    use conductor_runtime_lib::models::{HistoryQuery, HistoryStatus};

    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let result = core
        .runner()
        .run(&agent_spec(&["answer"]), "what changed?")
        .await
        .expect("sync run");
    assert_eq!(result.status, HistoryStatus::Ok);

    let records = core
        .history()
        .query(&HistoryQuery {
            role: Some("oracle".to_string()),
            ..HistoryQuery::default()
        })
        .expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, result.run_id);

    remember_output(core.memory(), &result.agent, &result.role, &result.stdout);
    let prompt = apply_shared_memory(core.memory(), "next step");
    assert!(prompt.contains("[role:oracle]\nfinal result from mock-agent\n[/role]"));
    assert!(prompt.ends_with("next step"));

    let view = core
        .scheduler()
        .status(&result.run_id, 0)
        .await
        .expect("status via history");
    assert_eq!(view.status, RunStatus::Done);
}
