//! Execution backend contract and the command backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use taskmesh_core::{Directive, ExecutionOutcome, WorkerId, WorkerSpec};

use crate::config::ExecutorConfig;
use crate::error::{CoordinatorError, Result};

/// Runs the actual work for a worker.
///
/// `launch` must return once the work has started; the backend then
/// heartbeats and reports the outcome through the [`WorkerContext`].
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn launch(&self, spec: WorkerSpec, ctx: WorkerContext) -> Result<()>;
}

/// Receiver of worker heartbeats and outcomes (the pool manager).
#[async_trait]
pub trait WorkerReporter: Send + Sync {
    async fn heartbeat(&self, worker_id: &WorkerId, tokens_used: u64) -> Result<Directive>;

    async fn complete(&self, worker_id: &WorkerId, outcome: ExecutionOutcome) -> Result<()>;
}

/// Handle a running worker uses to check in.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: WorkerId,
    reporter: Arc<dyn WorkerReporter>,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerId, reporter: Arc<dyn WorkerReporter>) -> Self {
        Self { worker_id, reporter }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Report progress. `Directive::Cancel` asks the worker to stop at this
    /// checkpoint.
    pub async fn heartbeat(&self, tokens_used: u64) -> Result<Directive> {
        self.reporter.heartbeat(&self.worker_id, tokens_used).await
    }

    /// Report the terminal outcome.
    pub async fn complete(&self, outcome: ExecutionOutcome) -> Result<()> {
        self.reporter.complete(&self.worker_id, outcome).await
    }
}

/// Backend for processes that never spawn workers (operator commands).
#[derive(Debug, Clone, Default)]
pub struct NullBackend;

#[async_trait]
impl ExecutionBackend for NullBackend {
    async fn launch(&self, spec: WorkerSpec, _ctx: WorkerContext) -> Result<()> {
        Err(CoordinatorError::Backend(format!(
            "no execution backend configured for worker {}",
            spec.worker_id
        )))
    }
}

const STDOUT_GRACE: Duration = Duration::from_secs(2);

/// Runs each worker as a shell command.
///
/// The worker spec is passed both as environment variables and as JSON on
/// stdin. Any stdout line of the form `{"tokens_used":N,...}` updates the
/// usage reported in heartbeats; the last stdout line is the result. On a
/// cancel directive the file named by `TASKMESH_CANCEL_FILE` is created; the
/// process is killed only when its deadline passes.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    shell: String,
    command: String,
    working_dir: Option<PathBuf>,
    heartbeat_interval: Duration,
}

impl CommandBackend {
    pub fn new(config: &ExecutorConfig, heartbeat_interval: Duration) -> Result<Self> {
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CoordinatorError::Config("executor.command is not set".into()))?;
        Ok(Self {
            shell: config.shell.clone(),
            command,
            working_dir: config.working_dir.clone(),
            heartbeat_interval,
        })
    }

    fn cancel_file(worker_id: &WorkerId) -> PathBuf {
        std::env::temp_dir().join(format!("taskmesh-cancel-{worker_id}"))
    }
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    async fn launch(&self, spec: WorkerSpec, ctx: WorkerContext) -> Result<()> {
        let cancel_file = Self::cancel_file(&spec.worker_id);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .env("TASKMESH_WORKER_ID", spec.worker_id.as_str())
            .env("WORKER_TYPE", &spec.worker_type)
            .env("TASK_ID", spec.task_id.as_str())
            .env("TOKEN_BUDGET", spec.token_budget.to_string())
            .env("TASKMESH_DEADLINE", spec.deadline.to_rfc3339())
            .env("TASKMESH_CANCEL_FILE", &cancel_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(worker_id = %spec.worker_id, error = %e, "Failed to spawn worker process");
            CoordinatorError::backend_io("spawn failed", e)
        })?;
        info!(worker_id = %spec.worker_id, task_id = %spec.task_id, pid = ?child.id(), "Worker process spawned");

        let input = serde_json::to_vec(&spec)?;
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Worker closed stdin early");
                }
            });
        }

        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let outcome = supervise(child, &spec, &ctx, interval, &cancel_file).await;
            let _ = tokio::fs::remove_file(&cancel_file).await;
            if let Err(e) = ctx.complete(outcome).await {
                error!(worker_id = %spec.worker_id, error = %e, "Failed to report worker outcome");
            }
        });
        Ok(())
    }
}

/// Wait for the process while heartbeating; kill it at the deadline.
async fn supervise(
    mut child: Child,
    spec: &WorkerSpec,
    ctx: &WorkerContext,
    interval: Duration,
    cancel_file: &Path,
) -> ExecutionOutcome {
    let tokens = Arc::new(AtomicU64::new(0));

    let stdout_task = child.stdout.take().map(|stdout| {
        let tokens = tokens.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(n) = tokens_used(trimmed) {
                    tokens.fetch_max(n, Ordering::SeqCst);
                }
                last = Some(trimmed.to_string());
            }
            last
        })
    });

    if let Some(stderr) = child.stderr.take() {
        let worker_id = spec.worker_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    debug!(worker_id = %worker_id, stderr = %line.trim(), "Worker stderr");
                }
            }
        });
    }

    let until_deadline = (spec.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let deadline = tokio::time::sleep(until_deadline);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    let mut killed = false;
    let mut cancel_signalled = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = ticker.tick() => {
                match ctx.heartbeat(tokens.load(Ordering::SeqCst)).await {
                    Ok(Directive::Cancel) if !cancel_signalled => {
                        info!(worker_id = %spec.worker_id, "Cancellation requested, signalling worker");
                        if let Err(e) = tokio::fs::write(cancel_file, b"cancel").await {
                            warn!(worker_id = %spec.worker_id, error = %e, "Failed to write cancel file");
                        }
                        cancel_signalled = true;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(worker_id = %spec.worker_id, error = %e, "Heartbeat failed"),
                }
            }
            _ = &mut deadline, if !killed => {
                warn!(worker_id = %spec.worker_id, "Worker deadline passed, killing process");
                if let Err(e) = child.start_kill() {
                    warn!(worker_id = %spec.worker_id, error = %e, "Failed to kill worker process");
                }
                killed = true;
            }
        }
    };

    // Children of a killed shell may keep stdout open.
    let last_line = match stdout_task {
        Some(handle) => tokio::time::timeout(STDOUT_GRACE, handle)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .flatten(),
        None => None,
    };
    let used = tokens.load(Ordering::SeqCst);

    match status {
        _ if killed => ExecutionOutcome::failed(used, "deadline exceeded"),
        Ok(status) if status.success() => {
            let result = last_line
                .as_deref()
                .and_then(|l| serde_json::from_str::<Value>(l).ok())
                .unwrap_or_else(|| json!({ "output": last_line }));
            ExecutionOutcome::completed(used, result)
        }
        Ok(status) => ExecutionOutcome::failed(
            used,
            format!("worker exited with code {}", status.code().unwrap_or(-1)),
        ),
        Err(e) => ExecutionOutcome::failed(used, format!("wait failed: {e}")),
    }
}

/// `tokens_used` from a JSON object line.
fn tokens_used(line: &str) -> Option<u64> {
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Value>(line)
        .ok()?
        .get("tokens_used")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::{OutcomeStatus, TaskId};
    use tokio::sync::{mpsc, Mutex};

    struct Recorder {
        beats: Mutex<Vec<u64>>,
        done: mpsc::UnboundedSender<ExecutionOutcome>,
        directive: Directive,
    }

    #[async_trait]
    impl WorkerReporter for Recorder {
        async fn heartbeat(&self, _worker_id: &WorkerId, tokens_used: u64) -> Result<Directive> {
            self.beats.lock().await.push(tokens_used);
            Ok(self.directive)
        }

        async fn complete(&self, _worker_id: &WorkerId, outcome: ExecutionOutcome) -> Result<()> {
            let _ = self.done.send(outcome);
            Ok(())
        }
    }

    fn spec(deadline_secs: i64) -> WorkerSpec {
        WorkerSpec {
            worker_id: WorkerId::generate(),
            worker_type: "development".into(),
            task_id: TaskId::new("t-1"),
            token_budget: 8000,
            deadline: Utc::now() + chrono::Duration::seconds(deadline_secs),
            deliverables: vec![],
            description: "fix the bug".into(),
            collaborating_classes: vec![],
        }
    }

    async fn run(command: &str, deadline_secs: i64, directive: Directive) -> (ExecutionOutcome, Arc<Recorder>) {
        let backend = CommandBackend::new(
            &ExecutorConfig {
                command: Some(command.to_string()),
                ..Default::default()
            },
            Duration::from_millis(50),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            beats: Mutex::new(Vec::new()),
            done: tx,
            directive,
        });
        let spec = spec(deadline_secs);
        let ctx = WorkerContext::new(spec.worker_id.clone(), recorder.clone());
        backend.launch(spec, ctx).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        (outcome, recorder)
    }

    #[tokio::test]
    async fn test_reads_tokens_from_last_line() {
        let (outcome, _) = run(r#"printf '{"tokens_used":%s}\n' "$TOKEN_BUDGET""#, 30, Directive::Continue).await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.tokens_used, 8000);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let (outcome, _) = run(r#"echo '{"tokens_used":12}'; exit 3"#, 30, Directive::Continue).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.tokens_used, 12);
        assert!(outcome.error.unwrap().contains("3"));
    }

    #[tokio::test]
    async fn test_heartbeats_while_running() {
        let (_, recorder) = run("sleep 0.3; echo done", 30, Directive::Continue).await;
        assert!(!recorder.beats.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_signalled_through_file() {
        let cmd = r#"while [ ! -f "$TASKMESH_CANCEL_FILE" ]; do sleep 0.05; done; echo '{"tokens_used":5,"cancelled":true}'"#;
        let (outcome, _) = run(cmd, 30, Directive::Cancel).await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.result.unwrap()["cancelled"], json!(true));
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let (outcome, _) = run("sleep 30", 1, Directive::Continue).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_missing_command_is_config_error() {
        let err = CommandBackend::new(&ExecutorConfig::default(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }
}
