//! Local process executor.
//!
//! Runs a build's script with `sh -c` in a per-build workspace directory,
//! streams stdout and stderr line by line into the log store, and reports
//! exactly one outcome per start through the outcome sink.

use async_trait::async_trait;
use dashmap::DashMap;
use kiln_core::build::{BuildOutcome, BuildRequest};
use kiln_core::ids::BuildId;
use kiln_core::ports::{BuildExecutor, ExecutionHandle, LogStore, OutcomeReport, OutcomeSink};
use kiln_core::slot::SlotHandle;
use kiln_core::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Process executor configuration.
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Parent directory of per-build workspaces.
    pub workspace_root: PathBuf,
    pub shell: String,
    /// Local kill deadline, independent of the scheduler watchdog.
    pub timeout_secs: Option<u64>,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("kiln").join("workspaces"),
            shell: "sh".to_string(),
            timeout_secs: None,
        }
    }
}

impl ProcessExecutorConfig {
    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

enum Ended {
    Exited(Option<i32>),
    Cancelled,
    TimedOut,
}

/// Runs builds as local shell processes.
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    log_store: Arc<dyn LogStore>,
    running: Arc<DashMap<(BuildId, u32), watch::Sender<bool>>>,
}

impl ProcessExecutor {
    pub fn new(config: ProcessExecutorConfig, log_store: Arc<dyn LogStore>) -> Self {
        Self {
            config,
            log_store,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Number of executions that have not reported yet.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl BuildExecutor for ProcessExecutor {
    async fn start(
        &self,
        slot: &SlotHandle,
        request: &BuildRequest,
        dispatch_seq: u32,
        sink: OutcomeSink,
    ) -> Result<ExecutionHandle> {
        let build_id = request.id;
        let script = request.source.script.as_deref().ok_or_else(|| {
            Error::ExecutorStartFailure(format!("build {build_id} has no script"))
        })?;

        let workspace = self.config.workspace_root.join(build_id.to_string());
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            Error::ExecutorStartFailure(format!("Failed to create workspace: {}", e))
        })?;

        info!(build_id = %build_id, node = %slot.node, workspace = %workspace.display(), "Spawning build process");

        let mut child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(script)
            .current_dir(&workspace)
            .env("KILN_BUILD_ID", build_id.to_string())
            .env("KILN_NODE", &slot.node)
            .env("KILN_GPU_ARCH", &slot.gpu_arch)
            .env("KILN_GPU_COUNT", request.profile.gpu_count.to_string())
            .env("KILN_REPOSITORY", &request.source.repository)
            .env("KILN_GIT_REF", &request.source.git_ref)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExecutorStartFailure(format!("Failed to spawn process: {}", e)))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ExecutorStartFailure("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ExecutorStartFailure("stderr not captured".to_string()))?;

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.running.insert((build_id, dispatch_seq), cancel_tx);

        let stdout_handle = tokio::spawn(stream_lines(
            stdout,
            build_id,
            dispatch_seq,
            Arc::clone(&self.log_store),
        ));
        let stderr_handle = tokio::spawn(stream_lines(
            stderr,
            build_id,
            dispatch_seq,
            Arc::clone(&self.log_store),
        ));

        let running = Arc::clone(&self.running);
        let timeout = self.config.timeout_secs.map(Duration::from_secs);

        tokio::spawn(async move {
            let ended = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => Ended::Exited(status.code()),
                    Err(e) => {
                        error!(build_id = %build_id, error = %e, "Failed to wait for process");
                        Ended::Exited(None)
                    }
                },
                _ = cancelled(&mut cancel_rx) => Ended::Cancelled,
                _ = deadline(timeout) => Ended::TimedOut,
            };

            if matches!(ended, Ended::Cancelled | Ended::TimedOut) {
                if let Err(e) = child.kill().await {
                    warn!(build_id = %build_id, error = %e, "Failed to kill process");
                }
                // Grandchildren may still hold the pipes open
                stdout_handle.abort();
                stderr_handle.abort();
            } else {
                // Wait for output streaming to complete
                let _ = stdout_handle.await;
                let _ = stderr_handle.await;
            }
            running.remove(&(build_id, dispatch_seq));

            let (outcome, exit_code) = match ended {
                Ended::Exited(Some(0)) => (BuildOutcome::Succeeded, Some(0)),
                Ended::Exited(code) => (BuildOutcome::Failed, code),
                Ended::Cancelled => (BuildOutcome::Cancelled, None),
                Ended::TimedOut => (BuildOutcome::TimedOut, None),
            };
            debug!(build_id = %build_id, outcome = ?outcome, exit_code = ?exit_code, "Process finished");

            let report = OutcomeReport {
                build_id,
                dispatch_seq,
                outcome,
                exit_code,
            };
            if let Err(e) = sink.report(report) {
                warn!(build_id = %build_id, error = %e, "Outcome dropped");
            }
        });

        Ok(ExecutionHandle {
            build_id,
            slot_id: slot.slot_id,
            dispatch_seq,
            reference: pid.map(|p| p.to_string()),
        })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        match self.running.get(&(handle.build_id, handle.dispatch_seq)) {
            Some(tx) => {
                info!(build_id = %handle.build_id, "Cancelling build process");
                let _ = tx.send(true);
            }
            None => debug!(build_id = %handle.build_id, "Cancel for finished process ignored"),
        }
        Ok(())
    }
}

async fn stream_lines<R>(reader: R, build_id: BuildId, attempt: u32, log_store: Arc<dyn LogStore>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let chunk = format!("{line}\n");
        if let Err(e) = log_store.append_chunk(build_id, attempt, chunk.as_bytes()).await {
            warn!(build_id = %build_id, error = %e, "Failed to store log line");
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancel| *cancel).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
