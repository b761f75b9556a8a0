//! otto-agent: process-backed agent dispatcher.
//!
//! Runs the configured agent command once per dispatched run. The
//! child's exit status becomes the run outcome and the trimmed tail of
//! its stdout becomes the summary; lifecycle transitions are reported
//! on the status channel the dispatcher is constructed with.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use otto_config::AgentConfig;
use otto_scheduler::AgentDispatcher;
use otto_types::{AgentStatus, CompletedRun, DispatchOptions, StatusChange};

/// Maximum characters of stdout kept as a run summary.
const MAX_SUMMARY_CHARS: usize = 2_000;

/// Completed-run entries retained for later lookup.
const COMPLETED_CAP: usize = 100;

/// [`AgentDispatcher`] that spawns one agent process per run.
pub struct ProcessDispatcher {
    config: AgentConfig,
    status_tx: mpsc::Sender<StatusChange>,
    kill_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    completed: Arc<Mutex<Vec<CompletedRun>>>,
}

impl ProcessDispatcher {
    pub fn new(config: AgentConfig, status_tx: mpsc::Sender<StatusChange>) -> Self {
        Self {
            config,
            status_tx,
            kill_tokens: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn build_command(&self, prompt: &str, options: &DispatchOptions) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if let Some(model) = options
            .model
            .as_deref()
            .or(self.config.default_model.as_deref())
        {
            cmd.arg("--model").arg(model);
        }
        if let Some(orchestrator) = options.orchestrator.as_deref() {
            cmd.arg("--orchestrator").arg(orchestrator);
        }
        if options.free_agent {
            cmd.arg("--free-agent");
        }
        cmd.arg(prompt);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentDispatcher for ProcessDispatcher {
    async fn run_quick(&self, prompt: &str, options: &DispatchOptions) -> anyhow::Result<String> {
        let agent_id = format!("agent-{}", Uuid::new_v4());
        let mut child = self
            .build_command(prompt, options)
            .spawn()
            .with_context(|| format!("failed to spawn agent command `{}`", self.config.command))?;
        debug!(agent = %agent_id, command = %self.config.command, "Agent run started");

        let token = CancellationToken::new();
        self.kill_tokens
            .lock()
            .await
            .insert(agent_id.clone(), token.clone());

        let status_tx = self.status_tx.clone();
        let completed = self.completed.clone();
        let kill_tokens = self.kill_tokens.clone();
        let id = agent_id.clone();
        tokio::spawn(async move {
            let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
            let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let stdout_text = stdout_task.await.unwrap_or_default();
            let stderr_text = stderr_task.await.unwrap_or_default();

            let (exit_code, success) = match status {
                Ok(status) => (status.code(), status.success()),
                Err(e) => {
                    warn!("Failed to reap agent {id}: {e}");
                    (None, false)
                }
            };
            if !success {
                if let Some(tail) = summarize(&stderr_text) {
                    warn!("Agent {id} stderr: {tail}");
                }
            }

            {
                let mut completed = completed.lock().await;
                completed.insert(
                    0,
                    CompletedRun {
                        id: id.clone(),
                        summary: summarize(&stdout_text),
                        exit_code,
                    },
                );
                completed.truncate(COMPLETED_CAP);
            }
            kill_tokens.lock().await.remove(&id);

            let status = if success {
                AgentStatus::Sleeping
            } else {
                AgentStatus::Error
            };
            let change = StatusChange {
                agent_id: id,
                status,
                prev_status: AgentStatus::Running,
            };
            if status_tx.send(change).await.is_err() {
                debug!("Status channel closed; dropping completion event");
            }
        });

        Ok(agent_id)
    }

    async fn list_completed(&self) -> Vec<CompletedRun> {
        self.completed.lock().await.clone()
    }

    async fn kill(&self, agent_id: &str) -> anyhow::Result<()> {
        let token = self.kill_tokens.lock().await.get(agent_id).cloned();
        match token {
            Some(token) => {
                info!("Killing agent {agent_id}");
                token.cancel();
                Ok(())
            }
            None => anyhow::bail!("no active run for agent {agent_id}"),
        }
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Trimmed tail of an agent's output, or None when it printed nothing.
fn summarize(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }
    let total = trimmed.chars().count();
    if total <= MAX_SUMMARY_CHARS {
        return Some(trimmed.to_string());
    }
    let tail: String = trimmed.chars().skip(total - MAX_SUMMARY_CHARS).collect();
    Some(format!("... {tail}"))
}
