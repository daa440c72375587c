//! Agent execution.
//!
//! The node hands every task to an [`AgentRunner`]. Library users implement
//! the trait (or wrap a closure with [`fn_runner`]); the binary ships
//! [`CommandRunner`], which pipes the prompt through an external program.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error returned by a runner; its text becomes the task's error.
pub type RunnerError = Box<dyn std::error::Error + Send + Sync>;

/// Executes a prompt on behalf of a named agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, agent_name: &str, prompt: &str) -> Result<String, RunnerError>;
}

/// Runner backed by an async closure.
pub struct FnRunner<F> {
    f: F,
}

/// Wrap `f(agent_name, prompt)` as a runner.
pub fn fn_runner<F, Fut>(f: F) -> FnRunner<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, RunnerError>> + Send,
{
    FnRunner { f }
}

#[async_trait]
impl<F, Fut> AgentRunner for FnRunner<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, RunnerError>> + Send,
{
    async fn run(&self, agent_name: &str, prompt: &str) -> Result<String, RunnerError> {
        (self.f)(agent_name.to_string(), prompt.to_string()).await
    }
}

/// Returns the prompt unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(&self, _agent_name: &str, prompt: &str) -> Result<String, RunnerError> {
        Ok(prompt.to_string())
    }
}

/// Runs `program [args..] <agent_name>` with the prompt on stdin and returns
/// its stdout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builder method to add arguments placed before the agent name.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn run(&self, agent_name: &str, prompt: &str) -> Result<String, RunnerError> {
        info!(
            program = %self.program.display(),
            agent = %agent_name,
            prompt_len = prompt.len(),
            "Running agent command"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(agent_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.program.display()))?;

        let mut stdin = child.stdin.take().ok_or("failed to open command stdin")?;
        let input = prompt.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            // Dropping stdin closes it so the program sees EOF.
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;
        if let Ok(Err(e)) = writer.await {
            debug!(error = %e, "Command closed stdin early");
        }

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            warn!(status = %output.status, stderr = %stderr, "Agent command failed");
            if stderr.is_empty() {
                Err(format!("command exited with {}", output.status).into())
            } else {
                Err(format!("command exited with {}: {stderr}", output.status).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_runner() {
        let runner = fn_runner(|agent, prompt| async move { Ok::<_, RunnerError>(format!("{agent}:{prompt}")) });
        assert_eq!(runner.run("coder", "hi").await.unwrap(), "coder:hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_pipes_prompt() {
        let runner = CommandRunner::new("sh").with_args(["-c", "cat; echo \" for $0\""]);
        let output = runner.run("coder", "hello").await.unwrap();
        assert_eq!(output, "hello for coder\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_reports_failure() {
        let runner = CommandRunner::new("sh").with_args(["-c", "echo broken >&2; exit 3"]);
        let err = runner.run("coder", "hello").await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = CommandRunner::new("/nonexistent/agentfleet-runner");
        let err = runner.run("coder", "hello").await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
