//! Shell-command readiness checks and re-run steps
//!
//! Used by the CLI: the command's exit status decides readiness (0 = ready)
//! or step success. The item id and context labels are exported as
//! `STAGEGATE_ITEM_ID` and `STAGEGATE_CTX_<LABEL>` environment variables.

use super::agent::{ReadinessCheck, RerunStep};
use super::item::RetryableWorkItem;
use crate::error::{CoordinationError, CoordinationResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Default bound on one command run.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub name: String,
    pub command: String,
    pub timeout: Duration,
}

impl ShellCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Blocking wrapper around [`execute_async`](Self::execute_async).
    ///
    /// Runs on the ambient runtime when called from a blocking-pool thread,
    /// otherwise on a private current-thread runtime. Async callers must use
    /// `execute_async` directly.
    pub fn execute(&self, item: &RetryableWorkItem) -> CoordinationResult<bool> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(self.execute_async(item)),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| CoordinationError::Upstream(format!("failed to start runtime for {}: {}", self.name, e)))?;
                runtime.block_on(self.execute_async(item))
            }
        }
    }

    /// Run the command for `item`. `Ok(true)` on exit status 0, `Ok(false)`
    /// on any other exit status; timeouts and spawn failures are errors.
    /// A command that outlives the timeout is killed.
    pub async fn execute_async(&self, item: &RetryableWorkItem) -> CoordinationResult<bool> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("STAGEGATE_ITEM_ID", &item.item_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (label, value) in &item.context {
            cmd.env(format!("STAGEGATE_CTX_{}", env_suffix(label)), value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CoordinationError::Upstream(format!("failed to start {}: {}", self.name, e)))?;

        match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) => Err(CoordinationError::Upstream(format!(
                "failed to wait for {}: {}",
                self.name, e
            ))),
            Err(_) => {
                // The child may have exited in between; kill_on_drop covers
                // a kill that fails here.
                if let Err(e) = child.kill().await {
                    tracing::debug!(command = %self.name, error = %e, "kill after timeout failed");
                }
                Err(CoordinationError::Upstream(format!(
                    "{} timed out after {:?}",
                    self.name, self.timeout
                )))
            }
        }
    }
}

fn env_suffix(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

impl ReadinessCheck for ShellCommand {
    fn is_ready(&self, item: &RetryableWorkItem) -> CoordinationResult<bool> {
        self.execute(item)
    }
}

impl RerunStep for ShellCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, item: &RetryableWorkItem) -> CoordinationResult<()> {
        if self.execute(item)? {
            Ok(())
        } else {
            Err(CoordinationError::Upstream(format!("{} exited with failure", self.name)))
        }
    }
}
