//! Built-in capabilities shipped with the CLI

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use super::{Capability, Context, StepResult};

/// Every built-in capability, in registration order
pub fn all() -> Vec<Arc<dyn Capability>> {
    vec![
        Arc::new(EchoCapability),
        Arc::new(SleepCapability),
        Arc::new(ShellCapability::default()),
    ]
}

/// Returns its input as result details
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns its input unchanged as result details. Useful for seeding context values."
    }

    async fn execute(&self, context: Context) -> Result<StepResult> {
        let keys = context.len();
        Ok(StepResult::success("echo", format!("Echoed {} value(s)", keys)).with_details(context))
    }
}

pub struct SleepCapability;

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

#[async_trait]
impl Capability for SleepCapability {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Waits for `ms` milliseconds, then succeeds."
    }

    fn can_handle(&self, context: &Context) -> bool {
        context.get("ms").map(|v| v.is_u64()).unwrap_or(false)
    }

    async fn execute(&self, context: Context) -> Result<StepResult> {
        let params: SleepParams = serde_json::from_value(serde_json::Value::Object(context))
            .context("Invalid parameters for sleep")?;

        tokio::time::sleep(Duration::from_millis(params.ms)).await;

        Ok(StepResult::success("sleep", format!("Slept {}ms", params.ms))
            .with_detail("slept_ms", params.ms))
    }
}

/// Runs a shell command. Always gated behind approval.
pub struct ShellCapability {
    timeout: Duration,
}

impl ShellCapability {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellCapability {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
}

#[async_trait]
impl Capability for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Runs `command` with `sh -c` and records stdout, stderr and the exit code. Requires approval."
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn can_handle(&self, context: &Context) -> bool {
        context.get("command").map(|v| v.is_string()).unwrap_or(false)
    }

    async fn execute(&self, context: Context) -> Result<StepResult> {
        let params: ShellParams = serde_json::from_value(serde_json::Value::Object(context))
            .context("Invalid parameters for shell")?;

        tracing::debug!(command = %params.command, "running shell capability");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&params.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("Command timed out after {:?}", self.timeout))?
            .context("Failed to spawn command")?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let result = if output.status.success() {
            StepResult::success("shell", format!("`{}` exited with 0", params.command))
        } else {
            StepResult::failure(
                "shell",
                format!("`{}` exited with {}: {}", params.command, exit_code, stderr.trim()),
            )
        };

        Ok(result
            .with_detail("exit_code", exit_code)
            .with_detail("stdout", stdout)
            .with_detail("stderr", stderr))
    }
}
