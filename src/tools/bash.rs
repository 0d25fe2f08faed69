use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::Duration;

use super::{require_str, ExecContext, ToolDef, ToolHandler};
use crate::error::ToolError;

/// Max lines of output to return inline. Rest is truncated.
const MAX_OUTPUT_LINES: usize = 500;

pub struct BashTool;

#[async_trait]
impl ToolHandler for BashTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "bash".to_string(),
            description: "Run a shell command. Returns stdout and stderr. Avoid interactive commands.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout_secs": { "type": "integer", "description": "Default: 30" }
                },
                "required": ["command"]
            }),
            read_only: false,
        }
    }

    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError> {
        let command = require_str("bash", args, "command")?;
        let timeout = Duration::from_secs(args["timeout_secs"].as_u64().unwrap_or(30));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The command runs in its own process group so a cancel can take
        // down the whole pipeline, not just the shell.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ToolError::new("bash", format!("failed to run '{command}': {e}")))?;
        let pid = child.id();

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| ToolError::new("bash", format!("failed to run '{command}': {e}")))?
            }
            _ = ctx.cancel.cancelled() => {
                kill_process_group(pid);
                return Ok("[cancelled — command terminated]".to_string());
            }
            _ = tokio::time::sleep(timeout) => {
                kill_process_group(pid);
                return Ok(format!(
                    "[exit code: -1]\n[timed out after {}s — command did not complete]",
                    timeout.as_secs()
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        let mut result = String::new();
        if exit_code != 0 {
            result.push_str(&format!("[exit code: {exit_code}]\n"));
        }

        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n[stderr]\n{stderr}")
        };

        let lines: Vec<&str> = combined.lines().collect();
        let total = lines.len();

        if total == 0 {
            result.push_str("[no output]");
        } else if total <= MAX_OUTPUT_LINES {
            result.push_str(&combined);
        } else {
            for line in &lines[..MAX_OUTPUT_LINES] {
                result.push_str(line);
                result.push('\n');
            }
            result.push_str(&format!(
                "[+{} lines truncated — use a more specific command to reduce output]",
                total - MAX_OUTPUT_LINES
            ));
        }

        Ok(result)
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: signalling a process group we spawned; ESRCH is harmless.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_stdout_captured() {
        let out = BashTool
            .execute(&json!({"command": "echo hello"}), &ExecContext::unrestricted())
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let out = BashTool
            .execute(&json!({"command": "exit 3"}), &ExecContext::unrestricted())
            .await
            .unwrap();
        assert!(out.starts_with("[exit code: 3]"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let out = BashTool
            .execute(
                &json!({"command": "sleep 30", "timeout_secs": 1}),
                &ExecContext::unrestricted(),
            )
            .await
            .unwrap();
        assert!(out.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_cancel_terminates_command() {
        let cancel = CancellationToken::new();
        let ctx = ExecContext { scope: None, cancel: cancel.clone() };
        let handle = tokio::spawn(async move {
            BashTool.execute(&json!({"command": "sleep 30"}), &ctx).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let out = handle.await.unwrap().unwrap();
        assert!(out.contains("cancelled"));
    }
}
