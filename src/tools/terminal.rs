//! Shell command tool.
//!
//! Commands run in the task workdir, or inside the task's sandbox when one
//! is leased.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{resolve_path, Tool, ToolContext};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT: usize = 10000;

/// Make command output safe to hand back to a model.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "This would destroy the entire system"),
    ("rm -rf /*", "This would destroy the entire system"),
    ("find / ", "Use a specific directory path"),
    ("grep -r /", "Use a specific directory path"),
    ("grep -R /", "Use a specific directory path"),
    ("ls -laR /", "Use a specific directory path instead of root"),
    ("du -sh /", "Use a specific directory path instead of root"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    ("mkfs", "Formatting filesystems is blocked"),
    (":(){", "Fork bombs are blocked"),
];

const COMMAND_PREFIXES: &[&str] = &["sudo ", "time ", "nice ", "nohup "];

/// Reject commands matching a dangerous pattern, directly or after a
/// wrapper prefix such as `sudo`.
fn validate_command(cmd: &str) -> Result<(), String> {
    let trimmed = cmd.trim();
    let unwrapped = COMMAND_PREFIXES
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .map(str::trim_start);

    for (pattern, suggestion) in DANGEROUS_PATTERNS {
        if trimmed.starts_with(pattern) || unwrapped.is_some_and(|c| c.starts_with(pattern)) {
            return Err(format!(
                "Blocked dangerous command pattern '{}'. {}",
                pattern, suggestion
            ));
        }
    }
    Ok(())
}

fn format_output(exit_code: i32, stdout: &str, stderr: &str) -> String {
    let mut result = format!("Exit code: {}\n", exit_code);
    if !stdout.is_empty() {
        result.push_str("\n--- stdout ---\n");
        result.push_str(stdout);
    }
    if !stderr.is_empty() {
        result.push_str("\n--- stderr ---\n");
        result.push_str(stderr);
    }
    if result.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
        result.push_str("\n... [output truncated]");
    }
    result
}

/// Run a shell command.
pub struct Exec;

#[async_trait]
impl Tool for Exec {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the task workdir (or its sandbox). Use for tests, builds and inspection."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Optional working directory, relative to the workdir. Ignored in a sandbox."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 60)"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' argument"))?;

        if let Err(msg) = validate_command(command) {
            tracing::warn!(command, task_id = %ctx.task_id, "Blocked dangerous command");
            return Err(anyhow::anyhow!("{}", msg));
        }

        let timeout = Duration::from_secs(input["timeout_secs"].as_u64().unwrap_or(DEFAULT_TIMEOUT_SECS));

        if let Some(sandbox) = &ctx.sandbox {
            tracing::info!(sandbox_id = %sandbox.id, command, "Executing command in sandbox");
            let out = sandbox.manager.exec(&sandbox.id, command, timeout).await?;
            return Ok(format_output(
                out.exit_code,
                &sanitize_output(out.stdout.as_bytes()),
                &sanitize_output(out.stderr.as_bytes()),
            ));
        }

        let cwd = input["cwd"]
            .as_str()
            .map(|p| resolve_path(p, &ctx.workdir).resolved)
            .unwrap_or_else(|| ctx.workdir.clone());

        tracing::info!(cwd = %cwd.display(), command, "Executing command");

        let run = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                tracing::info!(task_id = %ctx.task_id, command, "Command cancelled");
                return Err(anyhow::anyhow!("Command cancelled"));
            }
            res = tokio::time::timeout(timeout, run) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(anyhow::anyhow!("Failed to execute command: {}", e)),
                Err(_) => {
                    return Err(anyhow::anyhow!(
                        "Command timed out after {} seconds",
                        timeout.as_secs()
                    ))
                }
            },
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);
        tracing::debug!(exit_code, stdout_len = stdout.len(), stderr_len = stderr.len(), "Command completed");

        Ok(format_output(exit_code, &stdout, &stderr))
    }
}
