//! Provider backed by the `claude` CLI in print mode.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Provider, ProviderRequest, ProviderResult};

/// JSON document printed by `claude --print --output-format json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliOutput {
    #[serde(rename = "type")]
    kind: String,
    subtype: String,
    result: String,
    is_error: bool,
    duration_ms: u64,
    total_cost_usd: f64,
    session_id: String,
    usage: CliUsage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliUsage {
    input_tokens: u64,
    output_tokens: u64,
}

pub struct ClaudeCliProvider {
    name: String,
    binary_path: String,
}

impl ClaudeCliProvider {
    pub fn new(name: impl Into<String>, binary_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary_path: binary_path.into(),
        }
    }

    fn build_args(req: &ProviderRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--output-format".into(),
            "json".into(),
        ];
        if !req.model.is_empty() {
            args.push("--model".into());
            args.push(req.model.clone());
        }
        if !req.session_id.is_empty() {
            args.push("--session-id".into());
            args.push(req.session_id.clone());
        }
        if !req.permission_mode.is_empty() {
            args.push("--permission-mode".into());
            args.push(req.permission_mode.clone());
        }
        args.push("--no-session-persistence".into());
        if req.budget > 0.0 {
            args.push("--max-budget-usd".into());
            args.push(format!("{:.2}", req.budget));
        }
        for dir in &req.add_dirs {
            args.push("--add-dir".into());
            args.push(dir.clone());
        }
        if !req.system_prompt.is_empty() {
            args.push("--append-system-prompt".into());
            args.push(req.system_prompt.clone());
        }
        args
    }
}

/// Interpret CLI output. Falls back to raw stdout when it is not JSON.
fn parse_output(stdout: &str, stderr: &str, success: bool) -> ProviderResult {
    if let Ok(parsed) = serde_json::from_str::<CliOutput>(stdout.trim()) {
        if !parsed.kind.is_empty() || !parsed.result.is_empty() {
            let is_error = parsed.is_error || parsed.subtype.starts_with("error");
            return ProviderResult {
                error: if is_error {
                    if parsed.result.is_empty() {
                        parsed.subtype.clone()
                    } else {
                        parsed.result.clone()
                    }
                } else {
                    String::new()
                },
                output: parsed.result,
                is_error,
                cost_usd: parsed.total_cost_usd,
                provider_ms: parsed.duration_ms,
                session_id: parsed.session_id,
                tokens_in: parsed.usage.input_tokens,
                tokens_out: parsed.usage.output_tokens,
                ..Default::default()
            };
        }
    }

    let mut result = ProviderResult {
        output: stdout.to_string(),
        ..Default::default()
    };
    if !success {
        result.is_error = true;
        result.error = crate::task::preview(stderr.trim(), 500);
        if result.error.is_empty() {
            result.error = "claude exited with non-zero status".to_string();
        }
    }
    result
}

#[async_trait]
impl Provider for ClaudeCliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, req: &ProviderRequest) -> Result<ProviderResult> {
        let args = Self::build_args(req);
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !req.workdir.is_empty() {
            cmd.current_dir(&req.workdir);
        }

        info!(
            provider = %self.name,
            model = %req.model,
            session_id = %req.session_id,
            "Spawning Claude CLI"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            anyhow!(
                "Failed to spawn Claude CLI: {}. Is it installed at '{}'?",
                e,
                self.binary_path
            )
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(req.prompt.as_bytes()).await?;
            // Closing stdin ends the prompt.
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            status = %output.status,
            stdout_len = stdout.len(),
            "Claude CLI exited"
        );

        let mut result = parse_output(&stdout, &stderr, output.status.success());
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}
