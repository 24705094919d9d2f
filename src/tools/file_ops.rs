//! File tools: read, write and edit files under the task workdir.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, PathResolution, Tool, ToolContext};

fn required_str<'a>(input: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    input[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", key))
}

fn with_note(message: String, resolution: &PathResolution) -> String {
    match resolution.note() {
        Some(note) => format!("{}\n{}", message, note),
        None => message,
    }
}

/// Read a file with line numbers.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file's contents with line numbers. Relative paths resolve from the task workdir."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workdir or absolute"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: first line to return (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: last line to return (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let path = required_str(&input, "path")?;
        let resolution = resolve_path(path, &ctx.workdir);

        if !resolution.resolved.exists() {
            return Err(anyhow::anyhow!(
                "File not found: {} (resolved to: {})",
                path,
                resolution.resolved.display()
            ));
        }

        let bytes = tokio::fs::read(&resolution.resolved).await?;
        let size = bytes.len();
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                return Ok(format!(
                    "Binary file detected: {} ({} bytes). Use exec with `file` or `strings` to inspect it.",
                    resolution.resolved.display(),
                    size
                ));
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let start = input["start_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(1)
            .saturating_sub(1);
        let end = input["end_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(total)
            .min(total);

        if total > 0 && start >= total {
            return Ok(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total,
                start + 1
            ));
        }
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect();
        Ok(with_note(numbered.join("\n"), &resolution))
    }
}

/// Write a file, creating parent directories.
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. Parent directories are created."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workdir or absolute"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let path = required_str(&input, "path")?;
        let content = required_str(&input, "content")?;
        let resolution = resolve_path(path, &ctx.workdir);

        if let Some(parent) = resolution.resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolution.resolved, content).await?;

        tracing::debug!(path = %resolution.resolved.display(), bytes = content.len(), "Wrote file");
        Ok(with_note(
            format!(
                "Wrote {} bytes to {}",
                content.len(),
                resolution.resolved.display()
            ),
            &resolution,
        ))
    }
}

/// Replace an exact snippet in a file.
pub struct EditFile;

#[async_trait]
impl Tool for EditFile {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. The old string must occur exactly once unless replace_all is set."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to edit" },
                "old_string": { "type": "string", "description": "Exact text to replace" },
                "new_string": { "type": "string", "description": "Replacement text" },
                "replace_all": { "type": "boolean", "description": "Replace every occurrence (default: false)" }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let path = required_str(&input, "path")?;
        let old = required_str(&input, "old_string")?;
        let new = required_str(&input, "new_string")?;
        let replace_all = input["replace_all"].as_bool().unwrap_or(false);
        if old.is_empty() {
            return Err(anyhow::anyhow!("old_string must not be empty"));
        }

        let resolution = resolve_path(path, &ctx.workdir);
        let content = tokio::fs::read_to_string(&resolution.resolved)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?;

        let occurrences = content.matches(old).count();
        let updated = match occurrences {
            0 => return Err(anyhow::anyhow!("old_string not found in {}", path)),
            1 => content.replacen(old, new, 1),
            n if replace_all => {
                tracing::debug!(path, replacements = n, "Replacing all occurrences");
                content.replace(old, new)
            }
            n => {
                return Err(anyhow::anyhow!(
                    "old_string occurs {} times in {}; pass replace_all or a longer snippet",
                    n,
                    path
                ))
            }
        };

        tokio::fs::write(&resolution.resolved, updated).await?;
        Ok(with_note(
            format!(
                "Edited {} ({} replacement{})",
                resolution.resolved.display(),
                if replace_all { occurrences } else { 1 },
                if replace_all && occurrences != 1 { "s" } else { "" }
            ),
            &resolution,
        ))
    }
}
