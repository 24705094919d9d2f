//! Tool system for the agentic loop.
//!
//! Tools are what a tool-capable model can call between rounds: read and
//! edit files, run commands, fetch URLs.
//!
//! ## Workspace-First Design
//!
//! Paths resolve **relative to the task workdir** by default:
//! - Relative paths (e.g., `output/report.md`) resolve from the workdir
//! - Absolute paths (e.g., `/etc/hosts`) are used as given
//!
//! When the task holds a sandbox lease, `exec` runs inside the sandbox
//! instead of on the host.

pub mod approval;
mod file_ops;
pub mod policy;
mod terminal;
mod web;

pub use file_ops::{EditFile, ReadFile, WriteFile};
pub use terminal::Exec;
pub use web::WebFetch;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::provider::ToolDefinition;
use crate::sandbox::SandboxManager;
use crate::task::is_within;

/// Result of resolving a path against the workdir.
#[derive(Debug, Clone)]
pub struct PathResolution {
    pub resolved: PathBuf,
    pub is_outside_workspace: bool,
}

impl PathResolution {
    /// Note appended to tool output when the path escapes the workdir.
    pub fn note(&self) -> Option<String> {
        self.is_outside_workspace
            .then(|| format!("Note: {} is outside the workspace", self.resolved.display()))
    }
}

/// Resolve a tool-supplied path. Relative paths join the workdir.
pub fn resolve_path(path: &str, workdir: &Path) -> PathResolution {
    let candidate = Path::new(path);
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workdir.join(candidate)
    };
    PathResolution {
        is_outside_workspace: !is_within(workdir, &resolved),
        resolved,
    }
}

/// Sandbox a tool may run commands in.
#[derive(Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub manager: Arc<dyn SandboxManager>,
}

/// Per-call execution context handed to a tool.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub workdir: PathBuf,
    pub task_id: String,
    pub agent: String,
    pub sandbox: Option<SandboxHandle>,
    /// Cancelled when the owning task is cancelled or times out.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("workdir", &self.workdir)
            .field("task_id", &self.task_id)
            .field("agent", &self.agent)
            .field("sandbox", &self.sandbox.as_ref().map(|s| s.id.as_str()))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Trait for tools the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool input.
    fn input_schema(&self) -> Value;

    /// Tools with side effects default to the `suggest` trust tier.
    fn requires_auth(&self) -> bool {
        false
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// Name-keyed tool registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with the built-in tools.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ReadFile));
        registry.register(Arc::new(WriteFile));
        registry.register(Arc::new(EditFile));
        registry.register(Arc::new(Exec));
        registry.register(Arc::new(WebFetch));
        tracing::debug!(tools = registry.tools.len(), "Created tool registry");
        registry
    }

    /// Registry with no tools.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of the registered tools in `allowed`, sorted by name.
    pub fn definitions(&self, allowed: &HashSet<String>) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| allowed.contains(t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let wd = Path::new("/srv/work");
        let rel = resolve_path("out/report.md", wd);
        assert_eq!(rel.resolved, PathBuf::from("/srv/work/out/report.md"));
        assert!(!rel.is_outside_workspace);
        assert!(rel.note().is_none());

        let abs = resolve_path("/etc/hosts", wd);
        assert_eq!(abs.resolved, PathBuf::from("/etc/hosts"));
        assert!(abs.is_outside_workspace);

        let escape = resolve_path("../other/file", wd);
        assert!(escape.is_outside_workspace);
    }

    #[test]
    fn test_registry_definitions_filtered() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.names(), vec!["edit", "exec", "read", "web_fetch", "write"]);
        assert!(registry.has_tool("exec"));
        assert!(registry.get("exec").map(|t| t.requires_auth()).unwrap_or(false));
        assert!(!registry.get("read").map(|t| t.requires_auth()).unwrap_or(true));

        let allowed: HashSet<String> = ["read", "exec", "memory_search"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let defs = registry.definitions(&allowed);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["exec", "read"]);
        assert_eq!(defs[1].input_schema["required"][0], "path");
    }
}
