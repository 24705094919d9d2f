//! Per-session sandboxes for tool execution.
//!
//! The dispatch pipeline asks [`acquire`] for a lease before execution and
//! always releases it afterwards. [`DockerSandbox`] is the default manager:
//! one long-lived container per session with the task workdir mounted at
//! `/workspace`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::{Config, SandboxConfig};
use crate::error::DispatchError;
use crate::task::Task;

/// Image used when neither the agent nor the config names one.
pub const FALLBACK_IMAGE: &str = "ubuntu:22.04";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox runtime not available")]
    Unavailable,

    #[error("Failed to create sandbox: {0}")]
    Create(String),

    #[error("Sandbox command failed: {0}")]
    Exec(String),

    #[error("Failed to destroy sandbox: {0}")]
    Destroy(String),
}

/// Whether an agent's work must, may, or must not run in a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPolicy {
    Required,
    Optional,
    #[default]
    Never,
}

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait SandboxManager: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Create the sandbox for `session_id`, or return the existing one.
    async fn ensure_sandbox(
        &self,
        session_id: &str,
        workdir: &str,
        image: &str,
    ) -> Result<String, SandboxError>;

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;

    async fn destroy_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

/// Effective policy for a task: the agent policy, adjusted by the task flag.
///
/// `sandbox: true` always requires one. `sandbox: false` only turns an
/// optional sandbox off; a required one stays required.
pub fn resolve_policy(cfg: &Config, task: &Task) -> SandboxPolicy {
    let agent_policy = cfg
        .agent(&task.agent)
        .map(|a| a.tool_policy.sandbox)
        .unwrap_or_default();
    match (task.sandbox, agent_policy) {
        (Some(true), _) => SandboxPolicy::Required,
        (Some(false), SandboxPolicy::Optional) => SandboxPolicy::Never,
        (_, policy) => policy,
    }
}

/// Image for an agent: its own, then the configured default, then [`FALLBACK_IMAGE`].
pub fn image_for_agent(cfg: &Config, agent: &str) -> String {
    if let Some(agent) = cfg.agent(agent) {
        if !agent.tool_policy.sandbox_image.is_empty() {
            return agent.tool_policy.sandbox_image.clone();
        }
    }
    if !cfg.sandbox.default_image.is_empty() {
        return cfg.sandbox.default_image.clone();
    }
    FALLBACK_IMAGE.to_string()
}

/// A sandbox held for the duration of one task attempt.
///
/// Dropped without [`SandboxLease::release`], the lease tears the sandbox
/// down on a spawned task.
pub struct SandboxLease {
    pub id: String,
    manager: Arc<dyn SandboxManager>,
    released: bool,
}

impl SandboxLease {
    pub fn manager(&self) -> Arc<dyn SandboxManager> {
        Arc::clone(&self.manager)
    }

    /// Tear the sandbox down. Failures are logged.
    pub async fn release(mut self) {
        if let Err(e) = self.manager.destroy_sandbox(&self.id).await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Sandbox teardown failed");
        }
        self.released = true;
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(sandbox_id = %self.id, "No runtime to tear down abandoned sandbox");
            return;
        };
        let manager = Arc::clone(&self.manager);
        let id = std::mem::take(&mut self.id);
        tracing::debug!(sandbox_id = %id, "Tearing down abandoned sandbox");
        runtime.spawn(async move {
            if let Err(e) = manager.destroy_sandbox(&id).await {
                tracing::warn!(sandbox_id = %id, error = %e, "Sandbox teardown failed");
            }
        });
    }
}

/// Acquire a sandbox according to the task's effective policy.
///
/// A required sandbox that cannot be obtained is an error; an optional one
/// degrades to unsandboxed execution.
pub async fn acquire(
    cfg: &Config,
    manager: Option<&Arc<dyn SandboxManager>>,
    task: &Task,
) -> Result<Option<SandboxLease>, DispatchError> {
    let policy = resolve_policy(cfg, task);
    if policy == SandboxPolicy::Never {
        return Ok(None);
    }

    let result = match manager {
        None => Err(SandboxError::Unavailable),
        Some(manager) if !manager.is_available().await => Err(SandboxError::Unavailable),
        Some(manager) => {
            let image = image_for_agent(cfg, &task.agent);
            manager
                .ensure_sandbox(&task.session_id, &task.workdir, &image)
                .await
                .map(|id| SandboxLease {
                    id,
                    manager: Arc::clone(manager),
                    released: false,
                })
        }
    };

    match result {
        Ok(lease) => {
            tracing::info!(task_id = %task.id, sandbox_id = %lease.id, "Sandbox acquired");
            Ok(Some(lease))
        }
        Err(e) if policy == SandboxPolicy::Required => {
            Err(DispatchError::SandboxRequired(e.to_string()))
        }
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "Optional sandbox unavailable, running unsandboxed");
            Ok(None)
        }
    }
}

fn command_on_path(cmd: &str) -> bool {
    if cmd.contains('/') {
        return Path::new(cmd).is_file();
    }
    std::env::var("PATH")
        .map(|path_var| {
            path_var
                .split(':')
                .filter(|dir| !dir.trim().is_empty())
                .any(|dir| PathBuf::from(dir).join(cmd).is_file())
        })
        .unwrap_or(false)
}

/// Docker-backed sandbox manager.
pub struct DockerSandbox {
    config: SandboxConfig,
    /// session id -> container id
    active: Mutex<HashMap<String, String>>,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn container_name(session_id: &str) -> String {
        let short: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(12)
            .collect();
        format!("agent-dispatch-{}", short)
    }
}

#[async_trait]
impl SandboxManager for DockerSandbox {
    async fn is_available(&self) -> bool {
        if !command_on_path(&self.config.docker_path) {
            return false;
        }
        match Command::new(&self.config.docker_path)
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn ensure_sandbox(
        &self,
        session_id: &str,
        workdir: &str,
        image: &str,
    ) -> Result<String, SandboxError> {
        let mut active = self.active.lock().await;
        if let Some(id) = active.get(session_id) {
            return Ok(id.clone());
        }

        let output = Command::new(&self.config.docker_path)
            .arg("run")
            .arg("-d")
            .arg("--rm")
            .arg("--name")
            .arg(Self::container_name(session_id))
            .arg("--network")
            .arg(&self.config.network)
            .arg("-v")
            .arg(format!("{}:/workspace", workdir))
            .arg("-w")
            .arg("/workspace")
            .arg(image)
            .args(["sleep", "infinity"])
            .output()
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if !output.status.success() {
            return Err(SandboxError::Create(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Create("docker returned empty container id".into()));
        }

        tracing::info!(session_id, container = %id, image, "Sandbox created");
        active.insert(session_id.to_string(), id.clone());
        Ok(id)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let child = Command::new(&self.config.docker_path)
            .args(["exec", sandbox_id, "/bin/sh", "-c", command])
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| SandboxError::Exec(format!("timed out after {}s", timeout.as_secs())))?
            .map_err(|e| SandboxError::Exec(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn destroy_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.active.lock().await.retain(|_, id| id != sandbox_id);

        let output = Command::new(&self.config.docker_path)
            .args(["rm", "-f", sandbox_id])
            .output()
            .await
            .map_err(|e| SandboxError::Destroy(e.to_string()))?;
        if !output.status.success() {
            tracing::debug!(
                sandbox_id,
                status = %output.status,
                "docker rm returned non-zero"
            );
        }
        tracing::info!(sandbox_id, "Sandbox destroyed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process manager that counts create/destroy calls.
    pub(crate) struct FakeSandbox {
        pub available: bool,
        pub fail_create: bool,
        pub created: AtomicUsize,
        pub destroyed: AtomicUsize,
    }

    impl FakeSandbox {
        pub fn new(available: bool, fail_create: bool) -> Self {
            Self {
                available,
                fail_create,
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SandboxManager for FakeSandbox {
        async fn is_available(&self) -> bool {
            self.available
        }

        async fn ensure_sandbox(&self, session_id: &str, _: &str, _: &str) -> Result<String, SandboxError> {
            if self.fail_create {
                return Err(SandboxError::Create("image pull failed".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sb-{}", session_id))
        }

        async fn exec(&self, _: &str, command: &str, _: Duration) -> Result<ExecOutput, SandboxError> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: format!("sandboxed: {}", command),
                stderr: String::new(),
            })
        }

        async fn destroy_sandbox(&self, _: &str) -> Result<(), SandboxError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config_with(policy: SandboxPolicy, image: &str) -> Config {
        let mut cfg = Config::default();
        let mut agent = AgentConfig::default();
        agent.tool_policy.sandbox = policy;
        agent.tool_policy.sandbox_image = image.to_string();
        cfg.agents.insert("coder".to_string(), agent);
        cfg
    }

    #[test]
    fn test_resolve_policy_overrides() {
        let cfg = config_with(SandboxPolicy::Optional, "");
        let mut task = Task::new("x").with_agent("coder");
        assert_eq!(resolve_policy(&cfg, &task), SandboxPolicy::Optional);
        task.sandbox = Some(false);
        assert_eq!(resolve_policy(&cfg, &task), SandboxPolicy::Never);
        task.sandbox = Some(true);
        assert_eq!(resolve_policy(&cfg, &task), SandboxPolicy::Required);

        let cfg = config_with(SandboxPolicy::Required, "");
        task.sandbox = Some(false);
        assert_eq!(resolve_policy(&cfg, &task), SandboxPolicy::Required);
    }

    #[test]
    fn test_image_resolution() {
        let cfg = config_with(SandboxPolicy::Required, "rust:1.80");
        assert_eq!(image_for_agent(&cfg, "coder"), "rust:1.80");

        let mut cfg = config_with(SandboxPolicy::Required, "");
        assert_eq!(image_for_agent(&cfg, "coder"), FALLBACK_IMAGE);
        cfg.sandbox.default_image = "debian:12".to_string();
        assert_eq!(image_for_agent(&cfg, "coder"), "debian:12");
    }

    #[tokio::test]
    async fn test_required_sandbox_unavailable_is_fatal() {
        let cfg = config_with(SandboxPolicy::Required, "");
        let task = Task::new("x").with_agent("coder");
        let manager: Arc<dyn SandboxManager> = Arc::new(FakeSandbox::new(false, false));
        let err = acquire(&cfg, Some(&manager), &task).await.err().unwrap();
        assert!(err.to_string().starts_with("sandbox required but unavailable"));

        let err = acquire(&cfg, None, &task).await.err().unwrap();
        assert!(matches!(err, DispatchError::SandboxRequired(_)));
    }

    #[tokio::test]
    async fn test_optional_sandbox_degrades() {
        let cfg = config_with(SandboxPolicy::Optional, "");
        let task = Task::new("x").with_agent("coder");
        let manager: Arc<dyn SandboxManager> = Arc::new(FakeSandbox::new(true, true));
        assert!(acquire(&cfg, Some(&manager), &task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_release_destroys() {
        let cfg = config_with(SandboxPolicy::Required, "");
        let mut task = Task::new("x").with_agent("coder");
        task.session_id = "s1".to_string();
        let fake = Arc::new(FakeSandbox::new(true, false));
        let manager: Arc<dyn SandboxManager> = fake.clone();

        let lease = acquire(&cfg, Some(&manager), &task).await.unwrap().unwrap();
        assert_eq!(lease.id, "sb-s1");
        lease.release().await;
        assert_eq!(fake.created.load(Ordering::SeqCst), 1);
        assert_eq!(fake.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_still_destroys() {
        let cfg = config_with(SandboxPolicy::Required, "");
        let task = Task::new("x").with_agent("coder");
        let fake = Arc::new(FakeSandbox::new(true, false));
        let manager: Arc<dyn SandboxManager> = fake.clone();

        let lease = acquire(&cfg, Some(&manager), &task).await.unwrap().unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fake.destroyed.load(Ordering::SeqCst), 1);
    }
}
