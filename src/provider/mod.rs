//! LLM provider abstraction, registry and failover.
//!
//! A provider turns a [`ProviderRequest`] into a [`ProviderResult`]. Providers
//! that can drive a tool-calling conversation expose it through
//! [`Provider::as_tool_capable`].

mod claude_cli;
pub(crate) mod openai_api;

pub use claude_cli::ClaudeCliProvider;
pub use openai_api::OpenAiProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, ProviderKind};
use crate::task::Task;

/// Prefix of the error produced when every candidate provider failed.
pub const ALL_PROVIDERS_UNAVAILABLE: &str = "all providers unavailable";

/// Role in a tool-calling conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Size of the message content as sent on the wire.
    pub fn content_len(&self) -> usize {
        serde_json::to_string(&self.content)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub workdir: String,
    pub add_dirs: Vec<String>,
    pub timeout: Duration,
    pub budget: f64,
    pub permission_mode: String,
    pub session_id: String,
    /// Conversation so far; empty for a single-shot request.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl ProviderRequest {
    pub fn from_task(task: &Task, timeout: Duration) -> Self {
        Self {
            prompt: task.prompt.clone(),
            system_prompt: task.system_prompt.clone(),
            model: task.model.clone(),
            workdir: task.workdir.clone(),
            add_dirs: task.add_dirs.clone(),
            timeout,
            budget: task.budget,
            permission_mode: task.permission_mode.clone(),
            session_id: task.session_id.clone(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderResult {
    pub output: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub session_id: String,
    pub is_error: bool,
    pub error: String,
    /// Name of the provider that handled the request.
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Provider-reported latency, as opposed to wall-clock duration.
    pub provider_ms: u64,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
}

impl ProviderResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error: message.into(),
            ..Default::default()
        }
    }
}

/// Trait for LLM providers.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Run a single-shot request.
    async fn execute(&self, req: &ProviderRequest) -> anyhow::Result<ProviderResult>;

    /// Tool-calling capability, if supported.
    fn as_tool_capable(&self) -> Option<&dyn ToolCapableProvider> {
        None
    }
}

/// Providers that can run one round of a tool-calling conversation.
#[async_trait]
pub trait ToolCapableProvider: Send + Sync {
    /// Send `req.messages` with `req.tools` and return the next turn.
    async fn execute_with_tools(&self, req: &ProviderRequest) -> anyhow::Result<ProviderResult>;
}

/// Name-keyed provider registry.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config. The default provider falls back to
    /// the `claude` CLI when it is not configured.
    pub fn from_config(cfg: &Config) -> Self {
        let mut registry = Self::new();
        for (name, pc) in &cfg.providers {
            let provider: Arc<dyn Provider> = match pc.kind {
                ProviderKind::ClaudeCli => {
                    let binary = if pc.binary_path.is_empty() {
                        name.clone()
                    } else {
                        pc.binary_path.clone()
                    };
                    Arc::new(ClaudeCliProvider::new(name, binary))
                }
                ProviderKind::OpenaiCompatible => Arc::new(
                    OpenAiProvider::new(name, &pc.base_url, pc.resolved_api_key(), &pc.model)
                        .with_pricing(cfg.estimate.pricing.clone()),
                ),
            };
            tracing::debug!(provider = %name, kind = ?pc.kind, "Provider registered");
            registry.register(name.clone(), provider);
        }
        if registry.get(&cfg.default_provider).is_none() {
            registry.register(
                cfg.default_provider.clone(),
                Arc::new(ClaudeCliProvider::new(&cfg.default_provider, "claude")),
            );
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Provider for a task: the task's own, then its agent's, then the default.
pub fn resolve_provider_name(cfg: &Config, task: &Task) -> String {
    if !task.provider.is_empty() {
        return task.provider.clone();
    }
    if let Some(agent) = cfg.agent(&task.agent) {
        if !agent.provider.is_empty() {
            return agent.provider.clone();
        }
    }
    cfg.default_provider.clone()
}

/// Ordered, de-duplicated failover candidates: primary, agent fallbacks,
/// then global fallbacks.
pub fn provider_candidates(cfg: &Config, task: &Task) -> Vec<String> {
    let mut candidates = vec![resolve_provider_name(cfg, task)];
    let agent_fallbacks = cfg
        .agent(&task.agent)
        .map(|a| a.fallback_providers.as_slice())
        .unwrap_or_default();
    for name in agent_fallbacks.iter().chain(cfg.fallback_providers.iter()) {
        if !candidates.contains(name) {
            candidates.push(name.clone());
        }
    }
    candidates
}

/// Whether an error message describes a failure worth failing over on.
pub fn is_transient_error(message: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "deadline exceeded",
        "connection refused",
        "connection reset",
        "connection failed",
        "eof",
        "broken pipe",
        "http 5",
        "status 5",
        "temporarily unavailable",
        "service unavailable",
        "too many requests",
        "rate limit",
    ];
    let lower = message.to_lowercase();
    TRANSIENT.iter().any(|t| lower.contains(t))
}

/// Run a single-shot request, failing over across candidates on transient errors.
///
/// A non-transient failure is returned as-is. When every candidate fails
/// transiently (or none is registered) the error starts with
/// [`ALL_PROVIDERS_UNAVAILABLE`].
pub async fn execute_with_failover(
    registry: &ProviderRegistry,
    candidates: &[String],
    req: &ProviderRequest,
) -> ProviderResult {
    let mut last_error = String::new();

    for name in candidates {
        let Some(provider) = registry.get(name) else {
            tracing::debug!(provider = %name, "Provider not registered, skipping");
            continue;
        };

        let message = match provider.execute(req).await {
            Ok(result) if !result.is_error => {
                return ProviderResult {
                    provider: name.clone(),
                    ..result
                };
            }
            Ok(result) => {
                if !is_transient_error(&result.error) {
                    return ProviderResult {
                        provider: name.clone(),
                        ..result
                    };
                }
                result.error
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if !is_transient_error(&message) {
                    tracing::warn!(provider = %name, error = %message, "Provider failed");
                    return ProviderResult {
                        provider: name.clone(),
                        ..ProviderResult::error(format!("provider {}: {}", name, message))
                    };
                }
                message
            }
        };

        tracing::warn!(provider = %name, error = %message, "Provider transient error, failing over");
        last_error = format!("provider {}: {}", name, message);
    }

    if last_error.is_empty() {
        ProviderResult::error(ALL_PROVIDERS_UNAVAILABLE)
    } else {
        ProviderResult::error(format!("{}: {}", ALL_PROVIDERS_UNAVAILABLE, last_error))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted provider: pops one response per call, repeating the last.
    pub(crate) struct MockProvider {
        name: String,
        script: Mutex<VecDeque<anyhow::Result<ProviderResult>>>,
        tool_capable: bool,
        pub requests: Mutex<Vec<ProviderRequest>>,
        delay: Option<Duration>,
    }

    impl MockProvider {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                script: Mutex::new(VecDeque::new()),
                tool_capable: false,
                requests: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub fn tool_capable(mut self) -> Self {
            self.tool_capable = true;
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn respond(self, result: ProviderResult) -> Self {
            self.script.lock().unwrap().push_back(Ok(result));
            self
        }

        pub fn fail(self, message: &str) -> Self {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(anyhow::anyhow!(message.to_string())));
            self
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        async fn next(&self, req: &ProviderRequest) -> anyhow::Result<ProviderResult> {
            self.requests.lock().unwrap().push(req.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().map(|r| match r {
                    Ok(result) => Ok(result.clone()),
                    Err(e) => Err(anyhow::anyhow!(e.to_string())),
                })
            };
            next.unwrap_or_else(|| {
                Ok(ProviderResult {
                    output: "ok".to_string(),
                    ..Default::default()
                })
            })
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, req: &ProviderRequest) -> anyhow::Result<ProviderResult> {
            self.next(req).await
        }

        fn as_tool_capable(&self) -> Option<&dyn ToolCapableProvider> {
            if self.tool_capable {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl ToolCapableProvider for MockProvider {
        async fn execute_with_tools(&self, req: &ProviderRequest) -> anyhow::Result<ProviderResult> {
            self.next(req).await
        }
    }

    pub(crate) fn text_result(output: &str, cost: f64) -> ProviderResult {
        ProviderResult {
            output: output.to_string(),
            cost_usd: cost,
            tokens_in: 10,
            tokens_out: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_error("HTTP 503 Service Unavailable"));
        assert!(is_transient_error("read: connection reset by peer"));
        assert!(is_transient_error("Rate limit exceeded"));
        assert!(is_transient_error("Connection failed: error sending request"));
        assert!(!is_transient_error("invalid api key"));
    }

    #[test]
    fn test_registry_from_config() {
        let cfg = Config::from_yaml(
            r#"
default_provider: claude
providers:
  local:
    type: openai-compatible
    base_url: http://localhost:11434/v1
    model: llama3
  cli:
    binary_path: /opt/claude
"#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&cfg);
        assert_eq!(registry.names(), vec!["claude", "cli", "local"]);
        assert!(registry.get("local").unwrap().as_tool_capable().is_some());
        assert!(registry.get("cli").unwrap().as_tool_capable().is_none());
        assert!(registry.get("claude").unwrap().as_tool_capable().is_none());
    }

    #[test]
    fn test_candidates_order_and_dedup() {
        let mut cfg = Config::default();
        cfg.fallback_providers = vec!["openai".to_string(), "local".to_string()];
        cfg.agents.insert(
            "coder".to_string(),
            crate::config::AgentConfig {
                provider: "anthropic".to_string(),
                fallback_providers: vec!["openai".to_string(), "anthropic".to_string()],
                ..Default::default()
            },
        );
        let task = Task::new("x").with_agent("coder");
        assert_eq!(provider_candidates(&cfg, &task), vec!["anthropic", "openai", "local"]);

        let mut explicit = Task::new("x");
        explicit.provider = "local".to_string();
        assert_eq!(provider_candidates(&cfg, &explicit), vec!["local", "openai"]);
    }

    #[tokio::test]
    async fn test_failover_on_transient_error() {
        let mut registry = ProviderRegistry::new();
        registry.register("a", Arc::new(MockProvider::new("a").fail("connection refused")));
        registry.register("b", Arc::new(MockProvider::new("b").respond(text_result("from b", 0.1))));

        let result = execute_with_failover(
            &registry,
            &["a".to_string(), "b".to_string()],
            &ProviderRequest::default(),
        )
        .await;
        assert!(!result.is_error);
        assert_eq!(result.output, "from b");
        assert_eq!(result.provider, "b");
    }

    #[tokio::test]
    async fn test_non_transient_error_stops() {
        let b = Arc::new(MockProvider::new("b"));
        let mut registry = ProviderRegistry::new();
        registry.register("a", Arc::new(MockProvider::new("a").fail("invalid api key")));
        registry.register("b", b.clone());

        let result = execute_with_failover(
            &registry,
            &["a".to_string(), "b".to_string()],
            &ProviderRequest::default(),
        )
        .await;
        assert!(result.is_error);
        assert_eq!(result.error, "provider a: invalid api key");
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_unavailable() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "a",
            Arc::new(MockProvider::new("a").respond(ProviderResult::error("HTTP 502 bad gateway"))),
        );
        let result = execute_with_failover(
            &registry,
            &["a".to_string(), "missing".to_string()],
            &ProviderRequest::default(),
        )
        .await;
        assert_eq!(
            result.error,
            "all providers unavailable: provider a: HTTP 502 bad gateway"
        );
    }
}
