//! Tool allow-lists and per-tool trust filtering.
//!
//! An agent's allowed set is its profile's allow list minus the profile's
//! deny list, plus the agent's own allow list, minus the agent's deny list.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ToolRegistry;
use crate::config::Config;
use crate::provider::ToolCall;
use crate::task::preview;
use crate::trust::TrustLevel;

/// Named allow/deny list. `"*"` in `allow` means every registered tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolProfile {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolProfile {
    fn allowing(tools: &[&str]) -> Self {
        Self {
            allow: tools.iter().map(|t| t.to_string()).collect(),
            deny: Vec::new(),
        }
    }
}

/// Built-in profiles: `minimal`, `standard` and `full`.
pub fn builtin_profile(name: &str) -> Option<ToolProfile> {
    match name {
        "minimal" => Some(ToolProfile::allowing(&[
            "memory_search",
            "memory_get",
            "knowledge_search",
        ])),
        "standard" => Some(ToolProfile::allowing(&[
            "read",
            "write",
            "edit",
            "exec",
            "memory_search",
            "memory_get",
            "knowledge_search",
            "web_fetch",
            "session_list",
        ])),
        "full" => Some(ToolProfile::allowing(&["*"])),
        _ => None,
    }
}

/// Profile by name: built-in first, then configured, falling back to `standard`.
pub fn profile(cfg: &Config, name: &str) -> ToolProfile {
    let name = if name.is_empty() {
        cfg.tools.default_profile.as_str()
    } else {
        name
    };
    builtin_profile(name)
        .or_else(|| cfg.tools.profiles.get(name).cloned())
        .or_else(|| builtin_profile("standard"))
        .unwrap_or_default()
}

/// Tool names an agent may call.
pub fn resolve_allowed_tools(cfg: &Config, agent: &str, registry: &ToolRegistry) -> HashSet<String> {
    let policy = cfg.agent(agent).map(|a| a.tool_policy.clone()).unwrap_or_default();
    let profile = profile(cfg, &policy.profile);

    let mut allowed: HashSet<String> = if profile.allow.iter().any(|t| t == "*") {
        registry.names().into_iter().collect()
    } else {
        profile.allow.iter().cloned().collect()
    };
    for name in &profile.deny {
        allowed.remove(name);
    }
    allowed.extend(policy.allow.iter().cloned());
    for name in &policy.deny {
        allowed.remove(name);
    }
    allowed
}

/// Trust tier for one tool call.
///
/// Precedence: the configured tool override, then the agent's own level,
/// then `suggest` for tools that require authorization, then `auto`.
pub fn tool_trust_level(
    cfg: &Config,
    agent_level: Option<TrustLevel>,
    tool: &str,
    requires_auth: bool,
) -> TrustLevel {
    if let Some(level) = cfg.tools.trust_override.get(tool) {
        return *level;
    }
    if let Some(level) = agent_level {
        return level;
    }
    if requires_auth {
        TrustLevel::Suggest
    } else {
        TrustLevel::Auto
    }
}

pub(crate) fn truncate_json(input: &Value, max: usize) -> String {
    preview(&input.to_string(), max)
}

/// Outcome of the trust filter: run the tool, or answer with a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    Execute,
    Withhold(String),
}

/// Apply the trust tier to a call. Withheld calls are reported back to the
/// model as a non-error tool result.
pub fn filter_tool_call(level: TrustLevel, agent: &str, call: &ToolCall) -> ToolDecision {
    match level {
        TrustLevel::Observe => {
            tracing::info!(tool = %call.name, agent, "Tool call observed (not executed)");
            ToolDecision::Withhold(format!(
                "[OBSERVE MODE: tool {} would execute with input: {}]",
                call.name,
                truncate_json(&call.input, 100)
            ))
        }
        TrustLevel::Suggest => {
            tracing::info!(tool = %call.name, agent, "Tool call requires approval");
            ToolDecision::Withhold(format!(
                "[APPROVAL REQUIRED: tool {} with input: {}]",
                call.name,
                truncate_json(&call.input, 200)
            ))
        }
        TrustLevel::Auto => ToolDecision::Execute,
    }
}
