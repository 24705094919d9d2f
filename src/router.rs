//! Smart routing: pick an agent for a prompt that names none.
//!
//! The scoring algorithm is pluggable behind [`SmartRouter`]; the built-in
//! [`KeywordRouter`] matches each agent's configured keywords as whole words.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMethod {
    Keyword,
    Llm,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub agent: String,
    pub method: RouteMethod,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[async_trait]
pub trait SmartRouter: Send + Sync {
    async fn route(&self, prompt: &str, source: &str) -> anyhow::Result<RouteResult>;
}

/// Whole-word keyword matching over agent configs, falling back to the
/// configured default agent.
pub struct KeywordRouter {
    /// Sorted by agent name so matching is deterministic.
    rules: Vec<(String, Regex)>,
    default_agent: String,
}

impl KeywordRouter {
    pub fn new(cfg: &Config) -> Self {
        let mut rules: Vec<(String, Regex)> = cfg
            .agents
            .iter()
            .filter(|(_, a)| !a.keywords.is_empty())
            .filter_map(|(name, agent)| {
                let words: Vec<&str> = agent.keywords.iter().map(String::as_str).collect();
                let alternation = words
                    .iter()
                    .map(|w| regex::escape(w))
                    .collect::<Vec<_>>()
                    .join("|");
                match Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)) {
                    Ok(re) => Some((name.clone(), re)),
                    Err(e) => {
                        tracing::warn!(agent = %name, error = %e, "Skipping agent keywords");
                        None
                    }
                }
            })
            .collect();
        rules.sort_by(|a, b| a.0.cmp(&b.0));

        let default_agent = if cfg.smart_dispatch.default_agent.is_empty() {
            cfg.smart_dispatch.coordinator.clone()
        } else {
            cfg.smart_dispatch.default_agent.clone()
        };
        Self { rules, default_agent }
    }

    /// Keyword match only, without the default fallback.
    pub fn match_keywords(&self, prompt: &str) -> Option<RouteResult> {
        self.rules.iter().find_map(|(agent, re)| {
            re.find(prompt).map(|m| RouteResult {
                agent: agent.clone(),
                method: RouteMethod::Keyword,
                confidence: Confidence::Medium,
                reason: format!("matched agent keyword {:?}", m.as_str()),
            })
        })
    }
}

#[async_trait]
impl SmartRouter for KeywordRouter {
    async fn route(&self, prompt: &str, source: &str) -> anyhow::Result<RouteResult> {
        let route = self.match_keywords(prompt).unwrap_or_else(|| RouteResult {
            agent: self.default_agent.clone(),
            method: RouteMethod::Default,
            confidence: Confidence::Low,
            reason: "no keyword matched".to_string(),
        });
        tracing::debug!(agent = %route.agent, method = ?route.method, source, "Routed prompt");
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.smart_dispatch.default_agent = "generalist".to_string();
        for (name, words) in [("coder", vec!["rust", "compile"]), ("writer", vec!["blog", "essay"])] {
            cfg.agents.insert(
                name.to_string(),
                AgentConfig {
                    keywords: words.into_iter().map(String::from).collect(),
                    ..Default::default()
                },
            );
        }
        cfg
    }

    #[tokio::test]
    async fn test_keyword_match_is_whole_word() {
        let router = KeywordRouter::new(&config());
        let route = router.route("Why won't this Rust code compile?", "cli").await.unwrap();
        assert_eq!(route.agent, "coder");
        assert_eq!(route.method, RouteMethod::Keyword);

        let route = router.route("Draft a blog post", "cli").await.unwrap();
        assert_eq!(route.agent, "writer");

        // "trust" contains "rust" but is not the word.
        let route = router.route("Can I trust this?", "cli").await.unwrap();
        assert_eq!(route.agent, "generalist");
        assert_eq!(route.method, RouteMethod::Default);
        assert_eq!(route.confidence, Confidence::Low);
    }
}
