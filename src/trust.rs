//! Agent trust tiers and promotion.
//!
//! Tiers are ordered `observe < suggest < auto`. An agent's tier comes from
//! an in-memory promotion, then its config, then the configured default.
//! Trust only applies when `trust.enabled` is set; otherwise every agent is
//! `auto`.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::store::HistoryStore;
use crate::task::Task;

/// Minimum spacing between two promotion suggestions for one agent.
const SUGGESTION_COOLDOWN_HOURS: i64 = 24;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Report only, no side effects.
    Observe,
    /// Execute, but present actions for confirmation.
    Suggest,
    #[default]
    Auto,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Observe => "observe",
            TrustLevel::Suggest => "suggest",
            TrustLevel::Auto => "auto",
        }
    }

    pub fn next(&self) -> Option<TrustLevel> {
        match self {
            TrustLevel::Observe => Some(TrustLevel::Suggest),
            TrustLevel::Suggest => Some(TrustLevel::Auto),
            TrustLevel::Auto => None,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A promotion produced after a successful task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustPromotion {
    pub agent: String,
    pub from: TrustLevel,
    pub to: TrustLevel,
    pub consecutive_successes: usize,
    /// Whether the level was changed, or only suggested.
    pub applied: bool,
    pub message: String,
}

#[derive(Default)]
pub struct TrustManager {
    promoted: RwLock<HashMap<String, TrustLevel>>,
    last_suggestion: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TrustManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective trust level for an agent.
    pub fn resolve(&self, cfg: &Config, agent: &str) -> TrustLevel {
        if !cfg.trust.enabled || agent.is_empty() {
            return TrustLevel::Auto;
        }
        if let Some(level) = self.promoted.read().ok().and_then(|p| p.get(agent).copied()) {
            return level;
        }
        cfg.agent(agent)
            .and_then(|a| a.trust_level)
            .unwrap_or(cfg.trust.default_level)
    }

    /// Level set for the agent itself (promoted or configured), ignoring
    /// the global default.
    pub fn explicit_level(&self, cfg: &Config, agent: &str) -> Option<TrustLevel> {
        if agent.is_empty() {
            return None;
        }
        self.promoted
            .read()
            .ok()
            .and_then(|p| p.get(agent).copied())
            .or_else(|| cfg.agent(agent).and_then(|a| a.trust_level))
    }

    /// Resolve the agent's level and restrict the task accordingly.
    ///
    /// `observe` forces plan mode so the provider makes no changes.
    pub fn apply_to_task(&self, cfg: &Config, task: &mut Task) -> TrustLevel {
        let level = self.resolve(cfg, &task.agent);
        if level == TrustLevel::Observe {
            task.permission_mode = "plan".to_string();
        }
        level
    }

    pub fn set_level(&self, agent: &str, level: TrustLevel) {
        if let Ok(mut promoted) = self.promoted.write() {
            promoted.insert(agent.to_string(), level);
        }
    }

    /// Check whether an agent has earned the next tier after a success.
    ///
    /// With `auto_promote` the level changes in memory; otherwise a
    /// suggestion is produced at most once per 24 hours.
    pub async fn check_promotion(
        &self,
        cfg: &Config,
        history: &dyn HistoryStore,
        agent: &str,
    ) -> Option<TrustPromotion> {
        if !cfg.trust.enabled || agent.is_empty() {
            return None;
        }
        let level = self.resolve(cfg, agent);
        let next = level.next()?;

        let streak = match history.consecutive_successes(agent).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(agent, error = %e, "Failed to read success streak");
                return None;
            }
        };
        let threshold = if cfg.trust.promote_threshold > 0 {
            cfg.trust.promote_threshold
        } else {
            10
        };
        if streak < threshold {
            return None;
        }

        let now = Utc::now();
        if let Ok(last) = self.last_suggestion.lock() {
            if let Some(at) = last.get(agent) {
                if now - *at < Duration::hours(SUGGESTION_COOLDOWN_HOURS) {
                    return None;
                }
            }
        }

        if cfg.trust.auto_promote {
            self.set_level(agent, next);
            tracing::info!(agent, from = %level, to = %next, "Trust auto-promoted");
            return Some(TrustPromotion {
                agent: agent.to_string(),
                from: level,
                to: next,
                consecutive_successes: streak,
                applied: true,
                message: format!(
                    "Trust Auto-Promoted [{}]\n{} → {} ({} consecutive successes)",
                    agent, level, next, streak
                ),
            });
        }

        if let Ok(mut last) = self.last_suggestion.lock() {
            last.insert(agent.to_string(), now);
        }
        Some(TrustPromotion {
            agent: agent.to_string(),
            from: level,
            to: next,
            consecutive_successes: streak,
            applied: false,
            message: format!(
                "Trust Promotion Ready [{}]\n{} → {} available ({} consecutive successes)",
                agent, level, next, streak
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::store::{HistoryRecord, MemoryStore};
    use crate::task::TaskStatus;

    fn config(level: TrustLevel, auto_promote: bool) -> Config {
        let mut cfg = Config::default();
        cfg.trust.enabled = true;
        cfg.trust.promote_threshold = 3;
        cfg.trust.auto_promote = auto_promote;
        cfg.agents.insert(
            "coder".to_string(),
            AgentConfig {
                trust_level: Some(level),
                ..Default::default()
            },
        );
        cfg
    }

    async fn record_successes(store: &MemoryStore, n: usize) {
        for _ in 0..n {
            store
                .record_history(HistoryRecord {
                    agent: "coder".to_string(),
                    status: TaskStatus::Success,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_resolve() {
        let trust = TrustManager::new();
        let mut cfg = config(TrustLevel::Observe, false);
        assert_eq!(trust.resolve(&cfg, "coder"), TrustLevel::Observe);
        assert_eq!(trust.resolve(&cfg, ""), TrustLevel::Auto);
        assert_eq!(trust.resolve(&cfg, "unknown"), TrustLevel::Auto);

        cfg.trust.enabled = false;
        assert_eq!(trust.resolve(&cfg, "coder"), TrustLevel::Auto);
    }

    #[test]
    fn test_observe_forces_plan_mode() {
        let trust = TrustManager::new();
        let cfg = config(TrustLevel::Observe, false);
        let mut task = Task::new("x").with_agent("coder");
        task.permission_mode = "acceptEdits".to_string();
        assert_eq!(trust.apply_to_task(&cfg, &mut task), TrustLevel::Observe);
        assert_eq!(task.permission_mode, "plan");
    }

    #[tokio::test]
    async fn test_suggestion_once_per_day() {
        let trust = TrustManager::new();
        let cfg = config(TrustLevel::Suggest, false);
        let store = MemoryStore::new();

        record_successes(&store, 2).await;
        assert!(trust.check_promotion(&cfg, &store, "coder").await.is_none());

        record_successes(&store, 1).await;
        let promo = trust.check_promotion(&cfg, &store, "coder").await.unwrap();
        assert!(!promo.applied);
        assert_eq!(
            promo.message,
            "Trust Promotion Ready [coder]\nsuggest → auto available (3 consecutive successes)"
        );
        // Level unchanged, and the second suggestion is suppressed
        assert_eq!(trust.resolve(&cfg, "coder"), TrustLevel::Suggest);
        assert!(trust.check_promotion(&cfg, &store, "coder").await.is_none());
    }

    #[tokio::test]
    async fn test_auto_promote() {
        let trust = TrustManager::new();
        let cfg = config(TrustLevel::Observe, true);
        let store = MemoryStore::new();
        record_successes(&store, 3).await;

        let promo = trust.check_promotion(&cfg, &store, "coder").await.unwrap();
        assert!(promo.applied);
        assert_eq!(promo.to, TrustLevel::Suggest);
        assert_eq!(trust.resolve(&cfg, "coder"), TrustLevel::Suggest);
    }
}
