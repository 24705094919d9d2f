//! Spend limits and model auto-downgrade.
//!
//! The pipeline asks the [`BudgetAuthority`] before running a task and the
//! tool loop asks again between rounds with the cost accrued so far.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use serde::Serialize;

use crate::config::{AutoDowngradeConfig, BudgetConfig};
use crate::store::HistoryStore;

/// What a budget check covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    /// Admission of a new task.
    Task,
    /// In-flight spend of a running task, checked against global limits.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Ok,
    Warning,
    Critical,
    Exceeded,
    Paused,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub exceeded: bool,
    pub paused: bool,
    /// Model to switch to, when auto-downgrade applies.
    pub downgrade_model: Option<String>,
    /// Highest spend/limit ratio across the checked limits.
    pub utilization: f64,
    pub alert_level: AlertLevel,
    pub message: String,
}

impl BudgetCheck {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    fn exceeded(utilization: f64, message: String) -> Self {
        Self {
            allowed: false,
            exceeded: true,
            utilization,
            alert_level: AlertLevel::Exceeded,
            message,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait BudgetAuthority: Send + Sync {
    /// Check whether `agent` may spend. `amount` is cost already committed
    /// by the caller but not yet recorded in history.
    async fn check(&self, agent: &str, scope: BudgetScope, amount: f64) -> BudgetCheck;
}

/// Highest threshold at or below `utilization`.
pub fn resolve_downgrade_model(cfg: &AutoDowngradeConfig, utilization: f64) -> Option<String> {
    cfg.thresholds
        .iter()
        .filter(|t| utilization >= t.at)
        .max_by(|a, b| a.at.total_cmp(&b.at))
        .map(|t| t.model.clone())
}

/// Budget limits read from config, with spend taken from run history.
pub struct LimitBudget {
    config: BudgetConfig,
    history: Arc<dyn HistoryStore>,
}

fn start_of_today() -> DateTime<Utc> {
    let today = Local::now().date_naive();
    today
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() - Duration::hours(24))
}

impl LimitBudget {
    pub fn new(config: BudgetConfig, history: Arc<dyn HistoryStore>) -> Self {
        Self { config, history }
    }

    async fn spend(&self, agent: Option<&str>, since: DateTime<Utc>) -> f64 {
        match self.history.spend_since(agent, since).await {
            Ok(spent) => spent,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read spend, treating as zero");
                0.0
            }
        }
    }
}

#[async_trait]
impl BudgetAuthority for LimitBudget {
    async fn check(&self, agent: &str, scope: BudgetScope, amount: f64) -> BudgetCheck {
        let budgets = &self.config;
        if budgets.paused {
            return BudgetCheck {
                allowed: false,
                paused: true,
                alert_level: AlertLevel::Paused,
                message: "budget paused: all paid execution suspended".to_string(),
                ..Default::default()
            };
        }
        if !budgets.has_limits() {
            return BudgetCheck::allow();
        }

        let today = start_of_today();
        let mut max_utilization: f64 = 0.0;

        let global = &budgets.global;
        let periods = [
            ("daily", global.daily, today),
            ("weekly", global.weekly, today - Duration::days(7)),
            ("monthly", global.monthly, today - Duration::days(30)),
        ];
        for (label, limit, since) in periods {
            if limit <= 0.0 {
                continue;
            }
            let spent = self.spend(None, since).await + amount;
            let u = spent / limit;
            max_utilization = max_utilization.max(u);
            if u >= 1.0 {
                return BudgetCheck::exceeded(
                    u,
                    format!("{} budget exceeded: ${:.2} / ${:.2}", label, spent, limit),
                );
            }
        }

        if scope == BudgetScope::Task && !agent.is_empty() {
            if let Some(limit) = budgets.agents.get(agent).map(|b| b.daily).filter(|d| *d > 0.0) {
                let spent = self.spend(Some(agent), today).await + amount;
                let u = spent / limit;
                max_utilization = max_utilization.max(u);
                if u >= 1.0 {
                    return BudgetCheck::exceeded(
                        u,
                        format!(
                            "role {:?} daily budget exceeded: ${:.2} / ${:.2}",
                            agent, spent, limit
                        ),
                    );
                }
            }
        }

        let alert_level = if max_utilization >= 0.9 {
            AlertLevel::Critical
        } else if max_utilization >= 0.7 {
            AlertLevel::Warning
        } else {
            AlertLevel::Ok
        };
        let downgrade_model = if budgets.auto_downgrade.enabled {
            resolve_downgrade_model(&budgets.auto_downgrade, max_utilization)
        } else {
            None
        };

        BudgetCheck {
            allowed: true,
            utilization: max_utilization,
            alert_level,
            downgrade_model,
            ..Default::default()
        }
    }
}
