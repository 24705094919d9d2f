//! Pre-dispatch cost estimation.
//!
//! Input tokens are approximated as bytes/4; output tokens come from config.
//! Prices are USD per million tokens.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::provider::resolve_provider_name;
use crate::router::SmartRouter;
use crate::task::{fill_defaults, Task};

/// Tokens assumed for a smart-dispatch classification call.
const CLASSIFY_TOKENS_IN: u64 = 500;
const CLASSIFY_TOKENS_OUT: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per 1M input tokens.
    pub input: f64,
    /// USD per 1M output tokens.
    pub output: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        tokens_in as f64 * self.input / 1_000_000.0 + tokens_out as f64 * self.output / 1_000_000.0
    }
}

const BUILTIN_PRICING: &[(&str, ModelPricing)] = &[
    ("opus", ModelPricing::new(15.0, 75.0)),
    ("sonnet", ModelPricing::new(3.0, 15.0)),
    ("haiku", ModelPricing::new(0.25, 1.25)),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4o", ModelPricing::new(2.50, 10.0)),
    ("gpt-4-turbo", ModelPricing::new(10.0, 30.0)),
    ("o1", ModelPricing::new(15.0, 60.0)),
];

/// Price used for models no table entry matches.
const FALLBACK_PRICING: ModelPricing = ModelPricing::new(2.50, 10.0);

fn lookup(table: &HashMap<String, ModelPricing>, model: &str) -> Option<ModelPricing> {
    if let Some(p) = table.get(model) {
        return Some(*p);
    }
    let lower = model.to_lowercase();
    let mut keys: Vec<&String> = table.keys().collect();
    // Longest key first so "gpt-4o-mini" wins over "gpt-4o".
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    keys.into_iter()
        .find(|k| lower.contains(&k.to_lowercase()))
        .and_then(|k| table.get(k).copied())
}

/// Pricing for a model: config overrides, then the built-in table (exact,
/// then substring match), then a flat fallback.
pub fn resolve_pricing(cfg: &Config, model: &str) -> ModelPricing {
    price_for(&cfg.estimate.pricing, model)
}

/// [`resolve_pricing`] against an explicit override table.
pub fn price_for(overrides: &HashMap<String, ModelPricing>, model: &str) -> ModelPricing {
    if let Some(p) = lookup(overrides, model) {
        return p;
    }
    let builtin: HashMap<String, ModelPricing> = BUILTIN_PRICING
        .iter()
        .map(|(k, p)| (k.to_string(), *p))
        .collect();
    lookup(&builtin, model).unwrap_or(FALLBACK_PRICING)
}

/// Approximate tokens for a piece of text (bytes/4, at least 10).
pub fn estimate_input_tokens(prompt: &str, system_prompt: &str) -> u64 {
    (((prompt.len() + system_prompt.len()) / 4) as u64).max(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub name: String,
    pub agent: String,
    pub provider: String,
    pub model: String,
    pub estimated_cost_usd: f64,
    pub estimated_tokens_in: u64,
    pub estimated_tokens_out: u64,
    pub breakdown: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateResult {
    pub tasks: Vec<CostEstimate>,
    #[serde(rename = "totalEstimatedCostUsd")]
    pub total_estimated_cost_usd: f64,
    #[serde(rename = "classifyCostUsd")]
    pub classify_cost_usd: f64,
}

/// Estimate one defaulted task as if run by `agent`.
pub fn estimate_task(cfg: &Config, task: &Task, agent: &str) -> CostEstimate {
    let mut routed = task.clone();
    routed.agent = agent.to_string();
    let provider = resolve_provider_name(cfg, &routed);

    let mut model = task.model.clone();
    if model.is_empty() {
        model = cfg
            .providers
            .get(&provider)
            .map(|p| p.model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| cfg.default_model.clone());
    }
    if let Some(agent_cfg) = cfg.agent(agent) {
        if !agent_cfg.model.is_empty() && (task.model.is_empty() || task.model == cfg.default_model) {
            model = agent_cfg.model.clone();
        }
    }

    let tokens_in = estimate_input_tokens(&task.prompt, &task.system_prompt);
    let tokens_out = cfg.estimate.default_output_tokens.max(1);
    let pricing = resolve_pricing(cfg, &model);

    CostEstimate {
        name: task.name.clone(),
        agent: agent.to_string(),
        provider,
        estimated_cost_usd: pricing.cost(tokens_in, tokens_out),
        estimated_tokens_in: tokens_in,
        estimated_tokens_out: tokens_out,
        breakdown: format!(
            "~{} in + ~{} out @ ${:.2}/${:.2} per 1M",
            tokens_in, tokens_out, pricing.input, pricing.output
        ),
        model,
    }
}

/// Estimate a batch. Tasks without an agent are routed first when smart
/// dispatch is on, and each such task adds one classification call.
pub async fn estimate_tasks(
    cfg: &Config,
    tasks: &[Task],
    router: Option<&dyn SmartRouter>,
) -> EstimateResult {
    let mut result = EstimateResult::default();

    for task in tasks {
        let mut task = task.clone();
        fill_defaults(cfg, &mut task);
        let mut agent = task.agent.clone();

        if agent.is_empty() && cfg.smart_dispatch.enabled {
            let classify_model = cfg
                .agent(&cfg.smart_dispatch.coordinator)
                .map(|a| a.model.clone())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| cfg.default_model.clone());
            result.classify_cost_usd +=
                resolve_pricing(cfg, &classify_model).cost(CLASSIFY_TOKENS_IN, CLASSIFY_TOKENS_OUT);

            agent = match router {
                Some(router) => match router.route(&task.prompt, &task.source).await {
                    Ok(route) if !route.agent.is_empty() => route.agent,
                    Ok(_) => cfg.smart_dispatch.default_agent.clone(),
                    Err(e) => {
                        tracing::debug!(error = %e, "Routing failed during estimate");
                        cfg.smart_dispatch.default_agent.clone()
                    }
                },
                None => cfg.smart_dispatch.default_agent.clone(),
            };
        }

        let estimate = estimate_task(cfg, &task, &agent);
        result.total_estimated_cost_usd += estimate.estimated_cost_usd;
        result.tasks.push(estimate);
    }

    result.total_estimated_cost_usd += result.classify_cost_usd;
    result
}
