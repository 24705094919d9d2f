//! Post-task self-reflection.
//!
//! After selected tasks finish, a cheap model grades the output 1-5 and
//! suggests one improvement. Reflections are stored next to run history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ReflectionConfig};
use crate::provider::{
    execute_with_failover, provider_candidates, ProviderRegistry, ProviderRequest,
};
use crate::store::{now_string, HistoryStore};
use crate::task::{preview, Task, TaskResult, TaskStatus};

const REFLECTION_MODEL: &str = "haiku";
const REFLECTION_BUDGET: f64 = 0.05;
const REFLECTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MIN_COST: f64 = 0.03;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reflection {
    pub job_id: String,
    pub agent: String,
    /// 1 (poor) to 5 (excellent).
    pub score: u8,
    pub feedback: String,
    pub improvement: String,
    pub cost_usd: f64,
    pub created_at: String,
}

/// Whether a finished task should be reflected on.
pub fn should_reflect(cfg: &ReflectionConfig, task: &Task, result: &TaskResult) -> bool {
    if !cfg.enabled || task.agent.is_empty() {
        return false;
    }
    let failed = matches!(result.status, TaskStatus::Error | TaskStatus::Timeout);
    if failed {
        return cfg.trigger_on_fail;
    }
    let min_cost = if cfg.min_cost > 0.0 { cfg.min_cost } else { DEFAULT_MIN_COST };
    result.cost_usd >= min_cost
}

#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, task: &Task, result: &TaskResult) -> Result<Reflection>;
}

/// Asks the task's own provider chain to grade the output.
pub struct ProviderReflector {
    config: Arc<Config>,
    providers: ProviderRegistry,
}

impl ProviderReflector {
    pub fn new(config: Arc<Config>, providers: ProviderRegistry) -> Self {
        Self { config, providers }
    }
}

fn reflection_prompt(task: &Task, result: &TaskResult) -> String {
    format!(
        "Evaluate this task output quality. Score 1-5 (1=poor, 5=excellent).\n\
         Respond ONLY with JSON: {{\"score\":N,\"feedback\":\"brief assessment\",\"improvement\":\"specific suggestion\"}}\n\n\
         Task: {}\nAgent: {}\nStatus: {}\nOutput: {}",
        preview(&task.prompt, 500),
        task.agent,
        result.status,
        preview(&result.output, 1000)
    )
}

#[async_trait]
impl Reflector for ProviderReflector {
    async fn reflect(&self, task: &Task, result: &TaskResult) -> Result<Reflection> {
        let req = ProviderRequest {
            prompt: reflection_prompt(task, result),
            model: REFLECTION_MODEL.to_string(),
            workdir: task.workdir.clone(),
            timeout: REFLECTION_TIMEOUT,
            budget: REFLECTION_BUDGET,
            permission_mode: "plan".to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        };
        let candidates = provider_candidates(&self.config, task);

        let out = tokio::time::timeout(
            REFLECTION_TIMEOUT,
            execute_with_failover(&self.providers, &candidates, &req),
        )
        .await
        .map_err(|_| anyhow!("reflection timed out after {}s", REFLECTION_TIMEOUT.as_secs()))?;
        if out.is_error {
            return Err(anyhow!("reflection failed: {}", out.error));
        }

        let mut reflection = parse_reflection(&out.output).context("parse reflection")?;
        reflection.job_id = task.id.clone();
        reflection.agent = task.agent.clone();
        reflection.cost_usd = out.cost_usd;
        reflection.created_at = now_string();
        Ok(reflection)
    }
}

/// First balanced `{...}` object in `s`, ignoring a surrounding code fence.
pub fn extract_json(s: &str) -> Option<&str> {
    let mut s = s.trim();
    if s.starts_with("```") {
        if let Some(idx) = s.find('\n') {
            s = &s[idx + 1..];
        }
        if let Some(last) = s.rfind("```") {
            s = &s[..last];
        }
        s = s.trim();
    }

    let start = s.find('{')?;
    let mut depth = 0usize;
    for (i, b) in s.bytes().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
struct Graded {
    score: i64,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    improvement: String,
}

/// Parse model output into a reflection. The score must be 1-5.
pub fn parse_reflection(output: &str) -> Result<Reflection> {
    let json = extract_json(output).ok_or_else(|| anyhow!("no JSON found in reflection output"))?;
    let graded: Graded = serde_json::from_str(json).context("invalid JSON in reflection")?;
    if !(1..=5).contains(&graded.score) {
        return Err(anyhow!("score {} out of range 1-5", graded.score));
    }
    Ok(Reflection {
        score: graded.score as u8,
        feedback: graded.feedback,
        improvement: graded.improvement,
        ..Default::default()
    })
}

/// Reflect on a finished task and store the result. Failures are logged.
pub async fn reflect_and_store(
    reflector: Arc<dyn Reflector>,
    history: Arc<dyn HistoryStore>,
    task: Task,
    result: TaskResult,
) {
    match reflector.reflect(&task, &result).await {
        Ok(reflection) => {
            tracing::info!(
                task_id = %task.id,
                agent = %task.agent,
                score = reflection.score,
                "Reflection recorded"
            );
            if let Err(e) = history.store_reflection(reflection).await {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to store reflection");
            }
        }
        Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Reflection failed"),
    }
}
