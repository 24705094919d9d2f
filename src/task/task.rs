//! Task request and outcome types.
//!
//! # Invariants
//! - Once defaulted, `Task::id` and `Task::session_id` never change; retries and
//!   reroutes build a new `Task` with fresh identifiers.
//! - A `TaskResult` is produced exactly once per attempt and returned by value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::duration::format_duration;
use crate::events::EventBroker;
use crate::notify::ChannelNotifier;
use crate::tools::approval::ApprovalGate;
use crate::trust::TrustLevel;

/// Runtime collaborators attached to a task.
///
/// These are never serialized; a task rebuilt from JSON starts without them.
#[derive(Clone, Default)]
pub struct TaskRuntime {
    /// Channel that receives human-readable notices about this task.
    pub notifier: Option<Arc<dyn ChannelNotifier>>,
    /// Gate consulted for tools that require approval.
    pub approval_gate: Option<Arc<dyn ApprovalGate>>,
    /// Broker for tool progress when no dispatch-level broker is in play.
    pub events: Option<EventBroker>,
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("notifier", &self.notifier.is_some())
            .field("approval_gate", &self.approval_gate.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// A unit of work submitted to the engine.
///
/// Empty strings and zero values are filled by [`super::fill_defaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub system_prompt: String,

    pub model: String,
    pub provider: String,
    /// Go-style duration string, e.g. `15m` or `1h30m`.
    pub timeout: String,
    /// Soft spend limit for this task in USD.
    pub budget: f64,
    pub permission_mode: String,
    pub workdir: String,
    pub add_dirs: Vec<String>,
    /// Sandbox override: `Some(true)` requires one, `Some(false)` opts out of optional ones.
    pub sandbox: Option<bool>,

    #[serde(alias = "role")]
    pub agent: String,
    pub source: String,
    pub trace_id: String,
    pub session_id: String,

    /// Sub-agent nesting depth (0 for top-level tasks).
    pub depth: u32,
    pub parent_id: Option<String>,

    #[serde(skip)]
    pub runtime: TaskRuntime,
}

impl Task {
    /// Create a task with only a prompt set.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// First 8 characters of the id, for log lines and file names.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Prompt preview used in status views.
    pub fn prompt_preview(&self) -> String {
        preview(&self.prompt, 100)
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Truncate `text` to at most `max` characters, appending `...` when cut.
pub(crate) fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Terminal status of a task attempt.
///
/// # State Machine
/// ```text
/// prepared -> validated -> (sandboxed) -> budgeted -> executing -> Success
///                                                              \-> Error
///                                                              \-> Timeout
///                                                              \-> Cancelled
///                                                              \-> Queued
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    #[default]
    Error,
    Timeout,
    Cancelled,
    /// Deferred to the offline queue because no provider was reachable.
    Queued,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Queued => "queued",
        }
    }

    /// Whether the attempt belongs in the failed-task cache.
    pub fn is_retryable_failure(&self) -> bool {
        !matches!(self, TaskStatus::Success | TaskStatus::Queued)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskResult {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub exit_code: i32,
    pub output: String,
    pub error: String,
    pub duration_ms: u64,
    #[serde(rename = "costUsd")]
    pub cost_usd: f64,
    pub model: String,
    pub session_id: String,
    pub output_file: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub provider_ms: u64,
    pub trace_id: String,
    pub provider: String,
    pub trust_level: Option<TrustLevel>,
}

impl TaskResult {
    /// A failed result for an attempt that never reached a provider.
    pub fn failure(task: &Task, status: TaskStatus, error: impl Into<String>) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            status,
            exit_code: 1,
            error: error.into(),
            model: task.model.clone(),
            session_id: task.session_id.clone(),
            trace_id: task.trace_id.clone(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Aggregate of one batch dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_cost: f64,
    pub tasks: Vec<TaskResult>,
    pub summary: String,
}

impl DispatchResult {
    pub fn new(started_at: DateTime<Utc>, tasks: Vec<TaskResult>) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let total_cost = tasks.iter().map(|t| t.cost_usd).sum();
        let mut result = Self {
            started_at,
            finished_at,
            duration_ms,
            total_cost,
            tasks,
            summary: String::new(),
        };
        result.summary = result.build_summary();
        result
    }

    fn build_summary(&self) -> String {
        let ok = self.tasks.iter().filter(|t| t.is_success()).count();
        format!(
            "{}/{} tasks succeeded (${:.2}, {})",
            ok,
            self.tasks.len(),
            self.total_cost,
            format_duration(std::time::Duration::from_millis(self.duration_ms))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_deserializes_role_alias() {
        let task: Task =
            serde_json::from_str(r#"{"prompt":"hi","role":"coder","permissionMode":"plan"}"#)
                .unwrap();
        assert_eq!(task.agent, "coder");
        assert_eq!(task.permission_mode, "plan");
        assert!(task.runtime.notifier.is_none());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Queued).unwrap(),
            "\"queued\""
        );
        assert!(TaskStatus::Timeout.is_retryable_failure());
        assert!(!TaskStatus::Queued.is_retryable_failure());
        assert!(!TaskStatus::Success.is_retryable_failure());
    }

    #[test]
    fn test_summary() {
        let ok = TaskResult {
            status: TaskStatus::Success,
            cost_usd: 0.25,
            ..Default::default()
        };
        let failed = TaskResult {
            status: TaskStatus::Error,
            cost_usd: 0.5,
            ..Default::default()
        };
        let result = DispatchResult::new(Utc::now(), vec![ok, failed]);
        assert!(result.summary.starts_with("1/2 tasks succeeded ($0.75, "));
        assert!((result.total_cost - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_preview_is_char_safe() {
        let text = "é".repeat(150);
        let p = preview(&text, 100);
        assert_eq!(p.chars().count(), 103);
        assert!(p.ends_with("..."));
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789"), "01234567");
    }
}
