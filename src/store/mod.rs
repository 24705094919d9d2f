//! Persistence for run history, session activity, reflections and the
//! offline queue.
//!
//! Backends:
//! - `memory`: In-memory storage (non-persistent, for tests and stateless runs)
//! - `sqlite`: SQLite database under the base directory

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reflection::Reflection;
use crate::task::{preview, Task, TaskResult, TaskStatus};

/// One finished task attempt, as kept in history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub job_id: String,
    pub name: String,
    pub source: String,
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub status: TaskStatus,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub error: String,
    pub output_file: Option<String>,
    pub trace_id: String,
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
}

impl HistoryRecord {
    pub fn from_result(task: &Task, result: &TaskResult, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: task.id.clone(),
            name: task.name.clone(),
            source: task.source.clone(),
            agent: task.agent.clone(),
            model: result.model.clone(),
            provider: result.provider.clone(),
            status: result.status,
            cost_usd: result.cost_usd,
            duration_ms: result.duration_ms,
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            error: result.error.clone(),
            output_file: result.output_file.clone(),
            trace_id: result.trace_id.clone(),
            session_id: result.session_id.clone(),
            started_at: started_at.to_rfc3339(),
            finished_at: now_string(),
        }
    }
}

/// A prompt/response exchange attributed to a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionActivity {
    pub session_id: String,
    pub agent: String,
    pub source: String,
    pub prompt: String,
    pub output: String,
    pub status: TaskStatus,
    pub cost_usd: f64,
    pub created_at: String,
}

impl SessionActivity {
    pub fn from_result(task: &Task, result: &TaskResult) -> Self {
        Self {
            session_id: task.session_id.clone(),
            agent: task.agent.clone(),
            source: task.source.clone(),
            prompt: preview(&task.prompt, 500),
            output: preview(&result.output, 2000),
            status: result.status,
            cost_usd: result.cost_usd,
            created_at: now_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Expired,
}

/// A task deferred because no provider was reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: i64,
    pub task: Task,
    pub agent: String,
    pub priority: i32,
    pub status: QueueStatus,
    pub enqueued_at: String,
}

/// Run history and session activity.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    async fn record_history(&self, record: HistoryRecord) -> Result<(), String>;

    async fn record_session_activity(&self, activity: SessionActivity) -> Result<(), String>;

    /// Total spend since `since`, for one agent or (with `None`) overall.
    async fn spend_since(&self, agent: Option<&str>, since: DateTime<Utc>) -> Result<f64, String>;

    /// Successes in a row, counting back from the latest run (capped at 50).
    async fn consecutive_successes(&self, agent: &str) -> Result<usize, String>;

    /// Most recent records first.
    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, String>;

    async fn store_reflection(&self, reflection: Reflection) -> Result<(), String>;
}

/// Tasks deferred while providers are unreachable. Draining is done elsewhere.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    async fn enqueue(&self, task: &Task, agent: &str, priority: i32) -> Result<i64, String>;

    /// Whether the number of pending items has reached `max_items`.
    async fn is_full(&self, max_items: usize) -> Result<bool, String>;

    /// Pending items, highest priority first, then oldest first.
    async fn pending(&self) -> Result<Vec<QueuedTask>, String>;

    /// Mark pending items older than `ttl` as expired. Returns how many.
    async fn expire(&self, ttl: Duration) -> Result<usize, String>;
}

/// How far back the success streak looks.
pub(crate) const STREAK_WINDOW: usize = 50;

pub(crate) fn now_string() -> String {
    Utc::now().to_rfc3339()
}
