//! In-memory store (non-persistent).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    now_string, HistoryRecord, HistoryStore, OfflineQueue, QueueStatus, QueuedTask,
    SessionActivity, STREAK_WINDOW,
};
use crate::reflection::Reflection;
use crate::task::{Task, TaskStatus};

#[derive(Default)]
struct Tables {
    history: Vec<HistoryRecord>,
    sessions: Vec<SessionActivity>,
    reflections: Vec<Reflection>,
    queue: Vec<(QueuedTask, DateTime<Utc>)>,
    next_queue_id: i64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sessions(&self) -> Vec<SessionActivity> {
        self.tables.read().await.sessions.clone()
    }

    pub async fn reflections(&self) -> Vec<Reflection> {
        self.tables.read().await.reflections.clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn record_history(&self, record: HistoryRecord) -> Result<(), String> {
        self.tables.write().await.history.push(record);
        Ok(())
    }

    async fn record_session_activity(&self, activity: SessionActivity) -> Result<(), String> {
        self.tables.write().await.sessions.push(activity);
        Ok(())
    }

    async fn spend_since(&self, agent: Option<&str>, since: DateTime<Utc>) -> Result<f64, String> {
        let since = since.to_rfc3339();
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|r| agent.map_or(true, |a| r.agent == a))
            .filter(|r| r.finished_at.is_empty() || r.finished_at >= since)
            .map(|r| r.cost_usd)
            .sum())
    }

    async fn consecutive_successes(&self, agent: &str) -> Result<usize, String> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .rev()
            .filter(|r| r.agent == agent)
            .take(STREAK_WINDOW)
            .take_while(|r| r.status == TaskStatus::Success)
            .count())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, String> {
        let tables = self.tables.read().await;
        Ok(tables.history.iter().rev().take(limit).cloned().collect())
    }

    async fn store_reflection(&self, reflection: Reflection) -> Result<(), String> {
        self.tables.write().await.reflections.push(reflection);
        Ok(())
    }
}

#[async_trait]
impl OfflineQueue for MemoryStore {
    async fn enqueue(&self, task: &Task, agent: &str, priority: i32) -> Result<i64, String> {
        let mut tables = self.tables.write().await;
        tables.next_queue_id += 1;
        let id = tables.next_queue_id;
        tables.queue.push((
            QueuedTask {
                id,
                task: task.clone(),
                agent: agent.to_string(),
                priority,
                status: QueueStatus::Pending,
                enqueued_at: now_string(),
            },
            Utc::now(),
        ));
        Ok(id)
    }

    async fn is_full(&self, max_items: usize) -> Result<bool, String> {
        let tables = self.tables.read().await;
        let pending = tables
            .queue
            .iter()
            .filter(|(q, _)| q.status == QueueStatus::Pending)
            .count();
        Ok(pending >= max_items)
    }

    async fn pending(&self) -> Result<Vec<QueuedTask>, String> {
        let tables = self.tables.read().await;
        let mut items: Vec<QueuedTask> = tables
            .queue
            .iter()
            .filter(|(q, _)| q.status == QueueStatus::Pending)
            .map(|(q, _)| q.clone())
            .collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn expire(&self, ttl: Duration) -> Result<usize, String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).map_err(|e| e.to_string())?;
        let mut tables = self.tables.write().await;
        let mut expired = 0;
        for (item, at) in tables.queue.iter_mut() {
            if item.status == QueueStatus::Pending && *at < cutoff {
                item.status = QueueStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
