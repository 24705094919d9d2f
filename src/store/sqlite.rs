//! SQLite-backed store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{
    now_string, HistoryRecord, HistoryStore, OfflineQueue, QueueStatus, QueuedTask,
    SessionActivity, STREAK_WINDOW,
};
use crate::reflection::Reflection;
use crate::task::{Task, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT '',
    agent TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    cost_usd REAL NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    output_file TEXT,
    trace_id TEXT NOT NULL DEFAULT '',
    session_id TEXT NOT NULL DEFAULT '',
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_runs_agent ON job_runs(agent);
CREATE INDEX IF NOT EXISTS idx_job_runs_finished ON job_runs(finished_at);

CREATE TABLE IF NOT EXISTS session_activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    agent TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT '',
    prompt TEXT NOT NULL DEFAULT '',
    output TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    cost_usd REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_activity_session ON session_activity(session_id);

CREATE TABLE IF NOT EXISTS reflections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    agent TEXT NOT NULL DEFAULT '',
    score INTEGER NOT NULL,
    feedback TEXT NOT NULL DEFAULT '',
    improvement TEXT NOT NULL DEFAULT '',
    cost_usd REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_json TEXT NOT NULL,
    agent TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    enqueued_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create store dir: {}", e))?;
        }
        let db_path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_status(s: &str) -> TaskStatus {
    match s {
        "success" => TaskStatus::Success,
        "timeout" => TaskStatus::Timeout,
        "cancelled" => TaskStatus::Cancelled,
        "queued" => TaskStatus::Queued,
        _ => TaskStatus::Error,
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn record_history(&self, record: HistoryRecord) -> Result<(), String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO job_runs (job_id, name, source, agent, model, provider, status,
                    cost_usd, duration_ms, tokens_in, tokens_out, error, output_file,
                    trace_id, session_id, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    record.job_id,
                    record.name,
                    record.source,
                    record.agent,
                    record.model,
                    record.provider,
                    record.status.as_str(),
                    record.cost_usd,
                    record.duration_ms as i64,
                    record.tokens_in as i64,
                    record.tokens_out as i64,
                    record.error,
                    record.output_file,
                    record.trace_id,
                    record.session_id,
                    record.started_at,
                    record.finished_at,
                ],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn record_session_activity(&self, activity: SessionActivity) -> Result<(), String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO session_activity (session_id, agent, source, prompt, output, status, cost_usd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    activity.session_id,
                    activity.agent,
                    activity.source,
                    activity.prompt,
                    activity.output,
                    activity.status.as_str(),
                    activity.cost_usd,
                    activity.created_at,
                ],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn spend_since(&self, agent: Option<&str>, since: DateTime<Utc>) -> Result<f64, String> {
        let conn = self.conn.clone();
        let agent = agent.map(str::to_string);
        let since = since.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let total: Option<f64> = match agent {
                Some(agent) => conn.query_row(
                    "SELECT SUM(cost_usd) FROM job_runs WHERE agent = ?1 AND finished_at >= ?2",
                    params![agent, since],
                    |row| row.get(0),
                ),
                None => conn.query_row(
                    "SELECT SUM(cost_usd) FROM job_runs WHERE finished_at >= ?1",
                    params![since],
                    |row| row.get(0),
                ),
            }
            .map_err(|e| e.to_string())?;
            Ok(total.unwrap_or(0.0))
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn consecutive_successes(&self, agent: &str) -> Result<usize, String> {
        let conn = self.conn.clone();
        let agent = agent.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare("SELECT status FROM job_runs WHERE agent = ?1 ORDER BY id DESC LIMIT ?2")
                .map_err(|e| e.to_string())?;
            let statuses = stmt
                .query_map(params![agent, STREAK_WINDOW as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(statuses.iter().take_while(|s| *s == "success").count())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(
                    "SELECT job_id, name, source, agent, model, provider, status, cost_usd,
                            duration_ms, tokens_in, tokens_out, error, output_file, trace_id,
                            session_id, started_at, finished_at
                     FROM job_runs ORDER BY id DESC LIMIT ?1",
                )
                .map_err(|e| e.to_string())?;
            let records = stmt
                .query_map(params![limit as i64], |row| {
                    let status: String = row.get(6)?;
                    Ok(HistoryRecord {
                        job_id: row.get(0)?,
                        name: row.get(1)?,
                        source: row.get(2)?,
                        agent: row.get(3)?,
                        model: row.get(4)?,
                        provider: row.get(5)?,
                        status: parse_status(&status),
                        cost_usd: row.get(7)?,
                        duration_ms: row.get::<_, i64>(8)?.max(0) as u64,
                        tokens_in: row.get::<_, i64>(9)?.max(0) as u64,
                        tokens_out: row.get::<_, i64>(10)?.max(0) as u64,
                        error: row.get(11)?,
                        output_file: row.get(12)?,
                        trace_id: row.get(13)?,
                        session_id: row.get(14)?,
                        started_at: row.get(15)?,
                        finished_at: row.get(16)?,
                    })
                })
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(records)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn store_reflection(&self, reflection: Reflection) -> Result<(), String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO reflections (job_id, agent, score, feedback, improvement, cost_usd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    reflection.job_id,
                    reflection.agent,
                    reflection.score as i64,
                    reflection.feedback,
                    reflection.improvement,
                    reflection.cost_usd,
                    reflection.created_at,
                ],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[async_trait]
impl OfflineQueue for SqliteStore {
    async fn enqueue(&self, task: &Task, agent: &str, priority: i32) -> Result<i64, String> {
        let task_json = serde_json::to_string(task).map_err(|e| e.to_string())?;
        let agent = agent.to_string();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO offline_queue (task_json, agent, priority, status, enqueued_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![task_json, agent, priority, now_string()],
            )
            .map_err(|e| e.to_string())?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn is_full(&self, max_items: usize) -> Result<bool, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM offline_queue WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| e.to_string())?;
            Ok(count.max(0) as usize >= max_items)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn pending(&self) -> Result<Vec<QueuedTask>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_json, agent, priority, enqueued_at FROM offline_queue
                     WHERE status = 'pending' ORDER BY priority DESC, id ASC",
                )
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;

            let mut items = Vec::with_capacity(rows.len());
            for (id, task_json, agent, priority, enqueued_at) in rows {
                match serde_json::from_str::<Task>(&task_json) {
                    Ok(task) => items.push(QueuedTask {
                        id,
                        task,
                        agent,
                        priority,
                        status: QueueStatus::Pending,
                        enqueued_at,
                    }),
                    Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable queued task"),
                }
            }
            Ok(items)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn expire(&self, ttl: Duration) -> Result<usize, String> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(ttl).map_err(|e| e.to_string())?)
            .to_rfc3339();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn
                .execute(
                    "UPDATE offline_queue SET status = 'expired'
                     WHERE status = 'pending' AND enqueued_at < ?1",
                    params![cutoff],
                )
                .map_err(|e| e.to_string())?;
            Ok(changed)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

impl SqliteStore {
    /// Latest reflection for a job, if any.
    pub async fn reflection_for(&self, job_id: &str) -> Result<Option<Reflection>, String> {
        let conn = self.conn.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT job_id, agent, score, feedback, improvement, cost_usd, created_at
                 FROM reflections WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                params![job_id],
                |row| {
                    Ok(Reflection {
                        job_id: row.get(0)?,
                        agent: row.get(1)?,
                        score: row.get::<_, i64>(2)?.clamp(0, 255) as u8,
                        feedback: row.get(3)?,
                        improvement: row.get(4)?,
                        cost_usd: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("history.db")).await.unwrap();
        let start = Utc::now() - chrono::Duration::seconds(5);

        for (status, cost) in [(TaskStatus::Error, 0.2), (TaskStatus::Success, 0.3), (TaskStatus::Success, 0.5)] {
            store
                .record_history(HistoryRecord {
                    job_id: "j".to_string(),
                    agent: "coder".to_string(),
                    status,
                    cost_usd: cost,
                    started_at: now_string(),
                    finished_at: now_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        assert_eq!(store.consecutive_successes("coder").await.unwrap(), 2);
        let spent = store.spend_since(Some("coder"), start).await.unwrap();
        assert!((spent - 1.0).abs() < 1e-9);
        assert_eq!(store.spend_since(Some("nobody"), start).await.unwrap(), 0.0);

        let recent = store.recent_history(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].status, TaskStatus::Success);
        assert_eq!(recent[2].status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_offline_queue_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("nested").join("q.db")).await.unwrap();

        let mut task = Task::new("summarize the logs").with_agent("ops");
        task.id = "t-1".to_string();
        store.enqueue(&task, "ops", 1).await.unwrap();
        store.enqueue(&Task::new("urgent"), "ops", 9).await.unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].task.prompt, "urgent");
        assert_eq!(pending[1].task.id, "t-1");
        assert!(store.is_full(2).await.unwrap());

        assert_eq!(store.expire(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.expire(Duration::from_millis(1)).await.unwrap(), 2);
        assert!(!store.is_full(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_reflection_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("r.db")).await.unwrap();
        store
            .store_reflection(Reflection {
                job_id: "j1".to_string(),
                agent: "coder".to_string(),
                score: 4,
                feedback: "solid".to_string(),
                improvement: "add tests".to_string(),
                cost_usd: 0.01,
                created_at: now_string(),
            })
            .await
            .unwrap();
        let stored = store.reflection_for("j1").await.unwrap().unwrap();
        assert_eq!(stored.score, 4);
        assert!(store.reflection_for("missing").await.unwrap().is_none());
    }
}
