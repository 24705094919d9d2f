//! Shared dispatch state: running tasks, finished results, the failed-task
//! cache used by retry/reroute, and externally reported channel activity.
//!
//! Everything sits behind one `std::sync::Mutex`. The lock is never held
//! across an `.await`; snapshots copy what they need and build the view
//! after releasing it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBroker};
use crate::task::{format_duration, Task, TaskResult};

/// How long a failed task stays available for retry.
pub const FAILED_TASK_TTL_MINUTES: i64 = 30;

/// Finished results kept for the status view; the oldest are dropped first.
pub const MAX_FINISHED: usize = 200;

struct RunningTask {
    task: Task,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// A failed attempt kept for retry or reroute.
#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task: Task,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTaskSummary {
    pub id: String,
    pub name: String,
    pub agent: String,
    pub source: String,
    pub prompt: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Something a messaging channel reports it is busy with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelActivity {
    pub channel: String,
    #[serde(default)]
    pub agent: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Idle,
    Dispatching,
    Done,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: BatchStatus,
    pub running: usize,
    pub completed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
    pub tasks: Vec<TaskStatusView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channel_activity: Vec<ChannelActivity>,
}

#[derive(Default)]
struct Inner {
    running: HashMap<String, RunningTask>,
    finished: VecDeque<TaskResult>,
    failed: HashMap<String, FailedTask>,
    channel_activity: HashMap<String, ChannelActivity>,
    active: bool,
    started_at: Option<DateTime<Utc>>,
    batch_cancel: Option<CancellationToken>,
}

#[derive(Default)]
pub struct DispatchState {
    inner: Mutex<Inner>,
    events: Option<EventBroker>,
}

/// An active batch. Dropping it, including when the dispatching future is
/// dropped mid-batch, cancels the batch token and marks the state idle.
pub struct BatchGuard<'a> {
    state: &'a DispatchState,
    token: CancellationToken,
}

impl BatchGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        self.state.end_batch();
    }
}

fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let ms = (now - start).num_milliseconds().max(0) as u64;
    format_duration(std::time::Duration::from_millis(ms))
}

impl DispatchState {
    pub fn new(events: Option<EventBroker>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Option<&EventBroker> {
        self.events.as_ref()
    }

    /// Publish to the given keys. No-op without a broker.
    pub fn publish(&self, keys: &[&str], event: Event) {
        if let Some(events) = &self.events {
            events.publish_multi(keys, event);
        }
    }

    /// Start a batch unless one is already active: clear running and finished
    /// tasks and mark the state active, all under one lock. The guard's token
    /// is a child of `parent`; dropping the guard cancels it and ends the batch.
    pub fn try_begin_batch(&self, parent: &CancellationToken) -> Option<BatchGuard<'_>> {
        let token = parent.child_token();
        {
            let mut inner = self.lock();
            if inner.active {
                return None;
            }
            inner.running.clear();
            inner.finished.clear();
            inner.active = true;
            inner.started_at = Some(Utc::now());
            inner.batch_cancel = Some(token.clone());
        }
        Some(BatchGuard { state: self, token })
    }

    fn end_batch(&self) {
        let mut inner = self.lock();
        inner.active = false;
        inner.batch_cancel = None;
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn track(&self, task: &Task, cancel: CancellationToken) {
        self.lock().running.insert(
            task.id.clone(),
            RunningTask {
                task: task.clone(),
                started_at: Utc::now(),
                cancel,
            },
        );
    }

    pub fn untrack(&self, id: &str) -> bool {
        self.lock().running.remove(id).is_some()
    }

    /// Append a result to the finished list, capped at [`MAX_FINISHED`].
    /// Failed attempts are also kept for retry.
    pub fn record_finished(&self, task: &Task, result: &TaskResult) {
        let mut inner = self.lock();
        if inner.finished.len() >= MAX_FINISHED {
            inner.finished.pop_front();
        }
        inner.finished.push_back(result.clone());
        if result.status.is_retryable_failure() {
            inner.failed.insert(
                task.id.clone(),
                FailedTask {
                    task: task.clone(),
                    error: result.error.clone(),
                    failed_at: Utc::now(),
                },
            );
        }
    }

    /// Cancel one running task. Returns false when it is not running.
    pub fn cancel_task(&self, id: &str) -> bool {
        let inner = self.lock();
        match inner.running.get(id) {
            Some(running) => {
                running.cancel.cancel();
                tracing::info!(task_id = %id, "Task cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel the active batch. Returns false when no batch is running.
    pub fn cancel_batch(&self) -> bool {
        let inner = self.lock();
        match (&inner.batch_cancel, inner.active) {
            (Some(token), true) => {
                token.cancel();
                tracing::info!(running = inner.running.len(), "Dispatch cancelled");
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (running, finished, activity, active, started_at) = {
            let inner = self.lock();
            let running: Vec<(Task, DateTime<Utc>)> = inner
                .running
                .values()
                .map(|r| (r.task.clone(), r.started_at))
                .collect();
            let activity: Vec<ChannelActivity> = inner.channel_activity.values().cloned().collect();
            let finished: Vec<TaskResult> = inner.finished.iter().cloned().collect();
            (running, finished, activity, inner.active, inner.started_at)
        };

        let now = Utc::now();
        let status = if active {
            BatchStatus::Dispatching
        } else if !finished.is_empty() {
            BatchStatus::Done
        } else {
            BatchStatus::Idle
        };

        let mut tasks: Vec<TaskStatusView> = running
            .iter()
            .map(|(task, started)| TaskStatusView {
                id: task.id.clone(),
                name: task.name.clone(),
                status: "running".to_string(),
                elapsed: Some(elapsed_since(*started, now)),
                duration: None,
                cost_usd: None,
                model: task.model.clone(),
                timeout: task.timeout.clone(),
                prompt: task.prompt_preview(),
                source: task.source.clone(),
            })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks.extend(finished.iter().map(|r| TaskStatusView {
            id: r.id.clone(),
            name: r.name.clone(),
            status: r.status.to_string(),
            elapsed: None,
            duration: Some(format_duration(std::time::Duration::from_millis(r.duration_ms))),
            cost_usd: Some(r.cost_usd),
            model: r.model.clone(),
            timeout: String::new(),
            prompt: String::new(),
            source: String::new(),
        }));

        let mut channel_activity = activity;
        channel_activity.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        StatusSnapshot {
            status,
            running: running.len(),
            completed: finished.len(),
            elapsed: started_at.filter(|_| active).map(|s| elapsed_since(s, now)),
            tasks,
            channel_activity,
        }
    }

    pub fn record_channel_activity(&self, key: &str, activity: ChannelActivity) {
        self.lock().channel_activity.insert(key.to_string(), activity);
    }

    pub fn clear_channel_activity(&self, key: &str) {
        self.lock().channel_activity.remove(key);
    }

    pub fn failed_task(&self, id: &str) -> Option<FailedTask> {
        self.lock().failed.get(id).cloned()
    }

    pub fn insert_failed(&self, task: &Task, error: &str) {
        self.lock().failed.insert(
            task.id.clone(),
            FailedTask {
                task: task.clone(),
                error: error.to_string(),
                failed_at: Utc::now(),
            },
        );
    }

    pub fn remove_failed(&self, id: &str) -> bool {
        self.lock().failed.remove(id).is_some()
    }

    /// Failed tasks, most recent first.
    pub fn list_failed_tasks(&self) -> Vec<FailedTaskSummary> {
        let failed: Vec<FailedTask> = self.lock().failed.values().cloned().collect();
        let mut list: Vec<FailedTaskSummary> = failed
            .into_iter()
            .map(|f| FailedTaskSummary {
                id: f.task.id.clone(),
                name: f.task.name.clone(),
                agent: f.task.agent.clone(),
                source: f.task.source.clone(),
                prompt: f.task.prompt_preview(),
                error: f.error,
                failed_at: f.failed_at,
            })
            .collect();
        list.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        list
    }

    /// Drop failed tasks older than the retry window. Returns how many.
    pub fn cleanup_failed_tasks(&self) -> usize {
        self.cleanup_failed_older_than(Duration::minutes(FAILED_TASK_TTL_MINUTES))
    }

    fn cleanup_failed_older_than(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let mut inner = self.lock();
        let before = inner.failed.len();
        inner.failed.retain(|_, f| f.failed_at > cutoff);
        let removed = before - inner.failed.len();
        if removed > 0 {
            tracing::debug!(removed, "Expired failed tasks");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::task::TaskStatus;
    use serde_json::json;

    fn task(id: &str, prompt: &str) -> Task {
        let mut task = Task::new(prompt);
        task.id = id.to_string();
        task.name = format!("task-{}", id);
        task
    }

    fn result(task: &Task, status: TaskStatus) -> TaskResult {
        TaskResult {
            id: task.id.clone(),
            name: task.name.clone(),
            status,
            error: if status == TaskStatus::Success { String::new() } else { "boom".to_string() },
            duration_ms: 1500,
            cost_usd: 0.25,
            ..Default::default()
        }
    }

    #[test]
    fn test_batch_lifecycle_and_snapshot() {
        let state = DispatchState::default();
        assert_eq!(state.snapshot().status, BatchStatus::Idle);

        let guard = state.try_begin_batch(&CancellationToken::new()).unwrap();
        let batch = guard.token().clone();
        let a = task("a", &"p".repeat(150));
        let b = task("b", "short");
        state.track(&a, batch.child_token());
        state.track(&b, batch.child_token());

        let snap = state.snapshot();
        assert_eq!(snap.status, BatchStatus::Dispatching);
        assert_eq!(snap.running, 2);
        assert!(snap.elapsed.is_some());
        assert_eq!(snap.tasks[0].prompt.len(), 103);
        assert!(snap.tasks[0].prompt.ends_with("..."));

        assert!(state.untrack("a"));
        assert!(state.untrack("b"));
        assert!(!state.untrack("b"));
        state.record_finished(&a, &result(&a, TaskStatus::Success));
        state.record_finished(&b, &result(&b, TaskStatus::Timeout));
        drop(guard);
        assert!(batch.is_cancelled());

        let snap = state.snapshot();
        assert_eq!(snap.status, BatchStatus::Done);
        assert_eq!(snap.running, 0);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.tasks[0].duration.as_deref(), Some("2s"));
        assert!(state.failed_task("a").is_none());
        assert_eq!(state.failed_task("b").unwrap().error, "boom");

        // A new batch clears finished tasks but keeps the failed cache.
        let _guard = state.try_begin_batch(&CancellationToken::new()).unwrap();
        assert_eq!(state.snapshot().completed, 0);
        assert!(state.failed_task("b").is_some());
    }

    #[test]
    fn test_queued_not_kept_as_failed() {
        let state = DispatchState::default();
        let t = task("q", "p");
        state.record_finished(&t, &result(&t, TaskStatus::Queued));
        assert!(state.failed_task("q").is_none());
    }

    #[test]
    fn test_cancel_task_and_batch() {
        let state = DispatchState::default();
        assert!(!state.cancel_batch());

        let guard = state.try_begin_batch(&CancellationToken::new()).unwrap();
        let batch = guard.token().clone();
        let t = task("a", "p");
        let token = batch.child_token();
        state.track(&t, token.clone());

        assert!(!state.cancel_task("missing"));
        assert!(state.cancel_task("a"));
        assert!(token.is_cancelled());
        assert!(!batch.is_cancelled());

        assert!(state.cancel_batch());
        assert!(batch.is_cancelled());

        drop(guard);
        assert!(!state.cancel_batch());
    }

    #[test]
    fn test_second_batch_rejected_while_active() {
        let state = DispatchState::default();
        let guard = state.try_begin_batch(&CancellationToken::new()).unwrap();
        assert!(state.is_active());
        assert!(state.try_begin_batch(&CancellationToken::new()).is_none());

        drop(guard);
        assert!(!state.is_active());
        assert!(state.try_begin_batch(&CancellationToken::new()).is_some());
    }

    #[test]
    fn test_finished_list_is_capped() {
        let state = DispatchState::default();
        for i in 0..MAX_FINISHED + 5 {
            let t = task(&format!("t{:03}", i), "p");
            state.record_finished(&t, &result(&t, TaskStatus::Success));
        }
        let snap = state.snapshot();
        assert_eq!(snap.completed, MAX_FINISHED);
        assert_eq!(snap.tasks[0].id, "t005");
        assert_eq!(snap.tasks.last().unwrap().id, format!("t{:03}", MAX_FINISHED + 4));
    }

    #[test]
    fn test_failed_listing_and_ttl() {
        let state = DispatchState::default();
        let t = task("f", &"x".repeat(120));
        state.insert_failed(&t, "provider down");

        let list = state.list_failed_tasks();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].prompt.len(), 103);
        assert_eq!(list[0].error, "provider down");

        assert_eq!(state.cleanup_failed_tasks(), 0);
        assert_eq!(state.cleanup_failed_older_than(Duration::zero()), 1);
        assert!(state.list_failed_tasks().is_empty());
        assert!(!state.remove_failed("f"));
    }

    #[test]
    fn test_channel_activity() {
        let state = DispatchState::default();
        state.record_channel_activity(
            "telegram:42",
            ChannelActivity {
                channel: "telegram".to_string(),
                agent: "coder".to_string(),
                description: "answering".to_string(),
                started_at: Utc::now(),
            },
        );
        assert_eq!(state.snapshot().channel_activity.len(), 1);
        state.clear_channel_activity("telegram:42");
        assert!(state.snapshot().channel_activity.is_empty());
    }

    #[test]
    fn test_publish_without_broker_is_noop() {
        let state = DispatchState::default();
        state.publish(&["a"], Event::new(EventKind::Started, "a", "s", json!({})));

        let broker = EventBroker::new();
        let mut sub = broker.subscribe("a");
        let state = DispatchState::new(Some(broker));
        state.publish(&["a"], Event::new(EventKind::Started, "a", "s", json!({})));
        assert_eq!(sub.try_recv().unwrap().kind, EventKind::Started);
    }
}
