//! Retry and reroute of tasks kept in the failed-task cache.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::Dispatcher;
use crate::error::DispatchError;
use crate::router::{KeywordRouter, RouteResult, SmartRouter};
use crate::store::{HistoryRecord, SessionActivity};
use crate::task::{fill_defaults, Task, TaskResult};

/// Outcome of a reroute: the routing decision and the task it produced.
#[derive(Debug, Clone, Serialize)]
pub struct SmartDispatchResult {
    pub route: RouteResult,
    pub task: TaskResult,
}

impl Dispatcher {
    /// Re-run a failed task under a fresh id and session.
    ///
    /// Either way the original leaves the failed cache; a renewed failure
    /// takes its place under the new id.
    pub async fn retry_task(&self, id: &str) -> Result<TaskResult, DispatchError> {
        let failed = self
            .state
            .failed_task(id)
            .ok_or_else(|| DispatchError::FailedTaskNotFound(id.to_string()))?;

        let mut task = failed.task;
        task.id.clear();
        task.session_id.clear();
        task.name.clear();
        task.source = format!("retry:{}", task.source);
        fill_defaults(&self.config, &mut task);

        let started_at = Utc::now();
        let result = self.run_single_task(task.clone(), &CancellationToken::new()).await;
        self.record_attempt(&task, &result, started_at).await;

        self.state.remove_failed(id);
        if !result.is_success() {
            self.state.insert_failed(&task, &result.error);
        }
        tracing::info!(original = %id, new = %task.id, status = %result.status, "Task retried");
        Ok(result)
    }

    /// Route a failed task's prompt to a (possibly different) agent and run it.
    pub async fn reroute_task(&self, id: &str) -> Result<SmartDispatchResult, DispatchError> {
        let failed = self
            .state
            .failed_task(id)
            .ok_or_else(|| DispatchError::FailedTaskNotFound(id.to_string()))?;
        if !self.config.smart_dispatch.enabled {
            return Err(DispatchError::SmartDispatchDisabled);
        }

        let router: Arc<dyn SmartRouter> = match &self.services.router {
            Some(router) => Arc::clone(router),
            None => Arc::new(KeywordRouter::new(&self.config)),
        };
        let route = router
            .route(&failed.task.prompt, "reroute")
            .await
            .map_err(|e| DispatchError::Provider(format!("routing failed: {:#}", e)))?;
        tracing::info!(original = %id, agent = %route.agent, method = ?route.method, "Rerouting task");

        let mut task = Task::new(failed.task.prompt.clone())
            .with_agent(route.agent.clone())
            .with_source("route:reroute");
        fill_defaults(&self.config, &mut task);

        let started_at = Utc::now();
        let result = self.run_single_task(task.clone(), &CancellationToken::new()).await;
        self.record_attempt(&task, &result, started_at).await;

        if result.is_success() {
            self.state.remove_failed(id);
        }
        Ok(SmartDispatchResult { route, task: result })
    }

    async fn record_attempt(&self, task: &Task, result: &TaskResult, started_at: chrono::DateTime<Utc>) {
        let history = &self.services.history;
        if let Err(e) = history
            .record_history(HistoryRecord::from_result(task, result, started_at))
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to record history");
        }
        if let Err(e) = history
            .record_session_activity(SessionActivity::from_result(task, result))
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to record session activity");
        }
    }
}
