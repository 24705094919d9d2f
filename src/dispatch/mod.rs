//! Task dispatch: admission, batch fan-out and the shared dispatch state.
//!
//! A [`Dispatcher`] owns the collaborators a task attempt needs and a
//! semaphore that bounds concurrent attempts across batch, single and
//! stateless dispatch.

mod pipeline;
mod retry;
mod state;

pub use retry::SmartDispatchResult;
pub use state::{
    BatchGuard, BatchStatus, ChannelActivity, DispatchState, FailedTask, FailedTaskSummary,
    StatusSnapshot, TaskStatusView, FAILED_TASK_TTL_MINUTES, MAX_FINISHED,
};

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::budget::BudgetAuthority;
use crate::config::Config;
use crate::error::DispatchError;
use crate::events::EventBroker;
use crate::notify::WebhookNotifier;
use crate::provider::ProviderRegistry;
use crate::reflection::Reflector;
use crate::router::SmartRouter;
use crate::sandbox::SandboxManager;
use crate::store::{HistoryStore, OfflineQueue};
use crate::task::{fill_defaults, DispatchResult, Task, TaskResult, TaskStatus};
use crate::tools::ToolRegistry;
use crate::trust::TrustManager;

/// Collaborators injected into the dispatcher.
pub struct Services {
    pub providers: ProviderRegistry,
    pub tools: ToolRegistry,
    pub budget: Option<Arc<dyn BudgetAuthority>>,
    pub sandbox: Option<Arc<dyn SandboxManager>>,
    pub history: Arc<dyn HistoryStore>,
    pub queue: Option<Arc<dyn OfflineQueue>>,
    pub router: Option<Arc<dyn SmartRouter>>,
    pub reflector: Option<Arc<dyn Reflector>>,
    pub events: Option<EventBroker>,
    pub webhooks: WebhookNotifier,
    pub trust: Arc<TrustManager>,
}

impl Services {
    /// Providers and history only; every optional collaborator is off.
    pub fn new(providers: ProviderRegistry, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            providers,
            tools: ToolRegistry::new(),
            budget: None,
            sandbox: None,
            history,
            queue: None,
            router: None,
            reflector: None,
            events: None,
            webhooks: WebhookNotifier::new(Vec::new()),
            trust: Arc::new(TrustManager::new()),
        }
    }
}

pub struct Dispatcher {
    config: Arc<Config>,
    services: Services,
    state: DispatchState,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, services: Services) -> Self {
        let permits = config.max_concurrent.max(1);
        let state = DispatchState::new(services.events.clone());
        tracing::info!(max_concurrent = permits, "Dispatcher ready");
        Self {
            config,
            services,
            state,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run a batch: reset the state, run every task concurrently (bounded by
    /// the semaphore) and aggregate the results in submission order.
    ///
    /// Fails with [`DispatchError::BatchActive`] while another batch runs.
    /// Dropping the returned future cancels the batch's tasks.
    pub async fn dispatch(
        self: &Arc<Self>,
        tasks: Vec<Task>,
        parent: &CancellationToken,
    ) -> Result<DispatchResult, DispatchError> {
        let started_at = Utc::now();
        let guard = self
            .state
            .try_begin_batch(parent)
            .ok_or(DispatchError::BatchActive)?;
        let batch = guard.token().clone();
        tracing::info!(tasks = tasks.len(), "Dispatch started");

        let handles: Vec<_> = tasks
            .into_iter()
            .map(|mut task| {
                fill_defaults(&self.config, &mut task);
                let dispatcher = Arc::clone(self);
                let batch = batch.clone();
                let fallback = TaskResult::failure(&task, TaskStatus::Error, "task aborted");
                let handle = tokio::spawn(async move { dispatcher.run_task(task, &batch).await });
                (handle, fallback)
            })
            .collect();

        let results = join_all(handles.into_iter().map(|(handle, fallback)| async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(task_id = %fallback.id, error = %e, "Task join failed");
                    TaskResult {
                        error: format!("task aborted: {}", e),
                        ..fallback
                    }
                }
            }
        }))
        .await;

        drop(guard);

        let result = DispatchResult::new(started_at, results);
        tracing::info!(summary = %result.summary, "Dispatch finished");
        Ok(result)
    }

    /// Run one task through the tracked pipeline without resetting the batch.
    pub async fn dispatch_one(&self, mut task: Task, parent: &CancellationToken) -> TaskResult {
        fill_defaults(&self.config, &mut task);
        self.run_task(task, parent).await
    }
}
