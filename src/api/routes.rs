//! Router, handlers and server bootstrap.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::budget::LimitBudget;
use crate::config::Config;
use crate::dispatch::{Dispatcher, Services};
use crate::error::DispatchError;
use crate::estimate::estimate_tasks;
use crate::events::EventBroker;
use crate::notify::WebhookNotifier;
use crate::provider::ProviderRegistry;
use crate::reflection::ProviderReflector;
use crate::router::KeywordRouter;
use crate::sandbox::DockerSandbox;
use crate::store::{HistoryStore, MemoryStore, OfflineQueue, SqliteStore};
use crate::task::{parse_duration, Task};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_QUEUE_TTL: Duration = Duration::from_secs(3600);

type ApiResult = Result<Json<Value>, (StatusCode, String)>;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: EventBroker,
    /// Cancelled on shutdown; parent of every batch.
    pub shutdown: CancellationToken,
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn dispatch_error(e: DispatchError) -> (StatusCode, String) {
    let status = match &e {
        DispatchError::FailedTaskNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::SmartDispatchDisabled => StatusCode::BAD_REQUEST,
        DispatchError::BatchActive => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value).map(Json).map_err(internal)
}

/// Build the router over an existing state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/dispatch", post(dispatch_batch))
        .route("/dispatch/estimate", post(estimate))
        .route("/dispatch/failed", get(list_failed))
        .route("/dispatch/queue", get(list_queue))
        .route("/dispatch/:id/retry", post(retry))
        .route("/dispatch/:id/reroute", post(reroute))
        .route("/status", get(status))
        .route("/cancel", post(cancel_batch))
        .route("/cancel/:id", post(cancel_task))
        .route("/events/:key", get(stream_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire up collaborators from config and serve until SIGINT/SIGTERM.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let (history, queue): (Arc<dyn HistoryStore>, Arc<dyn OfflineQueue>) =
        match SqliteStore::open(&config.history_db_path()).await {
            Ok(store) => {
                let store = Arc::new(store);
                let history: Arc<dyn HistoryStore> = store.clone();
                let queue: Arc<dyn OfflineQueue> = store;
                (history, queue)
            }
            Err(e) => {
                tracing::warn!("History DB unavailable, using in-memory store: {}", e);
                let store = Arc::new(MemoryStore::new());
                let history: Arc<dyn HistoryStore> = store.clone();
                let queue: Arc<dyn OfflineQueue> = store;
                (history, queue)
            }
        };

    let providers = ProviderRegistry::from_config(&config);
    let events = EventBroker::new();

    let mut services = Services::new(providers.clone(), Arc::clone(&history));
    services.events = Some(events.clone());
    services.queue = Some(Arc::clone(&queue));
    services.sandbox = Some(Arc::new(DockerSandbox::new(config.sandbox.clone())));
    services.webhooks = WebhookNotifier::new(config.webhooks.clone());
    if config.budgets.has_limits() {
        services.budget = Some(Arc::new(LimitBudget::new(
            config.budgets.clone(),
            Arc::clone(&history),
        )));
    }
    if config.smart_dispatch.enabled {
        services.router = Some(Arc::new(KeywordRouter::new(&config)));
    }
    if config.reflection.enabled {
        services.reflector = Some(Arc::new(ProviderReflector::new(
            Arc::clone(&config),
            providers,
        )));
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config), services));
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        dispatcher,
        events,
        shutdown: CancellationToken::new(),
    });

    spawn_maintenance(Arc::clone(&state), queue);

    let app = router(Arc::clone(&state));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Sweep expired failed tasks and offline-queue items every minute.
fn spawn_maintenance(state: Arc<AppState>, queue: Arc<dyn OfflineQueue>) {
    let ttl = parse_duration(&state.config.offline_queue.ttl).unwrap_or(DEFAULT_QUEUE_TTL);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let removed = state.dispatcher.state().cleanup_failed_tasks();
            if removed > 0 {
                tracing::debug!(removed, "Expired failed tasks");
            }
            if state.config.offline_queue.enabled {
                match queue.expire(ttl).await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "Expired offline-queue items"),
                    Err(e) => tracing::warn!("Offline queue expiry failed: {}", e),
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, cancelling running tasks");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "dispatching": state.dispatcher.state().is_active(),
        "maxConcurrent": state.config.max_concurrent,
    }))
}

async fn dispatch_batch(
    State(state): State<Arc<AppState>>,
    Json(tasks): Json<Vec<Task>>,
) -> ApiResult {
    if tasks.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no tasks".to_string()));
    }
    let result = state
        .dispatcher
        .dispatch(tasks, &state.shutdown)
        .await
        .map_err(dispatch_error)?;
    to_json(&result)
}

async fn estimate(State(state): State<Arc<AppState>>, Json(tasks): Json<Vec<Task>>) -> ApiResult {
    let router = state.dispatcher.services().router.as_deref();
    let result = estimate_tasks(&state.config, &tasks, router).await;
    to_json(&result)
}

async fn list_failed(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(&state.dispatcher.state().list_failed_tasks())
}

async fn list_queue(State(state): State<Arc<AppState>>) -> ApiResult {
    let Some(queue) = &state.dispatcher.services().queue else {
        return Ok(Json(json!([])));
    };
    let pending = queue.pending().await.map_err(internal)?;
    to_json(&pending)
}

async fn retry(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let result = state.dispatcher.retry_task(&id).await.map_err(dispatch_error)?;
    to_json(&result)
}

async fn reroute(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let result = state.dispatcher.reroute_task(&id).await.map_err(dispatch_error)?;
    to_json(&result)
}

async fn status(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(&state.dispatcher.state().snapshot())
}

async fn cancel_batch(State(state): State<Arc<AppState>>) -> ApiResult {
    if !state.dispatcher.state().cancel_batch() {
        return Err((StatusCode::CONFLICT, "no active dispatch".to_string()));
    }
    tracing::info!("Batch cancelled via API");
    Ok(Json(json!({"status": "cancelling"})))
}

async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    if !state.dispatcher.state().cancel_task(&id) {
        return Err((StatusCode::NOT_FOUND, format!("task {} is not running", id)));
    }
    tracing::info!(task_id = %id, "Task cancelled via API");
    Ok(Json(json!({"status": "cancelling", "id": id})))
}

/// Stream events for one key (task id, session id, `trust`, or the dashboard key).
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let mut sub = state.events.subscribe(&key);
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = sub.recv() => match next {
                    Some(ev) => {
                        let name = serde_json::to_value(ev.kind)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_else(|| "message".to_string());
                        match Event::default().event(name).json_data(&ev) {
                            Ok(sse) => yield Ok(sse),
                            Err(e) => tracing::warn!("Failed to encode event: {}", e),
                        }
                    }
                    None => break,
                },
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
