//! Outbound notifications: webhooks and channel notices.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::WebhookConfig;
use crate::store::now_string;
use crate::task::{preview, Task, TaskResult};

/// Receives human-readable notices about a task (queued, trust changes).
///
/// Implemented by messaging-channel adapters and attached to the task runtime.
#[async_trait]
pub trait ChannelNotifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// JSON body posted to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: String,
    pub job_id: String,
    pub name: String,
    pub source: String,
    pub status: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: String,
}

impl WebhookPayload {
    pub fn from_result(task: &Task, result: &TaskResult) -> Self {
        Self {
            event: result.status.to_string(),
            job_id: task.id.clone(),
            name: task.name.clone(),
            source: task.source.clone(),
            status: result.status.to_string(),
            cost_usd: result.cost_usd,
            duration_ms: result.duration_ms,
            model: result.model.clone(),
            output: preview(&result.output, 500),
            error: preview(&result.error, 300),
            timestamp: now_string(),
        }
    }
}

fn matches_event(webhook: &WebhookConfig, event: &str) -> bool {
    webhook.events.is_empty() || webhook.events.iter().any(|e| e == "all" || e == event)
}

/// Posts task outcomes to configured webhooks.
#[derive(Clone)]
pub struct WebhookNotifier {
    webhooks: Vec<WebhookConfig>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhooks: Vec<WebhookConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { webhooks, client }
    }

    pub fn is_empty(&self) -> bool {
        self.webhooks.is_empty()
    }

    /// Send `payload` to every webhook subscribed to its event, each in a
    /// detached task. Failures are only logged.
    pub fn send(&self, payload: WebhookPayload) {
        for webhook in self.webhooks.iter().filter(|w| matches_event(w, &payload.event)) {
            let client = self.client.clone();
            let webhook = webhook.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut req = client.post(&webhook.url).json(&payload);
                for (key, value) in &webhook.headers {
                    req = req.header(key.as_str(), value.as_str());
                }
                match req.send().await {
                    Ok(resp) if resp.status().is_client_error() || resp.status().is_server_error() => {
                        tracing::warn!(url = %webhook.url, status = %resp.status(), "Webhook returned error status");
                    }
                    Ok(_) => tracing::debug!(url = %webhook.url, job_id = %payload.job_id, "Webhook delivered"),
                    Err(e) => tracing::error!(url = %webhook.url, error = %e, "Webhook POST failed"),
                }
            });
        }
    }
}
