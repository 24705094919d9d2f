//! Keyed event fan-out for dispatch progress.
//!
//! Subscribers get a bounded channel per key. Publishing never blocks: a
//! subscriber whose buffer is full simply misses the event. Subscribers of
//! [`DASHBOARD_KEY`] receive every event regardless of key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Key whose subscribers receive every published event.
pub const DASHBOARD_KEY: &str = "__dashboard__";

/// Per-subscriber buffer size.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Completed,
    Error,
    TaskQueued,
    ToolCall,
    ToolResult,
    TrustPromotion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: String,
    pub session_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            session_id: session_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, mpsc::Sender<Event>)>>,
}

/// Cheaply cloneable handle to the shared subscriber table.
#[derive(Clone, Default)]
pub struct EventBroker {
    inner: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroker").finish_non_exhaustive()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events for `key`. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, key: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = match self.inner.lock() {
            Ok(mut subs) => {
                subs.next_id += 1;
                let id = subs.next_id;
                subs.by_key
                    .entry(key.to_string())
                    .or_default()
                    .push((id, tx));
                id
            }
            Err(_) => 0,
        };
        Subscription {
            key: key.to_string(),
            id,
            rx,
            broker: self.clone(),
        }
    }

    pub fn has_subscribers(&self, key: &str) -> bool {
        self.inner
            .lock()
            .map(|subs| subs.by_key.get(key).is_some_and(|v| !v.is_empty()))
            .unwrap_or(false)
    }

    pub fn publish(&self, key: &str, event: Event) {
        self.publish_multi(&[key], event);
    }

    /// Deliver one event to the subscribers of several keys.
    ///
    /// Each subscriber receives the event at most once.
    pub fn publish_multi(&self, keys: &[&str], event: Event) {
        let targets: Vec<mpsc::Sender<Event>> = {
            let Ok(subs) = self.inner.lock() else {
                return;
            };
            let mut seen = Vec::new();
            let mut targets = Vec::new();
            for key in keys.iter().copied().chain(std::iter::once(DASHBOARD_KEY)) {
                if key.is_empty() {
                    continue;
                }
                for (id, tx) in subs.by_key.get(key).into_iter().flatten() {
                    if !seen.contains(id) {
                        seen.push(*id);
                        targets.push(tx.clone());
                    }
                }
            }
            targets
        };

        for tx in targets {
            if let Err(mpsc::error::TrySendError::Full(ev)) = tx.try_send(event.clone()) {
                tracing::debug!(kind = ?ev.kind, task_id = %ev.task_id, "Subscriber buffer full, dropping event");
            }
        }
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        if let Ok(mut subs) = self.inner.lock() {
            if let Some(list) = subs.by_key.get_mut(key) {
                list.retain(|(sid, _)| *sid != id);
                if list.is_empty() {
                    subs.by_key.remove(key);
                }
            }
        }
    }
}

/// A live subscription. Unsubscribes on drop.
pub struct Subscription {
    key: String,
    id: u64,
    rx: mpsc::Receiver<Event>,
    broker: EventBroker,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.key, self.id);
    }
}
