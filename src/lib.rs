//! # agent-dispatch
//!
//! Task dispatch and agentic execution engine for a self-hosted AI agent
//! runtime.
//!
//! This library provides:
//! - A task model with defaulting, sanitization and directory validation
//! - A bounded-concurrency dispatcher with per-task cancellation
//! - An execution pipeline with trust, budget and sandbox gates
//! - A multi-round tool-calling loop with loop detection and context compression
//! - Retry, reroute and an offline queue for failed tasks
//! - An HTTP API with SSE progress events
//!
//! ## Task Flow
//! 1. Receive tasks via API or CLI
//! 2. Fill defaults and run each task under the shared semaphore
//! 3. Call the provider directly, or run the tool loop for complex work
//! 4. Record history, publish events and keep failures for retry
//!
//! ## Modules
//! - `dispatch`: dispatcher, pipeline, dispatch state, retry/reroute
//! - `agentic`: tool-calling loop
//! - `task`: task and result types, defaults
//! - `provider`: LLM providers and failover
//! - `tools`: built-in tools and tool policy
//! - `store`: history, session activity and offline queue

pub mod agentic;
pub mod api;
pub mod budget;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod estimate;
pub mod events;
pub mod injection;
pub mod notify;
pub mod provider;
pub mod reflection;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod task;
pub mod tools;
pub mod trust;

pub use config::Config;
pub use dispatch::{Dispatcher, Services};
pub use error::DispatchError;
pub use task::{DispatchResult, Task, TaskResult, TaskStatus};
