//! HTTP API for the dispatcher.
//!
//! ## Endpoints
//!
//! - `POST /dispatch` - Run a batch of tasks (409 while one is active)
//! - `POST /dispatch/estimate` - Estimate the cost of a batch
//! - `GET /dispatch/failed` - List failed tasks available for retry
//! - `POST /dispatch/:id/retry` - Retry a failed task
//! - `POST /dispatch/:id/reroute` - Reroute a failed task through smart dispatch
//! - `GET /dispatch/queue` - Pending offline-queue items
//! - `GET /status` - Snapshot of the current batch
//! - `POST /cancel` - Cancel the active batch
//! - `POST /cancel/:id` - Cancel one running task
//! - `GET /events/:key` - Stream task events via SSE
//! - `GET /api/health` - Health check

mod routes;

pub use routes::{router, serve, AppState};
