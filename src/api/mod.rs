//! HTTP API for browser-pilot.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/actions` - List registered actions (`?category=`)
//! - `POST /api/actions/execute` - Run one action
//! - `GET /api/agent/status` - Browser session state and recent actions
//! - `POST /api/tasks` - Create and start a task
//! - `GET /api/tasks` - List tasks (`?status=&limit=&skip=`)
//! - `DELETE /api/tasks` - Clear finished tasks (`?status=`)
//! - `GET /api/tasks/metrics` - Task counts per status
//! - `GET /api/tasks/{id}` - Get a task
//! - `DELETE /api/tasks/{id}` - Cancel a task
//! - `GET /api/tasks/{id}/plan` - Plan status of a task
//! - `POST /api/tasks/{id}/plan/reset` - Reset the plan of a task
//! - `GET /ws` - Live updates over WebSocket (`?client_id=`)

mod routes;
pub mod types;
mod ws;

pub use routes::{router, serve, AppState};
pub use types::*;
