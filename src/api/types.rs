//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::agent::{ActionRequest, PlanStep};
use crate::controller::{ActionCategory, ActionParams};
use crate::task::{TaskId, TaskStatus};

/// Default page size of `GET /api/tasks`.
pub const DEFAULT_LIST_LIMIT: usize = 100;
/// Largest accepted page size of `GET /api/tasks`.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether a browser session is live
    pub browser_initialized: bool,
    /// Number of live observer connections
    pub connections: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListActionsQuery {
    pub category: Option<ActionCategory>,
}

/// Request to run one action outside of any task.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteActionRequest {
    pub action: String,
    #[serde(default, alias = "parameters")]
    pub params: ActionParams,
}

/// Request to submit a new task.
///
/// Exactly one of `actions` and `steps` must be non-empty.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,

    /// Ordered actions, run until the first failure
    #[serde(default)]
    pub actions: Vec<ActionRequest>,

    /// Plan steps, each carried out by one action
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// Response after creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearTasksQuery {
    pub status: Option<String>,
}

/// Plain message response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearTasksResponse {
    pub message: String,
    pub cleared: usize,
}

/// Query of the live-update endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    pub client_id: Option<String>,
}
