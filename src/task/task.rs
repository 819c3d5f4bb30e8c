//! Task record and its lifecycle.
//!
//! # State Machine
//! ```text
//! Pending -> Running -> Completed
//!                   \-> Failed
//!                   \-> Canceled
//!        \-> Canceled
//! ```
//!
//! # Invariants
//! - Nothing leaves a terminal state
//! - `completed_at` is set exactly once, on the first terminal transition
//! - `progress` stays within `[0, 100]`

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not started yet
    Pending,
    /// Work is in flight
    Running,
    Completed,
    Failed,
    /// Canceled by a caller
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// One line of a task's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A unit of browser work and everything observers may ask about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "task_id")]
    id: TaskId,
    description: String,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    progress: f64,
    result: Option<Value>,
    error: Option<String>,
    logs: Vec<TaskLogEntry>,
}

impl Task {
    /// Create a new task in `Pending` state.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn logs(&self) -> &[TaskLogEntry] {
        &self.logs
    }

    /// Append a log entry. Mirrored to the `tracing` output.
    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(task_id = %self.id, "{}", message);
        self.logs.push(TaskLogEntry {
            timestamp: Utc::now(),
            message,
        });
    }

    /// Set progress, clamped to `[0, 100]`. NaN counts as 0.
    pub fn set_progress(&mut self, percent: f64) {
        self.progress = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
    }

    // State transitions - explicit and validated

    /// `Pending -> Running`
    pub fn start(&mut self) -> Result<(), TaskError> {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: other,
                to: TaskStatus::Running,
            }),
        }
    }

    /// `Running -> Completed`, progress jumps to 100.
    pub fn complete(&mut self, result: Value) -> Result<(), TaskError> {
        self.finish(TaskStatus::Completed)?;
        self.progress = 100.0;
        self.result = Some(result);
        Ok(())
    }

    /// `Running -> Failed`
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.finish(TaskStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// `Pending | Running -> Canceled`
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        if !self.status.is_active() {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Canceled,
            });
        }
        self.status = TaskStatus::Canceled;
        self.completed_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    fn finish(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.completed_at.get_or_insert_with(Utc::now);
        Ok(())
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {id} cannot be canceled in status {status}")]
    NotCancelable { id: TaskId, status: TaskStatus },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Unknown task status '{0}'")]
    UnknownStatus(String),
}
