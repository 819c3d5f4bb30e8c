//! Task module - task records, their manager, and per-task plans.
//!
//! - Task lifecycle transitions are explicit and validated
//! - Invariants are documented on the types that enforce them
//! - Work runs on its own tokio task; observers learn about it through the hub

mod manager;
pub mod plan;
pub mod task;

pub use manager::{TaskContext, TaskListener, TaskManager, TaskMetrics};
pub use plan::{Plan, PlanError, PlanStatus, PlanStatusView, StepAdvance};
pub use task::{Task, TaskError, TaskId, TaskLogEntry, TaskStatus};
