//! Plan state machine - ordered steps of a decomposed goal.
//!
//! ```text
//! Idle -> Planning -> Executing -> Completed
//!                             \-> Failed
//! (any) --reset--> Idle
//! ```
//!
//! Steps run strictly in order. `completed_steps` grows by index with no gaps,
//! and a failed plan stays failed until [`Plan::reset`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Journal entries kept per plan.
pub const MAX_JOURNAL_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Idle,
    Planning,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanStatus::Idle => "idle",
            PlanStatus::Planning => "planning",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub index: usize,
    pub description: String,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRef {
    pub index: usize,
    pub description: String,
}

/// What follows a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepAdvance {
    Next {
        next_step: StepRef,
    },
    Finished {
        task_completed: bool,
        steps_executed: usize,
    },
}

/// Record of a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub failed: bool,
    pub step_index: usize,
    pub error: String,
}

/// Externally visible plan summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusView {
    pub active: bool,
    pub status: PlanStatus,
    pub original_task: Option<String>,
    pub total_steps: usize,
    /// -1 when no step is current
    pub current_step: i64,
    pub completed_steps: usize,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("Cannot {operation} while plan is {status}")]
    InvalidState {
        operation: &'static str,
        status: PlanStatus,
    },

    #[error("Step index {index} out of range (plan has {len} steps)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Step {index} is not the current step ({current:?})")]
    NotCurrentStep {
        index: usize,
        current: Option<usize>,
    },

    #[error("A plan needs at least one step")]
    EmptyPlan,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    steps: Vec<String>,
    current_step: Option<usize>,
    completed_steps: Vec<CompletedStep>,
    status: PlanStatus,
    original_goal: Option<String>,
    journal: VecDeque<JournalEntry>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            current_step: None,
            completed_steps: Vec::new(),
            status: PlanStatus::Idle,
            original_goal: None,
            journal: VecDeque::with_capacity(MAX_JOURNAL_ENTRIES),
        }
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed_steps
    }

    pub fn original_goal(&self) -> Option<&str> {
        self.original_goal.as_deref()
    }

    pub fn journal(&self) -> impl Iterator<Item = &JournalEntry> {
        self.journal.iter()
    }

    fn record(&mut self, message: String) {
        if self.journal.len() == MAX_JOURNAL_ENTRIES {
            self.journal.pop_front();
        }
        self.journal.push_back(JournalEntry {
            timestamp: Utc::now(),
            message,
        });
    }

    fn require(&self, operation: &'static str, status: PlanStatus) -> Result<(), PlanError> {
        if self.status != status {
            return Err(PlanError::InvalidState {
                operation,
                status: self.status,
            });
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), PlanError> {
        if index >= self.steps.len() {
            return Err(PlanError::IndexOutOfRange {
                index,
                len: self.steps.len(),
            });
        }
        Ok(())
    }

    /// `Idle -> Planning`
    pub fn start_planning(&mut self, goal: impl Into<String>) -> Result<(), PlanError> {
        self.require("start planning", PlanStatus::Idle)?;
        let goal = goal.into();
        self.record(format!("Planning task: {}", goal));
        self.original_goal = Some(goal);
        self.status = PlanStatus::Planning;
        Ok(())
    }

    /// `Planning -> Executing` with the first step current.
    pub fn set_steps(&mut self, steps: Vec<String>) -> Result<(), PlanError> {
        if let Err(e) = self.require("set steps", PlanStatus::Planning) {
            tracing::warn!(status = %self.status, "Rejected plan steps outside planning");
            return Err(e);
        }
        if steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let mut summary = String::from("I've broken down this task into the following steps:");
        for (i, step) in steps.iter().enumerate() {
            summary.push_str(&format!("\nStep {}: {}", i + 1, step));
        }
        self.record(summary);

        self.steps = steps;
        self.current_step = Some(0);
        self.status = PlanStatus::Executing;
        Ok(())
    }

    /// Mark `index` as started. Only the current step can start.
    pub fn start_step(&mut self, index: usize) -> Result<StepRef, PlanError> {
        self.require("start a step", PlanStatus::Executing)?;
        self.check_index(index)?;
        if self.current_step != Some(index) {
            return Err(PlanError::NotCurrentStep {
                index,
                current: self.current_step,
            });
        }

        let description = self.steps[index].clone();
        self.record(format!("Starting step {}: {}", index + 1, description));
        Ok(StepRef { index, description })
    }

    /// Complete the current step and advance.
    pub fn complete_step(&mut self, index: usize, result: Value) -> Result<StepAdvance, PlanError> {
        self.require("complete a step", PlanStatus::Executing)?;
        self.check_index(index)?;
        if self.current_step != Some(index) {
            return Err(PlanError::NotCurrentStep {
                index,
                current: self.current_step,
            });
        }

        let description = self.steps[index].clone();
        self.record(format!("Completed step {}: {}", index + 1, description));
        self.completed_steps.push(CompletedStep {
            index,
            description,
            result,
        });

        let next = index + 1;
        if next < self.steps.len() {
            self.current_step = Some(next);
            Ok(StepAdvance::Next {
                next_step: StepRef {
                    index: next,
                    description: self.steps[next].clone(),
                },
            })
        } else {
            self.current_step = None;
            self.status = PlanStatus::Completed;
            self.record("All task steps completed successfully".to_string());
            Ok(StepAdvance::Finished {
                task_completed: true,
                steps_executed: self.completed_steps.len(),
            })
        }
    }

    /// Fail the plan at `index`. Completed steps are kept.
    pub fn fail_step(
        &mut self,
        index: usize,
        error: impl Into<String>,
    ) -> Result<StepFailure, PlanError> {
        self.require("fail a step", PlanStatus::Executing)?;
        self.check_index(index)?;

        let error = error.into();
        self.record(format!("Step {} failed: {}", index + 1, error));
        self.status = PlanStatus::Failed;
        Ok(StepFailure {
            failed: true,
            step_index: index,
            error,
        })
    }

    /// Back to `Idle` from any state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn status_view(&self) -> PlanStatusView {
        PlanStatusView {
            active: matches!(self.status, PlanStatus::Planning | PlanStatus::Executing),
            status: self.status,
            original_task: self.original_goal.clone(),
            total_steps: self.steps.len(),
            current_step: self.current_step.map_or(-1, |i| i as i64),
            completed_steps: self.completed_steps.len(),
            steps: self.steps.clone(),
        }
    }
}
