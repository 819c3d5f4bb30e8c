//! Agent service - runs actions, sequences and plans on behalf of tasks.
//!
//! Every action outcome is fed back to observers of the task it belongs to:
//! an `action_feedback` event, the page state, and a screenshot frame through
//! the debounced [`FrameBroadcaster`].

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::actuator::PageState;
use crate::controller::{ActionOutcome, ActionParams, ActionRegistry, DONE_ACTION};
use crate::notify::{Envelope, FrameBroadcaster, NotificationHub};
use crate::task::{Plan, PlanStatus, TaskContext, TaskId};

/// Action history entries kept by the service.
pub const MAX_HISTORY: usize = 10;

/// One action to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(alias = "action")]
    pub name: String,
    #[serde(default)]
    pub params: ActionParams,
}

/// One step of a plan together with the action that carries it out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    pub action: String,
    #[serde(default)]
    pub params: ActionParams,
}

/// What an interpreter made of a natural-language instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interpretation {
    Action {
        action: String,
        #[serde(default)]
        parameters: ActionParams,
    },
    Plan {
        steps: Vec<String>,
    },
    ExecuteStep {
        step_index: usize,
        action: String,
        #[serde(default)]
        parameters: ActionParams,
    },
    Done {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Turns an instruction into something the agent can run.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(
        &self,
        instruction: &str,
        page: Option<&PageState>,
    ) -> anyhow::Result<Interpretation>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of the agent's view of the browser.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub initialized: bool,
    pub current_url: Option<String>,
    pub last_error: Option<String>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Default)]
struct AgentState {
    current_url: Option<String>,
    last_error: Option<String>,
    history: VecDeque<HistoryEntry>,
}

/// Result of [`AgentService::execute_sequence`].
#[derive(Debug, Clone, Serialize)]
pub struct SequenceReport {
    pub success: bool,
    pub message: String,
    pub results: Vec<ActionOutcome>,
}

impl SequenceReport {
    /// Completed sequences become the task result; failed ones fail the task.
    pub fn into_result(self) -> anyhow::Result<Value> {
        if self.success {
            return Ok(serde_json::to_value(self)?);
        }
        let cause = self
            .results
            .last()
            .and_then(ActionOutcome::error_message)
            .unwrap_or("unknown error")
            .to_string();
        bail!("{}: {}", self.message, cause)
    }
}

pub struct AgentService {
    registry: Arc<ActionRegistry>,
    hub: Arc<NotificationHub>,
    frames: Arc<FrameBroadcaster>,
    state: Mutex<AgentState>,
}

impl AgentService {
    pub fn new(
        registry: Arc<ActionRegistry>,
        hub: Arc<NotificationHub>,
        frames: Arc<FrameBroadcaster>,
    ) -> Self {
        Self {
            registry,
            hub,
            frames,
            state: Mutex::new(AgentState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub async fn status(&self) -> AgentStatus {
        let initialized = self.registry.actuator().is_initialized().await;
        let state = self.state.lock().await;
        AgentStatus {
            initialized,
            current_url: state.current_url.clone(),
            last_error: state.last_error.clone(),
            history: state.history.iter().cloned().collect(),
        }
    }

    /// Run one action and publish its outcome to the task's observers.
    pub async fn execute_action(
        &self,
        name: &str,
        params: ActionParams,
        task: Option<TaskId>,
    ) -> ActionOutcome {
        let outcome = self.registry.execute(name, params).await;
        self.record(name, &outcome).await;
        if let Some(task_id) = task {
            self.publish(task_id, name, &outcome);
        }
        outcome
    }

    async fn record(&self, name: &str, outcome: &ActionOutcome) {
        let mut state = self.state.lock().await;
        match outcome {
            ActionOutcome::Success { result, .. } => {
                let url = result
                    .pointer("/page_state/url")
                    .or_else(|| result.get("url"))
                    .and_then(Value::as_str);
                if let Some(url) = url {
                    state.current_url = Some(url.to_string());
                }
            }
            ActionOutcome::Error { message, .. } => {
                state.last_error = Some(message.clone());
            }
        }

        if state.history.len() == MAX_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            action: name.to_string(),
            success: outcome.is_success(),
            error: outcome.error_message().map(str::to_string),
        });
    }

    fn publish(&self, task_id: TaskId, name: &str, outcome: &ActionOutcome) {
        let feedback = Envelope::ActionFeedback {
            task_id,
            data: json!({
                "action": name,
                "success": outcome.is_success(),
                "message": outcome.error_message(),
            }),
        };
        self.hub.broadcast(task_id, &feedback);

        let Some(result) = outcome.result() else {
            return;
        };
        if let Some(page_state) = result.get("page_state") {
            self.hub.broadcast(
                task_id,
                &Envelope::PageState {
                    task_id,
                    data: page_state.clone(),
                },
            );
        }
        if let Some(image) = result.get("screenshot").and_then(Value::as_str) {
            self.frames
                .offer(&task_id.to_string(), task_id, image.to_string());
        }
    }

    /// Run `actions` in order, stopping at the first failure.
    ///
    /// With a task context, progress is updated after every action.
    pub async fn execute_sequence(
        &self,
        actions: &[ActionRequest],
        ctx: Option<&TaskContext>,
    ) -> SequenceReport {
        let total = actions.len();
        let mut results = Vec::with_capacity(total);
        let mut success = true;

        for (i, request) in actions.iter().enumerate() {
            if ctx.is_some_and(TaskContext::is_canceled) {
                success = false;
                break;
            }

            let outcome = self
                .execute_action(&request.name, request.params.clone(), ctx.map(TaskContext::id))
                .await;
            let failed = !outcome.is_success();
            results.push(outcome);

            if let Some(ctx) = ctx {
                let percent = (i + 1) as f64 / total as f64 * 100.0;
                let message = format!("Executed action {}", request.name);
                ctx.progress(percent, Some(message.as_str())).await;
                ctx.notify().await;
            }
            if failed {
                success = false;
                break;
            }
        }

        SequenceReport {
            success,
            message: format!("Executed {}/{} actions", results.len(), total),
            results,
        }
    }

    /// Drive the task's plan through `steps`, one action per step.
    pub async fn run_plan(
        &self,
        ctx: &TaskContext,
        goal: &str,
        steps: Vec<PlanStep>,
    ) -> anyhow::Result<Value> {
        {
            let mut plan = ctx.plan().lock().await;
            plan.start_planning(goal)?;
            plan.set_steps(steps.iter().map(|s| s.description.clone()).collect())?;
        }
        ctx.notify().await;

        let total = steps.len();
        for (index, step) in steps.into_iter().enumerate() {
            ctx.plan().lock().await.start_step(index)?;
            ctx.log(format!("Starting step {}: {}", index + 1, step.description))
                .await;

            let outcome = self
                .execute_action(&step.action, step.params, Some(ctx.id()))
                .await;

            match outcome {
                ActionOutcome::Success { result, .. } => {
                    ctx.plan().lock().await.complete_step(index, result)?;
                    let percent = (index + 1) as f64 / total as f64 * 100.0;
                    let message = format!("Completed step {}: {}", index + 1, step.description);
                    ctx.progress(percent, Some(message.as_str())).await;
                    ctx.notify().await;
                }
                ActionOutcome::Error { message, .. } => {
                    ctx.plan().lock().await.fail_step(index, message.clone())?;
                    bail!("Step {} failed: {}", index + 1, message);
                }
            }
        }

        let view = ctx.plan().lock().await.status_view();
        Ok(json!({
            "task_completed": true,
            "steps_executed": total,
            "plan": view,
        }))
    }

    /// Interpret `instruction` and run whatever it resolves to.
    ///
    /// Plans and steps are tracked on `plan`.
    pub async fn execute_from_natural_language(
        &self,
        interpreter: &dyn Interpreter,
        instruction: &str,
        plan: &Mutex<Plan>,
        task: Option<TaskId>,
    ) -> anyhow::Result<Value> {
        let actuator = self.registry.actuator();
        let page = if actuator.is_initialized().await {
            actuator.page_state().await.ok()
        } else {
            None
        };

        match interpreter.interpret(instruction, page.as_ref()).await? {
            Interpretation::Action { action, parameters } => {
                let outcome = self.execute_action(&action, parameters, task).await;
                Ok(serde_json::to_value(outcome)?)
            }
            Interpretation::Plan { steps } => {
                let mut plan = plan.lock().await;
                if plan.status() == PlanStatus::Completed {
                    plan.reset();
                }
                plan.start_planning(instruction)?;
                plan.set_steps(steps)?;
                Ok(json!({ "plan": plan.status_view() }))
            }
            Interpretation::ExecuteStep {
                step_index,
                action,
                parameters,
            } => {
                plan.lock().await.start_step(step_index)?;
                let outcome = self.execute_action(&action, parameters, task).await;
                let mut plan = plan.lock().await;
                match outcome {
                    ActionOutcome::Success { result, .. } => {
                        let advance = plan.complete_step(step_index, result)?;
                        Ok(serde_json::to_value(advance)?)
                    }
                    ActionOutcome::Error { message, .. } => {
                        let failure = plan.fail_step(step_index, message)?;
                        Ok(serde_json::to_value(failure)?)
                    }
                }
            }
            Interpretation::Done { message } => {
                let outcome = self
                    .execute_action(DONE_ACTION, ActionParams::new(), task)
                    .await;
                Ok(json!({
                    "done": outcome.is_success(),
                    "message": message,
                }))
            }
        }
    }

    /// Close the browser session.
    pub async fn shutdown(&self) {
        if let Err(e) = self.registry.actuator().close().await {
            tracing::warn!(error = %e, "Failed to close browser session");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::actuator::testing::ScriptedActuator;
    use crate::config::BrowserConfig;
    use crate::task::{TaskManager, TaskStatus};

    struct Fixture {
        actuator: Arc<ScriptedActuator>,
        hub: Arc<NotificationHub>,
        agent: Arc<AgentService>,
        tasks: Arc<TaskManager>,
    }

    fn fixture() -> Fixture {
        let actuator = Arc::new(ScriptedActuator::initialized());
        let hub = Arc::new(NotificationHub::new());
        let registry = Arc::new(ActionRegistry::new(actuator.clone(), BrowserConfig::default()));
        let frames = Arc::new(FrameBroadcaster::new(hub.clone(), Duration::from_millis(100)));
        let agent = Arc::new(AgentService::new(registry, hub.clone(), frames));
        let tasks = Arc::new(TaskManager::new(hub.clone()));
        Fixture {
            actuator,
            hub,
            agent,
            tasks,
        }
    }

    fn params(value: Value) -> ActionParams {
        value.as_object().cloned().unwrap_or_default()
    }

    fn request(name: &str, value: Value) -> ActionRequest {
        ActionRequest {
            name: name.to_string(),
            params: params(value),
        }
    }

    fn step(description: &str, action: &str, value: Value) -> PlanStep {
        PlanStep {
            description: description.to_string(),
            action: action.to_string(),
            params: params(value),
        }
    }

    struct Scripted(Interpretation);

    #[async_trait]
    impl Interpreter for Scripted {
        async fn interpret(
            &self,
            _instruction: &str,
            _page: Option<&PageState>,
        ) -> anyhow::Result<Interpretation> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let f = fixture();
        f.actuator.fail_operation("click", "no such element");

        let report = f
            .agent
            .execute_sequence(
                &[
                    request("go_to_url", json!({"url": "https://example.com"})),
                    request("click_element", json!({"selector": "#missing"})),
                    request("wait", json!({"time": 10})),
                ],
                None,
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.message, "Executed 2/3 actions");
        assert!(!f.actuator.calls().iter().any(|c| c.starts_with("wait")));

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("no such element"));
    }

    #[tokio::test]
    async fn test_status_tracks_url_error_and_history() {
        let f = fixture();
        f.agent
            .execute_action("go_to_url", params(json!({"url": "https://example.com/"})), None)
            .await;
        f.agent.execute_action("fly", ActionParams::new(), None).await;
        for _ in 0..12 {
            f.agent.execute_action(DONE_ACTION, ActionParams::new(), None).await;
        }

        let status = f.agent.status().await;
        assert!(status.initialized);
        assert_eq!(status.current_url.as_deref(), Some("https://example.com/"));
        assert_eq!(status.last_error.as_deref(), Some("Action 'fly' not found"));
        assert_eq!(status.history.len(), MAX_HISTORY);
    }

    #[tokio::test]
    async fn test_action_outcome_is_published_to_subscribers() {
        let f = fixture();
        let id = f.tasks.create_task("watch").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let viewer = f.hub.connect("viewer", tx);
        f.tasks.subscribe(id, viewer).await.unwrap();

        f.agent
            .execute_action("go_to_url", params(json!({"url": "https://example.com"})), Some(id))
            .await;

        let mut kinds = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            kinds.push(match envelope {
                Envelope::ActionFeedback { .. } => "feedback",
                Envelope::PageState { .. } => "page_state",
                Envelope::Screenshot { .. } => "screenshot",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["feedback", "page_state", "screenshot"]);
    }

    #[tokio::test]
    async fn test_two_step_plan_completes_task() {
        let f = fixture();
        let id = f.tasks.create_task("search").await;
        let agent = f.agent.clone();
        let steps = vec![
            step("Open the site", "go_to_url", json!({"url": "https://example.com"})),
            step("Search", "input_text", json!({"selector": "#q", "text": "rust"})),
        ];

        f.tasks
            .run_task(id, move |ctx| async move {
                agent.run_plan(&ctx, "search the site", steps).await
            })
            .await
            .unwrap()
            .await
            .unwrap();

        let task = f.tasks.get_task(id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result().unwrap()["steps_executed"], 2);

        let plan = f.tasks.plan(id).await.unwrap();
        let plan = plan.lock().await;
        assert_eq!(plan.status(), PlanStatus::Completed);
        assert_eq!(plan.completed_steps().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_plan_step_fails_task() {
        let f = fixture();
        f.actuator.fail_operation("type_text", "input is disabled");
        let id = f.tasks.create_task("search").await;
        let agent = f.agent.clone();
        let steps = vec![
            step("Open the site", "go_to_url", json!({"url": "https://example.com"})),
            step("Search", "input_text", json!({"selector": "#q", "text": "rust"})),
            step("Finish", DONE_ACTION, json!({})),
        ];

        f.tasks
            .run_task(id, move |ctx| async move {
                agent.run_plan(&ctx, "search the site", steps).await
            })
            .await
            .unwrap()
            .await
            .unwrap();

        let task = f.tasks.get_task(id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error().unwrap().starts_with("Step 2 failed"));

        let plan = f.tasks.plan(id).await.unwrap();
        let plan = plan.lock().await;
        assert_eq!(plan.status(), PlanStatus::Failed);
        assert_eq!(plan.completed_steps().len(), 1);
    }

    #[tokio::test]
    async fn test_natural_language_action() {
        let f = fixture();
        let plan = Mutex::new(Plan::new());
        let interpreter = Scripted(Interpretation::Action {
            action: "go_to_url".to_string(),
            parameters: params(json!({"url": "https://example.com"})),
        });

        let value = f
            .agent
            .execute_from_natural_language(&interpreter, "open example", &plan, None)
            .await
            .unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(plan.lock().await.status(), PlanStatus::Idle);
    }

    #[tokio::test]
    async fn test_natural_language_plan_then_step() {
        let f = fixture();
        let plan = Mutex::new(Plan::new());

        let planner = Scripted(Interpretation::Plan {
            steps: vec!["open".into(), "finish".into()],
        });
        let value = f
            .agent
            .execute_from_natural_language(&planner, "open then finish", &plan, None)
            .await
            .unwrap();
        assert_eq!(value["plan"]["total_steps"], 2);

        let first = Scripted(Interpretation::ExecuteStep {
            step_index: 0,
            action: "go_to_url".into(),
            parameters: params(json!({"url": "https://example.com"})),
        });
        let value = f
            .agent
            .execute_from_natural_language(&first, "step", &plan, None)
            .await
            .unwrap();
        assert_eq!(value["next_step"]["index"], 1);

        let wrong = Scripted(Interpretation::ExecuteStep {
            step_index: 0,
            action: DONE_ACTION.into(),
            parameters: ActionParams::new(),
        });
        assert!(f
            .agent
            .execute_from_natural_language(&wrong, "step", &plan, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_natural_language_done() {
        let f = fixture();
        let plan = Mutex::new(Plan::new());
        let interpreter = Scripted(Interpretation::Done {
            message: Some("all good".into()),
        });

        let value = f
            .agent
            .execute_from_natural_language(&interpreter, "done", &plan, None)
            .await
            .unwrap();
        assert_eq!(value, json!({"done": true, "message": "all good"}));
    }

    #[test]
    fn test_interpretation_wire_format() {
        let parsed: Interpretation = serde_json::from_value(json!({
            "type": "execute_step",
            "step_index": 1,
            "action": "click_element",
            "parameters": {"selector": "#go"},
        }))
        .unwrap();
        assert!(matches!(parsed, Interpretation::ExecuteStep { step_index: 1, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_actuator() {
        let f = fixture();
        f.agent.shutdown().await;
        assert_eq!(f.actuator.calls().last().map(String::as_str), Some("close"));
    }
}
