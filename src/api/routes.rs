//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::actuator::{Actuator, CdpActuator};
use crate::agent::{AgentService, AgentStatus};
use crate::config::Config;
use crate::controller::{ActionInfo, ActionOutcome, ActionRegistry};
use crate::notify::{Envelope, FrameBroadcaster, NotificationHub};
use crate::task::{PlanStatusView, Task, TaskError, TaskId, TaskManager, TaskMetrics, TaskStatus};

use super::types::*;
use super::ws;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Action catalogue bound to the browser session
    pub registry: Arc<ActionRegistry>,
    /// All tasks and their plans
    pub tasks: Arc<TaskManager>,
    /// Live observer connections
    pub hub: Arc<NotificationHub>,
    pub agent: Arc<AgentService>,
}

impl AppState {
    pub fn new(config: Config, actuator: Arc<dyn Actuator>) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let frames = Arc::new(FrameBroadcaster::new(
            Arc::clone(&hub),
            config.screenshot_min_interval,
        ));
        let registry = Arc::new(ActionRegistry::new(actuator, config.browser.clone()));
        let tasks = Arc::new(TaskManager::new(Arc::clone(&hub)).with_frames(Arc::clone(&frames)));
        let agent = Arc::new(AgentService::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            frames,
        ));
        Self {
            config,
            registry,
            tasks,
            hub,
            agent,
        }
    }
}

/// Build the router for `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/actions", get(list_actions))
        .route("/api/actions/execute", post(execute_action))
        .route("/api/agent/status", get(agent_status))
        .route(
            "/api/tasks",
            get(list_tasks).post(create_task).delete(clear_tasks),
        )
        .route("/api/tasks/metrics", get(task_metrics))
        .route("/api/tasks/:id", get(get_task).delete(cancel_task))
        .route("/api/tasks/:id/plan", get(get_plan))
        .route("/api/tasks/:id/plan/reset", post(reset_plan))
        .route("/ws", get(ws::live_updates_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let actuator: Arc<dyn Actuator> = Arc::new(CdpActuator::new(config.browser.clone()));
    let state = Arc::new(AppState::new(config.clone(), actuator));

    let background = vec![
        spawn_cleanup_sweep(Arc::clone(&state)),
        ws::spawn_heartbeat(Arc::clone(&state.hub), config.heartbeat_interval),
    ];

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    state.agent.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Periodically drop finished tasks older than the configured age.
fn spawn_cleanup_sweep(state: Arc<AppState>) -> JoinHandle<()> {
    let every = state.config.task_cleanup_interval;
    let max_age = state.config.task_max_age;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = state.tasks.clear_tasks(max_age, None).await;
            if removed > 0 {
                tracing::info!(removed, "Swept finished tasks");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, closing browser session...");
}

fn parse_task_id(raw: &str) -> Result<TaskId, (StatusCode, String)> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid task ID '{}'", raw)))
}

fn parse_status(raw: Option<&str>) -> Result<Option<TaskStatus>, (StatusCode, String)> {
    raw.map(|s| {
        s.parse::<TaskStatus>().map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                format!(
                    "Invalid status '{}'. Valid statuses are: pending, running, completed, failed, canceled",
                    s
                ),
            )
        })
    })
    .transpose()
}

fn not_found(id: TaskId) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("Task with ID '{}' not found", id))
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        browser_initialized: state.registry.actuator().is_initialized().await,
        connections: state.hub.connection_count(),
    })
}

async fn list_actions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListActionsQuery>,
) -> Json<Vec<ActionInfo>> {
    Json(state.registry.list(query.category))
}

/// Run one action. Failures are reported in the body, not the status code.
async fn execute_action(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteActionRequest>,
) -> Json<ActionOutcome> {
    tracing::debug!(action = %req.action, "Executing action via API");
    Json(state.agent.execute_action(&req.action, req.params, None).await)
}

/// Browser session state, current URL, last error and recent actions.
async fn agent_status(State(state): State<Arc<AppState>>) -> Json<AgentStatus> {
    Json(state.agent.status().await)
}

/// Status to report for a task just handed to `run_task`.
///
/// A cancel that lands between creation and start leaves the task canceled;
/// that status is reported instead of an error.
fn started_status<T>(started: Result<T, TaskError>) -> Result<TaskStatus, (StatusCode, String)> {
    match started {
        Ok(_) => Ok(TaskStatus::Running),
        Err(TaskError::InvalidTransition { from, .. }) if from.is_terminal() => Ok(from),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// Create a task and start it right away.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, (StatusCode, String)> {
    if req.description.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Task description cannot be empty".to_string(),
        ));
    }
    match (req.actions.is_empty(), req.steps.is_empty()) {
        (true, true) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "A task needs either actions or steps".to_string(),
            ))
        }
        (false, false) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "A task takes either actions or steps, not both".to_string(),
            ))
        }
        _ => {}
    }

    let id = state.tasks.create_task(req.description.clone()).await;
    let agent = Arc::clone(&state.agent);

    let started = if req.steps.is_empty() {
        let actions = req.actions;
        state
            .tasks
            .run_task(id, move |ctx| async move {
                agent.execute_sequence(&actions, Some(&ctx)).await.into_result()
            })
            .await
    } else {
        let goal = req.description;
        let steps = req.steps;
        state
            .tasks
            .run_task(id, move |ctx| async move {
                agent.run_plan(&ctx, &goal, steps).await
            })
            .await
    };

    let status = started_status(started)?;

    Ok(Json(CreateTaskResponse { task_id: id, status }))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, (StatusCode, String)> {
    let status = parse_status(query.status.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {}", MAX_LIST_LIMIT),
        ));
    }
    let skip = query.skip.unwrap_or(0);
    Ok(Json(state.tasks.list_tasks(status, limit, skip).await))
}

async fn task_metrics(State(state): State<Arc<AppState>>) -> Json<TaskMetrics> {
    Json(state.tasks.metrics().await)
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let id = parse_task_id(&id)?;
    state
        .tasks
        .get_task(id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(id))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let id = parse_task_id(&id)?;
    match state.tasks.cancel_task(id).await {
        Ok(()) => Ok(Json(MessageResponse {
            message: format!("Task with ID '{}' canceled successfully", id),
        })),
        Err(TaskError::NotFound(_)) => Err(not_found(id)),
        Err(TaskError::NotCancelable { status, .. }) => Err((
            StatusCode::BAD_REQUEST,
            format!("Cannot cancel task with status '{}'", status),
        )),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// Drop every finished task, optionally only those with one status.
async fn clear_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearTasksQuery>,
) -> Result<Json<ClearTasksResponse>, (StatusCode, String)> {
    let status = parse_status(query.status.as_deref())?;
    let cleared = state.tasks.clear_tasks(Duration::ZERO, status).await;
    let message = match status {
        Some(status) => format!("Cleared {} tasks with status '{}'", cleared, status),
        None => format!("Cleared {} tasks", cleared),
    };
    Ok(Json(ClearTasksResponse { message, cleared }))
}

async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PlanStatusView>, (StatusCode, String)> {
    let id = parse_task_id(&id)?;
    let plan = state.tasks.plan(id).await.map_err(|_| not_found(id))?;
    let view = plan.lock().await.status_view();
    Ok(Json(view))
}

/// Reset a task's plan to idle. The task itself is left alone.
async fn reset_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PlanStatusView>, (StatusCode, String)> {
    let id = parse_task_id(&id)?;
    let plan = state.tasks.plan(id).await.map_err(|_| not_found(id))?;
    let view = {
        let mut plan = plan.lock().await;
        plan.reset();
        plan.status_view()
    };
    state.hub.broadcast(
        id,
        &Envelope::TaskUpdate {
            task_id: id,
            data: serde_json::json!({ "plan": &view }),
        },
    );
    Ok(Json(view))
}
