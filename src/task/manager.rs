//! Task manager - owns every task and runs its work in the background.
//!
//! The task map lock is only held for lookups, inserts and removals. Each task
//! has its own mutex; work never runs while holding either.
//!
//! Updates are published while the task's mutex is held, so observers see the
//! states of one task in the order they were reached and nothing after a
//! terminal state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::plan::Plan;
use super::task::{Task, TaskError, TaskId, TaskStatus};
use crate::notify::{ConnectionId, Envelope, FrameBroadcaster, NotificationHub};

/// Observer called with a snapshot on every task update.
///
/// Runs with the task locked; it must not call back into the manager.
pub type TaskListener = Arc<dyn Fn(&Task) + Send + Sync>;

struct TaskSlot {
    task: Mutex<Task>,
    plan: Arc<Mutex<Plan>>,
    cancel: CancellationToken,
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskMetrics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

pub struct TaskManager {
    tasks: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
    listeners: RwLock<HashMap<String, TaskListener>>,
    hub: Arc<NotificationHub>,
    frames: Option<Arc<FrameBroadcaster>>,
}

impl TaskManager {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            hub,
            frames: None,
        }
    }

    /// Also drop a task's screenshot window when the task is cleared.
    pub fn with_frames(mut self, frames: Arc<FrameBroadcaster>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    async fn slot(&self, id: TaskId) -> Result<Arc<TaskSlot>, TaskError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))
    }

    async fn slots(&self) -> Vec<Arc<TaskSlot>> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Create a `Pending` task and return its id.
    pub async fn create_task(&self, description: impl Into<String>) -> TaskId {
        let task = Task::new(description);
        let id = task.id();
        let slot = Arc::new(TaskSlot {
            task: Mutex::new(task),
            plan: Arc::new(Mutex::new(Plan::new())),
            cancel: CancellationToken::new(),
        });
        self.tasks.write().await.insert(id, slot);
        tracing::info!(task_id = %id, "Task created");
        id
    }

    /// Start `work` for a pending task on its own tokio task.
    ///
    /// `Ok(value)` completes the task with `value`, `Err` fails it, and
    /// [`cancel_task`](Self::cancel_task) drops the work at its next await.
    pub async fn run_task<F, Fut>(
        self: &Arc<Self>,
        id: TaskId,
        work: F,
    ) -> Result<JoinHandle<()>, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let slot = self.slot(id).await?;
        {
            let mut task = slot.task.lock().await;
            task.start()?;
            task.log("Task started");
            self.publish(&task).await;
        }

        let ctx = TaskContext {
            id,
            manager: Arc::clone(self),
            plan: Arc::clone(&slot.plan),
            cancel: slot.cancel.clone(),
        };
        let manager = Arc::clone(self);
        let token = slot.cancel.clone();

        Ok(tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = work(ctx) => Some(result),
            };
            manager.finish(&slot, id, outcome, token.is_cancelled()).await;
        }))
    }

    async fn finish(
        &self,
        slot: &TaskSlot,
        id: TaskId,
        outcome: Option<anyhow::Result<Value>>,
        canceled: bool,
    ) {
        let mut task = slot.task.lock().await;
        let applied = match outcome {
            Some(Ok(result)) if !canceled => {
                let applied = task.complete(result).is_ok();
                if applied {
                    task.log("Task completed");
                }
                applied
            }
            Some(Err(e)) if !canceled => {
                let message = format!("{:#}", e);
                let applied = task.fail(message.clone()).is_ok();
                if applied {
                    tracing::warn!(task_id = %id, error = %message, "Task failed");
                    task.log(format!("Task failed: {}", message));
                }
                applied
            }
            _ => {
                // cancel_task has usually done this already
                let applied = task.cancel().is_ok();
                if applied {
                    task.log("Task canceled");
                }
                applied
            }
        };

        if applied {
            self.publish(&task).await;
        }
    }

    /// Set progress (clamped) and optionally log. Does not notify.
    pub async fn update_progress(
        &self,
        id: TaskId,
        percent: f64,
        message: Option<&str>,
    ) -> Result<(), TaskError> {
        let slot = self.slot(id).await?;
        let mut task = slot.task.lock().await;
        task.set_progress(percent);
        if let Some(message) = message {
            task.log(message);
        }
        Ok(())
    }

    /// Append a log entry. Does not notify.
    pub async fn log(&self, id: TaskId, message: impl Into<String>) -> Result<(), TaskError> {
        let slot = self.slot(id).await?;
        slot.task.lock().await.log(message);
        Ok(())
    }

    /// Cancel a pending or running task.
    pub async fn cancel_task(&self, id: TaskId) -> Result<(), TaskError> {
        let slot = self.slot(id).await?;
        {
            let mut task = slot.task.lock().await;
            if !task.status().is_active() {
                return Err(TaskError::NotCancelable {
                    id,
                    status: task.status(),
                });
            }
            task.cancel()?;
            task.log("Task canceled");
            self.publish(&task).await;
        }
        slot.cancel.cancel();
        tracing::info!(task_id = %id, "Task canceled");
        Ok(())
    }

    /// Remove terminal tasks that finished more than `older_than` ago and
    /// match `status`. Returns how many were removed.
    pub async fn clear_tasks(&self, older_than: Duration, status: Option<TaskStatus>) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();
        for slot in self.slots().await {
            let task = slot.task.lock().await;
            if !task.status().is_terminal() {
                continue;
            }
            if status.is_some_and(|s| s != task.status()) {
                continue;
            }
            let Some(completed_at) = task.completed_at() else {
                continue;
            };
            let age = (now - completed_at).to_std().unwrap_or_default();
            if age > older_than {
                expired.push(task.id());
            }
        }

        if expired.is_empty() {
            return 0;
        }
        let removed: Vec<TaskId> = {
            let mut tasks = self.tasks.write().await;
            expired
                .into_iter()
                .filter(|id| tasks.remove(id).is_some())
                .collect()
        };
        for id in &removed {
            self.hub.forget_task(*id);
            if let Some(frames) = &self.frames {
                frames.forget(&id.to_string());
            }
        }
        tracing::info!(removed = removed.len(), "Cleared finished tasks");
        removed.len()
    }

    /// Snapshot of a task.
    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        let slot = self.slot(id).await.ok()?;
        let task = slot.task.lock().await.clone();
        Some(task)
    }

    pub async fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().await.contains_key(&id)
    }

    /// Tasks matching `status`, newest first, paginated.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();
        for slot in self.slots().await {
            let task = slot.task.lock().await;
            if status.map_or(true, |s| s == task.status()) {
                tasks.push(task.clone());
            }
        }
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        tasks.into_iter().skip(offset).take(limit).collect()
    }

    pub async fn metrics(&self) -> TaskMetrics {
        let mut metrics = TaskMetrics::default();
        for slot in self.slots().await {
            metrics.total += 1;
            match slot.task.lock().await.status() {
                TaskStatus::Pending => metrics.pending += 1,
                TaskStatus::Running => metrics.running += 1,
                TaskStatus::Completed => metrics.completed += 1,
                TaskStatus::Failed => metrics.failed += 1,
                TaskStatus::Canceled => metrics.canceled += 1,
            }
        }
        metrics
    }

    /// Plan of a task.
    pub async fn plan(&self, id: TaskId) -> Result<Arc<Mutex<Plan>>, TaskError> {
        Ok(Arc::clone(&self.slot(id).await?.plan))
    }

    /// Register a global listener under `key`, replacing any previous one.
    pub async fn add_subscriber(&self, key: impl Into<String>, listener: TaskListener) {
        self.listeners.write().await.insert(key.into(), listener);
    }

    pub async fn remove_subscriber(&self, key: &str) -> bool {
        self.listeners.write().await.remove(key).is_some()
    }

    /// Subscribe a connection to an existing task.
    pub async fn subscribe(&self, id: TaskId, conn: ConnectionId) -> Result<(), TaskError> {
        if !self.contains(id).await {
            return Err(TaskError::NotFound(id));
        }
        self.hub.subscribe(id, conn);
        Ok(())
    }

    pub fn unsubscribe(&self, id: TaskId, conn: ConnectionId) {
        self.hub.unsubscribe(id, conn);
    }

    /// Push the current snapshot of a task to listeners and subscribers.
    pub async fn notify_task_update(&self, id: TaskId) {
        let Ok(slot) = self.slot(id).await else {
            return;
        };
        let task = slot.task.lock().await;
        self.publish(&task).await;
    }

    /// Like [`notify_task_update`](Self::notify_task_update), but silent once
    /// the task is terminal. Used by running work.
    async fn notify_active(&self, id: TaskId) {
        let Ok(slot) = self.slot(id).await else {
            return;
        };
        let task = slot.task.lock().await;
        if task.status().is_terminal() {
            tracing::trace!(task_id = %id, "Skipping update of finished task");
            return;
        }
        self.publish(&task).await;
    }

    /// Caller holds the task's lock.
    async fn publish(&self, task: &Task) {
        let listeners: Vec<TaskListener> = self.listeners.read().await.values().cloned().collect();
        for listener in listeners {
            listener(task);
        }

        let id = task.id();
        let data = match serde_json::to_value(task) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "Failed to serialize task");
                return;
            }
        };
        self.hub
            .broadcast(id, &Envelope::TaskUpdate { task_id: id, data });
    }
}

/// Handle given to a task's work.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    manager: Arc<TaskManager>,
    plan: Arc<Mutex<Plan>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn plan(&self) -> &Arc<Mutex<Plan>> {
        &self.plan
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        self.manager.hub()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task is canceled.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn progress(&self, percent: f64, message: Option<&str>) {
        if let Err(e) = self
            .manager
            .update_progress(self.id, percent, message)
            .await
        {
            tracing::debug!(task_id = %self.id, error = %e, "Dropped progress update");
        }
    }

    pub async fn log(&self, message: impl Into<String>) {
        if let Err(e) = self.manager.log(self.id, message).await {
            tracing::debug!(task_id = %self.id, error = %e, "Dropped log entry");
        }
    }

    /// Push the current snapshot to observers. Does nothing once the task
    /// has finished.
    pub async fn notify(&self) {
        self.manager.notify_active(self.id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn manager() -> Arc<TaskManager> {
        Arc::new(TaskManager::new(Arc::new(NotificationHub::new())))
    }

    fn terminal_counter() -> (Arc<AtomicUsize>, TaskListener) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener: TaskListener = Arc::new(move |task: &Task| {
            if task.status().is_terminal() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, listener)
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let manager = manager();
        let (terminal, listener) = terminal_counter();
        manager.add_subscriber("counter", listener).await;

        let id = manager.create_task("t").await;
        assert_eq!(manager.get_task(id).await.unwrap().status(), TaskStatus::Pending);

        let handle = manager
            .run_task(id, |_ctx| async { Ok(json!({"x": 1})) })
            .await
            .unwrap();
        handle.await.unwrap();

        let task = manager.get_task(id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(&json!({"x": 1})));
        assert_eq!(task.progress(), 100.0);
        assert_eq!(terminal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_records_message() {
        let manager = manager();
        let id = manager.create_task("t").await;

        manager
            .run_task(id, |_ctx| async { Err(anyhow::anyhow!("element vanished")) })
            .await
            .unwrap()
            .await
            .unwrap();

        let task = manager.get_task(id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error(), Some("element vanished"));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let manager = manager();
        let (terminal, listener) = terminal_counter();
        manager.add_subscriber("counter", listener).await;
        let id = manager.create_task("t").await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let handle = manager
            .run_task(id, |_ctx| async move {
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
                Ok(Value::Null)
            })
            .await
            .unwrap();

        started_rx.await.unwrap();
        manager.cancel_task(id).await.unwrap();
        handle.await.unwrap();

        let task = manager.get_task(id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(task.completed_at().is_some());
        assert_eq!(terminal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_then_run_is_rejected() {
        let manager = manager();
        let id = manager.create_task("t").await;

        manager.cancel_task(id).await.unwrap();

        assert_eq!(manager.get_task(id).await.unwrap().status(), TaskStatus::Canceled);
        let err = manager
            .run_task(id, |_ctx| async { Ok(Value::Null) })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_terminal() {
        let manager = manager();
        assert!(matches!(
            manager.cancel_task(TaskId::new()).await,
            Err(TaskError::NotFound(_))
        ));

        let id = manager.create_task("t").await;
        manager.cancel_task(id).await.unwrap();
        assert!(matches!(
            manager.cancel_task(id).await,
            Err(TaskError::NotCancelable { .. })
        ));
    }

    #[tokio::test]
    async fn test_progress_is_clamped_and_silent() {
        let manager = manager();
        let hub = Arc::clone(manager.hub());
        let id = manager.create_task("t").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let viewer = hub.connect("viewer", tx);
        manager.subscribe(id, viewer).await.unwrap();

        manager.update_progress(id, 250.0, Some("almost")).await.unwrap();

        let task = manager.get_task(id).await.unwrap();
        assert_eq!(task.progress(), 100.0);
        assert_eq!(task.logs().last().unwrap().message, "almost");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates() {
        let manager = manager();
        let id = manager.create_task("t").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let viewer = manager.hub().connect("viewer", tx);
        manager.subscribe(id, viewer).await.unwrap();

        manager
            .run_task(id, |_ctx| async { Ok(json!({})) })
            .await
            .unwrap()
            .await
            .unwrap();

        let mut statuses = Vec::new();
        while let Ok(Envelope::TaskUpdate { data, .. }) = rx.try_recv() {
            statuses.push(data["status"].as_str().unwrap().to_string());
        }
        assert_eq!(statuses, vec!["running", "completed"]);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_task_fails() {
        let manager = manager();
        assert!(manager.subscribe(TaskId::new(), ConnectionId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_only_terminal_and_filtered() {
        let manager = manager();
        let pending = manager.create_task("pending").await;
        let canceled = manager.create_task("canceled").await;
        manager.cancel_task(canceled).await.unwrap();
        let done = manager.create_task("done").await;
        manager
            .run_task(done, |_ctx| async { Ok(Value::Null) })
            .await
            .unwrap()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(manager.clear_tasks(Duration::from_secs(3600), None).await, 0);
        assert_eq!(
            manager
                .clear_tasks(Duration::ZERO, Some(TaskStatus::Canceled))
                .await,
            1
        );
        assert!(manager.contains(done).await);
        assert_eq!(manager.clear_tasks(Duration::ZERO, None).await, 1);
        assert!(manager.contains(pending).await);
        assert!(!manager.contains(canceled).await);
    }

    #[tokio::test]
    async fn test_list_and_metrics() {
        let manager = manager();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(manager.create_task(format!("task {}", i)).await);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        manager.cancel_task(ids[0]).await.unwrap();

        let all = manager.list_tasks(None, 100, 0).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id(), ids[2]);

        let page = manager.list_tasks(None, 1, 1).await;
        assert_eq!(page[0].id(), ids[1]);

        let canceled = manager.list_tasks(Some(TaskStatus::Canceled), 100, 0).await;
        assert_eq!(canceled.len(), 1);

        let metrics = manager.metrics().await;
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.pending, 2);
        assert_eq!(metrics.canceled, 1);
    }

    #[tokio::test]
    async fn test_remove_subscriber() {
        let manager = manager();
        let (_, listener) = terminal_counter();
        manager.add_subscriber("counter", listener).await;
        assert!(manager.remove_subscriber("counter").await);
        assert!(!manager.remove_subscriber("counter").await);
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<String> {
        let mut statuses = Vec::new();
        while let Ok(Envelope::TaskUpdate { data, .. }) = rx.try_recv() {
            statuses.push(data["status"].as_str().unwrap().to_string());
        }
        statuses
    }

    #[tokio::test]
    async fn test_worker_notify_after_cancel_is_dropped() {
        let manager = manager();
        let id = manager.create_task("t").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let viewer = manager.hub().connect("viewer", tx);
        manager.subscribe(id, viewer).await.unwrap();

        let (ctx_tx, ctx_rx) = tokio::sync::oneshot::channel();
        let handle = manager
            .run_task(id, move |ctx| async move {
                let _ = ctx_tx.send(ctx.clone());
                std::future::pending::<()>().await;
                Ok(Value::Null)
            })
            .await
            .unwrap();
        let ctx = ctx_rx.await.unwrap();

        manager.cancel_task(id).await.unwrap();
        ctx.notify().await;
        handle.await.unwrap();

        assert_eq!(statuses(&mut rx), vec!["running", "canceled"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_notify_racing_cancel_never_follows_terminal() {
        for _ in 0..20 {
            let manager = manager();
            let id = manager.create_task("race").await;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let viewer = manager.hub().connect("viewer", tx);
            manager.subscribe(id, viewer).await.unwrap();

            let handle = manager
                .run_task(id, |ctx| async move {
                    while !ctx.is_canceled() {
                        ctx.notify().await;
                        tokio::task::yield_now().await;
                    }
                    Ok(Value::Null)
                })
                .await
                .unwrap();

            let canceler = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..3 {
                        tokio::task::yield_now().await;
                    }
                    manager.cancel_task(id).await
                })
            };
            canceler.await.unwrap().unwrap();
            handle.await.unwrap();

            let seen = statuses(&mut rx);
            assert_eq!(seen.last().map(String::as_str), Some("canceled"));
            assert_eq!(seen.iter().filter(|s| *s == "canceled").count(), 1);
            assert!(seen[..seen.len() - 1].iter().all(|s| s == "running"));
        }
    }

    #[tokio::test]
    async fn test_clear_drops_subscriptions_and_frame_windows() {
        let hub = Arc::new(NotificationHub::new());
        let frames = Arc::new(FrameBroadcaster::new(
            Arc::clone(&hub),
            Duration::from_millis(100),
        ));
        let manager = Arc::new(TaskManager::new(Arc::clone(&hub)).with_frames(Arc::clone(&frames)));

        let id = manager.create_task("t").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let viewer = hub.connect("viewer", tx);
        manager.subscribe(id, viewer).await.unwrap();
        frames.offer(&id.to_string(), id, String::new());
        manager.cancel_task(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.clear_tasks(Duration::ZERO, None).await, 1);

        assert!(!hub.has_subscriptions(id));
        assert_eq!(frames.tracked(), 0);
        assert!(hub.is_connected(viewer));
    }

    #[tokio::test]
    async fn test_context_outlives_cleared_task() {
        let manager = manager();
        let id = manager.create_task("t").await;
        let (ctx_tx, ctx_rx) = tokio::sync::oneshot::channel();
        let handle = manager
            .run_task(id, move |ctx| async move {
                let _ = ctx_tx.send(ctx.clone());
                std::future::pending::<()>().await;
                Ok(Value::Null)
            })
            .await
            .unwrap();
        let ctx = ctx_rx.await.unwrap();
        manager.cancel_task(id).await.unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.clear_tasks(Duration::ZERO, None).await;

        ctx.progress(50.0, Some("late")).await;
        ctx.log("late").await;
        ctx.notify().await;
        assert!(manager.get_task(id).await.is_none());
    }
}
