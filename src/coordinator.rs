//! Task coordinator: admits run requests, tracks live instances, and
//! drives every instance from admission to completion.
//!
//! All admission decisions and live-set mutations happen on one control-loop
//! task that selects over the run, cancel and done channels plus a shutdown
//! token. Task bodies run on their own tokio tasks and only talk back to the
//! loop through the done channel.
//!
//! Cancellation is advisory: a canceled instance keeps running until its
//! body notices `TaskRuntime::is_canceled()` and returns.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ScheduleConfig;
use crate::error::{CoordinatorError, Error, TaskError};
use crate::notify::NotificationSender;
use crate::scheduler::{CronScheduler, Runner};
use crate::store::{ResultStore, TaskStore};
use crate::task::context::{TaskContext, format_elapsed};
use crate::task::id::IdGenerator;
use crate::task::kinds::{CommandKind, InstanceId, NotifierId, TaskKind};
use crate::task::registry::TaskRegistry;
use crate::task::request::{RunBy, RunRequest};
use crate::task::{Task, TaskRuntime};

/// Default capacity of the run and cancel queues.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// One admitted, not yet completed instance.
struct TaskHandle {
    task_kind: TaskKind,
    command_kind: CommandKind,
    notifier_id: NotifierId,
    run_by: RunBy,
    context: TaskContext,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    cancel: CancellationToken,
}

impl TaskHandle {
    fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Snapshot of a live instance for administrative queries.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub instance_id: InstanceId,
    pub task_kind: TaskKind,
    pub command_kind: CommandKind,
    pub run_by: RunBy,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub canceled: bool,
}

type LiveSet = Arc<RwLock<HashMap<InstanceId, TaskHandle>>>;

/// Enqueues requests into a running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct RequestSender {
    run_tx: mpsc::Sender<RunRequest>,
    cancel_tx: mpsc::Sender<InstanceId>,
}

impl RequestSender {
    pub async fn run(&self, request: RunRequest) -> Result<(), CoordinatorError> {
        self.run_tx
            .send(request)
            .await
            .map_err(|_| CoordinatorError::EnqueueFailed { what: "run request" })
    }

    pub async fn cancel(&self, instance_id: InstanceId) -> Result<(), CoordinatorError> {
        self.cancel_tx
            .send(instance_id)
            .await
            .map_err(|_| CoordinatorError::EnqueueFailed {
                what: "cancel request",
            })
    }
}

#[async_trait]
impl Runner for RequestSender {
    async fn run(&self, request: RunRequest) -> Result<(), Error> {
        RequestSender::run(self, request).await.map_err(Error::from)
    }
}

struct Lifecycle {
    requests: RequestSender,
    shutdown: CancellationToken,
    control: JoinHandle<()>,
}

/// The task coordinator.
pub struct Coordinator {
    registry: Arc<TaskRegistry>,
    store: Arc<ResultStore>,
    ids: Arc<IdGenerator>,
    queue_capacity: usize,
    notifier: StdRwLock<Option<Arc<dyn NotificationSender>>>,
    live: LiveSet,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Coordinator {
    pub fn new(registry: TaskRegistry, store: Arc<ResultStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            ids: Arc::new(IdGenerator::new()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            notifier: StdRwLock::new(None),
            live: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Must be called before `start`.
    pub fn set_notification_sender(&self, sender: Arc<dyn NotificationSender>) {
        let mut slot = self.notifier.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(sender);
    }

    fn notification_sender(&self) -> Option<Arc<dyn NotificationSender>> {
        self.notifier
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the scheduler and the control loop, then return immediately.
    ///
    /// Cancelling `parent` has the same effect as calling `stop`, except that
    /// nobody waits for the workers. A second call while running is a no-op.
    pub async fn start(
        &self,
        schedule: &ScheduleConfig,
        parent: &CancellationToken,
    ) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        // A loop that died without running its shutdown still reports running.
        if lifecycle.as_ref().is_some_and(|l| l.control.is_finished())
            && let Some(dead) = lifecycle.take()
        {
            dead.shutdown.cancel();
            if let Err(e) = dead.control.await {
                tracing::error!("Coordinator control loop ended abnormally: {}", e);
                self.abandon_live().await;
            }
        }
        if self.is_running() {
            return Ok(());
        }
        // A loop that ended through the parent token leaves its handle behind.
        if let Some(stale) = lifecycle.take() {
            let _ = stale.control.await;
        }

        let notifier = self
            .notification_sender()
            .ok_or(CoordinatorError::MissingNotificationSender)?;

        let (run_tx, run_rx) = mpsc::channel(self.queue_capacity);
        let (cancel_tx, cancel_rx) = mpsc::channel(self.queue_capacity);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let requests = RequestSender { run_tx, cancel_tx };

        let scheduler = Arc::new(CronScheduler::new(
            Arc::new(requests.clone()),
            notifier.clone(),
        ));
        let registered = scheduler.start(schedule).await;

        let shutdown = parent.child_token();
        let control = ControlLoop {
            registry: self.registry.clone(),
            store: self.store.clone(),
            ids: self.ids.clone(),
            notifier,
            live: self.live.clone(),
            running: self.running.clone(),
            scheduler,
            shutdown: shutdown.clone(),
            run_rx,
            cancel_rx,
            done_tx,
            done_rx,
            workers: TaskTracker::new(),
            notifications: TaskTracker::new(),
        };

        self.running.store(true, Ordering::Release);
        let control = tokio::spawn(control.run());

        tracing::info!(scheduled = registered, "Task coordinator started");
        *lifecycle = Some(Lifecycle {
            requests,
            shutdown,
            control,
        });
        Ok(())
    }

    /// Shut down and wait until every in-flight worker has reported done.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.lifecycle.lock().await.take() else {
            return;
        };
        lifecycle.shutdown.cancel();
        if let Err(e) = lifecycle.control.await {
            tracing::error!("Coordinator control loop ended abnormally: {}", e);
            self.abandon_live().await;
        }
    }

    /// Cleanup after a control loop that never reached its shutdown path.
    async fn abandon_live(&self) {
        let mut live = self.live.write().await;
        for handle in live.values() {
            handle.cancel.cancel();
        }
        if !live.is_empty() {
            tracing::warn!(instances = live.len(), "Abandoning instances of a dead control loop");
        }
        live.clear();
        self.running.store(false, Ordering::Release);
    }

    /// A handle for enqueueing requests, e.g. from a command interface.
    pub async fn requests(&self) -> Result<RequestSender, CoordinatorError> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .map(|l| l.requests.clone())
            .ok_or(CoordinatorError::NotRunning)
    }

    /// Enqueue a run request. Validation happens inside the control loop.
    pub async fn run(&self, request: RunRequest) -> Result<(), CoordinatorError> {
        self.requests().await?.run(request).await
    }

    /// Enqueue an advisory cancellation for `instance_id`.
    pub async fn cancel(&self, instance_id: InstanceId) -> Result<(), CoordinatorError> {
        self.requests().await?.cancel(instance_id).await
    }

    /// Snapshot of live instances, oldest first.
    pub async fn running_instances(&self) -> Vec<InstanceInfo> {
        let live = self.live.read().await;
        let mut infos: Vec<InstanceInfo> = live
            .iter()
            .map(|(id, handle)| InstanceInfo {
                instance_id: id.clone(),
                task_kind: handle.task_kind.clone(),
                command_kind: handle.command_kind.clone(),
                run_by: handle.run_by,
                started_at: handle.started_wall,
                elapsed: handle.started_at.elapsed(),
                canceled: handle.is_canceled(),
            })
            .collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }
}

/// State owned by the control-loop task.
struct ControlLoop {
    registry: Arc<TaskRegistry>,
    store: Arc<ResultStore>,
    ids: Arc<IdGenerator>,
    notifier: Arc<dyn NotificationSender>,
    live: LiveSet,
    running: Arc<AtomicBool>,
    scheduler: Arc<CronScheduler>,
    shutdown: CancellationToken,
    run_rx: mpsc::Receiver<RunRequest>,
    cancel_rx: mpsc::Receiver<InstanceId>,
    done_tx: mpsc::UnboundedSender<InstanceId>,
    done_rx: mpsc::UnboundedReceiver<InstanceId>,
    workers: TaskTracker,
    notifications: TaskTracker,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(instance_id) = self.done_rx.recv() => self.handle_done(instance_id).await,
                Some(instance_id) = self.cancel_rx.recv() => self.handle_cancel(instance_id).await,
                Some(request) = self.run_rx.recv() => self.handle_run(request).await,
                else => break,
            }
        }
        self.shut_down().await;
    }

    async fn handle_run(&mut self, request: RunRequest) {
        let kind = request.task_kind.clone();
        let command = request.command_kind.clone();
        let ctx = request
            .context
            .clone()
            .unwrap_or_else(|| TaskContext::new().with_task(kind.clone(), command.clone()));

        let Some((registration, spec)) = self.registry.lookup(&kind, &command) else {
            tracing::warn!(task = %kind, command = %command, run_by = %request.run_by, "Unsupported task");
            self.notify(
                ctx.with_error(),
                request.notifier_id.clone(),
                format!("Unsupported task: {kind}/{command}"),
            );
            return;
        };

        if !spec.allow_concurrent
            && let Some((existing_id, elapsed)) = self.find_active(&kind, &command).await
        {
            if request.run_by == RunBy::Scheduler {
                tracing::info!(
                    task = %kind,
                    command = %command,
                    existing = %existing_id,
                    "Scheduled run skipped, instance already in progress"
                );
                return;
            }
            tracing::info!(task = %kind, command = %command, existing = %existing_id, "Duplicate run rejected");
            self.notify(
                ctx.with_instance_id(existing_id.clone()).with_elapsed(elapsed),
                request.notifier_id.clone(),
                format!(
                    "Task is already in progress (instance {existing_id}, running for {})",
                    format_elapsed(elapsed)
                ),
            );
            return;
        }

        let instance_id = self.allocate_id().await;

        let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
            (registration.factory)(&instance_id, &request)
        }))
        .unwrap_or_else(|panic| {
            Err(TaskError::Construction {
                kind: kind.to_string(),
                command: command.to_string(),
                reason: format!("factory panicked: {}", panic_message(panic.as_ref())),
            })
        });

        let body = match built {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(task = %kind, command = %command, "Task construction failed: {}", e);
                self.notify(
                    ctx.with_error(),
                    request.notifier_id.clone(),
                    format!("Failed to start task: {e}"),
                );
                return;
            }
        };

        let ctx = ctx.with_instance_id(instance_id.clone());
        let cancel = CancellationToken::new();
        let started_at = Instant::now();
        let runtime = TaskRuntime {
            task_kind: kind.clone(),
            command_kind: command.clone(),
            instance_id: instance_id.clone(),
            notifier_id: request.notifier_id.clone(),
            run_by: request.run_by,
            context: ctx.clone(),
            notifier: self.notifier.clone(),
            store: TaskStore::new(
                self.store.clone(),
                kind.clone(),
                command.clone(),
                spec.result_shape,
            ),
            cancel: cancel.clone(),
            started_at,
        };

        self.live.write().await.insert(
            instance_id.clone(),
            TaskHandle {
                task_kind: kind.clone(),
                command_kind: command.clone(),
                notifier_id: request.notifier_id.clone(),
                run_by: request.run_by,
                context: ctx.clone(),
                started_at,
                started_wall: Utc::now(),
                cancel,
            },
        );

        tracing::info!(
            task = %kind,
            command = %command,
            instance = %instance_id,
            run_by = %request.run_by,
            "Task admitted"
        );

        if request.notify_on_start {
            self.notify(
                ctx.with_elapsed(Duration::ZERO),
                request.notifier_id.clone(),
                format!("Working on {kind}/{command} (instance {instance_id})"),
            );
        }

        self.workers
            .spawn(run_worker(body, runtime, self.done_tx.clone()));
    }

    /// Oldest live, non-canceled instance of (kind, command).
    async fn find_active(
        &self,
        kind: &TaskKind,
        command: &CommandKind,
    ) -> Option<(InstanceId, Duration)> {
        let live = self.live.read().await;
        live.iter()
            .filter(|(_, h)| &h.task_kind == kind && &h.command_kind == command && !h.is_canceled())
            .map(|(id, h)| (id.clone(), h.started_at.elapsed()))
            .max_by_key(|(_, elapsed)| *elapsed)
    }

    async fn allocate_id(&self) -> InstanceId {
        let live = self.live.read().await;
        loop {
            let id = self.ids.next_id();
            if !live.contains_key(&id) {
                return id;
            }
            tracing::warn!(instance = %id, "Generated instance id collides with a live instance, regenerating");
        }
    }

    async fn handle_done(&mut self, instance_id: InstanceId) {
        match self.live.write().await.remove(&instance_id) {
            Some(handle) => tracing::info!(
                task = %handle.task_kind,
                command = %handle.command_kind,
                instance = %instance_id,
                elapsed_ms = handle.started_at.elapsed().as_millis() as u64,
                canceled = handle.is_canceled(),
                "Task finished"
            ),
            None => tracing::warn!(instance = %instance_id, "Done signal for unknown instance"),
        }
    }

    async fn handle_cancel(&mut self, instance_id: InstanceId) {
        let target = {
            let live = self.live.read().await;
            live.get(&instance_id).map(|handle| {
                handle.cancel.cancel();
                (
                    handle
                        .context
                        .with_elapsed(handle.started_at.elapsed()),
                    handle.notifier_id.clone(),
                )
            })
        };

        match target {
            Some((ctx, notifier_id)) => {
                tracing::info!(instance = %instance_id, "Cancellation requested");
                self.notify(ctx, notifier_id, "Task canceled by user request.".to_string());
            }
            None => {
                tracing::warn!(instance = %instance_id, "Cancel requested for unknown instance");
                let notifier = self.notifier.clone();
                let message = format!("Cannot find task instance {instance_id}.");
                self.notifications.spawn(async move {
                    notifier.notify_default(&message).await;
                });
            }
        }
    }

    /// Send a notification without blocking the loop.
    fn notify(&self, ctx: TaskContext, notifier_id: NotifierId, message: String) {
        let notifier = self.notifier.clone();
        self.notifications.spawn(async move {
            if !notifier.notify(&ctx, &notifier_id, &message).await {
                tracing::warn!(notifier = %notifier_id, "Notification was not sent");
            }
        });
    }

    async fn shut_down(mut self) {
        tracing::info!("Task coordinator shutting down");
        // Closing first wakes scheduler firings blocked on a full run queue.
        self.run_rx.close();
        self.cancel_rx.close();
        self.scheduler.stop().await;

        {
            let live = self.live.read().await;
            for handle in live.values() {
                handle.cancel.cancel();
            }
        }

        let mut dropped = 0usize;
        while self.run_rx.try_recv().is_ok() {
            dropped += 1;
        }
        while self.cancel_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "Discarded queued requests during shutdown");
        }

        self.workers.close();
        loop {
            if self.live.read().await.is_empty() {
                break;
            }
            match self.done_rx.recv().await {
                Some(instance_id) => self.handle_done(instance_id).await,
                None => break,
            }
        }
        self.workers.wait().await;

        self.done_rx.close();
        self.notifications.close();
        self.notifications.wait().await;

        self.live.write().await.clear();
        self.running.store(false, Ordering::Release);
        tracing::info!("Task coordinator stopped");
    }
}

/// Worker boundary: run the body, turn errors and panics into a failure
/// notification, and always report done.
async fn run_worker(
    mut body: Box<dyn Task>,
    rt: TaskRuntime,
    done_tx: mpsc::UnboundedSender<InstanceId>,
) {
    let outcome = AssertUnwindSafe(body.run(&rt)).catch_unwind().await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(Error::Task(TaskError::Canceled))) => {
            tracing::info!(instance = %rt.instance_id, "Task stopped after cancellation");
            None
        }
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
    };

    if let Some(cause) = failure {
        tracing::error!(
            task = %rt.task_kind,
            command = %rt.command_kind,
            instance = %rt.instance_id,
            "Task execution failed: {}",
            cause
        );
        let ctx = rt.context.with_error().with_elapsed(rt.elapsed());
        rt.notifier
            .notify(&ctx, &rt.notifier_id, &format!("Task execution failed: {cause}"))
            .await;
    }

    if done_tx.send(rt.instance_id.clone()).is_err() {
        tracing::warn!(instance = %rt.instance_id, "Coordinator gone before done signal");
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
