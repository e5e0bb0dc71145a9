//! Cron scheduler: turns the schedule table into timed run requests.
//!
//! Each runnable entry gets its own timer task. When a timer fires it hands a
//! `RunRequest { run_by: Scheduler }` to the injected `Runner`. A firing is
//! skipped while the previous firing of the same entry is still executing,
//! and a panicking firing is logged without taking the timer down.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{ScheduleConfig, ScheduleEntry};
use crate::error::{Error, ScheduleError};
use crate::notify::NotificationSender;
use crate::task::context::TaskContext;
use crate::task::request::RunRequest;

/// Accepts run requests. The coordinator's request sender implements this.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<(), Error>;
}

struct RunningState {
    token: CancellationToken,
    tracker: TaskTracker,
    registered: usize,
}

/// Drives cron timers for the schedule table.
pub struct CronScheduler {
    runner: Arc<dyn Runner>,
    notifier: Arc<dyn NotificationSender>,
    state: Mutex<Option<RunningState>>,
}

impl CronScheduler {
    pub fn new(runner: Arc<dyn Runner>, notifier: Arc<dyn NotificationSender>) -> Self {
        Self {
            runner,
            notifier,
            state: Mutex::new(None),
        }
    }

    /// Register a timer for every runnable entry. Returns how many were
    /// registered. Calling again while running is a no-op.
    pub async fn start(&self, config: &ScheduleConfig) -> usize {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            return running.registered;
        }

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut registered = 0;

        for entry in config.runnable_entries() {
            let schedule = match cron::Schedule::from_str(&entry.time_spec) {
                Ok(schedule) => schedule,
                Err(e) => {
                    let err = ScheduleError::InvalidExpression {
                        kind: entry.task.to_string(),
                        command: entry.command.to_string(),
                        expression: entry.time_spec.clone(),
                        reason: e.to_string(),
                    };
                    tracing::error!(task = %entry.task, command = %entry.command, "{}", err);
                    let ctx = TaskContext::new()
                        .with_task(entry.task.clone(), entry.command.clone())
                        .with_error();
                    self.notifier
                        .notify(&ctx, &entry.notifier, &format!("Schedule registration failed: {err}"))
                        .await;
                    continue;
                }
            };

            let job = Arc::new(ScheduledJob::new(
                entry.clone(),
                self.runner.clone(),
                self.notifier.clone(),
                token.clone(),
            ));
            tracker.spawn(drive(job, schedule, token.clone(), tracker.clone()));
            registered += 1;

            tracing::info!(
                task = %entry.task,
                command = %entry.command,
                schedule = %entry.time_spec,
                "Registered scheduled task"
            );
        }

        *state = Some(RunningState {
            token,
            tracker,
            registered,
        });
        registered
    }

    /// Stop all timers and wait until every timer and in-flight firing has
    /// exited. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().await.take() else {
            return;
        };
        running.token.cancel();
        running.tracker.close();
        running.tracker.wait().await;
        tracing::info!(jobs = running.registered, "Cron scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn registered_jobs(&self) -> usize {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.registered)
            .unwrap_or(0)
    }
}

/// One registered schedule entry.
struct ScheduledJob {
    entry: ScheduleEntry,
    runner: Arc<dyn Runner>,
    notifier: Arc<dyn NotificationSender>,
    stopping: CancellationToken,
    in_flight: AtomicBool,
}

impl ScheduledJob {
    fn new(
        entry: ScheduleEntry,
        runner: Arc<dyn Runner>,
        notifier: Arc<dyn NotificationSender>,
        stopping: CancellationToken,
    ) -> Self {
        Self {
            entry,
            runner,
            notifier,
            stopping,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Spawn a firing unless the previous one is still executing.
    fn try_fire(self: &Arc<Self>, tracker: &TaskTracker) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                task = %self.entry.task,
                command = %self.entry.command,
                "Previous scheduled firing still running, skipping"
            );
            return false;
        }

        let job = Arc::clone(self);
        tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(job.fire()).catch_unwind().await {
                tracing::error!(
                    task = %job.entry.task,
                    command = %job.entry.command,
                    "Scheduled firing panicked: {}",
                    crate::coordinator::panic_message(panic.as_ref())
                );
            }
            job.in_flight.store(false, Ordering::Release);
        });
        true
    }

    async fn fire(&self) {
        let request = RunRequest::by_scheduler(
            self.entry.task.clone(),
            self.entry.command.clone(),
            self.entry.notifier.clone(),
        );

        // The runner may be waiting on a full queue that nobody drains anymore.
        let outcome = tokio::select! {
            outcome = self.runner.run(request) => outcome,
            _ = self.stopping.cancelled() => {
                tracing::debug!(
                    task = %self.entry.task,
                    command = %self.entry.command,
                    "Scheduler stopping, pending run request abandoned"
                );
                return;
            }
        };

        if let Err(e) = outcome {
            let err = ScheduleError::RunRejected {
                kind: self.entry.task.to_string(),
                command: self.entry.command.to_string(),
                reason: e.to_string(),
            };
            tracing::error!(task = %self.entry.task, command = %self.entry.command, "{}", err);
            let ctx = TaskContext::new()
                .with_task(self.entry.task.clone(), self.entry.command.clone())
                .with_error();
            self.notifier
                .notify(&ctx, &self.entry.notifier, &format!("Scheduled run failed: {err}"))
                .await;
        }
    }
}

/// Timer loop for one job.
async fn drive(
    job: Arc<ScheduledJob>,
    schedule: cron::Schedule,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let mut cursor = Local::now();
    loop {
        let Some(next) = schedule.after(&cursor).next() else {
            tracing::info!(task = %job.entry.task, command = %job.entry.command, "Schedule has no upcoming fire time");
            break;
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        job.try_fire(&tracker);
        cursor = next.max(Local::now());
    }
}
