//! Task model: identifiers, requests, contexts and the `Task` trait that
//! concrete task types implement.
//!
//! - `kinds`: TaskKind / CommandKind / InstanceId newtypes
//! - `context`: immutable TaskContext metadata carrier
//! - `request`: RunRequest and RunBy
//! - `id`: base62 instance id generator
//! - `registry`: TaskRegistry, the immutable kind → factory table

pub mod context;
pub mod id;
pub mod kinds;
pub mod registry;
pub mod request;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::notify::NotificationSender;
use crate::store::TaskStore;

pub use context::TaskContext;
pub use id::IdGenerator;
pub use kinds::{CommandKind, InstanceId, NotifierId, TaskKind};
pub use registry::{CommandSpec, TaskFactory, TaskRegistration, TaskRegistry};
pub use request::{RunBy, RunRequest};

/// A runnable task body, built per instance by its registration's factory.
///
/// Cancellation is advisory: implementations must check
/// [`TaskRuntime::is_canceled`] at bounded intervals (about once a second)
/// and return voluntarily. Nothing aborts a running body.
#[async_trait]
pub trait Task: Send {
    async fn run(&mut self, rt: &TaskRuntime) -> Result<(), Error>;
}

/// Everything a running task body gets from the coordinator.
#[derive(Clone)]
pub struct TaskRuntime {
    pub task_kind: TaskKind,
    pub command_kind: CommandKind,
    pub instance_id: InstanceId,
    pub notifier_id: NotifierId,
    pub run_by: RunBy,
    pub context: TaskContext,
    pub notifier: Arc<dyn NotificationSender>,
    pub store: TaskStore,
    pub(crate) cancel: CancellationToken,
    pub(crate) started_at: Instant,
}

impl TaskRuntime {
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for operations that can abort early, e.g. fetcher backoff.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Notify this instance's notifier with the instance context attached.
    pub async fn notify(&self, message: &str) -> bool {
        let ctx = self.context.with_elapsed(self.elapsed());
        self.notifier.notify(&ctx, &self.notifier_id, message).await
    }
}
