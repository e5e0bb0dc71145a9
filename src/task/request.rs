//! Run requests submitted to the coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::context::TaskContext;
use crate::task::kinds::{CommandKind, NotifierId, TaskKind};

/// Provenance of a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunBy {
    User,
    Scheduler,
}

impl fmt::Display for RunBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Scheduler => "scheduler",
        };
        write!(f, "{s}")
    }
}

/// A request to run one (task, command) pair.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_kind: TaskKind,
    pub command_kind: CommandKind,
    pub notifier_id: NotifierId,
    pub notify_on_start: bool,
    pub run_by: RunBy,
    pub context: Option<TaskContext>,
}

impl RunRequest {
    /// A user-initiated request that announces itself on start.
    pub fn by_user(
        task_kind: impl Into<TaskKind>,
        command_kind: impl Into<CommandKind>,
        notifier_id: impl Into<NotifierId>,
    ) -> Self {
        Self {
            task_kind: task_kind.into(),
            command_kind: command_kind.into(),
            notifier_id: notifier_id.into(),
            notify_on_start: true,
            run_by: RunBy::User,
            context: None,
        }
    }

    /// A scheduler-initiated request. Scheduled runs start silently.
    pub fn by_scheduler(
        task_kind: impl Into<TaskKind>,
        command_kind: impl Into<CommandKind>,
        notifier_id: impl Into<NotifierId>,
    ) -> Self {
        Self {
            task_kind: task_kind.into(),
            command_kind: command_kind.into(),
            notifier_id: notifier_id.into(),
            notify_on_start: false,
            run_by: RunBy::Scheduler,
            context: None,
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_notify_on_start(mut self, notify: bool) -> Self {
        self.notify_on_start = notify;
        self
    }
}
