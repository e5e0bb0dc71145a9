//! Immutable metadata carried alongside a task run.
//!
//! Every `with_*` call returns a new `TaskContext`; existing values are never
//! mutated, so contexts can be cloned into notification tasks freely.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::task::kinds::{CommandKind, InstanceId, TaskKind};

#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    title: Option<String>,
    error_occurred: bool,
    task_kind: Option<TaskKind>,
    command_kind: Option<CommandKind>,
    instance_id: Option<InstanceId>,
    elapsed: Option<Duration>,
    extras: Arc<BTreeMap<String, serde_json::Value>>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(&self, title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..self.clone()
        }
    }

    pub fn with_error(&self) -> Self {
        Self {
            error_occurred: true,
            ..self.clone()
        }
    }

    pub fn with_task(&self, kind: TaskKind, command: CommandKind) -> Self {
        Self {
            task_kind: Some(kind),
            command_kind: Some(command),
            ..self.clone()
        }
    }

    pub fn with_instance_id(&self, id: InstanceId) -> Self {
        Self {
            instance_id: Some(id),
            ..self.clone()
        }
    }

    pub fn with_elapsed(&self, elapsed: Duration) -> Self {
        Self {
            elapsed: Some(elapsed),
            ..self.clone()
        }
    }

    /// Layer an extra key. The side table is copied, not shared mutably.
    pub fn with_value(&self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut extras = (*self.extras).clone();
        extras.insert(key.into(), value);
        Self {
            extras: Arc::new(extras),
            ..self.clone()
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn error_occurred(&self) -> bool {
        self.error_occurred
    }

    pub fn task_kind(&self) -> Option<&TaskKind> {
        self.task_kind.as_ref()
    }

    pub fn command_kind(&self) -> Option<&CommandKind> {
        self.command_kind.as_ref()
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.extras.get(key)
    }
}

/// Human-readable elapsed time for notifications, e.g. `1h 2m 3s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
