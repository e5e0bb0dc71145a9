//! Notification sender abstraction.
//!
//! The coordinator and scheduler report lifecycle events through a
//! `NotificationSender`. Implementations must tolerate concurrent calls;
//! the core never serializes against them.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::task::context::TaskContext;
use crate::task::kinds::NotifierId;

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Send to the default (administrator) channel.
    async fn notify_default(&self, message: &str) -> bool;

    /// Send to a specific notifier. Returns whether the local send attempt
    /// succeeded, not whether the message was delivered.
    async fn notify(&self, ctx: &TaskContext, notifier_id: &NotifierId, message: &str) -> bool;

    fn supports_html(&self, notifier_id: &NotifierId) -> bool;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSender for LogNotifier {
    async fn notify_default(&self, message: &str) -> bool {
        tracing::info!(notifier = "default", "{}", message);
        true
    }

    async fn notify(&self, ctx: &TaskContext, notifier_id: &NotifierId, message: &str) -> bool {
        let task = ctx.task_kind().map(|k| k.as_str()).unwrap_or("-");
        let command = ctx.command_kind().map(|c| c.as_str()).unwrap_or("-");
        let instance = ctx.instance_id().map(|i| i.as_str()).unwrap_or("-");
        if ctx.error_occurred() {
            tracing::warn!(
                notifier = %notifier_id,
                task,
                command,
                instance,
                "{}",
                message
            );
        } else {
            tracing::info!(
                notifier = %notifier_id,
                task,
                command,
                instance,
                "{}",
                message
            );
        }
        true
    }

    fn supports_html(&self, _notifier_id: &NotifierId) -> bool {
        false
    }
}

/// A notification captured by `RecordingNotifier`.
#[derive(Debug, Clone)]
pub struct RecordedNotification {
    /// `None` for `notify_default`.
    pub notifier_id: Option<NotifierId>,
    pub context: Option<TaskContext>,
    pub message: String,
}

/// Keeps every notification in memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<RecordedNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<RecordedNotification> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Messages containing `needle`.
    pub fn matching(&self, needle: &str) -> Vec<RecordedNotification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.message.contains(needle))
            .collect()
    }

    fn record(&self, notification: RecordedNotification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn notify_default(&self, message: &str) -> bool {
        self.record(RecordedNotification {
            notifier_id: None,
            context: None,
            message: message.to_string(),
        });
        true
    }

    async fn notify(&self, ctx: &TaskContext, notifier_id: &NotifierId, message: &str) -> bool {
        self.record(RecordedNotification {
            notifier_id: Some(notifier_id.clone()),
            context: Some(ctx.clone()),
            message: message.to_string(),
        });
        true
    }

    fn supports_html(&self, _notifier_id: &NotifierId) -> bool {
        false
    }
}
