// Operator alerts - the only errors that leave the engines.
//
// Everything else is recorded on the log or execution it belongs to.
// Transport failures, invalid schedules and keyword alerts are pushed to
// whatever operator channel the composition root wires in.

use crate::core::scheduling::{DispatchReport, ExecutionStatus, Platform};
use async_trait::async_trait;
use serde::Serialize;
use std::error::Error;

/// Something a human operator has to look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpsAlert {
    /// A keyword rule with action `alert` matched an inbound message.
    KeywordAlert {
        bot_id: i64,
        rule_id: i64,
        sender: String,
        content: String,
    },
    /// A reply could not be produced or delivered. Not retried.
    ReplyFailed {
        bot_id: i64,
        log_id: i64,
        error: String,
    },
    /// A scheduled task has a recurrence that cannot be evaluated.
    InvalidSchedule { task_id: i64, error: String },
    /// At least one platform rejected (or timed out on) a confirmed execution.
    PublishFailed {
        execution_id: i64,
        task_id: i64,
        report: DispatchReport,
    },
    /// A publish run stopped part way, by a cancel or by a shutdown.
    /// Posts listed as successful in `report` are already live.
    PublishInterrupted {
        execution_id: i64,
        task_id: i64,
        status: ExecutionStatus,
        report: DispatchReport,
    },
}

impl OpsAlert {
    pub fn title(&self) -> &'static str {
        match self {
            OpsAlert::KeywordAlert { .. } => "Keyword alert",
            OpsAlert::ReplyFailed { .. } => "Reply failed",
            OpsAlert::InvalidSchedule { .. } => "Invalid schedule",
            OpsAlert::PublishFailed { .. } => "Publish failed",
            OpsAlert::PublishInterrupted { .. } => "Publish interrupted",
        }
    }

    /// One-line description for log output and chat-style notification targets.
    pub fn summary(&self) -> String {
        match self {
            OpsAlert::KeywordAlert {
                bot_id,
                rule_id,
                sender,
                content,
            } => format!("bot {bot_id}: rule {rule_id} matched a message from {sender}: {content}"),
            OpsAlert::ReplyFailed {
                bot_id,
                log_id,
                error,
            } => format!("bot {bot_id}: reply for log {log_id} failed: {error}"),
            OpsAlert::InvalidSchedule { task_id, error } => {
                format!("task {task_id} skipped: {error}")
            }
            OpsAlert::PublishFailed {
                execution_id,
                task_id,
                report,
            } => {
                let failed: Vec<String> = report
                    .failed_platforms()
                    .into_iter()
                    .map(Platform::as_str)
                    .map(str::to_string)
                    .collect();
                format!(
                    "task {task_id}: execution {execution_id} failed on {}",
                    failed.join(", ")
                )
            }
            OpsAlert::PublishInterrupted {
                execution_id,
                task_id,
                status,
                report,
            } => format!(
                "task {task_id}: execution {execution_id} interrupted ({status}) after {} of its platforms",
                report.outcomes.len()
            ),
        }
    }
}

/// Port for pushing alerts to operators.
#[async_trait]
pub trait OpsNotifier: Send + Sync {
    async fn notify(&self, alert: &OpsAlert) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Deliver an alert, logging (not propagating) notifier failures.
pub async fn raise(notifier: &dyn OpsNotifier, alert: OpsAlert) {
    if let Err(e) = notifier.notify(&alert).await {
        tracing::warn!(alert = alert.title(), error = %e, "Failed to notify operators");
    }
}
