// Dispatch executor - human confirmation and multi-platform publishing.
//
// Every status change is a compare-and-swap on the execution log: two
// operators acting on the same state cannot both win, the loser gets
// `StaleState`. Publishing re-reads the status before each platform and
// stops as soon as the execution is no longer `confirmed`.

use crate::core::alerts::{raise, OpsAlert, OpsNotifier};
use crate::core::scheduling::{
    CasOutcome, DispatchReport, ExecutionStatus, ExecutionUpdate, Platform, PublishOutcome,
    SchedulingError, TaskExecutionLog, TaskStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// What a platform hands back for a successful post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub post_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by platform: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Port for the external platform publishing APIs.
#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    async fn publish(&self, platform: Platform, content: &str)
        -> Result<PublishReceipt, PublishError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Execution {0} not found")]
    ExecutionNotFound(i64),

    #[error("Execution {execution_id} is {actual}, expected {expected}")]
    StaleState {
        execution_id: i64,
        expected: ExecutionStatus,
        actual: ExecutionStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<SchedulingError> for DispatchError {
    fn from(e: SchedulingError) -> Self {
        DispatchError::StorageError(e.to_string())
    }
}

const INTERRUPTED_OUTCOME: &str = "publish interrupted by shutdown; outcome unknown";

/// How a publish run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishRun {
    /// Every platform was attempted; the log is `published` or `failed`.
    Completed(TaskExecutionLog),
    /// The execution left `confirmed` mid-run. `partial` holds what was attempted.
    Aborted {
        status: ExecutionStatus,
        partial: DispatchReport,
    },
}

pub struct DispatchExecutor<S: TaskStore> {
    store: Arc<S>,
    publisher: Arc<dyn PlatformPublisher>,
    notifier: Arc<dyn OpsNotifier>,
    publish_timeout: Duration,
}

impl<S: TaskStore> DispatchExecutor<S> {
    pub fn new(
        store: Arc<S>,
        publisher: Arc<dyn PlatformPublisher>,
        notifier: Arc<dyn OpsNotifier>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            notifier,
            publish_timeout,
        }
    }

    /// pending_confirmation -> confirmed
    pub async fn confirm(
        &self,
        execution_id: i64,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskExecutionLog, DispatchError> {
        let operator = Self::operator(operator)?;
        let log = self
            .transition(
                execution_id,
                ExecutionStatus::PendingConfirmation,
                ExecutionUpdate::to(ExecutionStatus::Confirmed).confirmed_by(operator, now),
            )
            .await?;
        tracing::info!(execution_id, task_id = log.task_id, operator, "Execution confirmed");
        Ok(log)
    }

    /// pending_confirmation | confirmed -> cancelled
    pub async fn cancel(
        &self,
        execution_id: i64,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskExecutionLog, DispatchError> {
        let operator = Self::operator(operator)?;
        let current = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(DispatchError::ExecutionNotFound(execution_id))?;

        if !current.status.can_become(ExecutionStatus::Cancelled) {
            return Err(DispatchError::StaleState {
                execution_id,
                expected: ExecutionStatus::PendingConfirmation,
                actual: current.status,
            });
        }

        let log = self
            .transition(
                execution_id,
                current.status,
                ExecutionUpdate::to(ExecutionStatus::Cancelled).cancelled_by(operator, now),
            )
            .await?;
        tracing::info!(execution_id, task_id = log.task_id, operator, "Execution cancelled");
        Ok(log)
    }

    /// Publish a confirmed execution to each of its target platforms.
    ///
    /// Platforms are attempted one at a time with a hard timeout each.
    /// Failures are recorded per platform and never retried here.
    pub async fn publish(&self, execution_id: i64) -> Result<PublishRun, DispatchError> {
        let log = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(DispatchError::ExecutionNotFound(execution_id))?;

        if log.status != ExecutionStatus::Confirmed {
            return Err(DispatchError::StaleState {
                execution_id,
                expected: ExecutionStatus::Confirmed,
                actual: log.status,
            });
        }

        let mut report = DispatchReport::default();

        for platform in &log.target_platforms {
            let current = self
                .store
                .get_execution(execution_id)
                .await?
                .ok_or(DispatchError::ExecutionNotFound(execution_id))?;
            if current.status != ExecutionStatus::Confirmed {
                return self.abort(&log, current.status, report).await;
            }

            let outcome = self.publish_one(*platform, &log.content).await;
            match &outcome {
                PublishOutcome::Success { post_id } => tracing::info!(
                    execution_id,
                    platform = %platform,
                    post_id = ?post_id,
                    "Published"
                ),
                failure => tracing::warn!(
                    execution_id,
                    platform = %platform,
                    outcome = ?failure,
                    "Publish failed"
                ),
            }
            report.outcomes.insert(*platform, outcome);
        }

        let status = if report.all_succeeded() {
            ExecutionStatus::Published
        } else {
            ExecutionStatus::Failed
        };

        let outcome = self
            .store
            .transition_execution(
                execution_id,
                ExecutionStatus::Confirmed,
                ExecutionUpdate::to(status).with_result(report.clone()),
            )
            .await?;

        match outcome {
            CasOutcome::Applied(done) => {
                tracing::info!(execution_id, task_id = done.task_id, status = %status, "Execution finished");
                if status == ExecutionStatus::Failed {
                    raise(
                        self.notifier.as_ref(),
                        OpsAlert::PublishFailed {
                            execution_id,
                            task_id: done.task_id,
                            report,
                        },
                    )
                    .await;
                }
                Ok(PublishRun::Completed(done))
            }
            CasOutcome::Stale(actual) => self.abort(&log, actual, report).await,
            CasOutcome::Missing => Err(DispatchError::ExecutionNotFound(execution_id)),
        }
    }

    async fn publish_one(&self, platform: Platform, content: &str) -> PublishOutcome {
        match tokio::time::timeout(self.publish_timeout, self.publisher.publish(platform, content))
            .await
        {
            Ok(Ok(receipt)) => PublishOutcome::Success {
                post_id: receipt.post_id,
            },
            Ok(Err(PublishError::Timeout(_))) | Err(_) => PublishOutcome::Timeout,
            Ok(Err(e)) => PublishOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    /// Keep what a stopped run already did. Platforms that succeeded are live,
    /// so the partial report is stored on the cancelled execution and
    /// operators are told.
    async fn abort(
        &self,
        log: &TaskExecutionLog,
        status: ExecutionStatus,
        partial: DispatchReport,
    ) -> Result<PublishRun, DispatchError> {
        tracing::warn!(
            execution_id = log.id,
            task_id = log.task_id,
            status = %status,
            attempted = partial.outcomes.len(),
            "Publishing aborted, execution is no longer confirmed"
        );

        if status == ExecutionStatus::Cancelled && !partial.outcomes.is_empty() {
            let saved = self
                .store
                .transition_execution(
                    log.id,
                    ExecutionStatus::Cancelled,
                    ExecutionUpdate::to(ExecutionStatus::Cancelled).with_result(partial.clone()),
                )
                .await?;
            if !matches!(saved, CasOutcome::Applied(_)) {
                tracing::warn!(execution_id = log.id, outcome = ?saved, "Partial report not stored");
            }
            raise(
                self.notifier.as_ref(),
                OpsAlert::PublishInterrupted {
                    execution_id: log.id,
                    task_id: log.task_id,
                    status,
                    report: partial.clone(),
                },
            )
            .await;
        }

        Ok(PublishRun::Aborted { status, partial })
    }

    /// Fail executions left `confirmed` by a previous process.
    ///
    /// Run once at startup, before any publish is spawned. Whether those
    /// posts went out is unknown, so nothing is retried: every target
    /// platform is marked failed and operators are alerted.
    pub async fn recover_interrupted(&self) -> Result<usize, DispatchError> {
        let stranded = self
            .store
            .executions_with_status(ExecutionStatus::Confirmed)
            .await?;

        let mut recovered = 0;
        for log in stranded {
            let mut report = log.result.clone().unwrap_or_default();
            for platform in &log.target_platforms {
                report
                    .outcomes
                    .entry(*platform)
                    .or_insert_with(|| PublishOutcome::Failed {
                        error: INTERRUPTED_OUTCOME.to_string(),
                    });
            }

            let outcome = self
                .store
                .transition_execution(
                    log.id,
                    ExecutionStatus::Confirmed,
                    ExecutionUpdate::to(ExecutionStatus::Failed).with_result(report.clone()),
                )
                .await?;
            if let CasOutcome::Applied(failed) = outcome {
                tracing::warn!(
                    execution_id = failed.id,
                    task_id = failed.task_id,
                    "Confirmed execution was interrupted by a restart, marked failed"
                );
                raise(
                    self.notifier.as_ref(),
                    OpsAlert::PublishInterrupted {
                        execution_id: failed.id,
                        task_id: failed.task_id,
                        status: ExecutionStatus::Failed,
                        report,
                    },
                )
                .await;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn transition(
        &self,
        execution_id: i64,
        expected: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<TaskExecutionLog, DispatchError> {
        match self
            .store
            .transition_execution(execution_id, expected, update)
            .await?
        {
            CasOutcome::Applied(log) => Ok(log),
            CasOutcome::Stale(actual) => Err(DispatchError::StaleState {
                execution_id,
                expected,
                actual,
            }),
            CasOutcome::Missing => Err(DispatchError::ExecutionNotFound(execution_id)),
        }
    }

    fn operator(operator: &str) -> Result<&str, DispatchError> {
        let operator = operator.trim();
        if operator.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "operator must not be empty".to_string(),
            ));
        }
        Ok(operator)
    }
}
