// Operator actions on pending executions.
//
// Confirming hands the execution straight to a background publish run,
// spawned on the shared tracker so shutdown can wait for it.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::core::dispatch::{DispatchError, DispatchExecutor, PublishRun};
use crate::core::scheduling::{TaskExecutionLog, TaskStore};

pub struct OperatorDesk<S: TaskStore + 'static> {
    executor: Arc<DispatchExecutor<S>>,
    tracker: TaskTracker,
}

impl<S: TaskStore + 'static> Clone for OperatorDesk<S> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            tracker: self.tracker.clone(),
        }
    }
}

impl<S: TaskStore + 'static> OperatorDesk<S> {
    pub fn new(executor: Arc<DispatchExecutor<S>>, tracker: TaskTracker) -> Self {
        Self { executor, tracker }
    }

    /// Confirm an execution and start publishing it.
    pub async fn confirm(
        &self,
        execution_id: i64,
        operator: &str,
    ) -> Result<(TaskExecutionLog, JoinHandle<()>), DispatchError> {
        let log = self.executor.confirm(execution_id, operator, Utc::now()).await?;

        let executor = Arc::clone(&self.executor);
        let run = self.tracker.spawn(async move {
            match executor.publish(execution_id).await {
                Ok(PublishRun::Completed(log)) => {
                    tracing::info!(execution_id, status = %log.status, "Publish run finished")
                }
                Ok(PublishRun::Aborted { status, partial }) => tracing::warn!(
                    execution_id,
                    %status,
                    attempted = partial.outcomes.len(),
                    "Publish run aborted"
                ),
                Err(e) => tracing::error!(execution_id, "Publish run failed: {}", e),
            }
        });

        Ok((log, run))
    }

    pub async fn cancel(
        &self,
        execution_id: i64,
        operator: &str,
    ) -> Result<TaskExecutionLog, DispatchError> {
        self.executor.cancel(execution_id, operator, Utc::now()).await
    }
}
