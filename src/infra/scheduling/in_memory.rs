// In-memory TaskStore.
//
// `fire_index` maps (task, fire time) to the execution created for it and is
// the in-memory counterpart of the unique constraint in the SQLite schema.

use crate::core::scheduling::{
    CasOutcome, ExecutionStatus, ExecutionUpdate, NewExecution, ScheduledTask, SchedulingError,
    TaskExecutionLog, TaskStatus, TaskStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone)]
struct StoredTask {
    task: ScheduledTask,
    deleted: bool,
}

pub struct InMemoryTaskStore {
    tasks: DashMap<i64, StoredTask>,
    executions: DashMap<i64, TaskExecutionLog>,
    fire_index: DashMap<(i64, DateTime<Utc>), i64>,
    next_task_id: AtomicI64,
    next_execution_id: AtomicI64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            executions: DashMap::new(),
            fire_index: DashMap::new(),
            next_task_id: AtomicI64::new(1),
            next_execution_id: AtomicI64::new(1),
        }
    }

    fn live_task(&self, task_id: i64) -> Option<ScheduledTask> {
        self.tasks
            .get(&task_id)
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.task.clone())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_task(&self, mut task: ScheduledTask) -> Result<ScheduledTask, SchedulingError> {
        if task.id == 0 {
            task.id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        } else if self.live_task(task.id).is_none() {
            return Err(SchedulingError::TaskNotFound(task.id));
        }

        self.tasks.insert(
            task.id,
            StoredTask {
                task: task.clone(),
                deleted: false,
            },
        );
        Ok(task)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<ScheduledTask>, SchedulingError> {
        Ok(self.live_task(task_id))
    }

    async fn schedulable_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulingError> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|stored| !stored.deleted && stored.task.status == TaskStatus::Enabled)
            .map(|stored| stored.task.clone())
            .collect();
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }

    async fn set_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> Result<bool, SchedulingError> {
        match self.tasks.get_mut(&task_id) {
            Some(mut stored) if !stored.deleted => {
                stored.task.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_schedule_error(
        &self,
        task_id: i64,
        error: Option<String>,
    ) -> Result<(), SchedulingError> {
        if let Some(mut stored) = self.tasks.get_mut(&task_id) {
            stored.task.schedule_error = error;
        }
        Ok(())
    }

    async fn delete_task(&self, task_id: i64) -> Result<bool, SchedulingError> {
        match self.tasks.get_mut(&task_id) {
            Some(mut stored) if !stored.deleted => {
                stored.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_execution_if_absent(
        &self,
        execution: NewExecution,
    ) -> Result<Option<TaskExecutionLog>, SchedulingError> {
        match self.fire_index.entry((execution.task_id, execution.fire_time)) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let log = TaskExecutionLog {
                    id: self.next_execution_id.fetch_add(1, Ordering::SeqCst),
                    task_id: execution.task_id,
                    fire_time: execution.fire_time,
                    content: execution.content,
                    target_platforms: execution.target_platforms,
                    status: ExecutionStatus::PendingConfirmation,
                    confirmed_by: None,
                    confirmed_time: None,
                    cancelled_by: None,
                    cancelled_time: None,
                    result: None,
                    created_at: execution.created_at,
                };
                self.executions.insert(log.id, log.clone());
                slot.insert(log.id);
                Ok(Some(log))
            }
        }
    }

    async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<TaskExecutionLog>, SchedulingError> {
        Ok(self
            .executions
            .get(&execution_id)
            .map(|log| log.value().clone()))
    }

    async fn executions_for_task(
        &self,
        task_id: i64,
    ) -> Result<Vec<TaskExecutionLog>, SchedulingError> {
        let mut logs: Vec<TaskExecutionLog> = self
            .executions
            .iter()
            .filter(|log| log.task_id == task_id)
            .map(|log| log.value().clone())
            .collect();
        logs.sort_by_key(|log| (log.fire_time, log.id));
        Ok(logs)
    }

    async fn executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<TaskExecutionLog>, SchedulingError> {
        let mut logs: Vec<TaskExecutionLog> = self
            .executions
            .iter()
            .filter(|log| log.status == status)
            .map(|log| log.value().clone())
            .collect();
        logs.sort_by_key(|log| (log.fire_time, log.id));
        Ok(logs)
    }

    async fn transition_execution(
        &self,
        execution_id: i64,
        expected: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<CasOutcome, SchedulingError> {
        let Some(mut log) = self.executions.get_mut(&execution_id) else {
            return Ok(CasOutcome::Missing);
        };

        if log.status != expected {
            return Ok(CasOutcome::Stale(log.status));
        }

        update.apply(&mut log);
        Ok(CasOutcome::Applied(log.value().clone()))
    }
}
