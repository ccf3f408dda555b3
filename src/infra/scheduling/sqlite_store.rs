// SQLite-backed task store.
//
// Tables:
// - scheduled_tasks: task definitions (soft delete via is_deleted)
// - task_execution_logs: one row per fire, UNIQUE(task_id, fire_time)
//
// The unique constraint is what keeps ticks idempotent across processes;
// status changes are conditional UPDATEs on the current status.

use crate::core::scheduling::{
    CasOutcome, ExecutionStatus, ExecutionUpdate, NewExecution, ScheduledTask, SchedulingError,
    TaskExecutionLog, TaskStatus, TaskStore,
};
use crate::infra::database::{
    enum_text, from_json, parse_enum, parse_timestamp, timestamp, to_json,
};
use async_trait::async_trait;
use chrono_tz::Tz;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteTaskStore {
    pool: Pool<Sqlite>,
}

fn storage(e: impl std::fmt::Display) -> SchedulingError {
    SchedulingError::StorageError(e.to_string())
}

impl SqliteTaskStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), SchedulingError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                target_platforms TEXT NOT NULL DEFAULT '[]',
                schedule TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                status TEXT NOT NULL DEFAULT 'enabled',
                schedule_error TEXT,
                created_at TEXT NOT NULL,
                is_deleted BOOLEAN NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES scheduled_tasks(id),
                fire_time TEXT NOT NULL,
                content TEXT NOT NULL,
                target_platforms TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                confirmed_by TEXT,
                confirmed_time TEXT,
                cancelled_by TEXT,
                cancelled_time TEXT,
                result TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (task_id, fire_time)
            );
            CREATE INDEX IF NOT EXISTS idx_task_execution_logs_status
                ON task_execution_logs(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save_task(&self, mut task: ScheduledTask) -> Result<ScheduledTask, SchedulingError> {
        let platforms = to_json(&task.target_platforms).map_err(storage)?;
        let schedule = to_json(&task.schedule).map_err(storage)?;

        if task.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO scheduled_tasks (owner_id, name, content, target_platforms, schedule,
                    timezone, status, schedule_error, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.owner_id)
            .bind(&task.name)
            .bind(&task.content)
            .bind(platforms)
            .bind(schedule)
            .bind(task.timezone.name())
            .bind(enum_text(&task.status))
            .bind(&task.schedule_error)
            .bind(timestamp(task.created_at))
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            task.id = result.last_insert_rowid();
            return Ok(task);
        }

        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks SET owner_id = ?, name = ?, content = ?, target_platforms = ?,
                schedule = ?, timezone = ?, status = ?, schedule_error = ?
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(&task.owner_id)
        .bind(&task.name)
        .bind(&task.content)
        .bind(platforms)
        .bind(schedule)
        .bind(task.timezone.name())
        .bind(enum_text(&task.status))
        .bind(&task.schedule_error)
        .bind(task.id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(SchedulingError::TaskNotFound(task.id));
        }
        Ok(task)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<ScheduledTask>, SchedulingError> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ? AND is_deleted = 0")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn schedulable_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulingError> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks WHERE status = 'enabled' AND is_deleted = 0 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn set_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> Result<bool, SchedulingError> {
        let result =
            sqlx::query("UPDATE scheduled_tasks SET status = ? WHERE id = ? AND is_deleted = 0")
                .bind(enum_text(&status))
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_schedule_error(
        &self,
        task_id: i64,
        error: Option<String>,
    ) -> Result<(), SchedulingError> {
        sqlx::query("UPDATE scheduled_tasks SET schedule_error = ? WHERE id = ?")
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn delete_task(&self, task_id: i64) -> Result<bool, SchedulingError> {
        let result =
            sqlx::query("UPDATE scheduled_tasks SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_execution_if_absent(
        &self,
        execution: NewExecution,
    ) -> Result<Option<TaskExecutionLog>, SchedulingError> {
        let platforms = to_json(&execution.target_platforms).map_err(storage)?;

        let result = sqlx::query(
            r#"
            INSERT INTO task_execution_logs (task_id, fire_time, content, target_platforms,
                status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id, fire_time) DO NOTHING
            "#,
        )
        .bind(execution.task_id)
        .bind(timestamp(execution.fire_time))
        .bind(&execution.content)
        .bind(platforms)
        .bind(enum_text(&ExecutionStatus::PendingConfirmation))
        .bind(timestamp(execution.created_at))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_execution(result.last_insert_rowid()).await
    }

    async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<TaskExecutionLog>, SchedulingError> {
        let row = sqlx::query("SELECT * FROM task_execution_logs WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn executions_for_task(
        &self,
        task_id: i64,
    ) -> Result<Vec<TaskExecutionLog>, SchedulingError> {
        let rows = sqlx::query(
            "SELECT * FROM task_execution_logs WHERE task_id = ? ORDER BY fire_time, id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<TaskExecutionLog>, SchedulingError> {
        let rows = sqlx::query(
            "SELECT * FROM task_execution_logs WHERE status = ? ORDER BY fire_time, id",
        )
        .bind(enum_text(&status))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn transition_execution(
        &self,
        execution_id: i64,
        expected: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<CasOutcome, SchedulingError> {
        let result_json = update
            .result
            .as_ref()
            .map(to_json)
            .transpose()
            .map_err(storage)?;

        let result = sqlx::query(
            r#"
            UPDATE task_execution_logs SET
                status = ?,
                confirmed_by = COALESCE(?, confirmed_by),
                confirmed_time = COALESCE(?, confirmed_time),
                cancelled_by = COALESCE(?, cancelled_by),
                cancelled_time = COALESCE(?, cancelled_time),
                result = COALESCE(?, result)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(enum_text(&update.status))
        .bind(&update.confirmed_by)
        .bind(update.confirmed_time.map(timestamp))
        .bind(&update.cancelled_by)
        .bind(update.cancelled_time.map(timestamp))
        .bind(result_json)
        .bind(execution_id)
        .bind(enum_text(&expected))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        let current = self.get_execution(execution_id).await?;
        Ok(match current {
            None => CasOutcome::Missing,
            Some(log) if result.rows_affected() > 0 => CasOutcome::Applied(log),
            Some(log) => CasOutcome::Stale(log.status),
        })
    }
}

fn row_to_task(row: &SqliteRow) -> Result<ScheduledTask, SchedulingError> {
    let platforms: String = row.try_get("target_platforms").map_err(storage)?;
    let schedule: String = row.try_get("schedule").map_err(storage)?;
    let timezone: String = row.try_get("timezone").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(ScheduledTask {
        id: row.try_get("id").map_err(storage)?,
        owner_id: row.try_get("owner_id").map_err(storage)?,
        name: row.try_get("name").map_err(storage)?,
        content: row.try_get("content").map_err(storage)?,
        target_platforms: from_json(&platforms).map_err(storage)?,
        schedule: from_json(&schedule).map_err(storage)?,
        timezone: timezone.parse::<Tz>().map_err(storage)?,
        status: parse_enum(&status).map_err(storage)?,
        schedule_error: row.try_get("schedule_error").map_err(storage)?,
        created_at: parse_timestamp(&created_at).map_err(storage)?,
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<TaskExecutionLog, SchedulingError> {
    let fire_time: String = row.try_get("fire_time").map_err(storage)?;
    let platforms: String = row.try_get("target_platforms").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let confirmed_time: Option<String> = row.try_get("confirmed_time").map_err(storage)?;
    let cancelled_time: Option<String> = row.try_get("cancelled_time").map_err(storage)?;
    let result: Option<String> = row.try_get("result").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(TaskExecutionLog {
        id: row.try_get("id").map_err(storage)?,
        task_id: row.try_get("task_id").map_err(storage)?,
        fire_time: parse_timestamp(&fire_time).map_err(storage)?,
        content: row.try_get("content").map_err(storage)?,
        target_platforms: from_json(&platforms).map_err(storage)?,
        status: parse_enum(&status).map_err(storage)?,
        confirmed_by: row.try_get("confirmed_by").map_err(storage)?,
        confirmed_time: confirmed_time
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(storage)?,
        cancelled_by: row.try_get("cancelled_by").map_err(storage)?,
        cancelled_time: cancelled_time
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(storage)?,
        result: result.as_deref().map(from_json).transpose().map_err(storage)?,
        created_at: parse_timestamp(&created_at).map_err(storage)?,
    })
}
