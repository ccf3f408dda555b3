// Schedule evaluation - next fire times and the periodic tick that turns
// them into execution logs awaiting confirmation.
//
// Wall-clock time in the task's timezone is authoritative:
// - a time inside a spring-forward gap fires at the first valid minute after it
// - a time repeated by a fall-back transition fires once, at the earlier instant
//
// Duplicate fires are prevented by the store (unique task/fire-time pair),
// so a re-delivered or overlapping tick is harmless.

use super::cron;
use super::schedule_models::{
    CasOutcome, ExecutionStatus, ExecutionUpdate, NewExecution, ScheduleConfig,
    ScheduleConfigError, ScheduledTask, SchedulingError, TaskExecutionLog, TaskStatus,
};
use crate::core::alerts::{raise, OpsAlert, OpsNotifier};
use async_trait::async_trait;
use chrono::{
    DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;
use std::sync::Arc;

/// Default upper bound on fires created for one task in one tick.
const MAX_FIRES_PER_TICK: usize = 1000;
/// How far a nonexistent local time is pushed forward looking for a valid one.
const MAX_GAP_MINUTES: u32 = 24 * 60;
/// Today plus a full week covers every weekday at least once.
const WEEK_DAYS: u64 = 7;
/// Eight years plus a week: long enough to reach a leap day on any weekday.
const CRON_HORIZON_DAYS: u64 = 366 * 8 + 7;

// ============================================================================
// RECURRENCE
// ============================================================================

/// Check that a schedule can be evaluated.
pub fn check_schedule(config: &ScheduleConfig) -> Result<(), ScheduleConfigError> {
    match config {
        ScheduleConfig::Daily { times } => {
            if times.is_empty() {
                return Err(ScheduleConfigError::NoTimes);
            }
        }
        ScheduleConfig::Weekly { days, times } => {
            if days.is_empty() {
                return Err(ScheduleConfigError::NoDays);
            }
            if times.is_empty() {
                return Err(ScheduleConfigError::NoTimes);
            }
        }
        ScheduleConfig::Cron { expression } => {
            cron::parse(expression)?;
        }
        ScheduleConfig::Once { .. } => {}
    }
    Ok(())
}

/// The first fire instant strictly after `after`, or `None` if the schedule
/// has no further occurrences.
pub fn next_fire(
    config: &ScheduleConfig,
    tz: Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleConfigError> {
    check_schedule(config)?;

    match config {
        ScheduleConfig::Daily { times } => Ok(next_matching(tz, after, times, WEEK_DAYS, |_| true)),
        ScheduleConfig::Weekly { days, times } => Ok(next_matching(
            tz,
            after,
            times,
            WEEK_DAYS,
            |date| days.contains(&date.weekday()),
        )),
        ScheduleConfig::Cron { expression } => {
            let schedule = cron::parse(expression)?;
            Ok(next_matching(
                tz,
                after,
                &schedule.times(),
                CRON_HORIZON_DAYS,
                |date| schedule.matches_date(date),
            ))
        }
        ScheduleConfig::Once { at } => Ok(resolve_local(tz, *at).filter(|fire| *fire > after)),
    }
}

/// Map a local wall-clock time to an instant.
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut candidate = local;
    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(first, second) => {
                return Some(first.min(second).with_timezone(&Utc))
            }
            LocalResult::None => candidate += chrono::Duration::minutes(1),
        }
    }
    None
}

fn next_matching(
    tz: Tz,
    after: DateTime<Utc>,
    times: &[NaiveTime],
    horizon_days: u64,
    date_matches: impl Fn(NaiveDate) -> bool,
) -> Option<DateTime<Utc>> {
    let mut times = times.to_vec();
    times.sort();
    let today = after.with_timezone(&tz).date_naive();

    for offset in 0..=horizon_days {
        let date = today.checked_add_days(Days::new(offset))?;
        if !date_matches(date) {
            continue;
        }

        // Resolution never moves a later wall-clock time to an earlier
        // instant, so the first hit in time order is the earliest.
        let next = times
            .iter()
            .filter_map(|time| resolve_local(tz, date.and_time(*time)))
            .find(|fire| *fire > after);
        if next.is_some() {
            return next;
        }
    }
    None
}

// ============================================================================
// PORT
// ============================================================================

/// Persistence for scheduled tasks and their execution logs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert (id 0) or update a task. Returns the stored task.
    async fn save_task(&self, task: ScheduledTask) -> Result<ScheduledTask, SchedulingError>;

    async fn get_task(&self, task_id: i64) -> Result<Option<ScheduledTask>, SchedulingError>;

    /// Enabled, non-deleted tasks.
    async fn schedulable_tasks(&self) -> Result<Vec<ScheduledTask>, SchedulingError>;

    async fn set_task_status(&self, task_id: i64, status: TaskStatus)
        -> Result<bool, SchedulingError>;

    async fn set_schedule_error(
        &self,
        task_id: i64,
        error: Option<String>,
    ) -> Result<(), SchedulingError>;

    /// Soft delete. Existing execution logs are kept.
    async fn delete_task(&self, task_id: i64) -> Result<bool, SchedulingError>;

    /// Create the execution for `(task_id, fire_time)` unless one already exists.
    /// Returns `None` when it did.
    async fn insert_execution_if_absent(
        &self,
        execution: NewExecution,
    ) -> Result<Option<TaskExecutionLog>, SchedulingError>;

    async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<TaskExecutionLog>, SchedulingError>;

    /// Executions of a task, by fire time.
    async fn executions_for_task(
        &self,
        task_id: i64,
    ) -> Result<Vec<TaskExecutionLog>, SchedulingError>;

    /// Every execution currently in `status`, oldest fire first.
    async fn executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<TaskExecutionLog>, SchedulingError>;

    /// Apply `update` only if the execution is currently in `expected`.
    async fn transition_execution(
        &self,
        execution_id: i64,
        expected: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<CasOutcome, SchedulingError>;
}

// ============================================================================
// EVALUATOR
// ============================================================================

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub evaluated: usize,
    pub created: Vec<TaskExecutionLog>,
    pub duplicates: usize,
    pub flagged: usize,
    pub completed: usize,
    /// Set when a task hit the fire cap. Everything up to this instant was
    /// created; the rest of the window still has to be evaluated.
    pub deferred_from: Option<DateTime<Utc>>,
}

impl TickSummary {
    fn defer_from(&mut self, covered: DateTime<Utc>) {
        self.deferred_from = Some(match self.deferred_from {
            Some(earlier) => earlier.min(covered),
            None => covered,
        });
    }
}

pub struct ScheduleEvaluator<S: TaskStore> {
    store: Arc<S>,
    notifier: Arc<dyn OpsNotifier>,
    fire_cap: usize,
}

impl<S: TaskStore> ScheduleEvaluator<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn OpsNotifier>) -> Self {
        Self {
            store,
            notifier,
            fire_cap: MAX_FIRES_PER_TICK,
        }
    }

    /// Limit how many fires one task may create in a single tick.
    pub fn with_fire_cap(mut self, cap: usize) -> Self {
        self.fire_cap = cap.max(1);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate and store a new task.
    pub async fn create_task(
        &self,
        mut task: ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, SchedulingError> {
        task.validate_at(now)?;
        task.id = 0;
        task.schedule_error = None;
        task.created_at = now;
        let task = self.store.save_task(task).await?;
        tracing::info!(task_id = task.id, owner = %task.owner_id, "Scheduled task created");
        Ok(task)
    }

    /// Validate and store changes to an existing task. Clears any schedule error.
    pub async fn update_task(
        &self,
        mut task: ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, SchedulingError> {
        task.validate_at(now)?;
        if self.store.get_task(task.id).await?.is_none() {
            return Err(SchedulingError::TaskNotFound(task.id));
        }
        task.schedule_error = None;
        self.store.save_task(task).await
    }

    /// Enable or disable a task. Disabled tasks are skipped by the tick.
    pub async fn set_enabled(&self, task_id: i64, enabled: bool) -> Result<ScheduledTask, SchedulingError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SchedulingError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::Completed {
            return Err(SchedulingError::InvalidTask(format!(
                "task {task_id} already completed"
            )));
        }

        let status = if enabled {
            TaskStatus::Enabled
        } else {
            TaskStatus::Disabled
        };
        self.store.set_task_status(task_id, status).await?;
        Ok(ScheduledTask { status, ..task })
    }

    pub async fn delete_task(&self, task_id: i64) -> Result<bool, SchedulingError> {
        self.store.delete_task(task_id).await
    }

    /// The next `count` fire times of a task after `after`.
    pub async fn upcoming(
        &self,
        task_id: i64,
        after: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, SchedulingError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SchedulingError::TaskNotFound(task_id))?;

        let mut fires = Vec::with_capacity(count);
        let mut cursor = after;
        while fires.len() < count {
            match next_fire(&task.schedule, task.timezone, cursor)? {
                Some(fire) => {
                    fires.push(fire);
                    cursor = fire;
                }
                None => break,
            }
        }
        Ok(fires)
    }

    /// Create pending executions for every fire time in `(start, end]`.
    ///
    /// If a task reaches the fire cap, `deferred_from` in the summary says
    /// where the next tick has to resume.
    pub async fn tick(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TickSummary, SchedulingError> {
        let mut summary = TickSummary::default();
        if end <= start {
            return Ok(summary);
        }

        let tasks = self.store.schedulable_tasks().await?;
        for task in tasks {
            summary.evaluated += 1;
            if let Err(e) = self.tick_task(&task, start, end, &mut summary).await {
                tracing::error!(task_id = task.id, error = %e, "Failed to evaluate task");
            }
        }

        tracing::debug!(
            evaluated = summary.evaluated,
            created = summary.created.len(),
            duplicates = summary.duplicates,
            deferred_from = ?summary.deferred_from,
            %start,
            %end,
            "Schedule tick finished"
        );
        Ok(summary)
    }

    async fn tick_task(
        &self,
        task: &ScheduledTask,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<(), SchedulingError> {
        let mut cursor = start;
        let mut fires = 0;

        loop {
            let fire = match next_fire(&task.schedule, task.timezone, cursor) {
                Ok(fire) => fire,
                Err(e) => {
                    self.flag(task, e).await?;
                    summary.flagged += 1;
                    return Ok(());
                }
            };

            if task.schedule_error.is_some() && fires == 0 {
                self.store.set_schedule_error(task.id, None).await?;
                tracing::info!(task_id = task.id, "Schedule error cleared");
            }

            match fire {
                Some(fire) if fire <= end && fires >= self.fire_cap => {
                    tracing::warn!(
                        task_id = task.id,
                        fires,
                        resume_after = %cursor,
                        "Too many fires in one tick, deferring the rest"
                    );
                    summary.defer_from(cursor);
                    return Ok(());
                }
                Some(fire) if fire <= end => {
                    let execution = NewExecution::for_task(task, fire, end);
                    match self.store.insert_execution_if_absent(execution).await? {
                        Some(log) => {
                            tracing::info!(
                                task_id = task.id,
                                execution_id = log.id,
                                fire_time = %fire,
                                "Execution awaiting confirmation"
                            );
                            summary.created.push(log);
                        }
                        None => summary.duplicates += 1,
                    }

                    cursor = fire;
                    fires += 1;
                }
                Some(_) => return Ok(()),
                None => {
                    if let ScheduleConfig::Once { at } = &task.schedule {
                        if fires == 0 {
                            self.fire_late(task, *at, end, summary).await?;
                        }
                        self.store
                            .set_task_status(task.id, TaskStatus::Completed)
                            .await?;
                        summary.completed += 1;
                        tracing::info!(task_id = task.id, "One-time task completed");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// A one-time task whose instant passed before any tick covered it
    /// (downtime, or a window that started after it) still fires once.
    async fn fire_late(
        &self,
        task: &ScheduledTask,
        at: NaiveDateTime,
        end: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<(), SchedulingError> {
        let Some(fire) = resolve_local(task.timezone, at) else {
            self.flag(task, ScheduleConfigError::UnresolvableTime { at }).await?;
            summary.flagged += 1;
            return Err(ScheduleConfigError::UnresolvableTime { at }.into());
        };

        let execution = NewExecution::for_task(task, fire, end);
        match self.store.insert_execution_if_absent(execution).await? {
            Some(log) => {
                tracing::warn!(
                    task_id = task.id,
                    execution_id = log.id,
                    fire_time = %fire,
                    "One-time fire was missed, created late"
                );
                summary.created.push(log);
            }
            None => summary.duplicates += 1,
        }
        Ok(())
    }

    /// Record an unusable schedule. Operators hear about it once per distinct error.
    async fn flag(&self, task: &ScheduledTask, error: ScheduleConfigError) -> Result<(), SchedulingError> {
        let message = error.to_string();
        if task.schedule_error.as_deref() == Some(message.as_str()) {
            tracing::debug!(task_id = task.id, "Task still has an invalid schedule");
            return Ok(());
        }

        tracing::warn!(task_id = task.id, error = %message, "Task schedule is invalid, skipping");
        self.store
            .set_schedule_error(task.id, Some(message.clone()))
            .await?;
        raise(
            self.notifier.as_ref(),
            OpsAlert::InvalidSchedule {
                task_id: task.id,
                error: message,
            },
        )
        .await;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
