// Scheduling domain models - tasks, their recurrence and their execution logs.

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Social platforms content can be published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Douyin,
    WechatChannels,
    Xiaohongshu,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Douyin => "douyin",
            Platform::WechatChannels => "wechat_channels",
            Platform::Xiaohongshu => "xiaohongshu",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a task fires. Times are wall-clock times in the task's timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Every day at each listed time.
    Daily { times: Vec<NaiveTime> },
    /// Listed weekdays at each listed time.
    Weekly {
        days: Vec<Weekday>,
        times: Vec<NaiveTime>,
    },
    /// Cron expression with 5 fields, or 6 with leading seconds. See `cron::parse`.
    Cron { expression: String },
    /// A single local date and time.
    Once { at: NaiveDateTime },
}

impl ScheduleConfig {
    pub fn is_one_time(&self) -> bool {
        matches!(self, ScheduleConfig::Once { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Enabled,
    Disabled,
    /// A one-time task that has fired.
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub content: String,
    pub target_platforms: BTreeSet<Platform>,
    pub schedule: ScheduleConfig,
    pub timezone: Tz,
    pub status: TaskStatus,
    /// Set while the schedule cannot be evaluated; the task is skipped until fixed.
    pub schedule_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.content.trim().is_empty() {
            return Err(SchedulingError::InvalidTask(
                "content must not be empty".to_string(),
            ));
        }
        if self.target_platforms.is_empty() {
            return Err(SchedulingError::InvalidTask(
                "at least one target platform is required".to_string(),
            ));
        }
        super::schedule_service::check_schedule(&self.schedule)?;
        Ok(())
    }

    /// `validate`, plus a one-time schedule must still lie ahead of `now`.
    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), SchedulingError> {
        self.validate()?;
        if let ScheduleConfig::Once { at } = &self.schedule {
            let fire = super::schedule_service::resolve_local(self.timezone, *at)
                .ok_or(ScheduleConfigError::UnresolvableTime { at: *at })?;
            if fire <= now {
                return Err(SchedulingError::InvalidTask(format!(
                    "one-time schedule {at} is not in the future"
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle of one fire of a task.
///
/// ```text
/// pending_confirmation -> confirmed -> published | failed
///          \                  \
///           `-> cancelled      `-> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    PendingConfirmation,
    Confirmed,
    Cancelled,
    Published,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Cancelled | ExecutionStatus::Published | ExecutionStatus::Failed
        )
    }

    pub fn can_become(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (PendingConfirmation, Confirmed)
                | (PendingConfirmation, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, Published)
                | (Confirmed, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::PendingConfirmation => "pending_confirmation",
            ExecutionStatus::Confirmed => "confirmed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Published => "published",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of publishing to one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Success { post_id: Option<String> },
    Failed { error: String },
    Timeout,
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PublishOutcome::Success { .. })
    }
}

/// Per-platform outcomes of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub outcomes: BTreeMap<Platform, PublishOutcome>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(PublishOutcome::is_success)
    }

    pub fn failed_platforms(&self) -> Vec<Platform> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(platform, _)| *platform)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionLog {
    pub id: i64,
    pub task_id: i64,
    pub fire_time: DateTime<Utc>,
    /// Content as it was when the execution was created.
    pub content: String,
    pub target_platforms: BTreeSet<Platform>,
    pub status: ExecutionStatus,
    pub confirmed_by: Option<String>,
    pub confirmed_time: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancelled_time: Option<DateTime<Utc>>,
    /// Per-platform outcomes. Also kept for runs stopped by a cancel.
    pub result: Option<DispatchReport>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub task_id: i64,
    pub fire_time: DateTime<Utc>,
    pub content: String,
    pub target_platforms: BTreeSet<Platform>,
    pub created_at: DateTime<Utc>,
}

impl NewExecution {
    pub fn for_task(task: &ScheduledTask, fire_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            fire_time,
            content: task.content.clone(),
            target_platforms: task.target_platforms.clone(),
            created_at: now,
        }
    }
}

/// Fields written by a status transition. `None` leaves the stored value alone.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub confirmed_by: Option<String>,
    pub confirmed_time: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancelled_time: Option<DateTime<Utc>>,
    pub result: Option<DispatchReport>,
}

impl ExecutionUpdate {
    pub fn to(status: ExecutionStatus) -> Self {
        Self {
            status,
            confirmed_by: None,
            confirmed_time: None,
            cancelled_by: None,
            cancelled_time: None,
            result: None,
        }
    }

    pub fn confirmed_by(mut self, operator: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.confirmed_by = Some(operator.into());
        self.confirmed_time = Some(at);
        self
    }

    pub fn cancelled_by(mut self, operator: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.cancelled_by = Some(operator.into());
        self.cancelled_time = Some(at);
        self
    }

    pub fn with_result(mut self, report: DispatchReport) -> Self {
        self.result = Some(report);
        self
    }

    pub fn apply(&self, log: &mut TaskExecutionLog) {
        log.status = self.status;
        if let Some(by) = &self.confirmed_by {
            log.confirmed_by = Some(by.clone());
        }
        if let Some(at) = self.confirmed_time {
            log.confirmed_time = Some(at);
        }
        if let Some(by) = &self.cancelled_by {
            log.cancelled_by = Some(by.clone());
        }
        if let Some(at) = self.cancelled_time {
            log.cancelled_time = Some(at);
        }
        if let Some(report) = &self.result {
            log.result = Some(report.clone());
        }
    }
}

/// Result of a compare-and-swap status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(TaskExecutionLog),
    /// The stored status was not the expected one. Nothing was written.
    Stale(ExecutionStatus),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleConfigError {
    #[error("schedule has no times of day")]
    NoTimes,

    #[error("weekly schedule has no days")]
    NoDays,

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("local time {at} does not exist in the task's timezone")]
    UnresolvableTime { at: NaiveDateTime },
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleConfigError),
}
