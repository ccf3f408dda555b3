// Drives the schedule evaluator on a fixed interval.
//
// Each tick covers `(previous end, now]`. The watermark only advances when a
// tick succeeds, so a failed tick is covered again by the next one. When the
// evaluator defers fires past its per-tick cap, the watermark stops at the
// last fire it created and the next tick resumes from there. A tick that is
// still running when the next one is due makes the newer one a no-op.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::core::scheduling::{ScheduleEvaluator, SchedulingError, TaskStore, TickSummary};

pub struct ScheduleTicker<S: TaskStore + 'static> {
    evaluator: Arc<ScheduleEvaluator<S>>,
    interval: Duration,
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl<S: TaskStore + 'static> ScheduleTicker<S> {
    pub fn new(evaluator: Arc<ScheduleEvaluator<S>>, interval: Duration) -> Self {
        Self {
            evaluator,
            interval,
            watermark: Mutex::new(None),
        }
    }

    /// Evaluate everything due up to `now`. `None` when another tick holds the lock.
    pub async fn tick_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<TickSummary>, SchedulingError> {
        let Ok(mut watermark) = self.watermark.try_lock() else {
            tracing::debug!("Previous schedule tick still running, skipping");
            return Ok(None);
        };

        // First tick looks back one interval.
        let lookback = chrono::Duration::from_std(self.interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(1));
        let start = watermark.unwrap_or(now - lookback);

        let summary = self.evaluator.tick(start, now).await?;
        let covered = summary.deferred_from.unwrap_or(now);
        if covered > start {
            *watermark = Some(covered);
        }
        Ok(Some(summary))
    }

    /// Tick forever. Errors are logged and the window is retried on the next tick.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            match self.tick_at(Utc::now()).await {
                Ok(Some(summary)) => {
                    if !summary.created.is_empty() || summary.flagged > 0 {
                        tracing::info!(
                            evaluated = summary.evaluated,
                            created = summary.created.len(),
                            duplicates = summary.duplicates,
                            flagged = summary.flagged,
                            completed = summary.completed,
                            "Schedule tick"
                        );
                    }
                    if let Some(from) = summary.deferred_from {
                        tracing::warn!(%from, "Schedule tick capped, resuming on the next tick");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Schedule tick failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduling::{Platform, ScheduleConfig, ScheduledTask, TaskStatus};
    use crate::infra::alerts::TracingNotifier;
    use crate::infra::scheduling::InMemoryTaskStore;
    use chrono::{NaiveTime, TimeZone};
    use std::collections::BTreeSet;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 6, h, m, 0).unwrap()
    }

    async fn evaluator() -> ScheduleEvaluator<InMemoryTaskStore> {
        let evaluator = ScheduleEvaluator::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(TracingNotifier),
        );
        evaluator
            .create_task(
                ScheduledTask {
                    id: 0,
                    owner_id: "ops-team".into(),
                    name: "morning post".into(),
                    content: "Good morning".into(),
                    target_platforms: BTreeSet::from([Platform::Douyin]),
                    schedule: ScheduleConfig::Daily {
                        times: vec![
                            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                        ],
                    },
                    timezone: chrono_tz::UTC,
                    status: TaskStatus::Enabled,
                    schedule_error: None,
                    created_at: utc(0, 0),
                },
                utc(0, 0),
            )
            .await
            .unwrap();
        evaluator
    }

    async fn ticker() -> ScheduleTicker<InMemoryTaskStore> {
        ScheduleTicker::new(Arc::new(evaluator().await), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn first_tick_looks_back_one_interval() {
        let ticker = ticker().await;

        let now = utc(9, 0) + chrono::Duration::seconds(30);
        let summary = ticker.tick_at(now).await.unwrap().unwrap();

        assert_eq!(summary.created.len(), 1);
        assert_eq!(summary.created[0].fire_time, utc(9, 0));
    }

    #[tokio::test]
    async fn watermark_catches_up_after_a_gap() {
        let ticker = ticker().await;

        let first = ticker.tick_at(utc(8, 0)).await.unwrap().unwrap();
        assert!(first.created.is_empty());

        // Nothing ran between 08:00 and 10:00; both fires are still picked up.
        let second = ticker.tick_at(utc(10, 0)).await.unwrap().unwrap();
        let fires: Vec<_> = second.created.iter().map(|e| e.fire_time).collect();
        assert_eq!(fires, vec![utc(9, 0), utc(9, 30)]);

        let third = ticker.tick_at(utc(10, 0)).await.unwrap().unwrap();
        assert!(third.created.is_empty());
        assert_eq!(third.duplicates, 0);
    }

    #[tokio::test]
    async fn capped_tick_resumes_from_last_created_fire() {
        let ticker = ScheduleTicker::new(
            Arc::new(evaluator().await.with_fire_cap(1)),
            Duration::from_secs(60),
        );

        ticker.tick_at(utc(8, 0)).await.unwrap().unwrap();

        let capped = ticker.tick_at(utc(10, 0)).await.unwrap().unwrap();
        let fires: Vec<_> = capped.created.iter().map(|e| e.fire_time).collect();
        assert_eq!(fires, vec![utc(9, 0)]);
        assert_eq!(capped.deferred_from, Some(utc(9, 0)));
        assert_eq!(*ticker.watermark.lock().await, Some(utc(9, 0)));

        let resumed = ticker.tick_at(utc(10, 1)).await.unwrap().unwrap();
        let fires: Vec<_> = resumed.created.iter().map(|e| e.fire_time).collect();
        assert_eq!(fires, vec![utc(9, 30)]);
        assert_eq!(resumed.deferred_from, None);
        assert_eq!(*ticker.watermark.lock().await, Some(utc(10, 1)));
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let ticker = ticker().await;

        let _held = ticker.watermark.lock().await;
        assert!(ticker.tick_at(utc(10, 0)).await.unwrap().is_none());
    }
}
