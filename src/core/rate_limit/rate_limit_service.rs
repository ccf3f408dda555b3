// Reply rate limiting - per-bot daily quota and randomized reply delay.
//
// The counter lives behind `QuotaStore`, which must consume a unit
// atomically (check and increment in one step). Day rollover is handled
// lazily by the store when it sees a new local date, so there is no
// background job that could miss a reset.

use crate::core::bots::BotConfig;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Reply may go out. `used` includes this one.
    Admitted { used: u32 },
    /// The bot already used its whole quota for the day. Nothing was counted.
    QuotaExceeded { limit: u32 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Keyed counter store for reply quotas.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Consume one reply from `bot_id`'s quota for `day`.
    ///
    /// Must be atomic per bot: concurrent calls never both take the last unit.
    /// A counter recorded for another day counts as zero. Denials leave the
    /// counter untouched.
    async fn try_consume(
        &self,
        bot_id: i64,
        day: NaiveDate,
        limit: u32,
    ) -> Result<Admission, RateLimitError>;

    /// Replies consumed by `bot_id` on `day`.
    async fn used_on(&self, bot_id: i64, day: NaiveDate) -> Result<u32, RateLimitError>;
}

/// Admission control for reply bots.
pub struct RateLimiter<Q: QuotaStore> {
    store: Q,
}

impl<Q: QuotaStore> RateLimiter<Q> {
    pub fn new(store: Q) -> Self {
        Self { store }
    }

    /// The bot's local calendar day at `now`.
    pub fn local_day(bot: &BotConfig, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&bot.timezone).date_naive()
    }

    /// Try to take one reply from the bot's daily quota.
    pub async fn try_admit(
        &self,
        bot: &BotConfig,
        now: DateTime<Utc>,
    ) -> Result<Admission, RateLimitError> {
        if bot.daily_reply_limit == 0 {
            return Ok(Admission::QuotaExceeded { limit: 0 });
        }

        let day = Self::local_day(bot, now);
        let admission = self
            .store
            .try_consume(bot.id, day, bot.daily_reply_limit)
            .await?;

        match admission {
            Admission::Admitted { used } => {
                tracing::debug!(bot_id = bot.id, used, limit = bot.daily_reply_limit, "Reply admitted")
            }
            Admission::QuotaExceeded { limit } => {
                tracing::warn!(bot_id = bot.id, limit, %day, "Daily reply quota exhausted")
            }
        }

        Ok(admission)
    }

    /// Replies already admitted for the bot's current local day.
    pub async fn replies_today(
        &self,
        bot: &BotConfig,
        now: DateTime<Utc>,
    ) -> Result<u32, RateLimitError> {
        self.store.used_on(bot.id, Self::local_day(bot, now)).await
    }

    /// How long to wait before emitting a reply: uniform over the bot's delay range.
    ///
    /// The caller schedules the emission; nothing here sleeps.
    pub fn compute_delay(&self, bot: &BotConfig) -> Duration {
        let (min, max) = bot.delay_range();
        let (min_ms, max_ms) = (min.as_millis() as u64, max.as_millis() as u64);
        if min_ms >= max_ms {
            return min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bots::{BotKind, MessageKind};
    use crate::infra::rate_limit::InMemoryQuotaStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn bot(limit: u32) -> BotConfig {
        BotConfig {
            id: 7,
            name: "quota-bot".into(),
            kind: BotKind::Private,
            knowledge_base_ids: vec![],
            platform_account_ids: vec![],
            reply_delay_min_secs: 3,
            reply_delay_max_secs: 8,
            daily_reply_limit: limit,
            reply_kinds: vec![MessageKind::PrivateChat],
            timezone: chrono_tz::UTC,
            active: true,
        }
    }

    #[tokio::test]
    async fn denies_once_limit_is_reached() {
        let limiter = RateLimiter::new(InMemoryQuotaStore::new());
        let bot = bot(2);
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();

        assert_eq!(
            limiter.try_admit(&bot, now).await.unwrap(),
            Admission::Admitted { used: 1 }
        );
        assert_eq!(
            limiter.try_admit(&bot, now).await.unwrap(),
            Admission::Admitted { used: 2 }
        );
        assert_eq!(
            limiter.try_admit(&bot, now).await.unwrap(),
            Admission::QuotaExceeded { limit: 2 }
        );

        // Denials are not counted.
        assert_eq!(limiter.replies_today(&bot, now).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zero_limit_never_admits() {
        let limiter = RateLimiter::new(InMemoryQuotaStore::new());
        let now = Utc::now();
        assert!(!limiter.try_admit(&bot(0), now).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn counter_resets_on_new_local_day() {
        let limiter = RateLimiter::new(InMemoryQuotaStore::new());
        let mut bot = bot(1);
        bot.timezone = chrono_tz::Asia::Shanghai;

        // 23:30 local on March 4th.
        let late = Utc.with_ymd_and_hms(2026, 3, 4, 15, 30, 0).unwrap();
        assert!(limiter.try_admit(&bot, late).await.unwrap().is_admitted());
        assert!(!limiter.try_admit(&bot, late).await.unwrap().is_admitted());

        // 00:30 local on March 5th, still March 4th in UTC.
        let after_midnight = Utc.with_ymd_and_hms(2026, 3, 4, 16, 30, 0).unwrap();
        assert!(limiter
            .try_admit(&bot, after_midnight)
            .await
            .unwrap()
            .is_admitted());
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(InMemoryQuotaStore::new()));
        let bot = Arc::new(bot(10));
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            let bot = Arc::clone(&bot);
            handles.push(tokio::spawn(async move {
                limiter.try_admit(&bot, now).await.unwrap().is_admitted()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(limiter.replies_today(&bot, now).await.unwrap(), 10);
    }

    #[test]
    fn delay_stays_inside_configured_range() {
        let limiter = RateLimiter::new(InMemoryQuotaStore::new());
        let bot = bot(1);
        for _ in 0..200 {
            let delay = limiter.compute_delay(&bot);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(8));
        }
    }

    #[test]
    fn fixed_delay_when_range_is_a_point() {
        let limiter = RateLimiter::new(InMemoryQuotaStore::new());
        let mut bot = bot(1);
        bot.reply_delay_min_secs = 4;
        bot.reply_delay_max_secs = 4;
        assert_eq!(limiter.compute_delay(&bot), Duration::from_secs(4));
    }
}
