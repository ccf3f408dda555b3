// In-memory reply quota counters.
//
// DashMap's entry API holds the shard lock for the key while the closure
// runs, which gives the check-and-increment its atomicity.

use crate::core::rate_limit::{Admission, QuotaStore, RateLimitError};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct DailyCount {
    day: NaiveDate,
    used: u32,
}

pub struct InMemoryQuotaStore {
    counters: DashMap<i64, DailyCount>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn try_consume(
        &self,
        bot_id: i64,
        day: NaiveDate,
        limit: u32,
    ) -> Result<Admission, RateLimitError> {
        let mut counter = self
            .counters
            .entry(bot_id)
            .or_insert(DailyCount { day, used: 0 });

        // Lazy rollover: a counter from another day starts over.
        if counter.day != day {
            *counter = DailyCount { day, used: 0 };
        }

        if counter.used >= limit {
            return Ok(Admission::QuotaExceeded { limit });
        }

        counter.used += 1;
        Ok(Admission::Admitted { used: counter.used })
    }

    async fn used_on(&self, bot_id: i64, day: NaiveDate) -> Result<u32, RateLimitError> {
        Ok(self
            .counters
            .get(&bot_id)
            .filter(|counter| counter.day == day)
            .map(|counter| counter.used)
            .unwrap_or(0))
    }
}
