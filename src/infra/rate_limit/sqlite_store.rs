// SQLite-backed reply quota counters.
//
// One row per bot holding the local day it was last used on. The upsert
// resets the row when the day changes and refuses to go past the limit,
// all inside a single statement, so concurrent admissions cannot overshoot.

use crate::core::rate_limit::{Admission, QuotaStore, RateLimitError};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteQuotaStore {
    pool: Pool<Sqlite>,
}

impl SqliteQuotaStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), RateLimitError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_reply_quota (
                bot_id INTEGER PRIMARY KEY,
                day TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RateLimitError::StorageError(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn try_consume(
        &self,
        bot_id: i64,
        day: NaiveDate,
        limit: u32,
    ) -> Result<Admission, RateLimitError> {
        if limit == 0 {
            return Ok(Admission::QuotaExceeded { limit });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO bot_reply_quota (bot_id, day, used)
            VALUES (?, ?, 1)
            ON CONFLICT(bot_id) DO UPDATE SET
                used = CASE WHEN bot_reply_quota.day = excluded.day
                    THEN bot_reply_quota.used + 1 ELSE 1 END,
                day = excluded.day
            WHERE bot_reply_quota.day != excluded.day OR bot_reply_quota.used < ?
            RETURNING used
            "#,
        )
        .bind(bot_id)
        .bind(day.to_string())
        .bind(limit as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RateLimitError::StorageError(e.to_string()))?;

        Ok(match row {
            Some(row) => Admission::Admitted {
                used: row.get::<i64, _>("used") as u32,
            },
            None => Admission::QuotaExceeded { limit },
        })
    }

    async fn used_on(&self, bot_id: i64, day: NaiveDate) -> Result<u32, RateLimitError> {
        let row = sqlx::query("SELECT used FROM bot_reply_quota WHERE bot_id = ? AND day = ?")
            .bind(bot_id)
            .bind(day.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RateLimitError::StorageError(e.to_string()))?;

        Ok(row.map(|row| row.get::<i64, _>("used") as u32).unwrap_or(0))
    }
}
