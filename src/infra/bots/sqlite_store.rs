// SQLite-backed bot store.
//
// Tables:
// - bots: bot configuration (soft delete via is_deleted)
// - keyword_rules: rules owned by a bot, removed with it
// - bot_logs: one row per processed inbound message

use crate::core::bots::{BotConfig, BotError, BotLogEntry, BotStore, LogStatus, NewBotLog};
use crate::core::filtering::KeywordRule;
use crate::infra::database::{
    enum_text, from_json, parse_enum, parse_timestamp, timestamp, to_json,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteBotStore {
    pool: Pool<Sqlite>,
}

fn storage(e: impl std::fmt::Display) -> BotError {
    BotError::StorageError(e.to_string())
}

impl SqliteBotStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), BotError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                knowledge_base_ids TEXT NOT NULL DEFAULT '[]',
                platform_account_ids TEXT NOT NULL DEFAULT '[]',
                reply_delay_min_secs INTEGER NOT NULL DEFAULT 0,
                reply_delay_max_secs INTEGER NOT NULL DEFAULT 0,
                daily_reply_limit INTEGER NOT NULL DEFAULT 0,
                reply_kinds TEXT NOT NULL DEFAULT '[]',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                active BOOLEAN NOT NULL DEFAULT 1,
                is_deleted BOOLEAN NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS keyword_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                filter_type TEXT NOT NULL,
                keyword TEXT NOT NULL,
                match_type TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT 'content',
                action TEXT NOT NULL,
                auto_reply_text TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                active BOOLEAN NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_keyword_rules_bot ON keyword_rules(bot_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id INTEGER NOT NULL,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                message_content TEXT NOT NULL,
                matched_rule_id INTEGER,
                reply_content TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bot_logs_bot_time ON bot_logs(bot_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_log(&self, log_id: i64) -> Result<Option<BotLogEntry>, BotError> {
        let row = sqlx::query("SELECT * FROM bot_logs WHERE id = ?")
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_log).transpose()
    }
}

#[async_trait]
impl BotStore for SqliteBotStore {
    async fn get_bot(&self, bot_id: i64) -> Result<Option<BotConfig>, BotError> {
        let row = sqlx::query("SELECT * FROM bots WHERE id = ? AND is_deleted = 0")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_bot).transpose()
    }

    async fn save_bot(&self, mut bot: BotConfig) -> Result<BotConfig, BotError> {
        let knowledge_base_ids = to_json(&bot.knowledge_base_ids).map_err(storage)?;
        let platform_account_ids = to_json(&bot.platform_account_ids).map_err(storage)?;
        let reply_kinds = to_json(&bot.reply_kinds).map_err(storage)?;

        if bot.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO bots (name, kind, knowledge_base_ids, platform_account_ids,
                    reply_delay_min_secs, reply_delay_max_secs, daily_reply_limit,
                    reply_kinds, timezone, active)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&bot.name)
            .bind(enum_text(&bot.kind))
            .bind(knowledge_base_ids)
            .bind(platform_account_ids)
            .bind(bot.reply_delay_min_secs as i64)
            .bind(bot.reply_delay_max_secs as i64)
            .bind(bot.daily_reply_limit as i64)
            .bind(reply_kinds)
            .bind(bot.timezone.name())
            .bind(bot.active)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            bot.id = result.last_insert_rowid();
            return Ok(bot);
        }

        let result = sqlx::query(
            r#"
            UPDATE bots SET name = ?, kind = ?, knowledge_base_ids = ?, platform_account_ids = ?,
                reply_delay_min_secs = ?, reply_delay_max_secs = ?, daily_reply_limit = ?,
                reply_kinds = ?, timezone = ?, active = ?
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(&bot.name)
        .bind(enum_text(&bot.kind))
        .bind(knowledge_base_ids)
        .bind(platform_account_ids)
        .bind(bot.reply_delay_min_secs as i64)
        .bind(bot.reply_delay_max_secs as i64)
        .bind(bot.daily_reply_limit as i64)
        .bind(reply_kinds)
        .bind(bot.timezone.name())
        .bind(bot.active)
        .bind(bot.id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(BotError::BotNotFound(bot.id));
        }
        Ok(bot)
    }

    async fn delete_bot(&self, bot_id: i64) -> Result<bool, BotError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let result = sqlx::query("UPDATE bots SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM keyword_rules WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM bot_logs WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_rules(&self, bot_id: i64) -> Result<Vec<KeywordRule>, BotError> {
        let rows = sqlx::query(
            "SELECT * FROM keyword_rules WHERE bot_id = ? AND active = 1 ORDER BY id",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(row_to_rule).collect()
    }

    async fn save_rule(&self, mut rule: KeywordRule) -> Result<KeywordRule, BotError> {
        if rule.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO keyword_rules (bot_id, filter_type, keyword, match_type, target,
                    action, auto_reply_text, priority, active)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(rule.bot_id)
            .bind(enum_text(&rule.filter_type))
            .bind(&rule.keyword)
            .bind(enum_text(&rule.match_type))
            .bind(enum_text(&rule.target))
            .bind(enum_text(&rule.action))
            .bind(&rule.auto_reply_text)
            .bind(rule.priority)
            .bind(rule.active)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            rule.id = result.last_insert_rowid();
            return Ok(rule);
        }

        sqlx::query(
            r#"
            UPDATE keyword_rules SET bot_id = ?, filter_type = ?, keyword = ?, match_type = ?,
                target = ?, action = ?, auto_reply_text = ?, priority = ?, active = ?
            WHERE id = ?
            "#,
        )
        .bind(rule.bot_id)
        .bind(enum_text(&rule.filter_type))
        .bind(&rule.keyword)
        .bind(enum_text(&rule.match_type))
        .bind(enum_text(&rule.target))
        .bind(enum_text(&rule.action))
        .bind(&rule.auto_reply_text)
        .bind(rule.priority)
        .bind(rule.active)
        .bind(rule.id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rule)
    }

    async fn delete_rule(&self, rule_id: i64) -> Result<bool, BotError> {
        let result = sqlx::query("DELETE FROM keyword_rules WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_log(&self, log: NewBotLog) -> Result<BotLogEntry, BotError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bot_logs (bot_id, channel, sender, message_content, matched_rule_id,
                reply_content, status, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.bot_id)
        .bind(enum_text(&log.channel))
        .bind(&log.sender)
        .bind(&log.message_content)
        .bind(log.matched_rule_id)
        .bind(&log.reply_content)
        .bind(enum_text(&log.status))
        .bind(&log.error_message)
        .bind(timestamp(log.created_at))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(BotLogEntry {
            id: result.last_insert_rowid(),
            bot_id: log.bot_id,
            channel: log.channel,
            sender: log.sender,
            message_content: log.message_content,
            matched_rule_id: log.matched_rule_id,
            reply_content: log.reply_content,
            status: log.status,
            error_message: log.error_message,
            created_at: log.created_at,
        })
    }

    async fn finalize_log(
        &self,
        log_id: i64,
        status: LogStatus,
        error: Option<String>,
    ) -> Result<BotLogEntry, BotError> {
        let result = sqlx::query(
            r#"
            UPDATE bot_logs SET status = ?, error_message = COALESCE(?, error_message)
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(enum_text(&status))
        .bind(error)
        .bind(log_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        let log = self
            .get_log(log_id)
            .await?
            .ok_or_else(|| BotError::StorageError(format!("log {log_id} not found")))?;

        if result.rows_affected() == 0 {
            return Err(BotError::LogAlreadyFinal(log_id));
        }
        Ok(log)
    }

    async fn pending_logs(&self, before: DateTime<Utc>) -> Result<Vec<BotLogEntry>, BotError> {
        let rows = sqlx::query(
            "SELECT * FROM bot_logs WHERE status = ? AND created_at < ? ORDER BY created_at, id",
        )
        .bind(enum_text(&LogStatus::Pending))
        .bind(timestamp(before))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(row_to_log).collect()
    }

    async fn logs_since(
        &self,
        bot_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BotLogEntry>, BotError> {
        let rows = sqlx::query(
            "SELECT * FROM bot_logs WHERE bot_id = ? AND created_at >= ? ORDER BY created_at, id",
        )
        .bind(bot_id)
        .bind(timestamp(since))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(row_to_log).collect()
    }
}

fn row_to_bot(row: &SqliteRow) -> Result<BotConfig, BotError> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    let knowledge_base_ids: String = row.try_get("knowledge_base_ids").map_err(storage)?;
    let platform_account_ids: String = row.try_get("platform_account_ids").map_err(storage)?;
    let reply_kinds: String = row.try_get("reply_kinds").map_err(storage)?;
    let timezone: String = row.try_get("timezone").map_err(storage)?;

    Ok(BotConfig {
        id: row.try_get("id").map_err(storage)?,
        name: row.try_get("name").map_err(storage)?,
        kind: parse_enum(&kind).map_err(storage)?,
        knowledge_base_ids: from_json(&knowledge_base_ids).map_err(storage)?,
        platform_account_ids: from_json(&platform_account_ids).map_err(storage)?,
        reply_delay_min_secs: row.try_get::<i64, _>("reply_delay_min_secs").map_err(storage)? as u64,
        reply_delay_max_secs: row.try_get::<i64, _>("reply_delay_max_secs").map_err(storage)? as u64,
        daily_reply_limit: row.try_get::<i64, _>("daily_reply_limit").map_err(storage)? as u32,
        reply_kinds: from_json(&reply_kinds).map_err(storage)?,
        timezone: timezone.parse::<Tz>().map_err(storage)?,
        active: row.try_get("active").map_err(storage)?,
    })
}

fn row_to_rule(row: &SqliteRow) -> Result<KeywordRule, BotError> {
    let filter_type: String = row.try_get("filter_type").map_err(storage)?;
    let match_type: String = row.try_get("match_type").map_err(storage)?;
    let target: String = row.try_get("target").map_err(storage)?;
    let action: String = row.try_get("action").map_err(storage)?;

    Ok(KeywordRule {
        id: row.try_get("id").map_err(storage)?,
        bot_id: row.try_get("bot_id").map_err(storage)?,
        filter_type: parse_enum(&filter_type).map_err(storage)?,
        keyword: row.try_get("keyword").map_err(storage)?,
        match_type: parse_enum(&match_type).map_err(storage)?,
        target: parse_enum(&target).map_err(storage)?,
        action: parse_enum(&action).map_err(storage)?,
        auto_reply_text: row.try_get("auto_reply_text").map_err(storage)?,
        priority: row.try_get("priority").map_err(storage)?,
        active: row.try_get("active").map_err(storage)?,
    })
}

fn row_to_log(row: &SqliteRow) -> Result<BotLogEntry, BotError> {
    let channel: String = row.try_get("channel").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let created_at: String = row.try_get("created_at").map_err(storage)?;

    Ok(BotLogEntry {
        id: row.try_get("id").map_err(storage)?,
        bot_id: row.try_get("bot_id").map_err(storage)?,
        channel: parse_enum(&channel).map_err(storage)?,
        sender: row.try_get("sender").map_err(storage)?,
        message_content: row.try_get("message_content").map_err(storage)?,
        matched_rule_id: row.try_get("matched_rule_id").map_err(storage)?,
        reply_content: row.try_get("reply_content").map_err(storage)?,
        status: parse_enum(&status).map_err(storage)?,
        error_message: row.try_get("error_message").map_err(storage)?,
        created_at: parse_timestamp(&created_at).map_err(storage)?,
    })
}
