// In-memory BotStore. Used by tests and for running without a database file.

use crate::core::bots::{BotConfig, BotError, BotLogEntry, BotStore, LogStatus, NewBotLog};
use crate::core::filtering::KeywordRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

pub struct InMemoryBotStore {
    bots: DashMap<i64, BotConfig>,
    rules: DashMap<i64, KeywordRule>,
    logs: DashMap<i64, BotLogEntry>,
    next_id: AtomicI64,
}

impl InMemoryBotStore {
    pub fn new() -> Self {
        Self {
            bots: DashMap::new(),
            rules: DashMap::new(),
            logs: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn assign_id(&self, id: i64) -> i64 {
        if id == 0 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        } else {
            id
        }
    }
}

impl Default for InMemoryBotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BotStore for InMemoryBotStore {
    async fn get_bot(&self, bot_id: i64) -> Result<Option<BotConfig>, BotError> {
        Ok(self.bots.get(&bot_id).map(|bot| bot.value().clone()))
    }

    async fn save_bot(&self, mut bot: BotConfig) -> Result<BotConfig, BotError> {
        bot.id = self.assign_id(bot.id);
        self.bots.insert(bot.id, bot.clone());
        Ok(bot)
    }

    async fn delete_bot(&self, bot_id: i64) -> Result<bool, BotError> {
        let removed = self.bots.remove(&bot_id).is_some();
        self.rules.retain(|_, rule| rule.bot_id != bot_id);
        self.logs.retain(|_, log| log.bot_id != bot_id);
        Ok(removed)
    }

    async fn active_rules(&self, bot_id: i64) -> Result<Vec<KeywordRule>, BotError> {
        let mut rules: Vec<KeywordRule> = self
            .rules
            .iter()
            .filter(|rule| rule.bot_id == bot_id && rule.active)
            .map(|rule| rule.value().clone())
            .collect();
        rules.sort_by_key(|rule| rule.id);
        Ok(rules)
    }

    async fn save_rule(&self, mut rule: KeywordRule) -> Result<KeywordRule, BotError> {
        rule.id = self.assign_id(rule.id);
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete_rule(&self, rule_id: i64) -> Result<bool, BotError> {
        Ok(self.rules.remove(&rule_id).is_some())
    }

    async fn insert_log(&self, log: NewBotLog) -> Result<BotLogEntry, BotError> {
        let entry = BotLogEntry {
            id: self.assign_id(0),
            bot_id: log.bot_id,
            channel: log.channel,
            sender: log.sender,
            message_content: log.message_content,
            matched_rule_id: log.matched_rule_id,
            reply_content: log.reply_content,
            status: log.status,
            error_message: log.error_message,
            created_at: log.created_at,
        };
        self.logs.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn finalize_log(
        &self,
        log_id: i64,
        status: LogStatus,
        error: Option<String>,
    ) -> Result<BotLogEntry, BotError> {
        let mut log = self
            .logs
            .get_mut(&log_id)
            .ok_or_else(|| BotError::StorageError(format!("log {log_id} not found")))?;

        if log.status.is_terminal() {
            return Err(BotError::LogAlreadyFinal(log_id));
        }

        log.status = status;
        if error.is_some() {
            log.error_message = error;
        }
        Ok(log.value().clone())
    }

    async fn pending_logs(&self, before: DateTime<Utc>) -> Result<Vec<BotLogEntry>, BotError> {
        let mut logs: Vec<BotLogEntry> = self
            .logs
            .iter()
            .filter(|log| log.status == LogStatus::Pending && log.created_at < before)
            .map(|log| log.value().clone())
            .collect();
        logs.sort_by_key(|log| (log.created_at, log.id));
        Ok(logs)
    }

    async fn logs_since(
        &self,
        bot_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BotLogEntry>, BotError> {
        let mut logs: Vec<BotLogEntry> = self
            .logs
            .iter()
            .filter(|log| log.bot_id == bot_id && log.created_at >= since)
            .map(|log| log.value().clone())
            .collect();
        logs.sort_by_key(|log| (log.created_at, log.id));
        Ok(logs)
    }
}
