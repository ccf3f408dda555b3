// Bot domain models - bot configuration, inbound messages and reply logs.
//
// These are pure domain types with no transport dependencies.
// The channel layer converts wire payloads into these.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::rate_limit::RateLimitError;

/// Logged reason when the daily quota denies a reply.
pub const REASON_QUOTA_EXCEEDED: &str = "quota exceeded";
/// Logged reason when a keyword rule blocks the message.
pub const REASON_KEYWORD_BLOCK: &str = "blocked by keyword rule";
/// Logged reason when the bot is switched off.
pub const REASON_BOT_INACTIVE: &str = "bot inactive";
/// Logged reason when the bot does not answer this kind of message.
pub const REASON_KIND_NOT_HANDLED: &str = "message kind not handled";
/// Logged error when a restart dropped a reply that was waiting out its delay.
pub const REASON_INTERRUPTED: &str = "interrupted before delivery";

/// Public bots answer on content platforms, private bots on WeChat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Public,
    Private,
}

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    PublicPlatform,
    PrivateWechat,
}

/// The conversation shape of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Comment under a published post.
    Comment,
    /// Platform direct message.
    DirectMessage,
    /// WeChat / WeCom group chat.
    GroupChat,
    /// WeChat / WeCom one-to-one chat.
    PrivateChat,
}

/// A reply bot and its limits.
#[derive(Debug, Clone, PartialEq)]
pub struct BotConfig {
    pub id: i64,
    pub name: String,
    pub kind: BotKind,
    pub knowledge_base_ids: Vec<i64>,
    pub platform_account_ids: Vec<i64>,
    pub reply_delay_min_secs: u64,
    pub reply_delay_max_secs: u64,
    pub daily_reply_limit: u32,
    /// Message kinds this bot answers. Anything else is logged and dropped.
    pub reply_kinds: Vec<MessageKind>,
    /// Day boundaries for the reply quota are computed in this zone.
    pub timezone: Tz,
    pub active: bool,
}

impl BotConfig {
    /// Check the config before it is written to storage.
    pub fn validate(&self) -> Result<(), BotError> {
        if self.name.trim().is_empty() {
            return Err(BotError::InvalidConfig("name must not be empty".to_string()));
        }
        if self.reply_delay_min_secs > self.reply_delay_max_secs {
            return Err(BotError::InvalidConfig(format!(
                "reply delay range is inverted ({}s > {}s)",
                self.reply_delay_min_secs, self.reply_delay_max_secs
            )));
        }
        if self.reply_kinds.is_empty() {
            return Err(BotError::InvalidConfig(
                "bot must answer at least one message kind".to_string(),
            ));
        }
        Ok(())
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.reply_kinds.contains(&kind)
    }

    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.reply_delay_min_secs),
            Duration::from_secs(self.reply_delay_max_secs),
        )
    }
}

/// An inbound message forwarded by the messaging-channel collaborator.
/// Never persisted as-is; only its log entry is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub bot_id: i64,
    pub channel: Channel,
    pub sender: String,
    pub content: String,
    pub message_kind: MessageKind,
}

/// Status of a bot log entry. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Sent,
    Blocked,
    Failed,
}

impl LogStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LogStatus::Pending)
    }
}

/// One row per processed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct BotLogEntry {
    pub id: i64,
    pub bot_id: i64,
    pub channel: Channel,
    pub sender: String,
    pub message_content: String,
    /// Weak reference: the rule may be edited or deleted later.
    pub matched_rule_id: Option<i64>,
    pub reply_content: Option<String>,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A log entry before storage assigns its id.
#[derive(Debug, Clone)]
pub struct NewBotLog {
    pub bot_id: i64,
    pub channel: Channel,
    pub sender: String,
    pub message_content: String,
    pub matched_rule_id: Option<i64>,
    pub reply_content: Option<String>,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewBotLog {
    pub fn for_message(message: &InboundMessage, status: LogStatus, now: DateTime<Utc>) -> Self {
        Self {
            bot_id: message.bot_id,
            channel: message.channel,
            sender: message.sender.clone(),
            message_content: message.content.clone(),
            matched_rule_id: None,
            reply_content: None,
            status,
            error_message: None,
            created_at: now,
        }
    }

    pub fn with_rule(mut self, rule_id: Option<i64>) -> Self {
        self.matched_rule_id = rule_id;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply_content = Some(reply.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Bot {0} not found")]
    BotNotFound(i64),

    #[error("Invalid bot configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid keyword rule: {0}")]
    InvalidRule(#[from] crate::core::filtering::FilterError),

    #[error("Log entry {0} already has a final status")]
    LogAlreadyFinal(i64),

    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),
}
