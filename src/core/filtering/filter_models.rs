// Filtering domain models - keyword rules and the decisions they produce.
//
// These are pure domain types. Storage adapters persist them,
// the bot reply service acts on the decisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which list a rule belongs to. Lists are evaluated in a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Sensitive,
    Blacklist,
    Whitelist,
}

impl FilterType {
    /// Evaluation rank, lowest first. Blocking intent beats permissive intent.
    pub fn precedence(self) -> u8 {
        match self {
            FilterType::Sensitive => 0,
            FilterType::Blacklist => 1,
            FilterType::Whitelist => 2,
        }
    }
}

/// How the keyword is compared against the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Whole text equals the keyword, ignoring case and surrounding whitespace.
    Exact,
    /// Keyword appears anywhere in the text, ignoring case.
    Contains,
    /// Keyword is a regular expression.
    Regex,
}

/// What happens when the rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Allow,
    Alert,
    AutoReply,
}

/// Which part of the message a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTarget {
    /// The message text.
    #[default]
    Content,
    /// The sender's display name or account identity (WeChat name lists).
    Sender,
}

/// A single keyword rule owned by a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub id: i64,
    pub bot_id: i64,
    pub filter_type: FilterType,
    pub keyword: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub target: MatchTarget,
    pub action: RuleAction,
    #[serde(default)]
    pub auto_reply_text: Option<String>,
    /// Lower runs first within a filter type; ties fall back to id (insertion order).
    #[serde(default)]
    pub priority: i32,
    pub active: bool,
}

impl KeywordRule {
    /// Check the rule before it is written to storage.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.keyword.trim().is_empty() {
            return Err(FilterError::InvalidRule {
                rule_id: self.id,
                reason: "keyword must not be empty".to_string(),
            });
        }

        if self.action == RuleAction::AutoReply && self.reply_text().is_none() {
            return Err(FilterError::InvalidRule {
                rule_id: self.id,
                reason: "auto_reply rules need auto_reply_text".to_string(),
            });
        }

        if self.match_type == MatchType::Regex {
            super::filter_service::compile_pattern(self.id, &self.keyword)?;
        }

        Ok(())
    }

    /// The configured auto-reply text, if it is non-blank.
    pub fn reply_text(&self) -> Option<&str> {
        self.auto_reply_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

/// Outcome of evaluating a message against a rule set.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    /// Drop the message. No reply.
    Block { rule_id: i64 },
    /// Notify operators, then continue with the default reply.
    Alert { rule_id: i64 },
    /// Reply with the rule's canned text.
    AutoReply { rule_id: i64, text: String },
    /// Whitelisted: skip remaining rules and use the default reply.
    Allow { rule_id: i64 },
    /// Nothing matched. The caller decides the default reply.
    PassThrough,
}

impl FilterDecision {
    pub fn matched_rule(&self) -> Option<i64> {
        match self {
            FilterDecision::Block { rule_id }
            | FilterDecision::Alert { rule_id }
            | FilterDecision::AutoReply { rule_id, .. }
            | FilterDecision::Allow { rule_id } => Some(*rule_id),
            FilterDecision::PassThrough => None,
        }
    }
}

/// The decision plus every rule that had to be skipped on the way.
#[derive(Debug, Clone)]
pub struct FilterEvaluation {
    pub decision: FilterDecision,
    pub skipped: Vec<FilterError>,
}

/// Rule-level errors. These never abort an evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("Rule {rule_id} has an invalid pattern: {reason}")]
    InvalidPattern { rule_id: i64, reason: String },

    #[error("Rule {rule_id} pattern is longer than {max} characters")]
    PatternTooLong { rule_id: i64, max: usize },

    #[error("Rule {rule_id} is invalid: {reason}")]
    InvalidRule { rule_id: i64, reason: String },
}
