// Filter engine - evaluates a message against a bot's keyword rules.
//
// Evaluation order:
// - active rules only
// - sensitive, then blacklist, then whitelist
// - within a list: priority, then id
// - first match wins
//
// Broken rules are logged and skipped, never fatal.

use super::filter_models::{
    FilterDecision, FilterError, FilterEvaluation, KeywordRule, MatchTarget, MatchType, RuleAction,
};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};

/// Patterns longer than this are rejected outright.
pub const MAX_PATTERN_LEN: usize = 512;
/// Upper bound on the compiled program (and lazy DFA cache) of one pattern.
const REGEX_SIZE_LIMIT: usize = 256 * 1024;
/// Regex matching only looks at this many bytes of the subject.
const MAX_REGEX_INPUT: usize = 16 * 1024;
/// Compiled patterns kept before the cache is flushed.
const MAX_CACHED_PATTERNS: usize = 4096;

/// Compile a rule pattern under the engine's limits.
///
/// The `regex` crate runs in time linear to the input, so together with the
/// size and input caps a single rule cannot stall an evaluation.
pub fn compile_pattern(rule_id: i64, pattern: &str) -> Result<Regex, FilterError> {
    if pattern.chars().count() > MAX_PATTERN_LEN {
        return Err(FilterError::PatternTooLong {
            rule_id,
            max: MAX_PATTERN_LEN,
        });
    }

    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| FilterError::InvalidPattern {
            rule_id,
            reason: e.to_string(),
        })
}

/// Keyword filter engine.
///
/// Holds nothing but a cache of compiled patterns, so one engine can be
/// shared by every bot. The cache is keyed by rule id: editing a rule's
/// pattern replaces its entry, deleting the rule should call `forget_rule`.
pub struct FilterEngine {
    patterns: DashMap<i64, CachedPattern>,
}

struct CachedPattern {
    source: String,
    regex: Regex,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self {
            patterns: DashMap::new(),
        }
    }

    /// Evaluate a message.
    ///
    /// `rules` is the snapshot fetched when processing started; edits made
    /// after that are picked up by the next message.
    pub fn evaluate(&self, content: &str, sender: &str, rules: &[KeywordRule]) -> FilterEvaluation {
        let mut ordered: Vec<&KeywordRule> = rules.iter().filter(|r| r.active).collect();
        ordered.sort_by_key(|r| (r.filter_type.precedence(), r.priority, r.id));

        let mut skipped = Vec::new();

        for rule in ordered {
            let subject = match rule.target {
                MatchTarget::Content => content,
                MatchTarget::Sender => sender,
            };

            let outcome = self
                .matches(rule, subject)
                .and_then(|matched| if matched { Self::decide(rule).map(Some) } else { Ok(None) });

            match outcome {
                Ok(Some(decision)) => return FilterEvaluation { decision, skipped },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        bot_id = rule.bot_id,
                        rule_id = rule.id,
                        error = %err,
                        "Skipping keyword rule"
                    );
                    skipped.push(err);
                }
            }
        }

        FilterEvaluation {
            decision: FilterDecision::PassThrough,
            skipped,
        }
    }

    fn matches(&self, rule: &KeywordRule, subject: &str) -> Result<bool, FilterError> {
        match rule.match_type {
            MatchType::Exact => Ok(normalize(subject) == normalize(&rule.keyword)),
            MatchType::Contains => {
                let needle = normalize(&rule.keyword);
                if needle.is_empty() {
                    return Err(FilterError::InvalidRule {
                        rule_id: rule.id,
                        reason: "keyword must not be empty".to_string(),
                    });
                }
                Ok(subject.to_lowercase().contains(&needle))
            }
            MatchType::Regex => {
                let regex = self.pattern(rule)?;
                Ok(regex.is_match(bounded(subject)))
            }
        }
    }

    /// Drop the compiled pattern of a deleted rule.
    pub fn forget_rule(&self, rule_id: i64) {
        self.patterns.remove(&rule_id);
    }

    pub fn cached_patterns(&self) -> usize {
        self.patterns.len()
    }

    fn pattern(&self, rule: &KeywordRule) -> Result<Regex, FilterError> {
        if let Some(cached) = self.patterns.get(&rule.id) {
            if cached.source == rule.keyword {
                return Ok(cached.regex.clone());
            }
        }

        let regex = compile_pattern(rule.id, &rule.keyword)?;
        if self.patterns.len() >= MAX_CACHED_PATTERNS && !self.patterns.contains_key(&rule.id) {
            tracing::debug!(cached = self.patterns.len(), "Pattern cache full, flushing");
            self.patterns.clear();
        }
        self.patterns.insert(
            rule.id,
            CachedPattern {
                source: rule.keyword.clone(),
                regex: regex.clone(),
            },
        );
        Ok(regex)
    }

    fn decide(rule: &KeywordRule) -> Result<FilterDecision, FilterError> {
        let rule_id = rule.id;
        match rule.action {
            RuleAction::Block => Ok(FilterDecision::Block { rule_id }),
            RuleAction::Alert => Ok(FilterDecision::Alert { rule_id }),
            RuleAction::Allow => Ok(FilterDecision::Allow { rule_id }),
            RuleAction::AutoReply => match rule.reply_text() {
                Some(text) => Ok(FilterDecision::AutoReply {
                    rule_id,
                    text: text.to_string(),
                }),
                None => Err(FilterError::InvalidRule {
                    rule_id,
                    reason: "auto_reply rule has no reply text".to_string(),
                }),
            },
        }
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Longest prefix of `text` within the regex input cap, cut on a char boundary.
fn bounded(text: &str) -> &str {
    if text.len() <= MAX_REGEX_INPUT {
        return text;
    }
    let mut end = MAX_REGEX_INPUT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
