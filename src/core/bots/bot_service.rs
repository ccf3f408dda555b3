// Bot reply service - turns an inbound message into a logged outcome.
//
// Per message: received -> filtered -> blocked | admitted | passthrough.
// - blocked: log it, emit nothing
// - auto reply / allow / passthrough: get reply text, ask the rate limiter,
//   then hand a `PendingReply` back to the caller, who emits it after the delay
// - emission success or transport failure finalizes the log; failures are
//   reported to operators and never retried here

use super::bot_models::{
    BotConfig, BotError, BotLogEntry, InboundMessage, LogStatus, NewBotLog, REASON_BOT_INACTIVE,
    REASON_INTERRUPTED, REASON_KEYWORD_BLOCK, REASON_KIND_NOT_HANDLED, REASON_QUOTA_EXCEEDED,
};
use crate::core::alerts::{raise, OpsAlert, OpsNotifier};
use crate::core::bots::Channel;
use crate::core::filtering::{FilterDecision, FilterEngine, KeywordRule};
use crate::core::rate_limit::{Admission, QuotaStore, RateLimiter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// PORTS
// ============================================================================

/// Persistence for bots, their rules and their reply logs.
#[async_trait]
pub trait BotStore: Send + Sync {
    async fn get_bot(&self, bot_id: i64) -> Result<Option<BotConfig>, BotError>;

    /// Insert (id 0) or update a bot. Returns the stored bot.
    async fn save_bot(&self, bot: BotConfig) -> Result<BotConfig, BotError>;

    /// Remove a bot together with its rules and logs.
    async fn delete_bot(&self, bot_id: i64) -> Result<bool, BotError>;

    /// Active rules of a bot, as one consistent snapshot.
    async fn active_rules(&self, bot_id: i64) -> Result<Vec<KeywordRule>, BotError>;

    /// Insert (id 0) or update a rule. Returns the stored rule.
    async fn save_rule(&self, rule: KeywordRule) -> Result<KeywordRule, BotError>;

    async fn delete_rule(&self, rule_id: i64) -> Result<bool, BotError>;

    async fn insert_log(&self, log: NewBotLog) -> Result<BotLogEntry, BotError>;

    /// Move a pending log to a terminal status.
    /// Fails with `LogAlreadyFinal` if the log is no longer pending.
    async fn finalize_log(
        &self,
        log_id: i64,
        status: LogStatus,
        error: Option<String>,
    ) -> Result<BotLogEntry, BotError>;

    /// Logs of every bot still `pending` that were created before `before`, oldest first.
    async fn pending_logs(&self, before: DateTime<Utc>) -> Result<Vec<BotLogEntry>, BotError>;

    /// Logs of a bot created at or after `since`, oldest first.
    async fn logs_since(
        &self,
        bot_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BotLogEntry>, BotError>;
}

/// Knowledge-base / AI collaborator producing default replies.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        knowledge_base_ids: &[i64],
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Messaging-channel collaborator that delivers a reply.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(&self, reply: &PendingReply) -> Result<(), Box<dyn Error + Send + Sync>>;
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// An admitted reply waiting for its delay to pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReply {
    pub log_id: i64,
    pub bot_id: i64,
    pub channel: Channel,
    pub recipient: String,
    pub content: String,
    pub delay: Duration,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// Terminal: nothing will be emitted.
    Blocked(BotLogEntry),
    /// Admitted: emit `PendingReply` after its delay, then call `deliver`.
    Scheduled(PendingReply),
    /// Terminal: the reply could not be produced.
    Failed(BotLogEntry),
}

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct BotReplyService<S: BotStore, Q: QuotaStore> {
    store: S,
    limiter: RateLimiter<Q>,
    engine: FilterEngine,
    generator: Arc<dyn ReplyGenerator>,
    sender: Arc<dyn ReplySender>,
    notifier: Arc<dyn OpsNotifier>,
}

impl<S: BotStore, Q: QuotaStore> BotReplyService<S, Q> {
    pub fn new(
        store: S,
        quota: Q,
        generator: Arc<dyn ReplyGenerator>,
        sender: Arc<dyn ReplySender>,
        notifier: Arc<dyn OpsNotifier>,
    ) -> Self {
        Self {
            store,
            limiter: RateLimiter::new(quota),
            engine: FilterEngine::new(),
            generator,
            sender,
            notifier,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate and store a bot.
    pub async fn save_bot(&self, bot: BotConfig) -> Result<BotConfig, BotError> {
        bot.validate()?;
        self.store.save_bot(bot).await
    }

    /// Validate and store a keyword rule.
    pub async fn save_rule(&self, rule: KeywordRule) -> Result<KeywordRule, BotError> {
        rule.validate()?;
        if self.store.get_bot(rule.bot_id).await?.is_none() {
            return Err(BotError::BotNotFound(rule.bot_id));
        }
        self.store.save_rule(rule).await
    }

    /// Delete a rule and drop its compiled pattern.
    pub async fn delete_rule(&self, rule_id: i64) -> Result<bool, BotError> {
        let deleted = self.store.delete_rule(rule_id).await?;
        self.engine.forget_rule(rule_id);
        Ok(deleted)
    }

    /// Delete a bot with its rules and logs.
    pub async fn delete_bot(&self, bot_id: i64) -> Result<bool, BotError> {
        for rule in self.store.active_rules(bot_id).await? {
            self.engine.forget_rule(rule.id);
        }
        self.store.delete_bot(bot_id).await
    }

    /// Process one inbound message up to the point of emission.
    pub async fn handle_inbound(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<ReplyOutcome, BotError> {
        let bot = self
            .store
            .get_bot(message.bot_id)
            .await?
            .ok_or(BotError::BotNotFound(message.bot_id))?;

        if !bot.active {
            return self.block(message, None, REASON_BOT_INACTIVE, now).await;
        }
        if !bot.handles(message.message_kind) {
            return self.block(message, None, REASON_KIND_NOT_HANDLED, now).await;
        }

        // Snapshot once; rule edits after this point apply to the next message.
        let rules = self.store.active_rules(bot.id).await?;
        let evaluation = self
            .engine
            .evaluate(&message.content, &message.sender, &rules);
        let decision = evaluation.decision;
        let matched = decision.matched_rule();

        tracing::debug!(
            bot_id = bot.id,
            rule_id = ?matched,
            skipped = evaluation.skipped.len(),
            "Message filtered"
        );

        let reply = match decision {
            FilterDecision::Block { rule_id } => {
                return self
                    .block(message, Some(rule_id), REASON_KEYWORD_BLOCK, now)
                    .await;
            }
            FilterDecision::AutoReply { text, .. } => text,
            FilterDecision::Alert { rule_id } => {
                raise(
                    self.notifier.as_ref(),
                    OpsAlert::KeywordAlert {
                        bot_id: bot.id,
                        rule_id,
                        sender: message.sender.clone(),
                        content: message.content.clone(),
                    },
                )
                .await;
                match self.generate(&bot, message, matched, now).await? {
                    Ok(text) => text,
                    Err(failed) => return Ok(failed),
                }
            }
            FilterDecision::Allow { .. } | FilterDecision::PassThrough => {
                match self.generate(&bot, message, matched, now).await? {
                    Ok(text) => text,
                    Err(failed) => return Ok(failed),
                }
            }
        };

        match self.limiter.try_admit(&bot, now).await? {
            Admission::QuotaExceeded { .. } => {
                self.block(message, matched, REASON_QUOTA_EXCEEDED, now)
                    .await
            }
            Admission::Admitted { .. } => {
                let log = self
                    .store
                    .insert_log(
                        NewBotLog::for_message(message, LogStatus::Pending, now)
                            .with_rule(matched)
                            .with_reply(reply.clone()),
                    )
                    .await?;

                Ok(ReplyOutcome::Scheduled(PendingReply {
                    log_id: log.id,
                    bot_id: bot.id,
                    channel: message.channel,
                    recipient: message.sender.clone(),
                    content: reply,
                    delay: self.limiter.compute_delay(&bot),
                }))
            }
        }
    }

    /// Emit an admitted reply and record the result. Called once the delay has passed.
    pub async fn deliver(&self, reply: &PendingReply) -> Result<BotLogEntry, BotError> {
        match self.sender.send_reply(reply).await {
            Ok(()) => {
                let log = self
                    .store
                    .finalize_log(reply.log_id, LogStatus::Sent, None)
                    .await?;
                tracing::info!(bot_id = reply.bot_id, log_id = reply.log_id, "Reply sent");
                Ok(log)
            }
            Err(e) => {
                let error = format!("transport error: {e}");
                tracing::warn!(
                    bot_id = reply.bot_id,
                    log_id = reply.log_id,
                    error = %error,
                    "Reply send failed"
                );
                let log = self
                    .store
                    .finalize_log(reply.log_id, LogStatus::Failed, Some(error.clone()))
                    .await?;
                raise(
                    self.notifier.as_ref(),
                    OpsAlert::ReplyFailed {
                        bot_id: reply.bot_id,
                        log_id: reply.log_id,
                        error,
                    },
                )
                .await;
                Ok(log)
            }
        }
    }

    /// Fail replies a previous process admitted but never finalized.
    ///
    /// Their delay timers died with that process. Delivery is not retried,
    /// the log is closed as failed and operators are told.
    pub async fn recover_interrupted(&self, started_at: DateTime<Utc>) -> Result<usize, BotError> {
        let mut recovered = 0;
        for log in self.store.pending_logs(started_at).await? {
            let error = REASON_INTERRUPTED.to_string();
            match self
                .store
                .finalize_log(log.id, LogStatus::Failed, Some(error.clone()))
                .await
            {
                Ok(_) => {}
                // Finished by someone else in the meantime.
                Err(BotError::LogAlreadyFinal(_)) => continue,
                Err(e) => return Err(e),
            }
            tracing::warn!(bot_id = log.bot_id, log_id = log.id, "Pending reply was interrupted by a restart");
            raise(
                self.notifier.as_ref(),
                OpsAlert::ReplyFailed {
                    bot_id: log.bot_id,
                    log_id: log.id,
                    error,
                },
            )
            .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Replies admitted for the bot's current local day.
    pub async fn replies_today(&self, bot_id: i64, now: DateTime<Utc>) -> Result<u32, BotError> {
        let bot = self
            .store
            .get_bot(bot_id)
            .await?
            .ok_or(BotError::BotNotFound(bot_id))?;
        Ok(self.limiter.replies_today(&bot, now).await?)
    }

    async fn block(
        &self,
        message: &InboundMessage,
        rule_id: Option<i64>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplyOutcome, BotError> {
        let log = self
            .store
            .insert_log(
                NewBotLog::for_message(message, LogStatus::Blocked, now)
                    .with_rule(rule_id)
                    .with_error(reason),
            )
            .await?;
        tracing::info!(bot_id = message.bot_id, log_id = log.id, reason, "Message blocked");
        Ok(ReplyOutcome::Blocked(log))
    }

    /// Ask the knowledge-base collaborator for a reply.
    /// The inner `Err` is an already-logged failure outcome.
    async fn generate(
        &self,
        bot: &BotConfig,
        message: &InboundMessage,
        rule_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Result<String, ReplyOutcome>, BotError> {
        match self
            .generator
            .generate(&message.content, &bot.knowledge_base_ids)
            .await
        {
            Ok(text) if !text.trim().is_empty() => Ok(Ok(text)),
            Ok(_) => Ok(Err(self
                .fail(bot, message, rule_id, "reply generation returned no text".into(), now)
                .await?)),
            Err(e) => Ok(Err(self
                .fail(bot, message, rule_id, format!("reply generation failed: {e}"), now)
                .await?)),
        }
    }

    async fn fail(
        &self,
        bot: &BotConfig,
        message: &InboundMessage,
        rule_id: Option<i64>,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<ReplyOutcome, BotError> {
        let log = self
            .store
            .insert_log(
                NewBotLog::for_message(message, LogStatus::Failed, now)
                    .with_rule(rule_id)
                    .with_error(error.clone()),
            )
            .await?;
        tracing::warn!(bot_id = bot.id, log_id = log.id, error = %error, "Reply not produced");
        raise(
            self.notifier.as_ref(),
            OpsAlert::ReplyFailed {
                bot_id: bot.id,
                log_id: log.id,
                error,
            },
        )
        .await;
        Ok(ReplyOutcome::Failed(log))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bots::{BotKind, MessageKind};
    use crate::core::filtering::{FilterType, MatchTarget, MatchType, RuleAction};
    use crate::infra::bots::InMemoryBotStore;
    use crate::infra::rate_limit::InMemoryQuotaStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CannedGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReplyGenerator for CannedGenerator {
        async fn generate(
            &self,
            prompt: &str,
            _knowledge_base_ids: &[i64],
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("knowledge base offline".into());
            }
            Ok(format!("answer to: {prompt}"))
        }
    }

    struct RecordingSender {
        sent: Mutex<Vec<PendingReply>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ReplySender for RecordingSender {
        async fn send_reply(
            &self,
            reply: &PendingReply,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("connection reset".into());
            }
            self.sent.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingNotifier {
        alerts: Mutex<Vec<OpsAlert>>,
    }

    #[async_trait]
    impl OpsNotifier for CollectingNotifier {
        async fn notify(&self, alert: &OpsAlert) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Harness {
        service: BotReplyService<InMemoryBotStore, InMemoryQuotaStore>,
        generator: Arc<CannedGenerator>,
        sender: Arc<RecordingSender>,
        notifier: Arc<CollectingNotifier>,
        bot: BotConfig,
    }

    async fn harness(limit: u32, generator_fails: bool) -> Harness {
        let generator = Arc::new(CannedGenerator {
            calls: AtomicUsize::new(0),
            fail: generator_fails,
        });
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        });
        let notifier = Arc::new(CollectingNotifier::default());

        let service = BotReplyService::new(
            InMemoryBotStore::new(),
            InMemoryQuotaStore::new(),
            generator.clone(),
            sender.clone(),
            notifier.clone(),
        );

        let bot = service
            .save_bot(BotConfig {
                id: 0,
                name: "shop-helper".into(),
                kind: BotKind::Public,
                knowledge_base_ids: vec![11, 12],
                platform_account_ids: vec![],
                reply_delay_min_secs: 1,
                reply_delay_max_secs: 3,
                daily_reply_limit: limit,
                reply_kinds: vec![MessageKind::Comment, MessageKind::DirectMessage],
                timezone: chrono_tz::UTC,
                active: true,
            })
            .await
            .unwrap();

        Harness {
            service,
            generator,
            sender,
            notifier,
            bot,
        }
    }

    async fn add_rule(
        h: &Harness,
        filter_type: FilterType,
        keyword: &str,
        action: RuleAction,
        reply: Option<&str>,
    ) -> KeywordRule {
        h.service
            .save_rule(KeywordRule {
                id: 0,
                bot_id: h.bot.id,
                filter_type,
                keyword: keyword.into(),
                match_type: MatchType::Contains,
                target: MatchTarget::Content,
                action,
                auto_reply_text: reply.map(str::to_string),
                priority: 0,
                active: true,
            })
            .await
            .unwrap()
    }

    fn message(bot_id: i64, content: &str) -> InboundMessage {
        InboundMessage {
            bot_id,
            channel: Channel::PublicPlatform,
            sender: "viewer_1".into(),
            content: content.into(),
            message_kind: MessageKind::Comment,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 6, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn sensitive_block_logs_and_emits_nothing() {
        let h = harness(5, false).await;
        let rule = add_rule(&h, FilterType::Sensitive, "refund", RuleAction::Block, None).await;

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "I want a refund please"), now())
            .await
            .unwrap();

        let ReplyOutcome::Blocked(log) = outcome else {
            panic!("expected a blocked outcome, got {outcome:?}");
        };
        assert_eq!(log.status, LogStatus::Blocked);
        assert_eq!(log.matched_rule_id, Some(rule.id));
        assert_eq!(log.reply_content, None);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.service.replies_today(h.bot.id, now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn auto_reply_skips_generation_and_delivers() {
        let h = harness(5, false).await;
        add_rule(
            &h,
            FilterType::Whitelist,
            "hours",
            RuleAction::AutoReply,
            Some("We are open 9-18"),
        )
        .await;

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "what are your hours?"), now())
            .await
            .unwrap();
        let ReplyOutcome::Scheduled(pending) = outcome else {
            panic!("expected a scheduled reply");
        };
        assert_eq!(pending.content, "We are open 9-18");
        assert!(pending.delay >= Duration::from_secs(1) && pending.delay <= Duration::from_secs(3));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);

        let log = h.service.deliver(&pending).await.unwrap();
        assert_eq!(log.status, LogStatus::Sent);
        assert_eq!(h.sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn passthrough_uses_knowledge_base_reply() {
        let h = harness(5, false).await;

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "do you ship abroad?"), now())
            .await
            .unwrap();

        let ReplyOutcome::Scheduled(pending) = outcome else {
            panic!("expected a scheduled reply");
        };
        assert_eq!(pending.content, "answer to: do you ship abroad?");
        assert_eq!(pending.recipient, "viewer_1");
    }

    #[tokio::test]
    async fn third_message_over_quota_is_blocked_with_quota_reason() {
        let h = harness(2, false).await;

        for text in ["first", "second"] {
            let outcome = h
                .service
                .handle_inbound(&message(h.bot.id, text), now())
                .await
                .unwrap();
            let ReplyOutcome::Scheduled(pending) = outcome else {
                panic!("expected a scheduled reply");
            };
            h.service.deliver(&pending).await.unwrap();
        }

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "third"), now())
            .await
            .unwrap();
        let ReplyOutcome::Blocked(log) = outcome else {
            panic!("expected quota block");
        };
        assert_eq!(log.status, LogStatus::Blocked);
        assert_eq!(log.error_message.as_deref(), Some(REASON_QUOTA_EXCEEDED));

        let logs = h
            .service
            .store()
            .logs_since(h.bot.id, now() - chrono::Duration::days(1))
            .await
            .unwrap();
        let sent = logs.iter().filter(|l| l.status == LogStatus::Sent).count();
        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn alert_rule_notifies_and_still_replies() {
        let h = harness(5, false).await;
        let rule = add_rule(&h, FilterType::Sensitive, "lawyer", RuleAction::Alert, None).await;

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "my lawyer will call"), now())
            .await
            .unwrap();

        assert!(matches!(outcome, ReplyOutcome::Scheduled(_)));
        let alerts = h.notifier.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            alerts[0],
            OpsAlert::KeywordAlert { rule_id, .. } if rule_id == rule.id
        ));
    }

    #[tokio::test]
    async fn transport_failure_marks_log_failed_without_retry() {
        let h = harness(5, false).await;
        h.sender.fail.store(true, Ordering::SeqCst);

        let ReplyOutcome::Scheduled(pending) = h
            .service
            .handle_inbound(&message(h.bot.id, "hello"), now())
            .await
            .unwrap()
        else {
            panic!("expected a scheduled reply");
        };

        let log = h.service.deliver(&pending).await.unwrap();
        assert_eq!(log.status, LogStatus::Failed);
        assert!(log.error_message.unwrap().contains("connection reset"));
        assert!(h.sender.sent.lock().unwrap().is_empty());
        assert!(matches!(
            h.notifier.alerts.lock().unwrap()[0],
            OpsAlert::ReplyFailed { .. }
        ));

        // The log is final; a second delivery attempt cannot rewrite it.
        h.sender.fail.store(false, Ordering::SeqCst);
        assert!(matches!(
            h.service.deliver(&pending).await,
            Err(BotError::LogAlreadyFinal(_))
        ));
    }

    #[tokio::test]
    async fn generation_failure_is_logged_and_not_counted() {
        let h = harness(1, true).await;

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "hello"), now())
            .await
            .unwrap();

        let ReplyOutcome::Failed(log) = outcome else {
            panic!("expected failure");
        };
        assert!(log
            .error_message
            .unwrap()
            .contains("knowledge base offline"));
        assert_eq!(h.service.replies_today(h.bot.id, now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inactive_bot_and_unhandled_kinds_are_blocked() {
        let h = harness(5, false).await;

        let mut group = message(h.bot.id, "hi all");
        group.message_kind = MessageKind::GroupChat;
        let ReplyOutcome::Blocked(log) = h.service.handle_inbound(&group, now()).await.unwrap()
        else {
            panic!("expected block");
        };
        assert_eq!(log.error_message.as_deref(), Some(REASON_KIND_NOT_HANDLED));

        let mut bot = h.bot.clone();
        bot.active = false;
        h.service.save_bot(bot).await.unwrap();

        let ReplyOutcome::Blocked(log) = h
            .service
            .handle_inbound(&message(h.bot.id, "hello"), now())
            .await
            .unwrap()
        else {
            panic!("expected block");
        };
        assert_eq!(log.error_message.as_deref(), Some(REASON_BOT_INACTIVE));
    }

    #[tokio::test]
    async fn deleting_a_rule_drops_its_compiled_pattern() {
        let h = harness(5, false).await;
        let rule = h
            .service
            .save_rule(KeywordRule {
                id: 0,
                bot_id: h.bot.id,
                filter_type: FilterType::Blacklist,
                keyword: r"sc[a@]m".into(),
                match_type: MatchType::Regex,
                target: MatchTarget::Content,
                action: RuleAction::Block,
                auto_reply_text: None,
                priority: 0,
                active: true,
            })
            .await
            .unwrap();

        let outcome = h
            .service
            .handle_inbound(&message(h.bot.id, "total sc@m"), now())
            .await
            .unwrap();
        assert!(matches!(outcome, ReplyOutcome::Blocked(_)));
        assert_eq!(h.service.engine.cached_patterns(), 1);

        assert!(h.service.delete_rule(rule.id).await.unwrap());
        assert_eq!(h.service.engine.cached_patterns(), 0);
    }

    #[tokio::test]
    async fn restart_fails_replies_left_pending() {
        let h = harness(5, false).await;
        let ReplyOutcome::Scheduled(stranded) = h
            .service
            .handle_inbound(&message(h.bot.id, "anyone there?"), now())
            .await
            .unwrap()
        else {
            panic!("expected a scheduled reply");
        };

        let restarted = now() + chrono::Duration::minutes(5);
        let ReplyOutcome::Scheduled(fresh) = h
            .service
            .handle_inbound(&message(h.bot.id, "hello again"), restarted)
            .await
            .unwrap()
        else {
            panic!("expected a scheduled reply");
        };

        assert_eq!(h.service.recover_interrupted(restarted).await.unwrap(), 1);

        let logs = h
            .service
            .store()
            .logs_since(h.bot.id, now() - chrono::Duration::days(1))
            .await
            .unwrap();
        let failed = logs.iter().find(|log| log.id == stranded.log_id).unwrap();
        assert_eq!(failed.status, LogStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(REASON_INTERRUPTED));
        assert!(matches!(
            h.notifier.alerts.lock().unwrap()[0],
            OpsAlert::ReplyFailed { log_id, .. } if log_id == stranded.log_id
        ));

        // Admitted after the restart, still deliverable.
        let sent = h.service.deliver(&fresh).await.unwrap();
        assert_eq!(sent.status, LogStatus::Sent);
        assert_eq!(h.sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_bot_is_an_error() {
        let h = harness(5, false).await;
        let result = h.service.handle_inbound(&message(999, "hi"), now()).await;
        assert!(matches!(result, Err(BotError::BotNotFound(999))));
    }

    #[tokio::test]
    async fn rules_for_unknown_bots_are_rejected() {
        let h = harness(5, false).await;
        let result = h
            .service
            .save_rule(KeywordRule {
                id: 0,
                bot_id: 404,
                filter_type: FilterType::Blacklist,
                keyword: "x".into(),
                match_type: MatchType::Exact,
                target: MatchTarget::Content,
                action: RuleAction::Block,
                auto_reply_text: None,
                priority: 0,
                active: true,
            })
            .await;
        assert!(matches!(result, Err(BotError::BotNotFound(404))));
    }
}
