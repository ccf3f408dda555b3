// Runs inbound messages through the reply engine and emits admitted replies
// once their delay has passed.
//
// Emissions are spawned on a shared tracker so shutdown can wait for them.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::core::bots::{
    BotError, BotReplyService, BotStore, InboundMessage, PendingReply, ReplyOutcome,
};
use crate::core::rate_limit::QuotaStore;

/// The outcome of one inbound message plus the background emission, if any.
pub struct Handled {
    pub outcome: ReplyOutcome,
    pub emission: Option<JoinHandle<()>>,
}

pub struct ReplyEmitter<S: BotStore + 'static, Q: QuotaStore + 'static> {
    service: Arc<BotReplyService<S, Q>>,
    tracker: TaskTracker,
}

impl<S: BotStore + 'static, Q: QuotaStore + 'static> Clone for ReplyEmitter<S, Q> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            tracker: self.tracker.clone(),
        }
    }
}

impl<S: BotStore + 'static, Q: QuotaStore + 'static> ReplyEmitter<S, Q> {
    pub fn new(service: Arc<BotReplyService<S, Q>>, tracker: TaskTracker) -> Self {
        Self { service, tracker }
    }

    pub fn service(&self) -> &BotReplyService<S, Q> {
        &self.service
    }

    pub async fn handle(&self, message: InboundMessage) -> Result<Handled, BotError> {
        let outcome = self.service.handle_inbound(&message, Utc::now()).await?;
        let emission = match &outcome {
            ReplyOutcome::Scheduled(pending) => Some(self.emit_later(pending.clone())),
            ReplyOutcome::Blocked(_) | ReplyOutcome::Failed(_) => None,
        };
        Ok(Handled { outcome, emission })
    }

    /// Sleep for the reply's delay, then send it and finalize its log.
    pub fn emit_later(&self, reply: PendingReply) -> JoinHandle<()> {
        let service = Arc::clone(&self.service);
        self.tracker.spawn(async move {
            tokio::time::sleep(reply.delay).await;
            match service.deliver(&reply).await {
                Ok(entry) => tracing::debug!(
                    log_id = entry.id,
                    status = ?entry.status,
                    "Reply emission finished"
                ),
                Err(e) => {
                    tracing::error!(log_id = reply.log_id, "Could not finalize reply: {}", e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bots::{
        BotConfig, BotKind, Channel, LogStatus, MessageKind, ReplyGenerator, ReplySender,
    };
    use crate::infra::alerts::TracingNotifier;
    use crate::infra::bots::InMemoryBotStore;
    use crate::infra::rate_limit::InMemoryQuotaStore;
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::Mutex;

    struct EchoGenerator;

    #[async_trait]
    impl ReplyGenerator for EchoGenerator {
        async fn generate(
            &self,
            prompt: &str,
            _knowledge_base_ids: &[i64],
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Ok(format!("re: {prompt}"))
        }
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplySender for Outbox {
        async fn send_reply(
            &self,
            reply: &PendingReply,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.sent.lock().unwrap().push(reply.content.clone());
            Ok(())
        }
    }

    type TestEmitter = ReplyEmitter<InMemoryBotStore, InMemoryQuotaStore>;

    async fn emitter(active: bool) -> (TestEmitter, Arc<Outbox>) {
        emitter_with(active, 0, TaskTracker::new()).await
    }

    async fn emitter_with(
        active: bool,
        delay_secs: u64,
        tracker: TaskTracker,
    ) -> (TestEmitter, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::default());
        let service = BotReplyService::new(
            InMemoryBotStore::new(),
            InMemoryQuotaStore::new(),
            Arc::new(EchoGenerator),
            outbox.clone(),
            Arc::new(TracingNotifier),
        );
        service
            .save_bot(BotConfig {
                id: 0,
                name: "front desk".into(),
                kind: BotKind::Private,
                knowledge_base_ids: vec![],
                platform_account_ids: vec![],
                reply_delay_min_secs: delay_secs,
                reply_delay_max_secs: delay_secs,
                daily_reply_limit: 10,
                reply_kinds: vec![MessageKind::PrivateChat],
                timezone: chrono_tz::UTC,
                active,
            })
            .await
            .unwrap();
        (ReplyEmitter::new(Arc::new(service), tracker), outbox)
    }

    fn message(content: &str) -> InboundMessage {
        InboundMessage {
            bot_id: 1,
            channel: Channel::PrivateWechat,
            sender: "wx_user_1".into(),
            content: content.into(),
            message_kind: MessageKind::PrivateChat,
        }
    }

    #[tokio::test]
    async fn admitted_reply_is_sent_after_delay() {
        let (emitter, outbox) = emitter(true).await;

        let handled = emitter.handle(message("opening hours?")).await.unwrap();
        let ReplyOutcome::Scheduled(pending) = handled.outcome else {
            panic!("expected a scheduled reply");
        };
        handled.emission.unwrap().await.unwrap();

        assert_eq!(*outbox.sent.lock().unwrap(), vec!["re: opening hours?".to_string()]);
        let logs = emitter
            .service()
            .store()
            .logs_since(1, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        let log = logs.iter().find(|l| l.id == pending.log_id).unwrap();
        assert_eq!(log.status, LogStatus::Sent);
    }

    #[tokio::test]
    async fn blocked_message_spawns_nothing() {
        let (emitter, outbox) = emitter(false).await;

        let handled = emitter.handle(message("hello")).await.unwrap();

        assert!(matches!(handled.outcome, ReplyOutcome::Blocked(_)));
        assert!(handled.emission.is_none());
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_the_tracker_waits_for_delayed_replies() {
        let tracker = TaskTracker::new();
        let (emitter, outbox) = emitter_with(true, 1, tracker.clone()).await;

        let handled = emitter.handle(message("still open?")).await.unwrap();
        assert!(matches!(handled.outcome, ReplyOutcome::Scheduled(_)));
        assert!(outbox.sent.lock().unwrap().is_empty());

        tracker.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), tracker.wait())
            .await
            .expect("emission should finish within the grace period");

        assert_eq!(*outbox.sent.lock().unwrap(), vec!["re: still open?".to_string()]);
    }
}
