// Line-delimited JSON intake.
//
// Upstream collaborators write one command per line: inbound messages from the
// messaging channels, and confirm/cancel decisions from operators. Each line
// gets exactly one JSON reply line, tagged with the line number it answers.
//
// Lines are handled concurrently, so replies come back in completion order.
// A slow knowledge-base call for one bot does not hold up the others.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::operator::OperatorDesk;
use super::reply_emitter::ReplyEmitter;
use crate::core::bots::{BotStore, InboundMessage, ReplyOutcome};
use crate::core::rate_limit::QuotaStore;
use crate::core::scheduling::{ExecutionStatus, TaskExecutionLog, TaskStore};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntakeCommand {
    Inbound(InboundMessage),
    Confirm { execution_id: i64, operator: String },
    Cancel { execution_id: i64, operator: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IntakeReply {
    Blocked { log_id: i64, reason: Option<String> },
    Scheduled { log_id: i64, delay_secs: u64 },
    Failed { log_id: i64, error: Option<String> },
    Execution { execution_id: i64, status: ExecutionStatus },
    Error { message: String },
}

/// A reply on the wire: `{"line": N, "result": ...}`.
#[derive(Debug, Serialize)]
struct Answer {
    line: u64,
    #[serde(flatten)]
    reply: IntakeReply,
}

/// Commands handled at once before reading pauses.
const MAX_IN_FLIGHT: usize = 64;

impl IntakeReply {
    fn execution(log: &TaskExecutionLog) -> Self {
        IntakeReply::Execution {
            execution_id: log.id,
            status: log.status,
        }
    }

    fn error(message: impl ToString) -> Self {
        IntakeReply::Error {
            message: message.to_string(),
        }
    }
}

pub struct Intake<S, Q, T>
where
    S: BotStore + 'static,
    Q: QuotaStore + 'static,
    T: TaskStore + 'static,
{
    replies: ReplyEmitter<S, Q>,
    desk: OperatorDesk<T>,
}

impl<S, Q, T> Intake<S, Q, T>
where
    S: BotStore + 'static,
    Q: QuotaStore + 'static,
    T: TaskStore + 'static,
{
    pub fn new(replies: ReplyEmitter<S, Q>, desk: OperatorDesk<T>) -> Self {
        Self { replies, desk }
    }

    pub async fn handle_line(&self, line: &str) -> IntakeReply {
        let command: IntakeCommand = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Rejected intake line: {}", e);
                return IntakeReply::error(format!("invalid command: {e}"));
            }
        };

        match command {
            IntakeCommand::Inbound(message) => match self.replies.handle(message).await {
                Ok(handled) => match handled.outcome {
                    ReplyOutcome::Blocked(log) => IntakeReply::Blocked {
                        log_id: log.id,
                        reason: log.error_message,
                    },
                    ReplyOutcome::Scheduled(pending) => IntakeReply::Scheduled {
                        log_id: pending.log_id,
                        delay_secs: pending.delay.as_secs(),
                    },
                    ReplyOutcome::Failed(log) => IntakeReply::Failed {
                        log_id: log.id,
                        error: log.error_message,
                    },
                },
                Err(e) => IntakeReply::error(e),
            },
            IntakeCommand::Confirm {
                execution_id,
                operator,
            } => match self.desk.confirm(execution_id, &operator).await {
                // The publish run continues in the background.
                Ok((log, _run)) => IntakeReply::execution(&log),
                Err(e) => IntakeReply::error(e),
            },
            IntakeCommand::Cancel {
                execution_id,
                operator,
            } => match self.desk.cancel(execution_id, &operator).await {
                Ok(log) => IntakeReply::execution(&log),
                Err(e) => IntakeReply::error(e),
            },
        }
    }

    /// Serve commands until the reader hits EOF, then wait for the ones in flight.
    pub async fn run<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (answers, mut outbox) = mpsc::unbounded_channel::<Answer>();
        let slots = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

        let read = async move {
            let mut lines = reader.lines();
            let mut handlers = JoinSet::new();
            let mut number = 0u64;

            while let Some(line) = lines.next_line().await? {
                number += 1;
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                let slot = Arc::clone(&slots).acquire_owned().await?;
                let intake = Arc::clone(&self);
                let answers = answers.clone();
                handlers.spawn(async move {
                    let reply = intake.handle_line(&line).await;
                    // Only fails once the writer has given up.
                    let _ = answers.send(Answer { line: number, reply });
                    drop(slot);
                });

                while let Some(done) = handlers.try_join_next() {
                    log_join_failure(done);
                }
            }

            drop(answers);
            while let Some(done) = handlers.join_next().await {
                log_join_failure(done);
            }
            anyhow::Ok(())
        };

        let write = async move {
            while let Some(answer) = outbox.recv().await {
                let mut out = serde_json::to_string(&answer)?;
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
            anyhow::Ok(())
        };

        let (read, write) = tokio::join!(read, write);
        read?;
        write
    }
}

fn log_join_failure(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        tracing::error!("Intake handler crashed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bots::{
        BotConfig, BotKind, BotReplyService, Channel, MessageKind, PendingReply, ReplyGenerator,
        ReplySender,
    };
    use crate::core::dispatch::{DispatchExecutor, PlatformPublisher, PublishError, PublishReceipt};
    use crate::core::scheduling::{NewExecution, Platform};
    use crate::infra::alerts::TracingNotifier;
    use crate::infra::bots::InMemoryBotStore;
    use crate::infra::rate_limit::InMemoryQuotaStore;
    use crate::infra::scheduling::InMemoryTaskStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::error::Error;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio_util::task::TaskTracker;

    struct Canned;

    #[async_trait]
    impl ReplyGenerator for Canned {
        async fn generate(
            &self,
            _prompt: &str,
            _knowledge_base_ids: &[i64],
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Ok("thanks for asking".into())
        }
    }

    #[async_trait]
    impl ReplySender for Canned {
        async fn send_reply(
            &self,
            _reply: &PendingReply,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            Ok(())
        }
    }

    #[async_trait]
    impl PlatformPublisher for Canned {
        async fn publish(
            &self,
            _platform: Platform,
            _content: &str,
        ) -> Result<PublishReceipt, PublishError> {
            Ok(PublishReceipt { post_id: None })
        }
    }

    /// Holds every generation until `parties` of them are running at once.
    struct Rendezvous {
        barrier: Barrier,
    }

    #[async_trait]
    impl ReplyGenerator for Rendezvous {
        async fn generate(
            &self,
            prompt: &str,
            _knowledge_base_ids: &[i64],
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.barrier.wait().await;
            Ok(format!("re: {prompt}"))
        }
    }

    type TestIntake = Intake<InMemoryBotStore, InMemoryQuotaStore, InMemoryTaskStore>;

    async fn intake() -> Arc<TestIntake> {
        intake_with(Arc::new(Canned)).await
    }

    async fn intake_with(generator: Arc<dyn ReplyGenerator>) -> Arc<TestIntake> {
        let tracker = TaskTracker::new();
        let service = BotReplyService::new(
            InMemoryBotStore::new(),
            InMemoryQuotaStore::new(),
            generator,
            Arc::new(Canned),
            Arc::new(TracingNotifier),
        );
        service
            .save_bot(BotConfig {
                id: 0,
                name: "comments".into(),
                kind: BotKind::Public,
                knowledge_base_ids: vec![3],
                platform_account_ids: vec![11],
                reply_delay_min_secs: 5,
                reply_delay_max_secs: 5,
                daily_reply_limit: 100,
                reply_kinds: vec![MessageKind::Comment],
                timezone: chrono_tz::Asia::Shanghai,
                active: true,
            })
            .await
            .unwrap();

        let tasks = Arc::new(InMemoryTaskStore::new());
        tasks
            .insert_execution_if_absent(NewExecution {
                task_id: 1,
                fire_time: Utc.with_ymd_and_hms(2026, 5, 6, 9, 0, 0).unwrap(),
                content: "New arrivals".into(),
                target_platforms: BTreeSet::from([Platform::Xiaohongshu]),
                created_at: Utc.with_ymd_and_hms(2026, 5, 6, 9, 0, 0).unwrap(),
            })
            .await
            .unwrap();
        let executor = DispatchExecutor::new(
            tasks,
            Arc::new(Canned),
            Arc::new(TracingNotifier),
            Duration::from_secs(1),
        );

        Arc::new(Intake::new(
            ReplyEmitter::new(Arc::new(service), tracker.clone()),
            OperatorDesk::new(Arc::new(executor), tracker),
        ))
    }

    async fn serve(intake: Arc<TestIntake>, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        intake
            .run(tokio::io::BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let mut replies: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        replies.sort_by_key(|r| r["line"].as_u64());
        replies
    }

    fn inbound(content: &str) -> String {
        json!({
            "type": "inbound",
            "bot_id": 1,
            "channel": "public_platform",
            "sender": "dy_9001",
            "content": content,
            "message_kind": "comment"
        })
        .to_string()
    }

    #[test]
    fn parses_tagged_commands() {
        let inbound: IntakeCommand = serde_json::from_value(json!({
            "type": "inbound",
            "bot_id": 1,
            "channel": "public_platform",
            "sender": "dy_9001",
            "content": "price?",
            "message_kind": "comment"
        }))
        .unwrap();
        assert!(matches!(inbound, IntakeCommand::Inbound(ref m) if m.bot_id == 1));

        let cancel: IntakeCommand = serde_json::from_value(json!({
            "type": "cancel",
            "execution_id": 4,
            "operator": "alice"
        }))
        .unwrap();
        assert_eq!(
            cancel,
            IntakeCommand::Cancel {
                execution_id: 4,
                operator: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn inbound_comment_is_scheduled_with_the_bot_delay() {
        let intake = intake().await;

        let reply = intake.handle_line(&inbound("is this in stock?")).await;

        assert!(matches!(reply, IntakeReply::Scheduled { delay_secs: 5, .. }));
    }

    #[tokio::test]
    async fn unknown_bot_and_garbage_become_error_replies() {
        let intake = intake().await;

        let unknown = json!({
            "type": "inbound",
            "bot_id": 99,
            "channel": "private_wechat",
            "sender": "wx_1",
            "content": "hi",
            "message_kind": "private_chat"
        })
        .to_string();
        assert!(matches!(intake.handle_line(&unknown).await, IntakeReply::Error { .. }));
        assert!(matches!(intake.handle_line("{not json").await, IntakeReply::Error { .. }));
    }

    #[tokio::test]
    async fn run_tags_each_reply_with_its_line() {
        let intake = intake().await;
        let input = concat!(
            "{\"type\":\"cancel\",\"execution_id\":1,\"operator\":\"alice\"}\n",
            "\n",
            "{not json\n",
        );

        let replies = serve(intake, input).await;

        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[0],
            json!({"line": 1, "result": "execution", "execution_id": 1, "status": "cancelled"})
        );
        assert_eq!(replies[1]["line"], 3);
        assert_eq!(replies[1]["result"], "error");
    }

    #[tokio::test]
    async fn slow_generation_does_not_hold_up_other_lines() {
        // Neither message can finish until both are being generated, so a
        // one-at-a-time intake would never get past the first line.
        let intake = intake_with(Arc::new(Rendezvous {
            barrier: Barrier::new(2),
        }))
        .await;
        let input = format!("{}\n{}\n", inbound("first"), inbound("second"));

        let replies = tokio::time::timeout(Duration::from_secs(5), serve(intake, &input))
            .await
            .expect("lines should be handled concurrently");

        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r["result"] == "scheduled"));
        assert_eq!(replies[0]["line"], 1);
        assert_eq!(replies[1]["line"], 2);
    }
}
