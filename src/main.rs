// Entry point of the marketing automation service.
//
// **Architecture Overview:**
// - `core/` = Business logic (filtering, quotas, replies, schedules, dispatch)
// - `infra/` = Implementations of core traits (SQLite stores, HTTP gateways, alert sinks)
// - `channels/` = Edges that feed the engines (JSON-lines intake, ticker, reply emission)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Close out work a previous process left half done
// 4. Start the schedule ticker
// 5. Serve intake commands until stdin closes or the process is interrupted
// 6. Give delayed replies and publish runs a grace period to finish

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "channels/channels_layer.rs"]
mod channels;
mod config;
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio_util::task::TaskTracker;

use crate::channels::{Intake, OperatorDesk, ReplyEmitter, ScheduleTicker};
use crate::config::AppConfig;
use crate::core::alerts::OpsNotifier;
use crate::core::bots::BotReplyService;
use crate::core::dispatch::DispatchExecutor;
use crate::core::scheduling::ScheduleEvaluator;
use crate::infra::alerts::{TracingNotifier, WebhookNotifier};
use crate::infra::bots::SqliteBotStore;
use crate::infra::database;
use crate::infra::gateway::{GenerationClient, HttpPublishGateway, HttpReplyGateway};
use crate::infra::rate_limit::SqliteQuotaStore;
use crate::infra::scheduling::SqliteTaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;
    let started_at = Utc::now();

    // ========================================================================
    // STORAGE
    // ========================================================================

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.data_dir.display()
        )
    })?;
    let db_path = config.database_path();
    let pool = database::connect(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let bot_store = SqliteBotStore::new(pool.clone());
    bot_store.migrate().await?;
    let quota_store = SqliteQuotaStore::new(pool.clone());
    quota_store.migrate().await?;
    let task_store = Arc::new(SqliteTaskStore::new(pool));
    task_store.migrate().await?;

    tracing::info!(path = %db_path.display(), "Database ready");

    // ========================================================================
    // SERVICES
    // ========================================================================

    let notifier: Arc<dyn OpsNotifier> = match &config.ops_webhook_url {
        Some(url) => {
            tracing::info!("Operator alerts go to the configured webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => {
            tracing::warn!("OPS_WEBHOOK_URL not set - operator alerts are only logged");
            Arc::new(TracingNotifier)
        }
    };

    let reply_service = BotReplyService::new(
        bot_store,
        quota_store,
        Arc::new(GenerationClient::new(
            config.generation_url.clone(),
            config.generation_api_key.clone(),
            config.reply_timeout,
        )),
        Arc::new(HttpReplyGateway::new(
            config.reply_gateway_url.clone(),
            config.reply_timeout,
        )),
        notifier.clone(),
    );

    let evaluator = ScheduleEvaluator::new(task_store.clone(), notifier.clone());
    let executor = DispatchExecutor::new(
        task_store,
        Arc::new(HttpPublishGateway::new(
            config.publish_gateway_url.clone(),
            config.publish_timeout,
        )),
        notifier,
        config.publish_timeout,
    );

    // ========================================================================
    // RECOVERY
    // ========================================================================

    // Nothing is spawned yet, so anything still in flight belongs to a
    // previous process.
    let interrupted_replies = reply_service.recover_interrupted(started_at).await?;
    let interrupted_runs = executor.recover_interrupted().await?;
    if interrupted_replies > 0 || interrupted_runs > 0 {
        tracing::warn!(
            replies = interrupted_replies,
            publish_runs = interrupted_runs,
            "Closed out work interrupted by the last shutdown"
        );
    }

    // ========================================================================
    // BACKGROUND TICKER
    // ========================================================================

    let ticker = Arc::new(ScheduleTicker::new(
        Arc::new(evaluator),
        config.tick_interval,
    ));
    let ticker_task = tokio::spawn(ticker.run());
    tracing::info!(
        interval_secs = config.tick_interval.as_secs(),
        "Schedule ticker started"
    );

    // ========================================================================
    // INTAKE
    // ========================================================================

    let tracker = TaskTracker::new();
    let intake = Arc::new(Intake::new(
        ReplyEmitter::new(Arc::new(reply_service), tracker.clone()),
        OperatorDesk::new(Arc::new(executor), tracker.clone()),
    ));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tracing::info!("Reading commands from stdin");
    tokio::select! {
        served = intake.run(stdin, stdout) => {
            served?;
            tracing::info!("Intake closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    ticker_task.abort();

    // ========================================================================
    // DRAIN
    // ========================================================================

    tracker.close();
    if !tracker.is_empty() {
        tracing::info!(
            in_flight = tracker.len(),
            grace_secs = config.shutdown_grace.as_secs(),
            "Waiting for delayed replies and publish runs"
        );
    }
    if tokio::time::timeout(config.shutdown_grace, tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            abandoned = tracker.len(),
            "Grace period over; unfinished work is closed out on the next start"
        );
    }

    Ok(())
}
