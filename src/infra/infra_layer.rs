// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

pub mod database;

#[path = "bots/bot_store.rs"]
pub mod bots;

#[path = "rate_limit/quota_store.rs"]
pub mod rate_limit;

#[path = "scheduling/task_store.rs"]
pub mod scheduling;

#[path = "gateway/mod.rs"]
pub mod gateway;

#[path = "alerts/mod.rs"]
pub mod alerts;
