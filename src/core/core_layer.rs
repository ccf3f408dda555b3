// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "alerts/alert_service.rs"]
pub mod alerts;

#[path = "filtering/mod.rs"]
pub mod filtering;

#[path = "rate_limit/rate_limit_service.rs"]
pub mod rate_limit;

#[path = "bots/mod.rs"]
pub mod bots;

#[path = "scheduling/mod.rs"]
pub mod scheduling;

#[path = "dispatch/dispatch_service.rs"]
pub mod dispatch;
