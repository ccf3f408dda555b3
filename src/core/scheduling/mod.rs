pub mod cron;
pub mod schedule_models;
pub mod schedule_service;

pub use schedule_models::*;
pub use schedule_service::*;
