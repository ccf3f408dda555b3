// Core bot module - inbound message handling for reply bots.
// Following the same pattern as the filtering module.

pub mod bot_models;
pub mod bot_service;

pub use bot_models::*;
pub use bot_service::*;
