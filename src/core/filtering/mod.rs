// Keyword filtering - decides what a bot does with an inbound message.
// Pure domain logic, no storage and no transport.

pub mod filter_models;
pub mod filter_service;

pub use filter_models::*;
pub use filter_service::*;
