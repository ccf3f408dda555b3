// Implementations of BotStore.
#![allow(unused_imports)]

pub mod in_memory;
pub mod sqlite_store;

pub use in_memory::InMemoryBotStore;
pub use sqlite_store::SqliteBotStore;
