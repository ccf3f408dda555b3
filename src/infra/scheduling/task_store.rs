// Implementations of TaskStore.
#![allow(unused_imports)]

pub mod in_memory;
pub mod sqlite_store;

pub use in_memory::InMemoryTaskStore;
pub use sqlite_store::SqliteTaskStore;
