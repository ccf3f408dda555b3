// Implementations of QuotaStore.
#![allow(unused_imports)]

pub mod in_memory;
pub mod sqlite_store;

pub use in_memory::InMemoryQuotaStore;
pub use sqlite_store::SqliteQuotaStore;
