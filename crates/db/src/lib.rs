pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{
    connect, connect_from_config, connect_in_memory, connect_with_settings, DbPool, IN_MEMORY_URL,
};
pub use fixtures::{DemoLedger, SeedSummary};
pub use repositories::{ContextStore, InMemoryContextStore, RepositoryError, SqlContextStore};
