use async_trait::async_trait;
use thiserror::Error;

use parley_core::context::UnifiedContext;

pub mod context;
pub mod ledger;
pub mod memory;

pub use context::SqlContextStore;
pub use ledger::{InvoiceLine, SqlLedgerRepository, StoredInvoice};
pub use memory::InMemoryContextStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Persists the whole per-session context. A turn loads it once at the start
/// and writes it back in full at the end.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<UnifiedContext>, RepositoryError>;
    async fn save(&self, context: &UnifiedContext) -> Result<(), RepositoryError>;
    async fn delete(&self, session_id: &str) -> Result<bool, RepositoryError>;
}
