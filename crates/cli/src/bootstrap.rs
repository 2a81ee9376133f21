//! Shared startup for commands that need the database or the runtime.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use parley_agent::{AgentRuntime, DisabledLlmClient, HttpLlmClient, LlmClient};
use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use parley_core::errors::ApplicationError;
use parley_db::{connect_from_config, migrations, DbPool, DemoLedger, SqlContextStore};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialize async runtime: {0}")]
    RuntimeInit(#[source] std::io::Error),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("agent runtime could not be built: {0}")]
    Runtime(#[source] ApplicationError),
}

impl BootstrapError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_validation",
            Self::RuntimeInit(_) => "runtime_init",
            Self::DatabaseConnect(_) => "db_connectivity",
            Self::Migration(_) => "migration",
            Self::Runtime(_) => "agent_runtime",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::RuntimeInit(_) => 3,
            Self::DatabaseConnect(_) => 4,
            Self::Migration(_) | Self::Runtime(_) => 5,
        }
    }
}

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub ledger: DemoLedger,
}

pub fn current_thread_runtime() -> Result<tokio::runtime::Runtime, BootstrapError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(BootstrapError::RuntimeInit)
}

/// Loads configuration, connects and migrates the database.
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let ledger = DemoLedger::new(db_pool.clone());
    Ok(Application { config, db_pool, ledger })
}

impl Application {
    /// Runtime over the demo ledger, storing sessions in the same database.
    pub fn agent_runtime(&self) -> Result<AgentRuntime, BootstrapError> {
        let llm: Arc<dyn LlmClient> = match HttpLlmClient::from_config(&self.config.llm) {
            Ok(client) => {
                info!(
                    event_name = "system.bootstrap.llm_configured",
                    endpoint = client.endpoint(),
                    model = %self.config.llm.model,
                    "language model client configured"
                );
                Arc::new(client)
            }
            Err(error) => {
                warn!(
                    event_name = "system.bootstrap.llm_disabled",
                    error = %error,
                    "language model unavailable; only deterministic parsing will run"
                );
                Arc::new(DisabledLlmClient)
            }
        };

        AgentRuntime::builder(
            Arc::new(self.ledger.registry()),
            Arc::new(SqlContextStore::new(self.db_pool.clone())),
        )
        .llm(llm)
        .catalog_config(self.config.catalog.clone())
        .extraction(self.config.extraction)
        .workflows(self.ledger.workflows())
        .build()
        .map_err(BootstrapError::Runtime)
    }
}
