use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use parley_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

pub const IN_MEMORY_URL: &str = "sqlite::memory:";

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_from_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Fresh private database, used by tests and the demo harness.
pub async fn connect_in_memory() -> Result<DbPool, sqlx::Error> {
    connect_with_settings(IN_MEMORY_URL, 1, 30).await
}

/// Opens the pool. An in-memory database is pinned to a single connection so
/// every query sees the same schema.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let max_connections = if is_in_memory(database_url) { 1 } else { max_connections.max(1) };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    debug!(event_name = "db.pool.connected", max_connections, "database pool opened");
    Ok(pool)
}

pub fn is_in_memory(database_url: &str) -> bool {
    let rest = database_url.trim().trim_start_matches("sqlite:").trim_start_matches("//");
    rest == ":memory:" || rest.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{connect, connect_in_memory, connect_with_settings, is_in_memory};

    #[test]
    fn recognizes_in_memory_urls() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory("sqlite://file:ledger?mode=memory&cache=shared"));
        assert!(!is_in_memory("sqlite://parley.db"));
        assert!(!is_in_memory("sqlite:data/parley.db"));
    }

    #[tokio::test]
    async fn in_memory_pools_share_one_schema() {
        let pool = connect_with_settings("sqlite::memory:", 8, 30).await.expect("connect");
        assert_eq!(pool.options().get_max_connections(), 1);

        sqlx::query("CREATE TABLE scratch (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .expect("create");
        let row = sqlx::query("SELECT COUNT(*) AS count FROM scratch")
            .fetch_one(&pool)
            .await
            .expect("select");
        assert_eq!(row.get::<i64, _>("count"), 0);
    }

    #[tokio::test]
    async fn connect_in_memory_opens_a_usable_pool() {
        let pool = connect_in_memory().await.expect("connect");
        let row = sqlx::query("SELECT 1 AS one").fetch_one(&pool).await.expect("select");
        assert_eq!(row.get::<i64, _>("one"), 1);
    }

    #[tokio::test]
    async fn default_settings_still_pin_memory_urls() {
        let pool = connect("sqlite::memory:").await.expect("connect");
        assert_eq!(pool.options().get_max_connections(), 1);
    }
}
