use chrono::Utc;
use sqlx::Row;
use tracing::debug;

use parley_core::context::UnifiedContext;

use super::{ContextStore, RepositoryError};
use crate::DbPool;

pub struct SqlContextStore {
    pool: DbPool,
}

impl SqlContextStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ContextStore for SqlContextStore {
    async fn load(&self, session_id: &str) -> Result<Option<UnifiedContext>, RepositoryError> {
        let row = sqlx::query("SELECT payload_json FROM conversation_context WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String =
            row.try_get("payload_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
        let context = serde_json::from_str::<UnifiedContext>(&payload)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        Ok(Some(context))
    }

    async fn save(&self, context: &UnifiedContext) -> Result<(), RepositoryError> {
        let payload =
            serde_json::to_string(context).map_err(|e| RepositoryError::Decode(e.to_string()))?;

        sqlx::query(
            "INSERT INTO conversation_context (session_id, user_id, current_workflow,
                                               payload_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 current_workflow = excluded.current_workflow,
                 payload_json = excluded.payload_json,
                 updated_at = excluded.updated_at",
        )
        .bind(&context.session_id)
        .bind(&context.user_id)
        .bind(&context.current_workflow)
        .bind(&payload)
        .bind(context.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            event_name = "persistence.context_saved",
            session_id = %context.session_id,
            depth = context.depth(),
            bytes = payload.len(),
            "conversation context saved"
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM conversation_context WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use parley_core::context::{Role, UnifiedContext};
    use parley_core::domain::entity::EntityId;

    use super::SqlContextStore;
    use crate::repositories::ContextStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlContextStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlContextStore::new(pool)
    }

    #[tokio::test]
    async fn nested_context_survives_a_save_load_cycle() {
        let store = store().await;
        let mut context = UnifiedContext::new("sess-9", "user-3");
        context.push_message(Role::User, "create invoice for Globex");
        context.begin_workflow("create_invoice", Map::new());
        context.workflow_state.insert("customer".to_string(), json!("Globex"));
        context.mark_entity_pending("customer", "Globex").expect("pending");
        context.mark_entity_missing("customer").expect("missing");
        context.enter_sub_workflow("create_customer", Map::new()).expect("enter");

        store.save(&context).await.expect("save");
        let loaded = store.load("sess-9").await.expect("load").expect("present");

        assert_eq!(loaded, context);
        assert_eq!(loaded.depth(), 1);
        assert_eq!(loaded.current_workflow.as_deref(), Some("create_customer"));
    }

    #[tokio::test]
    async fn save_upserts_existing_rows() {
        let store = store().await;
        let mut context = UnifiedContext::new("sess-1", "user-1");
        store.save(&context).await.expect("first save");

        context.mark_entity_pending("customer", "Acme").expect("pending");
        context.mark_entity_resolved("customer", EntityId(4)).expect("resolved");
        store.save(&context).await.expect("second save");

        let loaded = store.load("sess-1").await.expect("load").expect("present");
        assert_eq!(loaded.entity("customer").resolved_id(), Some(EntityId(4)));

        assert!(store.delete("sess-1").await.expect("delete"));
        assert!(store.load("sess-1").await.expect("load").is_none());
    }
}
