use std::collections::HashMap;

use tokio::sync::RwLock;

use parley_core::context::UnifiedContext;

use super::{ContextStore, RepositoryError};

#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: RwLock<HashMap<String, UnifiedContext>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ContextStore for InMemoryContextStore {
    async fn load(&self, session_id: &str) -> Result<Option<UnifiedContext>, RepositoryError> {
        let contexts = self.contexts.read().await;
        Ok(contexts.get(session_id).cloned())
    }

    async fn save(&self, context: &UnifiedContext) -> Result<(), RepositoryError> {
        let mut contexts = self.contexts.write().await;
        contexts.insert(context.session_id.clone(), context.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, RepositoryError> {
        let mut contexts = self.contexts.write().await;
        Ok(contexts.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use parley_core::context::{Role, UnifiedContext};

    use crate::repositories::{ContextStore, InMemoryContextStore};

    #[tokio::test]
    async fn in_memory_store_keeps_latest_snapshot_per_session() {
        let store = InMemoryContextStore::default();
        let mut context = UnifiedContext::new("sess-1", "user-1");
        context.push_message(Role::User, "create invoice");
        store.save(&context).await.expect("save");

        context.push_message(Role::Assistant, "Which customer?");
        store.save(&context).await.expect("save again");

        let loaded = store.load("sess-1").await.expect("load").expect("present");
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(store.len().await, 1);
        assert!(store.load("sess-2").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_session_existed() {
        let store = InMemoryContextStore::default();
        store.save(&UnifiedContext::new("sess-1", "user-1")).await.expect("save");

        assert!(store.delete("sess-1").await.expect("delete"));
        assert!(!store.delete("sess-1").await.expect("delete again"));
        assert!(store.is_empty().await);
    }
}
