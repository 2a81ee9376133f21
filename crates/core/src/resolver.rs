//! Maps free-text identifiers onto concrete entity records.
//!
//! Resolution order for one slot:
//! 1. an id already resolved in context, or bound in workflow data, wins;
//! 2. otherwise the identifier is looked up by exact, case-insensitive match
//!    across the configured search fields, narrowed by the config's filter and
//!    the capability's own search filter;
//! 3. zero hits either create the record directly (when allowed without
//!    confirmation) or report the slot as missing so the caller can ask or
//!    start a sub-workflow.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capability::{CapabilityError, EntityRegistry};
use crate::context::UnifiedContext;
use crate::domain::entity::{EntityConfig, EntityId, EntityRecord, ResolutionState};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Resolved { id: EntityId, record: Option<EntityRecord> },
    /// More than one record matched; the slot stays pending until one is chosen.
    Ambiguous(Vec<EntityRecord>),
    Missing,
    Created(EntityRecord),
    NeedsIdentifier,
}

impl Resolution {
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            Self::Resolved { id, .. } => Some(*id),
            Self::Created(record) => Some(record.id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no capability registered for entity type `{0}`")]
    UnknownEntityType(String),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl ResolutionError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::UnknownEntityType(_) => "resolution.unknown_type",
            Self::Capability(error) => error.error_class(),
            Self::Domain(_) => "resolution.domain",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EntityResolver {
    registry: Arc<EntityRegistry>,
}

impl EntityResolver {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Resolves the slot tracked under `key` and records the outcome in the
    /// context's entity states.
    pub async fn resolve(
        &self,
        config: &EntityConfig,
        key: &str,
        identifier: Option<&str>,
        bound_id: Option<EntityId>,
        context: &mut UnifiedContext,
    ) -> Result<Resolution, ResolutionError> {
        if let Some(id) = context.entity(key).resolved_id() {
            return Ok(Resolution::Resolved { id, record: None });
        }

        if let Some(id) = bound_id {
            self.bind(key, identifier.unwrap_or_default(), id, context)?;
            return Ok(Resolution::Resolved { id, record: None });
        }

        let Some(identifier) = identifier.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(Resolution::NeedsIdentifier);
        };

        self.begin(key, identifier, context)?;
        let matches = match self.search(config, identifier).await {
            Ok(matches) => matches,
            Err(error) => {
                context.mark_entity_failed(key)?;
                warn!(
                    event_name = "resolver.search_failed",
                    entity_type = %config.entity_type,
                    key,
                    error = %error,
                    "entity search failed"
                );
                return Err(error);
            }
        };

        debug!(
            event_name = "resolver.searched",
            entity_type = %config.entity_type,
            key,
            identifier,
            hits = matches.len(),
            "entity lookup finished"
        );

        match matches.len() {
            0 if config.create_if_missing && !config.confirm_before_create => {
                let mut params = Map::new();
                let name_field =
                    config.search_fields.first().cloned().unwrap_or_else(|| "name".to_string());
                params.insert(name_field, Value::from(identifier));
                let record = self.create_missing(config, key, &params, context).await?;
                Ok(Resolution::Created(record))
            }
            0 => {
                context.mark_entity_missing(key)?;
                Ok(Resolution::Missing)
            }
            1 => {
                let record = matches.into_iter().next().ok_or_else(|| {
                    DomainError::InvariantViolation("single match vanished".to_string())
                })?;
                context.mark_entity_resolved(key, record.id)?;
                Ok(Resolution::Resolved { id: record.id, record: Some(record) })
            }
            _ => Ok(Resolution::Ambiguous(matches)),
        }
    }

    /// Exact, case-insensitive lookup across the configured search fields.
    pub async fn search(
        &self,
        config: &EntityConfig,
        identifier: &str,
    ) -> Result<Vec<EntityRecord>, ResolutionError> {
        let capability = self
            .registry
            .get(&config.entity_type)
            .ok_or_else(|| ResolutionError::UnknownEntityType(config.entity_type.clone()))?;
        let type_filter = capability.search_filter();

        let mut seen = BTreeSet::new();
        let mut matches = Vec::new();
        for field in &config.search_fields {
            for record in capability.search(field, identifier).await? {
                if !exact_match(&record, field, identifier) {
                    continue;
                }
                if config.filter.as_ref().is_some_and(|filter| !filter.matches(&record)) {
                    continue;
                }
                if type_filter.as_ref().is_some_and(|filter| !filter.matches(&record)) {
                    continue;
                }
                if seen.insert(record.id) {
                    matches.push(record);
                }
            }
        }
        Ok(matches)
    }

    /// Creates the referenced record through its capability and resolves the
    /// slot to it.
    pub async fn create_missing(
        &self,
        config: &EntityConfig,
        key: &str,
        params: &Map<String, Value>,
        context: &mut UnifiedContext,
    ) -> Result<EntityRecord, ResolutionError> {
        let capability = self
            .registry
            .get(&config.entity_type)
            .ok_or_else(|| ResolutionError::UnknownEntityType(config.entity_type.clone()))?;

        match capability.create(params, &context.user_id).await {
            Ok(record) => {
                self.bind(key, &record.display_name, record.id, context)?;
                Ok(record)
            }
            Err(error) => {
                if context.entity(key).state == ResolutionState::Pending {
                    context.mark_entity_failed(key)?;
                }
                Err(error.into())
            }
        }
    }

    /// Settles an ambiguous or missing slot onto a chosen record.
    pub fn select(
        &self,
        key: &str,
        record: &EntityRecord,
        context: &mut UnifiedContext,
    ) -> Result<(), ResolutionError> {
        self.bind(key, &record.display_name, record.id, context)
    }

    fn begin(
        &self,
        key: &str,
        identifier: &str,
        context: &mut UnifiedContext,
    ) -> Result<(), ResolutionError> {
        match context.entity(key).state {
            ResolutionState::Unresolved | ResolutionState::Pending => {
                context.mark_entity_pending(key, identifier)?;
            }
            // A new identifier after a miss or failure starts a fresh attempt.
            ResolutionState::Missing | ResolutionState::Failed => {
                context.invalidate_entity(key);
                context.mark_entity_pending(key, identifier)?;
            }
            ResolutionState::Resolved => {}
        }
        Ok(())
    }

    fn bind(
        &self,
        key: &str,
        identifier: &str,
        id: EntityId,
        context: &mut UnifiedContext,
    ) -> Result<(), ResolutionError> {
        match context.entity(key).state {
            ResolutionState::Unresolved => {
                context.mark_entity_pending(key, identifier)?;
            }
            ResolutionState::Failed => {
                context.invalidate_entity(key);
                context.mark_entity_pending(key, identifier)?;
            }
            _ => {}
        }
        context.mark_entity_resolved(key, id)?;
        Ok(())
    }
}

fn exact_match(record: &EntityRecord, field: &str, identifier: &str) -> bool {
    let wanted = identifier.trim().to_lowercase();
    let field_hit = record
        .fields
        .get(field)
        .map(|value| match value {
            Value::String(text) => text.trim().to_lowercase() == wanted,
            other => other.to_string() == wanted,
        })
        .unwrap_or(false);
    field_hit || (field == "name" && record.display_name.trim().to_lowercase() == wanted)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::{EntityResolver, Resolution, ResolutionError};
    use crate::capability::{CapabilityError, EntityCapability, EntityRegistry};
    use crate::context::UnifiedContext;
    use crate::domain::action::FieldSpec;
    use crate::domain::entity::{
        EntityConfig, EntityFilter, EntityId, EntityRecord, ResolutionState,
    };

    struct Customers {
        rows: Mutex<Vec<EntityRecord>>,
        next_id: AtomicI64,
    }

    impl Customers {
        fn seeded(names: &[(i64, &str, &str)]) -> Self {
            let rows = names
                .iter()
                .map(|(id, name, region)| {
                    EntityRecord::new(*id, "customer", *name)
                        .with_field("name", json!(name))
                        .with_field("region", json!(region))
                })
                .collect();
            Self { rows: Mutex::new(rows), next_id: AtomicI64::new(100) }
        }
    }

    #[async_trait]
    impl EntityCapability for Customers {
        fn entity_type(&self) -> &str {
            "customer"
        }

        fn field_schema(&self) -> BTreeMap<String, FieldSpec> {
            BTreeMap::from([("name".to_string(), FieldSpec::string("Name").required())])
        }

        async fn create(
            &self,
            params: &Map<String, Value>,
            _user_id: &str,
        ) -> Result<EntityRecord, CapabilityError> {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| CapabilityError::Validation("name is required".to_string()))?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let record = EntityRecord::new(id, "customer", name).with_field("name", json!(name));
            self.rows.lock().expect("rows").push(record.clone());
            Ok(record)
        }

        async fn search(
            &self,
            field: &str,
            value: &str,
        ) -> Result<Vec<EntityRecord>, CapabilityError> {
            let needle = value.to_lowercase();
            Ok(self
                .rows
                .lock()
                .expect("rows")
                .iter()
                .filter(|row| {
                    row.field_str(field).is_some_and(|text| text.to_lowercase().contains(&needle))
                })
                .cloned()
                .collect())
        }
    }

    fn resolver(customers: Customers) -> EntityResolver {
        let mut registry = EntityRegistry::new();
        registry.register(customers);
        EntityResolver::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn single_exact_match_resolves_and_persists_id() {
        let resolver =
            resolver(Customers::seeded(&[(1, "Acme Corp", "eu"), (2, "Acme Corporation", "us")]));
        let config = EntityConfig::single("customer", "customer");
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("acme corp"), None, &mut context)
            .await
            .expect("resolve");

        assert_eq!(resolution.entity_id(), Some(EntityId(1)));
        assert_eq!(context.entity("customer").state, ResolutionState::Resolved);
    }

    #[tokio::test]
    async fn duplicate_names_surface_as_ambiguous() {
        let resolver =
            resolver(Customers::seeded(&[(1, "Acme Corp", "eu"), (2, "Acme Corp", "us")]));
        let config = EntityConfig::single("customer", "customer");
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("Acme Corp"), None, &mut context)
            .await
            .expect("resolve");

        let Resolution::Ambiguous(candidates) = resolution else {
            panic!("expected ambiguity, got {resolution:?}");
        };
        assert_eq!(candidates.len(), 2);
        assert_eq!(context.entity("customer").state, ResolutionState::Pending);

        resolver.select("customer", &candidates[1], &mut context).expect("select");
        assert_eq!(context.entity("customer").resolved_id(), Some(EntityId(2)));
    }

    #[tokio::test]
    async fn caller_filter_narrows_matches() {
        let resolver =
            resolver(Customers::seeded(&[(1, "Acme Corp", "eu"), (2, "Acme Corp", "us")]));
        let config = EntityConfig::single("customer", "customer")
            .with_filter(EntityFilter::field_equals("region", json!("us")));
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("Acme Corp"), None, &mut context)
            .await
            .expect("resolve");
        assert_eq!(resolution.entity_id(), Some(EntityId(2)));
    }

    #[tokio::test]
    async fn bound_id_short_circuits_lookup() {
        let resolver = resolver(Customers::seeded(&[]));
        let config = EntityConfig::single("customer", "customer");
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("Nobody"), Some(EntityId(55)), &mut context)
            .await
            .expect("resolve");
        assert_eq!(resolution, Resolution::Resolved { id: EntityId(55), record: None });

        let again = resolver
            .resolve(&config, "customer", Some("Someone else"), None, &mut context)
            .await
            .expect("resolve");
        assert_eq!(again.entity_id(), Some(EntityId(55)));
    }

    #[tokio::test]
    async fn zero_hits_report_missing_without_create_path() {
        let resolver = resolver(Customers::seeded(&[]));
        let config = EntityConfig::single("customer", "customer");
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("Globex"), None, &mut context)
            .await
            .expect("resolve");
        assert_eq!(resolution, Resolution::Missing);
        assert_eq!(context.entity("customer").state, ResolutionState::Missing);
    }

    #[tokio::test]
    async fn zero_hits_create_directly_when_allowed() {
        let resolver = resolver(Customers::seeded(&[]));
        let config = EntityConfig::single("customer", "customer").allow_direct_create(false);
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("Globex"), None, &mut context)
            .await
            .expect("resolve");

        let Resolution::Created(record) = resolution else {
            panic!("expected creation, got {resolution:?}");
        };
        assert_eq!(record.display_name, "Globex");
        assert_eq!(context.entity("customer").resolved_id(), Some(record.id));
    }

    #[tokio::test]
    async fn unknown_entity_type_is_an_error() {
        let resolver = resolver(Customers::seeded(&[]));
        let config = EntityConfig::single("vendor", "vendor");
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let error = resolver
            .resolve(&config, "vendor", Some("Initech"), None, &mut context)
            .await
            .expect_err("unknown type");
        assert_eq!(error, ResolutionError::UnknownEntityType("vendor".to_string()));
        assert_eq!(context.entity("vendor").state, ResolutionState::Failed);
    }

    #[tokio::test]
    async fn empty_identifier_needs_input() {
        let resolver = resolver(Customers::seeded(&[]));
        let config = EntityConfig::single("customer", "customer");
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let resolution = resolver
            .resolve(&config, "customer", Some("  "), None, &mut context)
            .await
            .expect("resolve");
        assert_eq!(resolution, Resolution::NeedsIdentifier);
        assert_eq!(context.entity("customer").state, ResolutionState::Unresolved);
    }
}
