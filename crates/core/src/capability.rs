//! Capability surface every creatable domain type implements.
//!
//! The catalog, extractor and resolver depend only on this interface; they
//! never inspect concrete entity types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::action::{humanize, FieldSpec};
use crate::domain::entity::{EntityFilter, EntityRecord};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity_type} rejected the request: {message}")]
    Rejected { entity_type: String, message: String },
    #[error("unknown entity type `{0}`")]
    UnknownType(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

impl CapabilityError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Validation(_) => "capability.validation",
            Self::Rejected { .. } => "capability.rejected",
            Self::UnknownType(_) => "capability.unknown_type",
            Self::Backend(_) => "capability.backend",
        }
    }
}

#[async_trait]
pub trait EntityCapability: Send + Sync {
    fn entity_type(&self) -> &str;

    fn label(&self) -> String {
        humanize(self.entity_type())
    }

    fn description(&self) -> String {
        format!("Create a new {}", self.label().to_lowercase())
    }

    fn field_schema(&self) -> BTreeMap<String, FieldSpec>;

    /// JSON schema for schema-constrained extraction, when the type has one.
    fn strict_schema(&self) -> Option<Value> {
        None
    }

    /// Fields the type needs on top of the schema's own `required` flags.
    fn critical_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn triggers(&self) -> Vec<String> {
        let noun = self.label().to_lowercase();
        vec![format!("create {noun}"), format!("add {noun}"), format!("new {noun}")]
    }

    /// Guided workflow bound to this type; its presence turns the derived
    /// action into a workflow-backed one.
    fn bound_workflow(&self) -> Option<String> {
        None
    }

    fn search_filter(&self) -> Option<EntityFilter> {
        None
    }

    async fn create(
        &self,
        params: &Map<String, Value>,
        user_id: &str,
    ) -> Result<EntityRecord, CapabilityError>;

    async fn search(&self, field: &str, value: &str) -> Result<Vec<EntityRecord>, CapabilityError>;
}

#[derive(Clone, Default)]
pub struct EntityRegistry {
    types: BTreeMap<String, Arc<dyn EntityCapability>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(&mut self, capability: C)
    where
        C: EntityCapability + 'static,
    {
        self.register_shared(Arc::new(capability));
    }

    pub fn register_shared(&mut self, capability: Arc<dyn EntityCapability>) {
        self.types.insert(capability.entity_type().to_string(), capability);
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityCapability>> {
        self.types.get(entity_type).cloned()
    }

    pub fn require(&self, entity_type: &str) -> Result<Arc<dyn EntityCapability>, CapabilityError> {
        self.get(entity_type).ok_or_else(|| CapabilityError::UnknownType(entity_type.to_string()))
    }

    pub fn type_ids(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry").field("types", &self.type_ids()).finish()
    }
}
