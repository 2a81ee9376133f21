use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub entity_type: String,
    pub display_name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(id: i64, entity_type: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: EntityId(id),
            entity_type: entity_type.into(),
            display_name: display_name.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::from(self.id.0));
        object.insert("entity_type".to_string(), Value::from(self.entity_type.clone()));
        object.insert("display_name".to_string(), Value::from(self.display_name.clone()));
        Value::Object(object)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    #[default]
    Unresolved,
    Pending,
    Resolved,
    Missing,
    Failed,
}

impl ResolutionState {
    /// Forward-only transitions. Returning to `Unresolved` is only possible
    /// through explicit invalidation on the context.
    pub fn can_transition_to(self, next: ResolutionState) -> bool {
        use ResolutionState::{Failed, Missing, Pending, Resolved, Unresolved};

        matches!(
            (self, next),
            (Unresolved, Pending)
                | (Pending, Pending)
                | (Pending, Resolved)
                | (Pending, Missing)
                | (Pending, Failed)
                | (Missing, Resolved)
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityResolution {
    pub state: ResolutionState,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
}

impl EntityResolution {
    pub fn resolved_id(&self) -> Option<EntityId> {
        match self.state {
            ResolutionState::Resolved => self.entity_id,
            _ => None,
        }
    }
}

/// Caller-supplied predicate narrowing search hits.
#[derive(Clone)]
pub struct EntityFilter(Arc<dyn Fn(&EntityRecord) -> bool + Send + Sync>);

impl EntityFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&EntityRecord) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    pub fn field_equals(field: impl Into<String>, expected: Value) -> Self {
        let field = field.into();
        Self::new(move |record| record.fields.get(&field) == Some(&expected))
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        (self.0)(record)
    }
}

impl fmt::Debug for EntityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntityFilter(..)")
    }
}

/// Nested guided interaction used to create a referenced entity that does not
/// exist yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorkflowRef {
    pub workflow_id: String,
    /// Child field that receives the unresolved identifier, e.g. `name`.
    #[serde(default)]
    pub identifier_as: Option<String>,
    /// Child field <- parent data key. Only these keys cross into the child.
    #[serde(default)]
    pub seed: BTreeMap<String, String>,
    /// Child result key -> parent data key. Only these keys flow back.
    #[serde(default)]
    pub merge: BTreeMap<String, String>,
}

impl SubWorkflowRef {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self { workflow_id: workflow_id.into(), ..Self::default() }
    }

    pub fn identifier_as(mut self, child_field: impl Into<String>) -> Self {
        self.identifier_as = Some(child_field.into());
        self
    }

    pub fn seed(mut self, child_field: impl Into<String>, parent_key: impl Into<String>) -> Self {
        self.seed.insert(child_field.into(), parent_key.into());
        self
    }

    pub fn merge(mut self, child_key: impl Into<String>, parent_key: impl Into<String>) -> Self {
        self.merge.insert(child_key.into(), parent_key.into());
        self
    }
}

/// How a workflow binds one of its fields to a domain entity type.
///
/// Single-cardinality configs read the identifier from `field` and store the
/// resolved id under `<field>_id`. List configs (`multiple`) treat `field` as
/// an array of objects, read each element's `identifier_field`, and store the
/// id under `<identifier_field>_id` inside the element.
#[derive(Clone, Debug)]
pub struct EntityConfig {
    pub field: String,
    pub entity_type: String,
    pub identifier_field: String,
    pub search_fields: Vec<String>,
    pub multiple: bool,
    pub item_required_fields: Vec<String>,
    pub sub_workflow: Option<SubWorkflowRef>,
    pub create_if_missing: bool,
    pub confirm_before_create: bool,
    pub filter: Option<EntityFilter>,
    pub prompt: Option<String>,
}

impl EntityConfig {
    pub fn single(field: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            identifier_field: field.clone(),
            field,
            entity_type: entity_type.into(),
            search_fields: vec!["name".to_string()],
            multiple: false,
            item_required_fields: Vec::new(),
            sub_workflow: None,
            create_if_missing: false,
            confirm_before_create: false,
            filter: None,
            prompt: None,
        }
    }

    pub fn list(
        field: impl Into<String>,
        identifier_field: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            identifier_field: identifier_field.into(),
            multiple: true,
            ..Self::single(field, entity_type)
        }
    }

    pub fn search_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn require_item_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sub_workflow(mut self, sub_workflow: SubWorkflowRef) -> Self {
        self.sub_workflow = Some(sub_workflow);
        self
    }

    pub fn allow_direct_create(mut self, confirm_first: bool) -> Self {
        self.create_if_missing = true;
        self.confirm_before_create = confirm_first;
        self
    }

    pub fn with_filter(mut self, filter: EntityFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn id_key(&self) -> String {
        format!("{}_id", self.identifier_field)
    }

    /// Context key tracking the resolution state of one slot.
    pub fn state_key(&self, index: Option<usize>) -> String {
        match index {
            Some(index) => format!("{}[{index}]", self.field),
            None => self.field.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EntityConfig, EntityFilter, EntityRecord, ResolutionState};

    #[test]
    fn resolution_state_only_moves_forward() {
        use ResolutionState::{Failed, Missing, Pending, Resolved, Unresolved};

        assert!(Unresolved.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Resolved));
        assert!(Pending.can_transition_to(Missing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Missing.can_transition_to(Resolved));

        assert!(!Unresolved.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Pending));
        assert!(!Resolved.can_transition_to(Unresolved));
        assert!(!Failed.can_transition_to(Resolved));
        assert!(!Missing.can_transition_to(Pending));
    }

    #[test]
    fn field_filter_matches_exact_values() {
        let filter = EntityFilter::field_equals("active", json!(true));
        let active = EntityRecord::new(1, "customer", "Acme").with_field("active", json!(true));
        let inactive = EntityRecord::new(2, "customer", "Acme").with_field("active", json!(false));

        assert!(filter.matches(&active));
        assert!(!filter.matches(&inactive));
    }

    #[test]
    fn list_config_keys_use_identifier_field() {
        let config = EntityConfig::list("items", "product", "product");
        assert_eq!(config.id_key(), "product_id");
        assert_eq!(config.state_key(Some(2)), "items[2]");

        let single = EntityConfig::single("customer", "customer");
        assert_eq!(single.id_key(), "customer_id");
        assert_eq!(single.state_key(None), "customer");
    }
}
