use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    LocalCreate,
    RemoteCreate,
    Workflow,
    Custom,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalCreate => "local_create",
            Self::RemoteCreate => "remote_create",
            Self::Workflow => "workflow",
            Self::Custom => "custom",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Entity,
}

impl FieldType {
    pub fn json_type(&self) -> &'static str {
        match self {
            Self::String | Self::Entity => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One entry of an action's field schema. Array fields describe their element
/// shape through `items`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl FieldSpec {
    pub fn new(field_type: FieldType, description: impl Into<String>) -> Self {
        Self { field_type, description: description.into(), ..Self::default() }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new(FieldType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::new(FieldType::Number, description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::new(FieldType::Integer, description)
    }

    pub fn entity(entity_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self { entity_type: Some(entity_type.into()), ..Self::new(FieldType::Entity, description) }
    }

    pub fn array(description: impl Into<String>, items: BTreeMap<String, FieldSpec>) -> Self {
        Self { items, ..Self::new(FieldType::Array, description) }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn referencing(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Scalars are collected directly from the message; entity references and
    /// arrays are left to entity resolution.
    pub fn is_scalar(&self) -> bool {
        !matches!(self.field_type, FieldType::Array | FieldType::Object | FieldType::Entity)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOrigin {
    Local,
    Remote {
        node_id: String,
    },
    #[default]
    Static,
}

impl ActionOrigin {
    pub fn label(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Remote { .. } => "remote",
            Self::Static => "static",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub node_id: String,
    pub base_url: String,
}

/// Alternate root-level name that belongs inside an array field's elements,
/// e.g. `price` -> `items[].unit_price`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAlias {
    pub array_field: String,
    pub item_field: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub executor: ExecutorKind,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub peer: Option<PeerRef>,
    #[serde(default)]
    pub origin: ActionOrigin,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub param_aliases: BTreeMap<String, ItemAlias>,
}

fn default_enabled() -> bool {
    true
}

impl ActionDefinition {
    pub fn new(id: impl Into<String>, executor: ExecutorKind) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            description: String::new(),
            executor,
            fields: BTreeMap::new(),
            required_params: Vec::new(),
            optional_params: Vec::new(),
            triggers: Vec::new(),
            entity_type: None,
            workflow_id: None,
            peer: None,
            origin: ActionOrigin::Static,
            enabled: true,
            param_aliases: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers.extend(triggers.into_iter().map(Into::into));
        self
    }

    pub fn for_entity(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_alias(
        mut self,
        alias: impl Into<String>,
        array_field: impl Into<String>,
        item_field: impl Into<String>,
    ) -> Self {
        self.param_aliases.insert(
            alias.into(),
            ItemAlias { array_field: array_field.into(), item_field: item_field.into() },
        );
        self
    }

    /// Fills defaults and aligns the parameter lists with the field schema.
    ///
    /// Every name in `required_params` ends up as a required field, every
    /// required field ends up in `required_params`, and `optional_params` is
    /// whatever remains.
    pub fn normalized(mut self) -> Self {
        if self.label.trim().is_empty() {
            self.label = humanize(&self.id);
        }
        if self.description.trim().is_empty() {
            self.description = self.label.clone();
        }

        for name in &self.required_params {
            let field = self
                .fields
                .entry(name.clone())
                .or_insert_with(|| FieldSpec::string(humanize(name)));
            field.required = true;
        }

        let mut seen = BTreeSet::new();
        let mut required = Vec::new();
        for name in self.required_params.iter().chain(
            self.fields.iter().filter(|(_, spec)| spec.required).map(|(name, _)| name),
        ) {
            if seen.insert(name.clone()) {
                required.push(name.clone());
            }
        }
        self.required_params = required;
        self.optional_params =
            self.fields.keys().filter(|name| !seen.contains(*name)).cloned().collect();

        let mut triggers = BTreeSet::new();
        self.triggers.retain(|trigger| {
            let normalized = trigger.trim().to_lowercase();
            !normalized.is_empty() && triggers.insert(normalized)
        });
        self.triggers = self.triggers.iter().map(|trigger| trigger.trim().to_lowercase()).collect();

        self
    }

    pub fn declares_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn is_triggered_by(&self, message: &str) -> bool {
        let normalized = message.to_lowercase();
        self.triggers.iter().any(|trigger| normalized.contains(trigger.as_str()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub params: Map<String, Value>,
    pub missing: Vec<String>,
    pub confidence: f64,
    pub duration_ms: u64,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub params: Map<String, Value>,
    pub ready: bool,
    pub missing: Vec<String>,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub action_id: String,
    pub action_type: ExecutorKind,
    pub label: String,
    pub payload: InvocationPayload,
}

impl ActionInvocation {
    pub fn from_extraction(definition: &ActionDefinition, extraction: ExtractionResult) -> Self {
        Self {
            action_id: definition.id.clone(),
            action_type: definition.executor,
            label: definition.label.clone(),
            payload: InvocationPayload {
                ready: extraction.missing.is_empty(),
                params: extraction.params,
                missing: extraction.missing,
                confidence: extraction.confidence,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    NeedsInput,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub action_id: String,
    pub action_label: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Outcome of one dispatch. `success` is false only for failures; a result
/// that still needs user input is successful but not completed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub status: ResultStatus,
    pub message: String,
    pub data: Value,
    pub error: Option<String>,
    pub metadata: ResultMetadata,
}

impl ActionResult {
    pub fn completed(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            status: ResultStatus::Completed,
            message: non_empty(message.into(), "Done."),
            data,
            error: None,
            metadata: ResultMetadata::default(),
        }
    }

    pub fn needs_input(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            status: ResultStatus::NeedsInput,
            message: non_empty(message.into(), "I need a bit more information."),
            data,
            error: None,
            metadata: ResultMetadata::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = non_empty(error.into(), "action failed");
        Self {
            success: false,
            status: ResultStatus::Failed,
            message: error.clone(),
            data: Value::Null,
            error: Some(error),
            metadata: ResultMetadata::default(),
        }
    }

    pub fn with_error_class(mut self, error_class: impl Into<String>) -> Self {
        self.metadata.error_class = Some(error_class.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }

    pub fn stamped(mut self, definition_id: &str, label: &str, duration_ms: u64) -> Self {
        self.metadata.action_id = definition_id.to_string();
        self.metadata.action_label = label.to_string();
        self.metadata.duration_ms = duration_ms;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    pub fn needs_more_input(&self) -> bool {
        self.status == ResultStatus::NeedsInput
    }
}

fn non_empty(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

pub fn humanize(identifier: &str) -> String {
    let spaced = identifier.replace(['_', '.', '-'], " ");
    let mut words = spaced.split_whitespace();
    let Some(first) = words.next() else {
        return String::new();
    };
    let mut label = String::new();
    let mut chars = first.chars();
    if let Some(head) = chars.next() {
        label.extend(head.to_uppercase());
        label.push_str(chars.as_str());
    }
    for word in words {
        label.push(' ');
        label.push_str(word);
    }
    label
}
