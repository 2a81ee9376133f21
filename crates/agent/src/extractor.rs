//! Turns a message plus an action-scoped slice of history into structured
//! parameters for one candidate action.
//!
//! The language model only proposes values. Merging, the missing list and
//! the confidence score are computed deterministically from the action's
//! declared schema.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use parley_core::capability::EntityRegistry;
use parley_core::config::ExtractionConfig;
use parley_core::context::{Role, UnifiedContext};
use parley_core::domain::action::{ActionDefinition, ExtractionResult, FieldSpec, FieldType};

use crate::llm::{LlmClient, LlmRequest};

/// Score given to an action that declares no fields at all, so generic
/// catch-alls never outrank a real match.
pub const NO_FIELDS_CONFIDENCE: f64 = 0.05;

const SYSTEM_INSTRUCTIONS: &str = "You convert user requests into JSON arguments. \
Extract only what the user explicitly stated. Omit every field that was not mentioned. \
Never guess, infer or invent values. Reply with a single JSON object and nothing else.";

/// How much conversation the extractor may look at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryScope {
    /// A brand-new invocation sees only the message that triggered it.
    CurrentMessage,
    /// Continuing an action sees history from its start index forward.
    Since(usize),
}

pub struct ParameterExtractor {
    llm: Arc<dyn LlmClient>,
    registry: Arc<EntityRegistry>,
    config: ExtractionConfig,
    max_tokens: u32,
}

impl ParameterExtractor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<EntityRegistry>,
        config: ExtractionConfig,
    ) -> Self {
        Self { llm, registry, config, max_tokens: 1024 }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn config(&self) -> ExtractionConfig {
        self.config
    }

    pub async fn extract(
        &self,
        message: &str,
        definition: &ActionDefinition,
        context: &UnifiedContext,
        scope: HistoryScope,
    ) -> ExtractionResult {
        let started = Instant::now();
        let transcript = scoped_transcript(message, context, scope);

        let capability =
            definition.entity_type.as_deref().and_then(|entity| self.registry.get(entity));
        let critical = capability.as_ref().map(|c| c.critical_fields()).unwrap_or_default();
        let request = match capability.as_ref().and_then(|c| c.strict_schema()) {
            Some(schema) => {
                LlmRequest::new(strict_prompt(definition, &transcript)).with_schema(schema)
            }
            None => LlmRequest::new(natural_prompt(definition, &transcript)),
        }
        .with_system(SYSTEM_INSTRUCTIONS)
        .with_max_tokens(self.max_tokens);

        let raw = match self.llm.complete(&request).await {
            Ok(response) => response.into_object().unwrap_or_default(),
            Err(error) => {
                warn!(
                    event_name = "agent.extractor.degraded",
                    action_id = %definition.id,
                    session_id = %context.session_id,
                    error_class = error.error_class(),
                    error = %error,
                    "extraction call failed; continuing with an empty extraction"
                );
                Map::new()
            }
        };

        let mut params = drop_empty(raw);
        merge_by_convention(&mut params, &definition.fields);
        merge_by_alias(&mut params, definition);
        if definition.declares_fields() {
            params.retain(|key, _| definition.fields.contains_key(key));
        }

        let missing = missing_params(&params, definition, &critical);
        let confidence = score(&params, definition, &critical, self.config.required_weight);
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(
            event_name = "agent.extractor.extracted",
            action_id = %definition.id,
            session_id = %context.session_id,
            params = params.len(),
            missing = missing.len(),
            confidence,
            duration_ms,
            "parameters extracted"
        );

        ExtractionResult { params, missing, confidence, duration_ms }
    }

    /// Re-scores an already merged parameter map against `definition`.
    pub fn assess(
        &self,
        params: Map<String, Value>,
        definition: &ActionDefinition,
    ) -> ExtractionResult {
        let critical = definition
            .entity_type
            .as_deref()
            .and_then(|entity| self.registry.get(entity))
            .map(|capability| capability.critical_fields())
            .unwrap_or_default();
        let missing = missing_params(&params, definition, &critical);
        let confidence = score(&params, definition, &critical, self.config.required_weight);
        ExtractionResult { params, missing, confidence, duration_ms: 0 }
    }
}

fn scoped_transcript(message: &str, context: &UnifiedContext, scope: HistoryScope) -> String {
    let mut lines = Vec::new();
    if let HistoryScope::Since(start) = scope {
        for entry in context.history_since(start) {
            let speaker = match entry.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            lines.push(format!("{speaker}: {}", entry.content));
        }
    }
    let already_last = context
        .history
        .last()
        .is_some_and(|entry| entry.role == Role::User && entry.content == message);
    if lines.is_empty() || !already_last {
        lines.push(format!("user: {message}"));
    }
    lines.join("\n")
}

fn strict_prompt(definition: &ActionDefinition, transcript: &str) -> String {
    format!(
        "Fill the arguments for \"{}\" ({}) from this conversation.\n\
         Use only values the user stated.\n\nConversation:\n{transcript}",
        definition.label, definition.description
    )
}

fn natural_prompt(definition: &ActionDefinition, transcript: &str) -> String {
    let mut prompt = format!(
        "Extract the arguments for the action \"{}\": {}.\n\nFields:\n",
        definition.label, definition.description
    );
    describe_fields(&definition.fields, 0, &mut prompt);

    if let Some(example) = example_object(&definition.fields) {
        prompt.push_str(&format!("\nExample output:\n{}\n", Value::Object(example)));
    }

    prompt.push_str(
        "\nRules:\n\
         - Extract only what the user explicitly stated.\n\
         - Omit any field that is not mentioned; never guess or fill in defaults.\n\
         - Put per-item values inside the matching array element.\n\
         - Reply with one JSON object.\n",
    );
    prompt.push_str(&format!("\nConversation:\n{transcript}"));
    prompt
}

fn describe_fields(fields: &BTreeMap<String, FieldSpec>, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for (name, spec) in fields {
        let requirement = if spec.required { "required" } else { "optional" };
        out.push_str(&format!(
            "{indent}- {name} ({}, {requirement}): {}",
            spec.field_type.json_type(),
            spec.description
        ));
        if let Some(hint) = &spec.hint {
            out.push_str(&format!(" Hint: {hint}."));
        }
        out.push('\n');
        if spec.field_type == FieldType::Array && !spec.items.is_empty() {
            out.push_str(&format!("{indent}  Each element has:\n"));
            describe_fields(&spec.items, depth + 2, out);
        }
    }
}

/// One example object assembled from the declared field examples.
fn example_object(fields: &BTreeMap<String, FieldSpec>) -> Option<Map<String, Value>> {
    let example: Map<String, Value> = fields
        .iter()
        .filter_map(|(name, spec)| spec.example.clone().map(|value| (name.clone(), value)))
        .collect();
    (!example.is_empty()).then_some(example)
}

pub fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(object)) => !object.is_empty(),
        Some(_) => true,
    }
}

fn drop_empty(params: Map<String, Value>) -> Map<String, Value> {
    params.into_iter().filter(|(_, value)| is_present(Some(value))).collect()
}

/// Moves stray root keys that belong to an array field's element structure
/// into that array's first element.
pub fn merge_by_convention(params: &mut Map<String, Value>, fields: &BTreeMap<String, FieldSpec>) {
    for (array_field, spec) in fields {
        if spec.field_type != FieldType::Array || spec.items.is_empty() {
            continue;
        }
        let stray: Vec<String> = params
            .keys()
            .filter(|key| !fields.contains_key(*key) && spec.items.contains_key(*key))
            .cloned()
            .collect();
        for key in stray {
            if let Some(value) = params.remove(&key) {
                lift_into_first_element(params, array_field, &key, value);
            }
        }
    }
}

/// Same as [`merge_by_convention`], driven by the action's explicit
/// alternate-name map.
pub fn merge_by_alias(params: &mut Map<String, Value>, definition: &ActionDefinition) {
    for (alias, target) in &definition.param_aliases {
        if definition.fields.contains_key(alias) {
            continue;
        }
        if let Some(value) = params.remove(alias) {
            lift_into_first_element(params, &target.array_field, &target.item_field, value);
        }
    }
}

fn lift_into_first_element(
    params: &mut Map<String, Value>,
    array_field: &str,
    item_field: &str,
    value: Value,
) {
    let array = params
        .entry(array_field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(elements) = array else {
        return;
    };
    if elements.is_empty() {
        elements.push(Value::Object(Map::new()));
    }
    if let Some(Value::Object(first)) = elements.first_mut() {
        first.entry(item_field.to_string()).or_insert(value);
    }
}

fn required_set(definition: &ActionDefinition, critical: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    definition
        .required_params
        .iter()
        .chain(critical.iter())
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

fn missing_params(
    params: &Map<String, Value>,
    definition: &ActionDefinition,
    critical: &[String],
) -> Vec<String> {
    required_set(definition, critical)
        .into_iter()
        .filter(|name| !is_present(params.get(name)))
        .collect()
}

/// `w * required_ratio + (1 - w) * optional_ratio`; an empty set counts as
/// fully covered.
pub fn score(
    params: &Map<String, Value>,
    definition: &ActionDefinition,
    critical: &[String],
    required_weight: f64,
) -> f64 {
    if params.is_empty() {
        return 0.0;
    }
    if !definition.declares_fields() {
        return NO_FIELDS_CONFIDENCE;
    }

    let required = required_set(definition, critical);
    let optional: Vec<&String> =
        definition.optional_params.iter().filter(|name| !required.contains(name)).collect();

    let required_ratio = coverage(params, required.iter());
    let optional_ratio = coverage(params, optional.iter().copied());

    let weight = required_weight.clamp(0.0, 1.0);
    (weight * required_ratio + (1.0 - weight) * optional_ratio).clamp(0.0, 1.0)
}

fn coverage<'a>(
    params: &Map<String, Value>,
    names: impl ExactSizeIterator<Item = &'a String>,
) -> f64 {
    let total = names.len();
    if total == 0 {
        return 1.0;
    }
    let present = names.filter(|name| is_present(params.get(name.as_str()))).count();
    present as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use parley_core::capability::{CapabilityError, EntityCapability, EntityRegistry};
    use parley_core::config::ExtractionConfig;
    use parley_core::context::{Role, UnifiedContext};
    use parley_core::domain::action::{ActionDefinition, ExecutorKind, FieldSpec};
    use parley_core::domain::entity::EntityRecord;

    use super::{score, HistoryScope, ParameterExtractor, NO_FIELDS_CONFIDENCE};
    use crate::llm::{LlmError, ScriptedLlmClient};

    struct Orders;

    #[async_trait]
    impl EntityCapability for Orders {
        fn entity_type(&self) -> &str {
            "order"
        }

        fn field_schema(&self) -> BTreeMap<String, FieldSpec> {
            order_fields()
        }

        fn strict_schema(&self) -> Option<Value> {
            Some(json!({"type": "object", "properties": {"customer": {"type": "string"}}}))
        }

        fn critical_fields(&self) -> Vec<String> {
            vec!["items".to_string()]
        }

        async fn create(
            &self,
            _params: &Map<String, Value>,
            _user_id: &str,
        ) -> Result<EntityRecord, CapabilityError> {
            Ok(EntityRecord::new(1, "order", "Order #1"))
        }

        async fn search(
            &self,
            _field: &str,
            _value: &str,
        ) -> Result<Vec<EntityRecord>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    fn order_fields() -> BTreeMap<String, FieldSpec> {
        BTreeMap::from([
            ("customer".to_string(), FieldSpec::string("Customer name").required()),
            (
                "items".to_string(),
                FieldSpec::array(
                    "Line items",
                    BTreeMap::from([
                        ("product".to_string(), FieldSpec::string("Product").required()),
                        ("unit_price".to_string(), FieldSpec::number("Unit price")),
                    ]),
                ),
            ),
            ("notes".to_string(), FieldSpec::string("Free-form notes")),
        ])
    }

    fn order_action() -> ActionDefinition {
        let mut definition =
            ActionDefinition::new("create_order", ExecutorKind::LocalCreate).for_entity("order");
        definition.fields = order_fields();
        definition.with_alias("price", "items", "unit_price").normalized()
    }

    fn plain_action() -> ActionDefinition {
        let mut definition = ActionDefinition::new("create_order", ExecutorKind::LocalCreate);
        definition.fields = order_fields();
        definition.with_alias("price", "items", "unit_price").normalized()
    }

    fn extractor(llm: ScriptedLlmClient) -> ParameterExtractor {
        let mut registry = EntityRegistry::new();
        registry.register(Orders);
        ParameterExtractor::new(Arc::new(llm), Arc::new(registry), ExtractionConfig::default())
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn new_invocations_only_see_the_current_message() {
        let llm = ScriptedLlmClient::new().on_json("Laptop", json!({"customer": "Acme"}));
        let extractor = extractor(llm.clone());
        let mut context = UnifiedContext::new("sess-1", "user-1");
        context.push_message(Role::User, "my phone is 555-0100");
        context.push_message(Role::User, "order a Laptop for Acme");

        extractor
            .extract(
                "order a Laptop for Acme",
                &plain_action(),
                &context,
                HistoryScope::CurrentMessage,
            )
            .await;

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("order a Laptop for Acme"));
        assert!(!prompt.contains("555-0100"));
    }

    #[tokio::test]
    async fn continued_actions_see_history_from_their_start_index() {
        let llm = ScriptedLlmClient::new().on_json("Acme", json!({"customer": "Acme"}));
        let extractor = extractor(llm.clone());
        let mut context = UnifiedContext::new("sess-1", "user-1");
        context.push_message(Role::User, "unrelated earlier turn");
        let start = context.push_message(Role::User, "order for Acme");
        context.push_message(Role::Assistant, "Which items?");
        context.push_message(Role::User, "a Laptop");

        extractor.extract("a Laptop", &plain_action(), &context, HistoryScope::Since(start)).await;

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("user: order for Acme"));
        assert!(prompt.contains("assistant: Which items?"));
        assert!(!prompt.contains("unrelated earlier turn"));
        assert_eq!(prompt.matches("user: a Laptop").count(), 1);
    }

    #[tokio::test]
    async fn strict_schema_types_use_schema_constrained_mode() {
        let llm = ScriptedLlmClient::new().on_json("Acme", json!({"customer": "Acme"}));
        let extractor = extractor(llm.clone());
        let context = UnifiedContext::new("sess-1", "user-1");

        let result = extractor
            .extract("order for Acme", &order_action(), &context, HistoryScope::CurrentMessage)
            .await;

        assert!(llm.requests()[0].schema.is_some());
        assert_eq!(result.params.get("customer"), Some(&json!("Acme")));
        assert_eq!(result.missing, vec!["items"]);
    }

    #[tokio::test]
    async fn model_failures_degrade_to_an_empty_extraction() {
        let llm = ScriptedLlmClient::new().on_error("order", LlmError::Timeout);
        let extractor = extractor(llm);
        let context = UnifiedContext::new("sess-1", "user-1");

        let result = extractor
            .extract("order stuff", &plain_action(), &context, HistoryScope::CurrentMessage)
            .await;

        assert!(result.params.is_empty());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.missing, vec!["customer"]);
    }

    #[tokio::test]
    async fn stray_root_values_are_lifted_into_the_first_item() {
        let llm = ScriptedLlmClient::new().on_json(
            "Laptop",
            json!({"customer": "Acme", "product": "Laptop", "price": 999, "invented": true}),
        );
        let extractor = extractor(llm);
        let context = UnifiedContext::new("sess-1", "user-1");

        let result = extractor
            .extract(
                "Laptop at 999 for Acme",
                &plain_action(),
                &context,
                HistoryScope::CurrentMessage,
            )
            .await;

        assert_eq!(
            result.params.get("items"),
            Some(&json!([{"product": "Laptop", "unit_price": 999}]))
        );
        assert!(result.params.get("price").is_none());
        assert!(result.params.get("invented").is_none());
    }

    #[test]
    fn confidence_grows_with_required_coverage() {
        let mut definition = ActionDefinition::new("create_contact", ExecutorKind::LocalCreate)
            .with_field("name", FieldSpec::string("Name").required())
            .with_field("email", FieldSpec::string("Email").required())
            .with_field("notes", FieldSpec::string("Notes"));
        definition = definition.normalized();
        let weight = ExtractionConfig::default().required_weight;

        let none = score(&object(json!({"notes": "vip"})), &definition, &[], weight);
        let one = score(&object(json!({"notes": "vip", "name": "Ada"})), &definition, &[], weight);
        let both = score(
            &object(json!({"notes": "vip", "name": "Ada", "email": "ada@example.com"})),
            &definition,
            &[],
            weight,
        );
        assert!(none < one && one < both);
        assert!((both - 1.0).abs() < f64::EPSILON);
        assert_eq!(score(&Map::new(), &definition, &[], weight), 0.0);
    }

    #[test]
    fn actions_without_fields_score_near_zero() {
        let definition = ActionDefinition::new("anything", ExecutorKind::Custom).normalized();
        let confidence = score(&object(json!({"x": 1})), &definition, &[], 0.7);
        assert_eq!(confidence, NO_FIELDS_CONFIDENCE);
    }
}
