use std::collections::BTreeMap;

use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::action::FieldSpec;
use crate::domain::entity::EntityConfig;
use crate::flows::states::{step_names, StepDefinition, StepKind, StepSignal, TransitionOutcome};

/// Declarative description of a guided workflow. The step topology is always
/// generated from this; it is never authored by hand.
#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    pub id: String,
    pub goal: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub entities: Vec<EntityConfig>,
    pub confirm_before_complete: bool,
    pub field_prompts: BTreeMap<String, String>,
}

impl WorkflowConfig {
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            fields: BTreeMap::new(),
            entities: Vec::new(),
            confirm_before_complete: false,
            field_prompts: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn with_entity(mut self, entity: EntityConfig) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_prompt(mut self, field: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.field_prompts.insert(field.into(), prompt.into());
        self
    }

    pub fn confirm_before_complete(mut self, confirm: bool) -> Self {
        self.confirm_before_complete = confirm;
        self
    }

    pub fn entity_for_field(&self, field: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|entity| entity.field == field)
    }

    /// Required scalar fields, i.e. the ones `collect_data` is responsible for.
    pub fn required_scalars(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(name, spec)| {
                spec.required && spec.is_scalar() && self.entity_for_field(name).is_none()
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("unknown step `{step}` in workflow `{workflow_id}`")]
    UnknownStep { workflow_id: String, step: String },
    #[error("step `{step}` is terminal; a new run is required")]
    TerminalStep { step: String },
    #[error("step `{step}` has no {signal:?} target")]
    MissingTarget { step: String, signal: StepSignal },
}

/// Generated step topology for one workflow:
///
/// `collect_data -> [resolve_entity_*] -> collect_array_item_fields ->
/// [confirm_action] -> execute_final_action -> {complete | error}`
///
/// Every failure edge leads to `error`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepGraph {
    workflow_id: String,
    steps: Vec<StepDefinition>,
}

impl StepGraph {
    pub fn generate(config: &WorkflowConfig) -> Self {
        let mut chain: Vec<(String, String, StepKind)> = Vec::new();
        chain.push((
            step_names::COLLECT_DATA.to_string(),
            format!("Collect the details needed to {}", config.goal),
            StepKind::CollectData,
        ));
        for (index, entity) in config.entities.iter().enumerate() {
            chain.push((
                format!("{}{}", step_names::RESOLVE_ENTITY_PREFIX, entity.field),
                format!("Resolve {} to existing {} records", entity.field, entity.entity_type),
                StepKind::ResolveEntity(index),
            ));
        }
        chain.push((
            step_names::COLLECT_ARRAY_ITEM_FIELDS.to_string(),
            "Fill required per-item fields".to_string(),
            StepKind::CollectArrayItemFields,
        ));
        if config.confirm_before_complete {
            chain.push((
                step_names::CONFIRM_ACTION.to_string(),
                "Confirm the summary with the user".to_string(),
                StepKind::ConfirmAction,
            ));
        }
        chain.push((
            step_names::EXECUTE_FINAL_ACTION.to_string(),
            format!("Run the final action to {}", config.goal),
            StepKind::ExecuteFinalAction,
        ));

        let mut steps = Vec::with_capacity(chain.len() + 2);
        for (position, (name, description, kind)) in chain.iter().enumerate() {
            let next = chain
                .get(position + 1)
                .map(|(next, _, _)| next.clone())
                .unwrap_or_else(|| step_names::COMPLETE.to_string());
            steps.push(StepDefinition {
                name: name.clone(),
                description: description.clone(),
                kind: kind.clone(),
                on_success: Some(next),
                on_failure: Some(step_names::ERROR.to_string()),
            });
        }
        steps.push(StepDefinition {
            name: step_names::COMPLETE.to_string(),
            description: "Workflow finished successfully".to_string(),
            kind: StepKind::Complete,
            on_success: None,
            on_failure: None,
        });
        steps.push(StepDefinition {
            name: step_names::ERROR.to_string(),
            description: "Workflow stopped with an error".to_string(),
            kind: StepKind::Error,
            on_success: None,
            on_failure: None,
        });

        Self { workflow_id: config.id.clone(), steps }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn first(&self) -> &StepDefinition {
        &self.steps[0]
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn step(&self, name: &str) -> Result<&StepDefinition, FlowTransitionError> {
        self.steps.iter().find(|step| step.name == name).ok_or_else(|| {
            FlowTransitionError::UnknownStep {
                workflow_id: self.workflow_id.clone(),
                step: name.to_string(),
            }
        })
    }

    pub fn advance(
        &self,
        current: &str,
        signal: StepSignal,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        let step = self.step(current)?;
        if step.kind.is_terminal() {
            return Err(FlowTransitionError::TerminalStep { step: step.name.clone() });
        }
        let to = step.target(signal).ok_or_else(|| FlowTransitionError::MissingTarget {
            step: step.name.clone(),
            signal,
        })?;
        self.step(to)?;

        Ok(TransitionOutcome { from: step.name.clone(), to: to.to_string(), signal })
    }

    pub fn advance_with_audit<S>(
        &self,
        current: &str,
        signal: StepSignal,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.advance(current, signal);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "workflow.transition_applied",
                        AuditCategory::Workflow,
                        AuditOutcome::Success,
                    )
                    .with_metadata("workflow_id", self.workflow_id.clone())
                    .with_metadata("from", outcome.from.clone())
                    .with_metadata("to", outcome.to.clone())
                    .with_metadata("signal", format!("{:?}", outcome.signal)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "workflow.transition_rejected",
                        AuditCategory::Workflow,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("workflow_id", self.workflow_id.clone())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::action::FieldSpec;
    use crate::domain::entity::EntityConfig;
    use crate::flows::engine::{FlowTransitionError, StepGraph, WorkflowConfig};
    use crate::flows::states::{StepKind, StepSignal};

    fn invoice_config(confirm: bool) -> WorkflowConfig {
        WorkflowConfig::new("create_invoice", "create an invoice")
            .with_field("customer", FieldSpec::entity("customer", "Customer").required())
            .with_field("due_date", FieldSpec::string("Due date").required())
            .with_field("notes", FieldSpec::string("Notes"))
            .with_entity(EntityConfig::single("customer", "customer"))
            .with_entity(
                EntityConfig::list("items", "product", "product")
                    .require_item_fields(["unit_price"]),
            )
            .confirm_before_complete(confirm)
    }

    #[test]
    fn generates_fixed_topology_with_one_step_per_entity() {
        let graph = StepGraph::generate(&invoice_config(true));
        assert_eq!(
            graph.names(),
            vec![
                "collect_data",
                "resolve_entity_customer",
                "resolve_entity_items",
                "collect_array_item_fields",
                "confirm_action",
                "execute_final_action",
                "complete",
                "error",
            ]
        );
        assert_eq!(graph.first().kind, StepKind::CollectData);
        assert_eq!(
            graph.step("resolve_entity_items").expect("step").kind,
            StepKind::ResolveEntity(1)
        );
    }

    #[test]
    fn confirm_step_is_optional() {
        let graph = StepGraph::generate(&invoice_config(false));
        assert!(!graph.names().contains(&"confirm_action"));
        let outcome =
            graph.advance("collect_array_item_fields", StepSignal::Succeeded).expect("advance");
        assert_eq!(outcome.to, "execute_final_action");
    }

    #[test]
    fn every_failure_leads_to_error() {
        let graph = StepGraph::generate(&invoice_config(true));
        for step in graph.steps().iter().filter(|step| !step.kind.is_terminal()) {
            let outcome = graph.advance(&step.name, StepSignal::Failed).expect("failure edge");
            assert_eq!(outcome.to, "error", "{} should fail into error", step.name);
        }
    }

    #[test]
    fn terminal_steps_do_not_transition() {
        let graph = StepGraph::generate(&invoice_config(true));
        for terminal in ["complete", "error"] {
            let error = graph.advance(terminal, StepSignal::Succeeded).expect_err("terminal");
            assert!(matches!(error, FlowTransitionError::TerminalStep { .. }));
        }
    }

    #[test]
    fn unknown_step_is_rejected() {
        let graph = StepGraph::generate(&invoice_config(true));
        let error = graph.advance("approve", StepSignal::Succeeded).expect_err("unknown");
        assert!(matches!(error, FlowTransitionError::UnknownStep { .. }));
    }

    #[test]
    fn required_scalars_exclude_entity_fields() {
        let config = invoice_config(true);
        assert_eq!(config.required_scalars(), vec!["due_date"]);
    }

    #[test]
    fn transitions_emit_audit_events() {
        let graph = StepGraph::generate(&invoice_config(true));
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(Some("sess-1".to_owned()), None, "corr-1", "workflow");

        graph
            .advance_with_audit("collect_data", StepSignal::Succeeded, &sink, &audit)
            .expect("advance");
        let _ = graph.advance_with_audit("complete", StepSignal::Succeeded, &sink, &audit);

        assert_eq!(
            sink.event_types(),
            vec!["workflow.transition_applied", "workflow.transition_rejected"]
        );
        assert_eq!(
            sink.events()[0].metadata.get("to").map(String::as_str),
            Some("resolve_entity_customer")
        );
    }
}
