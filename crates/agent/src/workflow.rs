//! Guided workflow execution.
//!
//! A [`WorkflowRunner`] walks the generated [`StepGraph`] of the active
//! workflow until a step needs the user, the run reaches a terminal step, or
//! a sub-workflow is entered. Each step reads at most the one message it was
//! waiting for; later steps in the same turn only see collected state.
//!
//! Sub-workflows run in their own frame on the context call stack. When a
//! child completes, only its declared merge keys flow back into the parent
//! and the parent resumes at the step that started the child.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use parley_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use parley_core::capability::{CapabilityError, EntityRegistry};
use parley_core::config::ExtractionConfig;
use parley_core::context::{keys, UnifiedContext};
use parley_core::domain::action::{
    humanize, ActionDefinition, ActionResult, ExecutorKind, FieldSpec, FieldType,
};
use parley_core::domain::entity::{EntityConfig, EntityId, EntityRecord};
use parley_core::flows::{step_names, StepGraph, StepKind, StepSignal, WorkflowConfig};
use parley_core::resolver::{EntityResolver, Resolution};

use crate::extractor::{is_present, HistoryScope, ParameterExtractor};
use crate::llm::{LlmClient, LlmRequest};
use crate::parsing::{
    coerce_answer, is_affirmative, is_negative, parse_field_update, parse_items, parse_removal,
    select_candidate, split_for_clause,
};

const HISTORY_START: &str = "history_start";
const RETURN_MERGE: &str = "return_merge";
const RETURN_SLOT: &str = "return_slot";
const FINAL_MESSAGE: &str = "final_message";

/// Upper bound on step executions within one turn.
const MAX_STEPS_PER_TURN: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct FinalOutcome {
    pub message: String,
    pub data: Value,
}

/// Callable a workflow runs once every step before it succeeded.
#[async_trait]
pub trait FinalAction: Send + Sync {
    async fn execute(
        &self,
        state: &Map<String, Value>,
        user_id: &str,
    ) -> anyhow::Result<FinalOutcome>;
}

/// Final action that creates a record through an entity capability.
pub struct CapabilityFinalAction {
    registry: Arc<EntityRegistry>,
    entity_type: String,
}

impl CapabilityFinalAction {
    pub fn new(registry: Arc<EntityRegistry>, entity_type: impl Into<String>) -> Self {
        Self { registry, entity_type: entity_type.into() }
    }
}

#[async_trait]
impl FinalAction for CapabilityFinalAction {
    async fn execute(
        &self,
        state: &Map<String, Value>,
        user_id: &str,
    ) -> anyhow::Result<FinalOutcome> {
        let capability = self.registry.require(&self.entity_type)?;
        let record = capability.create(state, user_id).await?;
        Ok(FinalOutcome {
            message: format!("Created {}.", record.display_name),
            data: record.to_value(),
        })
    }
}

struct RegisteredWorkflow {
    config: WorkflowConfig,
    graph: StepGraph,
    final_action: Arc<dyn FinalAction>,
}

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<RegisteredWorkflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: WorkflowConfig, final_action: Arc<dyn FinalAction>) {
        let graph = StepGraph::generate(&config);
        let workflow = RegisteredWorkflow { config, graph, final_action };
        self.workflows.insert(workflow.config.id.clone(), Arc::new(workflow));
    }

    /// Registers each config with a final action that creates the entity type
    /// whose capability declares the workflow as its bound workflow.
    pub fn from_capabilities(configs: Vec<WorkflowConfig>, registry: &Arc<EntityRegistry>) -> Self {
        let mut workflows = Self::new();
        for config in configs {
            let owner = registry.type_ids().into_iter().find(|entity_type| {
                registry
                    .get(entity_type)
                    .and_then(|capability| capability.bound_workflow())
                    .is_some_and(|bound| bound == config.id)
            });
            match owner {
                Some(entity_type) => {
                    let action = CapabilityFinalAction::new(Arc::clone(registry), entity_type);
                    workflows.register(config, Arc::new(action));
                }
                None => warn!(
                    event_name = "agent.workflow.unbound",
                    workflow_id = %config.id,
                    "no entity type declares this workflow; skipping it"
                ),
            }
        }
        workflows
    }

    pub fn config(&self, workflow_id: &str) -> Option<&WorkflowConfig> {
        self.workflows.get(workflow_id).map(|workflow| &workflow.config)
    }

    pub fn graph(&self, workflow_id: &str) -> Option<&StepGraph> {
        self.workflows.get(workflow_id).map(|workflow| &workflow.graph)
    }

    pub fn ids(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    fn get(&self, workflow_id: &str) -> Option<Arc<RegisteredWorkflow>> {
        self.workflows.get(workflow_id).cloned()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowOutcome {
    NeedsInput { message: String, metadata: Value },
    Complete { message: String, data: Value },
    Failed { message: String, error_class: Option<String> },
}

impl WorkflowOutcome {
    fn failed(message: impl Into<String>, error_class: &str) -> Self {
        Self::Failed { message: message.into(), error_class: Some(error_class.to_string()) }
    }

    pub fn into_action_result(self) -> ActionResult {
        match self {
            Self::NeedsInput { message, metadata } => ActionResult::needs_input(message, metadata),
            Self::Complete { message, data } => ActionResult::completed(message, data),
            Self::Failed { message, error_class } => {
                let result = ActionResult::failure(message);
                match error_class {
                    Some(error_class) => result.with_error_class(error_class),
                    None => result,
                }
            }
        }
    }
}

enum StepResult {
    Advance,
    Ask { message: String, awaiting: Value },
    Fail { message: String, error_class: String },
    Enter {
        workflow_id: String,
        seed: Map<String, Value>,
        merge: BTreeMap<String, String>,
        slot: String,
    },
    /// Re-enters an earlier step of the same workflow.
    Rewind { step: String },
}

impl StepResult {
    fn fail(message: impl Into<String>, error_class: &str) -> Self {
        Self::Fail { message: message.into(), error_class: error_class.to_string() }
    }
}

enum Slot {
    Done,
    Stop(StepResult),
}

/// What an edit request at the confirm step touched.
#[derive(Default)]
struct Edits {
    applied: bool,
    /// Lowest entity index whose slots must be resolved again.
    reresolve: Option<usize>,
}

impl Edits {
    fn field(&mut self) {
        self.applied = true;
    }

    fn entity(&mut self, index: usize) {
        self.applied = true;
        self.reresolve = Some(self.reresolve.map_or(index, |current| current.min(index)));
    }
}

pub struct WorkflowRunner {
    workflows: WorkflowRegistry,
    resolver: EntityResolver,
    extractor: ParameterExtractor,
    llm: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
}

impl WorkflowRunner {
    pub fn new(
        workflows: WorkflowRegistry,
        registry: Arc<EntityRegistry>,
        llm: Arc<dyn LlmClient>,
        extraction: ExtractionConfig,
    ) -> Self {
        Self {
            workflows,
            resolver: EntityResolver::new(Arc::clone(&registry)),
            extractor: ParameterExtractor::new(Arc::clone(&llm), registry, extraction),
            llm,
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// Continues the active run, or starts `workflow_id` seeded with
    /// `params` when nothing is running.
    pub async fn start_or_continue(
        &self,
        workflow_id: &str,
        params: Map<String, Value>,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> WorkflowOutcome {
        if context.current_workflow.is_some() {
            return self.resume(message, context).await;
        }
        self.start(workflow_id, params, message, context).await
    }

    pub async fn start(
        &self,
        workflow_id: &str,
        params: Map<String, Value>,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> WorkflowOutcome {
        if self.workflows.get(workflow_id).is_none() {
            return WorkflowOutcome::failed(
                format!("Workflow `{workflow_id}` is not registered."),
                "configuration.unknown_workflow",
            );
        }

        let seeded = !params.is_empty();
        context.begin_workflow(workflow_id, params);
        let history_start = context.history.len().saturating_sub(1);
        context.set_meta(HISTORY_START, Value::from(history_start));
        if seeded {
            context.set_flag(keys::AI_EXTRACTION_DONE, true);
        }
        info!(
            event_name = "agent.workflow.started",
            workflow_id,
            session_id = %context.session_id,
            seeded,
            "workflow started"
        );
        self.drive(message, context).await
    }

    pub async fn resume(
        &self,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> WorkflowOutcome {
        self.drive(message, context).await
    }

    /// Drops every frame of the active run.
    pub fn abandon(&self, context: &mut UnifiedContext) {
        if let Some(workflow_id) = context.current_workflow.clone() {
            info!(
                event_name = "agent.workflow.abandoned",
                workflow_id = %workflow_id,
                session_id = %context.session_id,
                depth = context.depth(),
                "workflow abandoned"
            );
        }
        context.call_stack.clear();
        context.finish_workflow();
    }

    async fn drive(&self, message: Option<&str>, context: &mut UnifiedContext) -> WorkflowOutcome {
        let session_audit = AuditContext::for_session(&context.session_id, "workflow");
        let mut message = message.map(str::to_string);
        let mut injected: Option<StepResult> = None;

        for _ in 0..MAX_STEPS_PER_TURN {
            let Some(workflow_id) = context.current_workflow.clone() else {
                return WorkflowOutcome::failed(
                    "There is no workflow in progress.",
                    "workflow.none_active",
                );
            };
            let Some(workflow) = self.workflows.get(&workflow_id) else {
                return self.abort(
                    context,
                    format!("Workflow `{workflow_id}` is not registered."),
                    "configuration.unknown_workflow",
                );
            };
            let step_name = match context.current_step.clone() {
                Some(step_name) => step_name,
                None => {
                    let first = workflow.graph.first().name.clone();
                    context.current_step = Some(first.clone());
                    first
                }
            };
            let step = match workflow.graph.step(&step_name) {
                Ok(step) => step.clone(),
                Err(error) => {
                    return self.abort(context, error.to_string(), "workflow.unknown_step");
                }
            };
            let audit = session_audit.clone().with_action(workflow_id.clone());

            let result = match injected.take() {
                Some(result) => result,
                None => {
                    let answer = message.take();
                    self.run_step(&workflow, &step.kind, answer.as_deref(), context).await
                }
            };

            let (signal, failure) = match result {
                StepResult::Ask { message: question, awaiting } => {
                    debug!(
                        event_name = "agent.workflow.awaiting_input",
                        workflow_id = %workflow_id,
                        step = %step.name,
                        session_id = %context.session_id,
                        "workflow needs input"
                    );
                    return WorkflowOutcome::NeedsInput {
                        message: question,
                        metadata: json!({
                            "workflow_id": workflow_id,
                            "step": step.name,
                            "awaiting": awaiting,
                            "depth": context.depth(),
                        }),
                    };
                }
                StepResult::Enter { workflow_id: child, seed, merge, slot } => {
                    if let Err(failure) = self.enter(&child, seed, merge, slot, context, &audit) {
                        injected = Some(failure);
                    }
                    continue;
                }
                StepResult::Rewind { step: target } => {
                    debug!(
                        event_name = "agent.workflow.rewound",
                        workflow_id = %workflow_id,
                        from = %step.name,
                        to = %target,
                        session_id = %context.session_id,
                        "edited entities are resolved again"
                    );
                    context.current_step = Some(target);
                    continue;
                }
                StepResult::Advance => (StepSignal::Succeeded, None),
                StepResult::Fail { message, error_class } => {
                    (StepSignal::Failed, Some((message, error_class)))
                }
            };

            let transition = match workflow.graph.advance_with_audit(
                &step.name,
                signal,
                self.audit.as_ref(),
                &audit,
            ) {
                Ok(transition) => transition,
                Err(error) => {
                    return self.abort(context, error.to_string(), "workflow.transition");
                }
            };
            context.current_step = Some(transition.to.clone());

            match transition.to.as_str() {
                step_names::COMPLETE => {
                    if let Some(outcome) = self.complete(&workflow, context, &audit) {
                        return outcome;
                    }
                }
                step_names::ERROR => {
                    let (message, error_class) = failure.unwrap_or_else(|| {
                        (format!("I couldn't {}.", workflow.config.goal), "workflow.error".into())
                    });
                    match self.fail(&workflow, message, error_class, context, &audit) {
                        Ok(parent_failure) => injected = Some(parent_failure),
                        Err(outcome) => return outcome,
                    }
                }
                _ => {}
            }
        }

        self.abort(
            context,
            "The workflow did not settle; please start again.".to_string(),
            "workflow.runaway",
        )
    }

    async fn run_step(
        &self,
        workflow: &RegisteredWorkflow,
        kind: &StepKind,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> StepResult {
        match kind {
            StepKind::CollectData => self.collect_data(workflow, message, context).await,
            StepKind::ResolveEntity(index) => match workflow.config.entities.get(*index) {
                Some(entity) if entity.multiple => {
                    self.resolve_list(workflow, entity, message, context).await
                }
                Some(entity) => self.resolve_single(workflow, entity, message, context).await,
                None => StepResult::fail(
                    format!("Entity step {index} is not configured."),
                    "configuration.entity_step",
                ),
            },
            StepKind::CollectArrayItemFields => {
                self.collect_item_fields(&workflow.config, message, context)
            }
            StepKind::ConfirmAction => self.confirm(workflow, message, context).await,
            StepKind::ExecuteFinalAction => self.execute_final(workflow, context).await,
            StepKind::Complete | StepKind::Error => StepResult::fail(
                "This workflow already finished; start a new one.",
                "workflow.terminal",
            ),
        }
    }

    fn enter(
        &self,
        child: &str,
        seed: Map<String, Value>,
        merge: BTreeMap<String, String>,
        slot: String,
        context: &mut UnifiedContext,
        audit: &AuditContext,
    ) -> Result<(), StepResult> {
        if self.workflows.get(child).is_none() {
            return Err(StepResult::fail(
                format!("Workflow `{child}` is not registered."),
                "configuration.unknown_workflow",
            ));
        }
        let parent = context.current_workflow.clone().unwrap_or_default();
        context
            .enter_sub_workflow(child, seed)
            .map_err(|error| StepResult::fail(error.to_string(), "context.call_stack"))?;

        let history_start = context.history.len();
        context.set_meta(RETURN_MERGE, json!(merge));
        context.set_meta(RETURN_SLOT, Value::from(slot));
        context.set_meta(HISTORY_START, Value::from(history_start));

        self.audit.emit(
            AuditEvent::new(
                audit,
                "context.subworkflow_entered",
                AuditCategory::Workflow,
                AuditOutcome::Success,
            )
            .with_metadata("parent", parent.clone())
            .with_metadata("child", child)
            .with_metadata("depth", context.depth().to_string()),
        );
        info!(
            event_name = "agent.workflow.subworkflow_entered",
            parent = %parent,
            child,
            depth = context.depth(),
            session_id = %context.session_id,
            "sub-workflow entered"
        );
        Ok(())
    }

    /// Returns the final outcome for a top-level run; `None` once a child
    /// handed control back to its parent.
    fn complete(
        &self,
        workflow: &RegisteredWorkflow,
        context: &mut UnifiedContext,
        audit: &AuditContext,
    ) -> Option<WorkflowOutcome> {
        let data = context.take_meta(keys::FINAL_RESULT).unwrap_or(Value::Null);
        let message = context
            .take_meta(FINAL_MESSAGE)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("Done: {}.", workflow.config.goal));

        if !context.is_subworkflow() {
            context.finish_workflow();
            info!(
                event_name = "agent.workflow.completed",
                workflow_id = %workflow.config.id,
                session_id = %context.session_id,
                "workflow completed"
            );
            return Some(WorkflowOutcome::Complete { message, data });
        }

        let merge: BTreeMap<String, String> = context
            .meta(RETURN_MERGE)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let slot = context.meta_str(RETURN_SLOT).map(str::to_string);
        let result = data.as_object().cloned().unwrap_or_default();

        let frame = match context.exit_sub_workflow(&result, &merge) {
            Ok(frame) => frame,
            Err(error) => return Some(self.abort(context, error.to_string(), "context.call_stack")),
        };
        if let Some(slot) = slot {
            let id = result.get("id").cloned().unwrap_or(Value::Null);
            context.set_meta(keys::SUBWORKFLOW_RESULT, json!({"slot": slot, "id": id}));
        }

        let parent = frame.workflow_id.unwrap_or_default();
        self.audit.emit(
            AuditEvent::new(
                audit,
                "context.subworkflow_exited",
                AuditCategory::Workflow,
                AuditOutcome::Success,
            )
            .with_metadata("child", workflow.config.id.clone())
            .with_metadata("parent", parent.clone())
            .with_metadata("merged", merge.values().cloned().collect::<Vec<_>>().join(",")),
        );
        info!(
            event_name = "agent.workflow.subworkflow_exited",
            child = %workflow.config.id,
            parent = %parent,
            session_id = %context.session_id,
            "sub-workflow completed; parent resumed"
        );
        None
    }

    /// A failing child pops its frame and fails the parent step that started
    /// it; a failing top-level run ends the conversation's workflow.
    fn fail(
        &self,
        workflow: &RegisteredWorkflow,
        message: String,
        error_class: String,
        context: &mut UnifiedContext,
        audit: &AuditContext,
    ) -> Result<StepResult, WorkflowOutcome> {
        warn!(
            event_name = "agent.workflow.failed",
            workflow_id = %workflow.config.id,
            session_id = %context.session_id,
            error_class = %error_class,
            depth = context.depth(),
            "workflow reached its error step"
        );

        if !context.is_subworkflow() {
            context.finish_workflow();
            return Err(WorkflowOutcome::Failed { message, error_class: Some(error_class) });
        }

        match context.exit_sub_workflow(&Map::new(), &BTreeMap::new()) {
            Ok(frame) => {
                self.audit.emit(
                    AuditEvent::new(
                        audit,
                        "context.subworkflow_exited",
                        AuditCategory::Workflow,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("child", workflow.config.id.clone())
                    .with_metadata("parent", frame.workflow_id.unwrap_or_default()),
                );
                Ok(StepResult::Fail { message, error_class })
            }
            Err(error) => Err(self.abort(context, error.to_string(), "context.call_stack")),
        }
    }

    fn abort(
        &self,
        context: &mut UnifiedContext,
        message: String,
        error_class: &str,
    ) -> WorkflowOutcome {
        warn!(
            event_name = "agent.workflow.aborted",
            session_id = %context.session_id,
            error_class,
            error = %message,
            "workflow aborted"
        );
        context.call_stack.clear();
        context.finish_workflow();
        WorkflowOutcome::failed(message, error_class)
    }

    async fn collect_data(
        &self,
        workflow: &RegisteredWorkflow,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> StepResult {
        let config = &workflow.config;
        let awaiting = take_meta_string(context, keys::AWAITING_FIELD);

        match (awaiting, message) {
            (Some(field), Some(answer)) => {
                let spec = config.fields.get(&field).cloned().unwrap_or_default();
                match coerce_answer(&spec, answer) {
                    Some(value) => {
                        context.workflow_state.insert(field, value);
                    }
                    None => {
                        let note = format!("I need a {} here.", spec.field_type.json_type());
                        return ask_field(config, &field, Some(note), context);
                    }
                }
            }
            (None, Some(text))
                if !context.flag(keys::AI_EXTRACTION_DONE)
                    && !missing_scalars(config, context).is_empty() =>
            {
                context.set_flag(keys::AI_EXTRACTION_DONE, true);
                self.fill_from_message(config, text, context).await;
            }
            _ => {}
        }

        match missing_scalars(config, context).into_iter().next() {
            Some(field) => ask_field(config, &field, None, context),
            None => StepResult::Advance,
        }
    }

    /// One best-effort extraction pass; only fills fields that are still empty.
    async fn fill_from_message(
        &self,
        config: &WorkflowConfig,
        message: &str,
        context: &mut UnifiedContext,
    ) {
        let definition = workflow_action(config);
        let scope = context
            .meta(HISTORY_START)
            .and_then(Value::as_u64)
            .map(|start| HistoryScope::Since(start as usize))
            .unwrap_or(HistoryScope::CurrentMessage);
        let extraction = self.extractor.extract(message, &definition, context, scope).await;

        let mut filled = 0;
        for (key, value) in extraction.params {
            if !is_present(context.workflow_state.get(&key)) {
                context.workflow_state.insert(key, value);
                filled += 1;
            }
        }
        debug!(
            event_name = "agent.workflow.ai_pass",
            workflow_id = %config.id,
            session_id = %context.session_id,
            filled,
            "extraction pass applied"
        );
    }

    async fn resolve_single(
        &self,
        workflow: &RegisteredWorkflow,
        entity: &EntityConfig,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> StepResult {
        let key = entity.state_key(None);
        let mut answer = answer_for(&key, message, context).map(str::to_string);

        // "<items> for <name>" also fills an empty list field.
        let plain_answer = !context.metadata.contains_key(&candidates_key(&key))
            && context.meta_str(keys::AWAITING_CREATE) != Some(key.as_str());
        let split = answer
            .as_deref()
            .filter(|_| plain_answer)
            .and_then(split_for_clause)
            .map(|(items, name)| (items.to_string(), name.to_string()));
        if let Some((items_text, name)) = split {
            let list = workflow.config.entities.iter().find(|candidate| {
                candidate.multiple && !is_present(context.workflow_state.get(&candidate.field))
            });
            if let Some(list) = list {
                let schema = item_schema(&workflow.config, list);
                let items = parse_items(&items_text, &list.identifier_field, &schema);
                if !items.is_empty() {
                    let items = items.into_iter().map(Value::Object).collect();
                    context.workflow_state.insert(list.field.clone(), Value::Array(items));
                    answer = Some(name);
                }
            }
        }

        match self.settle_slot(&workflow.config, entity, None, answer.as_deref(), context).await {
            Slot::Done => StepResult::Advance,
            Slot::Stop(result) => result,
        }
    }

    async fn resolve_list(
        &self,
        workflow: &RegisteredWorkflow,
        entity: &EntityConfig,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> StepResult {
        let config = &workflow.config;
        let field = entity.field.clone();
        let schema = item_schema(config, entity);

        if let Some(answer) = answer_for(&field, message, context) {
            let items = parse_items(answer, &entity.identifier_field, &schema);
            if !items.is_empty() {
                let items = items.into_iter().map(Value::Object).collect();
                context.workflow_state.insert(field.clone(), Value::Array(items));
            }
        }
        normalize_list(context, entity, &schema);

        let count = context
            .workflow_state
            .get(&field)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or_default();
        if count == 0 {
            context.set_meta(keys::AWAITING_ENTITY, Value::from(field.clone()));
            let question = config
                .field_prompts
                .get(&field)
                .or(entity.prompt.as_ref())
                .cloned()
                .unwrap_or_else(|| format!("Which {}s should I include?", entity.entity_type));
            return StepResult::Ask { message: question, awaiting: json!({"entity": field}) };
        }

        for index in 0..count {
            let key = entity.state_key(Some(index));
            let answer = answer_for(&key, message, context);
            if let Slot::Stop(result) =
                self.settle_slot(config, entity, Some(index), answer, context).await
            {
                return result;
            }
        }
        StepResult::Advance
    }

    /// Settles one slot: applies a pending answer, then runs the resolver and
    /// turns anything short of a resolved id into a question or sub-workflow.
    async fn settle_slot(
        &self,
        config: &WorkflowConfig,
        entity: &EntityConfig,
        index: Option<usize>,
        answer: Option<&str>,
        context: &mut UnifiedContext,
    ) -> Slot {
        let key = entity.state_key(index);

        if let Some(answer) = answer {
            if let Some(stored) = context.take_meta(&candidates_key(&key)) {
                let records: Vec<EntityRecord> =
                    serde_json::from_value(stored).unwrap_or_default();
                let options: Vec<(i64, String)> = records
                    .iter()
                    .map(|record| (record.id.0, record.display_name.clone()))
                    .collect();
                let choice = select_candidate(answer, &options).and_then(|i| records.get(i));
                if let Some(choice) = choice {
                    if let Err(error) = self.resolver.select(&key, choice, context) {
                        return Slot::Stop(StepResult::fail(error.to_string(), error.error_class()));
                    }
                    record_resolution(entity, index, choice.id, Some(choice), context);
                    return Slot::Done;
                }
                write_identifier(entity, index, answer, &key, context);
            } else if context.meta_str(keys::AWAITING_CREATE) == Some(key.as_str()) {
                context.take_meta(keys::AWAITING_CREATE);
                if is_affirmative(answer) {
                    return self.create_for_slot(entity, index, &key, context).await;
                }
                if is_negative(answer) {
                    return Slot::Stop(StepResult::fail(
                        format!("Okay, I won't create that {}.", entity.entity_type),
                        "workflow.cancelled",
                    ));
                }
                write_identifier(entity, index, answer, &key, context);
            } else {
                write_identifier(entity, index, answer, &key, context);
            }
        }

        let bound = bound_id(entity, index, &key, context);
        let state = &context.workflow_state;
        let identifier = slot_value(state, entity, index, &entity.identifier_field)
            .and_then(Value::as_str)
            .map(str::to_string);

        match self.resolver.resolve(entity, &key, identifier.as_deref(), bound, context).await {
            Ok(Resolution::Resolved { id, record }) => {
                record_resolution(entity, index, id, record.as_ref(), context);
                Slot::Done
            }
            Ok(Resolution::Created(record)) => {
                record_resolution(entity, index, record.id, Some(&record), context);
                Slot::Done
            }
            Ok(Resolution::Ambiguous(records)) => {
                let mut question = format!(
                    "I found {} {}s matching \"{}\":",
                    records.len(),
                    entity.entity_type,
                    identifier.unwrap_or_default()
                );
                for (position, record) in records.iter().enumerate() {
                    question.push_str(&format!(
                        "\n{}. {} (#{})",
                        position + 1,
                        record.display_name,
                        record.id
                    ));
                }
                question.push_str("\nWhich one did you mean?");
                let candidates: Vec<Value> = records
                    .iter()
                    .map(|record| json!({"id": record.id.0, "display_name": record.display_name}))
                    .collect();
                context.set_meta(
                    candidates_key(&key),
                    serde_json::to_value(&records).unwrap_or_default(),
                );
                context.set_meta(keys::AWAITING_ENTITY, Value::from(key.clone()));
                Slot::Stop(StepResult::Ask {
                    message: question,
                    awaiting: json!({"entity": key, "candidates": candidates}),
                })
            }
            Ok(Resolution::Missing) => {
                let identifier = identifier.unwrap_or_default();
                self.missing_slot(config, entity, index, &key, identifier, context)
            }
            Ok(Resolution::NeedsIdentifier) => {
                context.set_meta(keys::AWAITING_ENTITY, Value::from(key.clone()));
                let question = match index {
                    Some(index) => format!("Which {} is item {}?", entity.entity_type, index + 1),
                    None => config
                        .field_prompts
                        .get(&entity.field)
                        .or(entity.prompt.as_ref())
                        .cloned()
                        .unwrap_or_else(|| format!("Which {} should I use?", entity.entity_type)),
                };
                Slot::Stop(StepResult::Ask { message: question, awaiting: json!({"entity": key}) })
            }
            Err(error) => {
                warn!(
                    event_name = "agent.workflow.resolution_failed",
                    entity_type = %entity.entity_type,
                    key = %key,
                    session_id = %context.session_id,
                    error_class = error.error_class(),
                    error = %error,
                    "entity resolution failed"
                );
                Slot::Stop(StepResult::fail(
                    format!("I couldn't look up the {}: {error}", entity.entity_type),
                    error.error_class(),
                ))
            }
        }
    }

    fn missing_slot(
        &self,
        config: &WorkflowConfig,
        entity: &EntityConfig,
        index: Option<usize>,
        key: &str,
        identifier: String,
        context: &mut UnifiedContext,
    ) -> Slot {
        let kind = &entity.entity_type;
        if entity.create_if_missing {
            context.set_meta(keys::AWAITING_CREATE, Value::from(key));
            return Slot::Stop(StepResult::Ask {
                message: format!(
                    "I couldn't find a {kind} named \"{identifier}\". Should I create it?"
                ),
                awaiting: json!({"create": key}),
            });
        }

        if let Some(sub_workflow) = &entity.sub_workflow {
            let mut seed = Map::new();
            if let Some(child_field) = &sub_workflow.identifier_as {
                seed.insert(child_field.clone(), Value::from(identifier));
            }
            for (child_field, parent_key) in &sub_workflow.seed {
                if let Some(value) = context.workflow_state.get(parent_key) {
                    seed.insert(child_field.clone(), value.clone());
                }
            }
            let merge = if sub_workflow.merge.is_empty() && index.is_none() {
                BTreeMap::from([("id".to_string(), entity.id_key())])
            } else {
                sub_workflow.merge.clone()
            };
            return Slot::Stop(StepResult::Enter {
                workflow_id: sub_workflow.workflow_id.clone(),
                seed,
                merge,
                slot: key.to_string(),
            });
        }

        context.set_meta(keys::AWAITING_ENTITY, Value::from(key));
        let retry = config
            .field_prompts
            .get(&entity.field)
            .cloned()
            .unwrap_or_else(|| format!("Which {kind} did you mean?"));
        Slot::Stop(StepResult::Ask {
            message: format!("I couldn't find a {kind} named \"{identifier}\". {retry}"),
            awaiting: json!({"entity": key}),
        })
    }

    async fn create_for_slot(
        &self,
        entity: &EntityConfig,
        index: Option<usize>,
        key: &str,
        context: &mut UnifiedContext,
    ) -> Slot {
        let name = slot_value(&context.workflow_state, entity, index, &entity.identifier_field)
            .cloned()
            .unwrap_or(Value::Null);
        let name_field = entity.search_fields.first().cloned().unwrap_or_else(|| "name".into());
        let mut params = Map::new();
        params.insert(name_field, name);
        for field in &entity.item_required_fields {
            if let Some(value) = slot_value(&context.workflow_state, entity, index, field) {
                params.insert(field.clone(), value.clone());
            }
        }

        match self.resolver.create_missing(entity, key, &params, context).await {
            Ok(record) => {
                record_resolution(entity, index, record.id, Some(&record), context);
                Slot::Done
            }
            Err(error) => Slot::Stop(StepResult::fail(
                format!("I couldn't create the {}: {error}", entity.entity_type),
                error.error_class(),
            )),
        }
    }

    fn collect_item_fields(
        &self,
        config: &WorkflowConfig,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> StepResult {
        let mut note = None;
        if let Some(cursor) = context.take_meta(keys::ITEM_CURSOR) {
            let list = cursor.get("list").and_then(Value::as_str).unwrap_or_default();
            let field = cursor.get("field").and_then(Value::as_str).unwrap_or_default();
            let index = cursor.get("index").and_then(Value::as_u64).map(|index| index as usize);
            let entity = config.entity_for_field(list);
            if let (Some(answer), Some(entity), Some(index)) = (message, entity, index) {
                let spec = item_schema(config, entity)
                    .get(field)
                    .cloned()
                    .unwrap_or_else(|| FieldSpec::string(humanize(field)));
                match coerce_answer(&spec, answer) {
                    Some(value) => {
                        let element = element_mut(&mut context.workflow_state, list, index);
                        if let Some(element) = element {
                            element.insert(field.to_string(), value);
                        }
                    }
                    None => note = Some(format!("I need a {} here.", spec.field_type.json_type())),
                }
            }
        }

        for entity in config.entities.iter().filter(|entity| {
            entity.multiple && !entity.item_required_fields.is_empty()
        }) {
            let items = context
                .workflow_state
                .get(&entity.field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for (index, element) in items.iter().enumerate() {
                let missing = entity
                    .item_required_fields
                    .iter()
                    .find(|field| !is_present(element.get(*field)));
                let Some(field) = missing else {
                    continue;
                };
                let item_name = element
                    .get(&entity.identifier_field)
                    .and_then(Value::as_str)
                    .unwrap_or("item")
                    .to_string();
                context.set_meta(
                    keys::ITEM_CURSOR,
                    json!({"list": entity.field, "index": index, "field": field}),
                );
                let question = config
                    .field_prompts
                    .get(&format!("{}[].{}", entity.field, field))
                    .map(|prompt| prompt.replace("{item}", &item_name))
                    .unwrap_or_else(|| {
                        let label = humanize(field).to_lowercase();
                        format!("What is the {label} for the {item_name}?")
                    });
                return StepResult::Ask {
                    message: with_note(note, question),
                    awaiting: json!({
                        "item": {"list": entity.field, "index": index, "field": field},
                    }),
                };
            }
        }
        StepResult::Advance
    }

    async fn confirm(
        &self,
        workflow: &RegisteredWorkflow,
        message: Option<&str>,
        context: &mut UnifiedContext,
    ) -> StepResult {
        let config = &workflow.config;
        let mut note = None;
        if let Some(answer) = message.filter(|_| context.flag(keys::AWAITING_CONFIRMATION)) {
            if is_affirmative(answer) {
                context.set_flag(keys::AWAITING_CONFIRMATION, false);
                return StepResult::Advance;
            }
            if is_negative(answer) {
                context.set_flag(keys::AWAITING_CONFIRMATION, false);
                return StepResult::fail("Okay, I cancelled that.", "workflow.cancelled");
            }
            let edits = self.apply_changes(config, answer, context).await;
            if !edits.applied {
                note = Some("I couldn't tell what to change, so nothing was updated.".to_string());
            }
            let target = edits.reresolve.and_then(|index| {
                workflow
                    .graph
                    .steps()
                    .iter()
                    .find(|step| step.kind == StepKind::ResolveEntity(index))
                    .map(|step| step.name.clone())
            });
            if let Some(step) = target {
                context.set_flag(keys::AWAITING_CONFIRMATION, false);
                return StepResult::Rewind { step };
            }
        }

        let summary = self.summarize(config, context).await;
        context.set_flag(keys::AWAITING_CONFIRMATION, true);
        let question = "Shall I go ahead? Reply yes or no, or tell me what to change.";
        StepResult::Ask {
            message: with_note(note, format!("{summary}\n\n{question}")),
            awaiting: json!({"confirmation": true}),
        }
    }

    /// Applies an edit request. Scalars are written in place; entity and list
    /// edits drop the affected resolutions so those slots are looked up again.
    async fn apply_changes(
        &self,
        config: &WorkflowConfig,
        answer: &str,
        context: &mut UnifiedContext,
    ) -> Edits {
        let mut edits = Edits::default();
        if let Some(name) = parse_removal(answer) {
            remove_named(config, &name, context, &mut edits);
            if edits.applied {
                return edits;
            }
        }
        if let Some((field, value)) = parse_field_update(answer) {
            apply_field_value(config, &field, Value::from(value), context, &mut edits);
            if edits.applied {
                return edits;
            }
        }

        let fields: Vec<&str> = config.fields.keys().map(String::as_str).collect();
        if fields.is_empty() {
            return edits;
        }
        let request = LlmRequest::new(format!(
            "The user is reviewing a request to {} and replied: \"{answer}\".\n\
             Current values:\n{}\n\
             Editable fields: {}.\n\
             Reply with a JSON object holding only the fields to change. \
             For a list field give the complete new list. \
             Use null to clear a field. Reply with {{}} if no change was asked for.",
            config.goal,
            Value::Object(context.workflow_state.clone()),
            fields.join(", ")
        ))
        .with_system("You interpret edit requests. Never invent values.")
        .with_max_tokens(512);

        let changes = match self.llm.complete(&request).await {
            Ok(response) => response.into_object().unwrap_or_default(),
            Err(error) => {
                debug!(
                    event_name = "agent.workflow.edit_unavailable",
                    error_class = error.error_class(),
                    "edit interpretation unavailable"
                );
                return edits;
            }
        };
        for (field, value) in changes {
            apply_field_value(config, &field, value, context, &mut edits);
        }
        edits
    }

    async fn summarize(&self, config: &WorkflowConfig, context: &UnifiedContext) -> String {
        let fallback = render_summary(config, &context.workflow_state);
        let request = LlmRequest::new(format!(
            "Rewrite this summary as a short, friendly confirmation message. \
             Keep every value exactly as given and add nothing.\n\n{fallback}"
        ))
        .with_max_tokens(256);

        match self.llm.complete(&request).await {
            Ok(response) => {
                let text = response.into_text();
                if text.trim().is_empty() {
                    fallback
                } else {
                    text.trim().to_string()
                }
            }
            Err(error) => {
                debug!(
                    event_name = "agent.workflow.summary_fallback",
                    workflow_id = %config.id,
                    error_class = error.error_class(),
                    "using the plain summary"
                );
                fallback
            }
        }
    }

    async fn execute_final(
        &self,
        workflow: &RegisteredWorkflow,
        context: &mut UnifiedContext,
    ) -> StepResult {
        let started = Instant::now();
        let outcome =
            workflow.final_action.execute(&context.workflow_state, &context.user_id).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(outcome) => {
                info!(
                    event_name = "agent.workflow.final_action_executed",
                    workflow_id = %workflow.config.id,
                    session_id = %context.session_id,
                    duration_ms,
                    "final action executed"
                );
                context.set_meta(keys::FINAL_RESULT, outcome.data);
                context.set_meta(FINAL_MESSAGE, Value::from(outcome.message));
                StepResult::Advance
            }
            Err(error) => {
                let error_class = error
                    .downcast_ref::<CapabilityError>()
                    .map(CapabilityError::error_class)
                    .unwrap_or("workflow.final_action");
                warn!(
                    event_name = "agent.workflow.final_action_failed",
                    workflow_id = %workflow.config.id,
                    session_id = %context.session_id,
                    duration_ms,
                    error_class,
                    error = %error,
                    "final action failed"
                );
                let goal = &workflow.config.goal;
                StepResult::fail(format!("I couldn't {goal}: {error}"), error_class)
            }
        }
    }
}

/// Plain-text summary of collected workflow data, one line per field.
pub fn render_summary(config: &WorkflowConfig, state: &Map<String, Value>) -> String {
    let mut lines = vec![format!("Here is what I have to {}:", config.goal)];
    for (name, spec) in &config.fields {
        let Some(value) = state.get(name).filter(|value| is_present(Some(value))) else {
            continue;
        };
        let rendered = match (spec.field_type, value) {
            (FieldType::Array, Value::Array(items)) => items
                .iter()
                .map(|item| render_item(config.entity_for_field(name), item))
                .collect::<Vec<_>>()
                .join("; "),
            (_, other) => plain(other),
        };
        lines.push(format!("- {}: {rendered}", humanize(name)));
    }
    lines.join("\n")
}

fn render_item(entity: Option<&EntityConfig>, item: &Value) -> String {
    let Some(object) = item.as_object() else {
        return plain(item);
    };
    let name_field = entity.map(|entity| entity.identifier_field.as_str()).unwrap_or("name");
    let mut text = object.get(name_field).map(plain).unwrap_or_else(|| "item".to_string());
    if let Some(quantity) = object.get("quantity") {
        text.push_str(&format!(" x{}", plain(quantity)));
    }
    if let Some(price) = object.get("unit_price") {
        text.push_str(&format!(" @ {}", plain(price)));
    }
    for (key, value) in object {
        if key == name_field || key == "quantity" || key == "unit_price" || key.ends_with("_id") {
            continue;
        }
        text.push_str(&format!(", {} {}", humanize(key).to_lowercase(), plain(value)));
    }
    text
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn apply_field_value(
    config: &WorkflowConfig,
    field: &str,
    value: Value,
    context: &mut UnifiedContext,
    edits: &mut Edits,
) {
    let Some(spec) = config.fields.get(field) else {
        return;
    };
    let entity = config.entities.iter().enumerate().find(|(_, entity)| entity.field == field);

    if value.is_null() {
        if spec.required || !context.workflow_state.contains_key(field) {
            return;
        }
        if let Some((_, entity)) = entity {
            clear_slots(entity, context);
        }
        context.workflow_state.remove(field);
        edits.field();
        return;
    }

    match entity {
        Some((index, entity)) if entity.multiple => {
            let schema = item_schema(config, entity);
            let items = match value {
                Value::String(text) => parse_items(&text, &entity.identifier_field, &schema)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
                Value::Array(items) => items,
                Value::Object(item) => vec![Value::Object(item)],
                _ => return,
            };
            if items.is_empty() {
                return;
            }
            let previous = context.workflow_state.get(field).and_then(Value::as_array).cloned();
            let merged = merge_items(previous.unwrap_or_default(), items, &entity.identifier_field);
            clear_slots(entity, context);
            context.workflow_state.insert(field.to_string(), Value::Array(merged));
            edits.entity(index);
        }
        Some((index, entity)) => {
            let identifier = plain(&value);
            if identifier.trim().is_empty() {
                return;
            }
            write_identifier(entity, None, &identifier, &entity.state_key(None), context);
            edits.entity(index);
        }
        None if spec.is_scalar() => {
            let coerced = match &value {
                Value::String(text) => coerce_answer(spec, text),
                other => Some(other.clone()),
            };
            if let Some(coerced) = coerced {
                context.workflow_state.insert(field.to_string(), coerced);
                edits.field();
            }
        }
        None => {}
    }
}

/// Drops the list element whose identifier matches `name`, or clears an
/// optional field of that name.
fn remove_named(
    config: &WorkflowConfig,
    name: &str,
    context: &mut UnifiedContext,
    edits: &mut Edits,
) {
    for (index, entity) in config.entities.iter().enumerate().filter(|(_, e)| e.multiple) {
        let Some(items) = context.workflow_state.get(&entity.field).and_then(Value::as_array)
        else {
            continue;
        };
        let position = items.iter().position(|item| {
            item.get(&entity.identifier_field)
                .and_then(Value::as_str)
                .is_some_and(|identifier| identifier.eq_ignore_ascii_case(name))
        });
        let Some(position) = position else {
            continue;
        };
        clear_slots(entity, context);
        if let Some(Value::Array(items)) = context.workflow_state.get_mut(&entity.field) {
            items.remove(position);
        }
        edits.entity(index);
        return;
    }

    let field = name.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_");
    apply_field_value(config, &field, Value::Null, context, edits);
}

/// Overlays edited items on the elements they name, keeping collected
/// values and bound ids the edit did not mention.
fn merge_items(previous: Vec<Value>, items: Vec<Value>, identifier_field: &str) -> Vec<Value> {
    let name_of = |item: &Map<String, Value>| {
        item.get(identifier_field).and_then(Value::as_str).map(str::to_lowercase)
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(edited) => {
                let name = name_of(&edited);
                let original = previous
                    .iter()
                    .filter_map(Value::as_object)
                    .find(|old| name.is_some() && name_of(*old) == name);
                let Some(original) = original else {
                    return Value::Object(edited);
                };
                let mut merged = original.clone();
                for (key, value) in edited {
                    if !value.is_null() {
                        merged.insert(key, value);
                    }
                }
                Value::Object(merged)
            }
            other => other,
        })
        .collect()
}

/// Forgets the resolution state of every slot of `entity`. List slots are
/// keyed by position, so any change to the list invalidates all of them.
fn clear_slots(entity: &EntityConfig, context: &mut UnifiedContext) {
    if !entity.multiple {
        context.workflow_state.remove(&entity.id_key());
        context.invalidate_entity(&entity.state_key(None));
        return;
    }
    let count = context
        .workflow_state
        .get(&entity.field)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_default();
    for index in 0..count {
        context.invalidate_entity(&entity.state_key(Some(index)));
    }
}

fn workflow_action(config: &WorkflowConfig) -> ActionDefinition {
    let mut definition = ActionDefinition::new(config.id.clone(), ExecutorKind::Workflow)
        .with_description(config.goal.clone())
        .with_workflow(config.id.clone());
    definition.fields = config.fields.clone();
    definition.normalized()
}

fn missing_scalars(config: &WorkflowConfig, context: &UnifiedContext) -> Vec<String> {
    config
        .required_scalars()
        .into_iter()
        .filter(|field| !is_present(context.workflow_state.get(*field)))
        .map(str::to_string)
        .collect()
}

fn ask_field(
    config: &WorkflowConfig,
    field: &str,
    note: Option<String>,
    context: &mut UnifiedContext,
) -> StepResult {
    context.set_meta(keys::AWAITING_FIELD, Value::from(field));
    let question = config
        .field_prompts
        .get(field)
        .cloned()
        .unwrap_or_else(|| format!("What is the {}?", humanize(field).to_lowercase()));
    StepResult::Ask { message: with_note(note, question), awaiting: json!({"field": field}) }
}

fn with_note(note: Option<String>, question: String) -> String {
    match note {
        Some(note) => format!("{note} {question}"),
        None => question,
    }
}

fn take_meta_string(context: &mut UnifiedContext, key: &str) -> Option<String> {
    context.take_meta(key).and_then(|value| value.as_str().map(str::to_string))
}

/// The message, when the slot under `key` is the one the user was asked about.
fn answer_for<'m>(
    key: &str,
    message: Option<&'m str>,
    context: &mut UnifiedContext,
) -> Option<&'m str> {
    let message = message?;
    if context.meta_str(keys::AWAITING_ENTITY) == Some(key) {
        context.take_meta(keys::AWAITING_ENTITY);
        return Some(message);
    }
    (context.meta_str(keys::AWAITING_CREATE) == Some(key)).then_some(message)
}

fn candidates_key(key: &str) -> String {
    format!("{}{key}", keys::CANDIDATES_PREFIX)
}

fn item_schema(config: &WorkflowConfig, entity: &EntityConfig) -> BTreeMap<String, FieldSpec> {
    config.fields.get(&entity.field).map(|spec| spec.items.clone()).unwrap_or_default()
}

/// Brings a list field into array-of-objects shape.
fn normalize_list(
    context: &mut UnifiedContext,
    entity: &EntityConfig,
    schema: &BTreeMap<String, FieldSpec>,
) {
    let normalized = match context.workflow_state.get(&entity.field) {
        Some(Value::String(text)) => parse_items(text, &entity.identifier_field, schema)
            .into_iter()
            .map(Value::Object)
            .collect(),
        Some(Value::Object(object)) => vec![Value::Object(object.clone())],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(name) => {
                    let mut object = Map::new();
                    object.insert(entity.identifier_field.clone(), Value::from(name.as_str()));
                    Value::Object(object)
                }
                other => other.clone(),
            })
            .collect(),
        _ => return,
    };
    context.workflow_state.insert(entity.field.clone(), Value::Array(normalized));
}

fn element_mut<'a>(
    state: &'a mut Map<String, Value>,
    field: &str,
    index: usize,
) -> Option<&'a mut Map<String, Value>> {
    state.get_mut(field)?.as_array_mut()?.get_mut(index)?.as_object_mut()
}

fn slot_value<'a>(
    state: &'a Map<String, Value>,
    entity: &EntityConfig,
    index: Option<usize>,
    field: &str,
) -> Option<&'a Value> {
    match index {
        Some(index) => state.get(&entity.field)?.as_array()?.get(index)?.get(field),
        None => state.get(field),
    }
}

fn write_identifier(
    entity: &EntityConfig,
    index: Option<usize>,
    answer: &str,
    key: &str,
    context: &mut UnifiedContext,
) {
    let identifier = Value::from(answer.trim());
    let id_key = entity.id_key();
    match index {
        Some(index) => {
            if let Some(element) = element_mut(&mut context.workflow_state, &entity.field, index) {
                element.insert(entity.identifier_field.clone(), identifier);
                element.remove(&id_key);
            }
        }
        None => {
            context.workflow_state.insert(entity.identifier_field.clone(), identifier);
            context.workflow_state.remove(&id_key);
        }
    }
    context.invalidate_entity(key);
}

/// An id handed back by a finished sub-workflow, or one already bound in
/// the collected data.
fn bound_id(
    entity: &EntityConfig,
    index: Option<usize>,
    key: &str,
    context: &mut UnifiedContext,
) -> Option<EntityId> {
    let returned = context
        .meta(keys::SUBWORKFLOW_RESULT)
        .filter(|result| result.get("slot").and_then(Value::as_str) == Some(key))
        .map(|result| result.get("id").and_then(Value::as_i64));
    if let Some(returned) = returned {
        context.take_meta(keys::SUBWORKFLOW_RESULT);
        if let Some(id) = returned {
            return Some(EntityId(id));
        }
    }
    slot_value(&context.workflow_state, entity, index, &entity.id_key())
        .and_then(Value::as_i64)
        .map(EntityId)
}

fn record_resolution(
    entity: &EntityConfig,
    index: Option<usize>,
    id: EntityId,
    record: Option<&EntityRecord>,
    context: &mut UnifiedContext,
) {
    let id_key = entity.id_key();
    match index {
        Some(index) => {
            let Some(element) = element_mut(&mut context.workflow_state, &entity.field, index)
            else {
                return;
            };
            element.insert(id_key, Value::from(id.0));
            if let Some(record) = record {
                for field in &entity.item_required_fields {
                    if is_present(element.get(field)) {
                        continue;
                    }
                    if let Some(value) = record.fields.get(field).filter(|v| is_present(Some(v))) {
                        element.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        None => {
            context.workflow_state.insert(id_key, Value::from(id.0));
        }
    }
}
