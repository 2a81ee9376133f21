//! Upward entry point: one [`AgentRuntime::process`] call per user message.
//!
//! A turn loads the session context, either continues the active workflow or
//! pending action or selects a new action from the catalog, runs it through
//! the execution pipeline and stores the context again. Turns for one session
//! id are serialized in-process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_core::audit::{AuditSink, NoopAuditSink};
use parley_core::capability::EntityRegistry;
use parley_core::config::{AppConfig, CatalogConfig, ExtractionConfig};
use parley_core::context::{PendingAction, Role, UnifiedContext};
use parley_core::domain::action::{
    ActionDefinition, ActionInvocation, ActionResult, ExecutorKind, ExtractionResult,
};
use parley_core::errors::ApplicationError;
use parley_core::flows::WorkflowConfig;
use parley_db::ContextStore;

use crate::catalog::{ActionCatalog, DiscoveredCatalog};
use crate::extractor::{is_present, HistoryScope, ParameterExtractor};
use crate::llm::{DisabledLlmClient, LlmClient};
use crate::middleware::{Middleware, ReadinessMiddleware};
use crate::parsing::{coerce_answer, is_cancel};
use crate::peer::{HttpPeerTransport, PeerTransport};
use crate::pipeline::{CustomExecutor, ExecutionPipeline};
use crate::workflow::{WorkflowRegistry, WorkflowRunner};

const SESSION_LOCK_IDLE: Duration = Duration::from_secs(30 * 60);
/// Locks are evicted by size as well as idleness, so a held lock can only be
/// dropped when more sessions than this are active inside one idle window.
/// Keep it above the peak number of concurrently active sessions.
const SESSION_LOCK_CAPACITY: u64 = 10_000;

#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    NeedsInput { message: String, metadata: Value },
    Complete { message: String, data: Value },
    Failure { message: String },
}

impl TurnOutcome {
    pub fn message(&self) -> &str {
        match self {
            Self::NeedsInput { message, .. }
            | Self::Complete { message, .. }
            | Self::Failure { message } => message,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

impl From<ActionResult> for TurnOutcome {
    fn from(result: ActionResult) -> Self {
        if !result.success {
            return Self::Failure { message: result.message };
        }
        if result.needs_more_input() {
            Self::NeedsInput { message: result.message, metadata: result.data }
        } else {
            Self::Complete { message: result.message, data: result.data }
        }
    }
}

pub struct AgentRuntime {
    catalog: ActionCatalog,
    extractor: ParameterExtractor,
    pipeline: ExecutionPipeline,
    workflows: Arc<WorkflowRunner>,
    store: Arc<dyn ContextStore>,
    extraction: ExtractionConfig,
    sessions: Cache<String, Arc<Mutex<()>>>,
}

impl AgentRuntime {
    pub fn builder(registry: Arc<EntityRegistry>, store: Arc<dyn ContextStore>) -> RuntimeBuilder {
        RuntimeBuilder::new(registry, store)
    }

    pub async fn catalog(&self) -> DiscoveredCatalog {
        self.catalog.discover().await
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        self.workflows.workflows()
    }

    pub async fn process(&self, message: &str, session_id: &str, user_id: &str) -> TurnOutcome {
        let lock = self
            .sessions
            .get_with(session_id.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let _turn = lock.lock().await;
        let started = Instant::now();

        let mut context = match self.store.load(session_id).await {
            Ok(Some(context)) => context,
            Ok(None) => UnifiedContext::new(session_id, user_id),
            Err(error) => {
                let error =
                    ApplicationError::Persistence(error.to_string()).into_interface(session_id);
                warn!(
                    event_name = "agent.runtime.context_load_failed",
                    session_id,
                    error = %error,
                    "could not load the session context"
                );
                return TurnOutcome::Failure { message: error.user_message().to_string() };
            }
        };
        context.user_id = user_id.to_string();
        context.push_message(Role::User, message);

        let outcome = self.turn(message, &mut context).await;
        context.push_message(Role::Assistant, outcome.message());

        if let Err(error) = self.store.save(&context).await {
            warn!(
                event_name = "agent.runtime.context_save_failed",
                session_id,
                error = %error,
                "could not store the session context"
            );
        }
        info!(
            event_name = "agent.runtime.turn_finished",
            session_id,
            duration_ms = started.elapsed().as_millis() as u64,
            workflow = context.current_workflow.as_deref().unwrap_or_default(),
            depth = context.depth(),
            "turn finished"
        );
        outcome
    }

    async fn turn(&self, message: &str, context: &mut UnifiedContext) -> TurnOutcome {
        let busy = context.current_workflow.is_some() || context.pending_action.is_some();
        if busy && is_cancel(message) {
            self.workflows.abandon(context);
            context.pending_action = None;
            return TurnOutcome::Failure { message: "Okay, I cancelled that.".to_string() };
        }

        if context.current_workflow.is_some() {
            return self.workflows.resume(Some(message), context).await.into_action_result().into();
        }

        let catalog = self.catalog.discover().await;
        if let Some(pending) = context.pending_action.clone() {
            let other_trigger = catalog
                .enabled()
                .into_iter()
                .any(|definition| {
                    definition.id != pending.action_id && definition.is_triggered_by(message)
                });
            if !other_trigger {
                if let Some(definition) = catalog.get(&pending.action_id) {
                    return self
                        .continue_pending(&catalog, definition, pending, message, context)
                        .await;
                }
            }
            context.pending_action = None;
        }

        let Some((definition, extraction)) = self.select(&catalog, message, context).await else {
            return self.no_match(&catalog);
        };
        info!(
            event_name = "agent.runtime.action_selected",
            action_id = %definition.id,
            session_id = %context.session_id,
            confidence = extraction.confidence,
            missing = extraction.missing.len(),
            "action selected"
        );

        let invocation = ActionInvocation::from_extraction(definition, extraction);
        let params = invocation.payload.params.clone();
        let result = self.pipeline.execute(&catalog, invocation, context).await;
        if result.needs_more_input() && definition.executor != ExecutorKind::Workflow {
            context.pending_action = Some(PendingAction {
                action_id: definition.id.clone(),
                start_index: context.history.len().saturating_sub(1),
                params,
            });
        }
        result.into()
    }

    /// Scores every candidate. Trigger matches are eligible at any confidence;
    /// ties break on trigger match, then confidence, then id.
    async fn select<'c>(
        &self,
        catalog: &'c DiscoveredCatalog,
        message: &str,
        context: &UnifiedContext,
    ) -> Option<(&'c ActionDefinition, ExtractionResult)> {
        let mut best: Option<(bool, &'c ActionDefinition, ExtractionResult)> = None;
        for definition in catalog.candidates(message) {
            let extraction = self
                .extractor
                .extract(message, definition, context, HistoryScope::CurrentMessage)
                .await;
            let triggered = definition.is_triggered_by(message);
            debug!(
                event_name = "agent.runtime.candidate_scored",
                action_id = %definition.id,
                triggered,
                confidence = extraction.confidence,
                "candidate scored"
            );
            if !triggered && extraction.confidence < self.extraction.min_confidence {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_triggered, best_definition, best_extraction)) => {
                    if triggered != *best_triggered {
                        triggered
                    } else if extraction.confidence != best_extraction.confidence {
                        extraction.confidence > best_extraction.confidence
                    } else {
                        definition.id < best_definition.id
                    }
                }
            };
            if better {
                best = Some((triggered, definition, extraction));
            }
        }
        best.map(|(_, definition, extraction)| (definition, extraction))
    }

    /// Treats the message as more input for the pending action: history since
    /// the action started is visible and new values win over earlier ones.
    async fn continue_pending(
        &self,
        catalog: &DiscoveredCatalog,
        definition: &ActionDefinition,
        pending: PendingAction,
        message: &str,
        context: &mut UnifiedContext,
    ) -> TurnOutcome {
        let still_missing = self.extractor.assess(pending.params.clone(), definition).missing;
        let extraction = self
            .extractor
            .extract(message, definition, context, HistoryScope::Since(pending.start_index))
            .await;

        let mut params = pending.params.clone();
        let extracted_any = !extraction.params.is_empty();
        for (key, value) in extraction.params {
            params.insert(key, value);
        }
        if !extracted_any {
            fill_single_gap(&mut params, definition, &still_missing, message);
        }

        let assessed = self.extractor.assess(params, definition);
        debug!(
            event_name = "agent.runtime.pending_continued",
            action_id = %definition.id,
            session_id = %context.session_id,
            missing = assessed.missing.len(),
            "pending action continued"
        );
        let invocation = ActionInvocation::from_extraction(definition, assessed);
        let params = invocation.payload.params.clone();
        let result = self.pipeline.execute(catalog, invocation, context).await;

        context.pending_action = result.needs_more_input().then(|| PendingAction {
            action_id: definition.id.clone(),
            start_index: pending.start_index,
            params,
        });
        result.into()
    }

    fn no_match(&self, catalog: &DiscoveredCatalog) -> TurnOutcome {
        let labels: Vec<String> = catalog
            .enabled()
            .into_iter()
            .map(|definition| definition.label.to_lowercase())
            .collect();
        let message = if labels.is_empty() {
            "I can't do anything here yet.".to_string()
        } else {
            format!("I'm not sure what you'd like to do. I can: {}.", labels.join(", "))
        };
        TurnOutcome::NeedsInput { message, metadata: json!({"available": labels}) }
    }
}

/// A bare answer fills the one scalar field that was still missing.
fn fill_single_gap(
    params: &mut Map<String, Value>,
    definition: &ActionDefinition,
    missing: &[String],
    message: &str,
) {
    let [field] = missing else {
        return;
    };
    let Some(spec) = definition.fields.get(field).filter(|spec| spec.is_scalar()) else {
        return;
    };
    if is_present(params.get(field)) {
        return;
    }
    if let Some(value) = coerce_answer(spec, message) {
        params.insert(field.clone(), value);
    }
}

pub struct RuntimeBuilder {
    registry: Arc<EntityRegistry>,
    store: Arc<dyn ContextStore>,
    llm: Arc<dyn LlmClient>,
    transport: Option<Arc<dyn PeerTransport>>,
    catalog: CatalogConfig,
    extraction: ExtractionConfig,
    workflows: WorkflowRegistry,
    static_actions: Vec<ActionDefinition>,
    custom: Vec<(String, Arc<dyn CustomExecutor>)>,
    middleware: Vec<Arc<dyn Middleware>>,
    readiness: bool,
    audit: Arc<dyn AuditSink>,
}

impl RuntimeBuilder {
    pub fn new(registry: Arc<EntityRegistry>, store: Arc<dyn ContextStore>) -> Self {
        let defaults = AppConfig::default();
        Self {
            registry,
            store,
            llm: Arc::new(DisabledLlmClient),
            transport: None,
            catalog: defaults.catalog,
            extraction: defaults.extraction,
            workflows: WorkflowRegistry::new(),
            static_actions: Vec::new(),
            custom: Vec::new(),
            middleware: Vec::new(),
            readiness: true,
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = llm;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn catalog_config(mut self, catalog: CatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = extraction;
        self
    }

    /// Binds each workflow to the entity type that declares it.
    pub fn workflows(mut self, configs: Vec<WorkflowConfig>) -> Self {
        self.workflows = WorkflowRegistry::from_capabilities(configs, &self.registry);
        self
    }

    pub fn workflow_registry(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn static_action(mut self, definition: ActionDefinition) -> Self {
        self.static_actions.push(definition);
        self
    }

    /// Registers a custom action together with the callable that runs it.
    pub fn custom_action(
        mut self,
        definition: ActionDefinition,
        executor: Arc<dyn CustomExecutor>,
    ) -> Self {
        self.custom.push((definition.id.clone(), executor));
        self.static_actions.push(definition);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Leaves the readiness check out of the middleware chain.
    pub fn without_readiness(mut self) -> Self {
        self.readiness = false;
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> Result<AgentRuntime, ApplicationError> {
        let transport: Arc<dyn PeerTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let timeout = Duration::from_millis(self.catalog.peer_timeout_ms);
                let client = HttpPeerTransport::new(timeout)
                    .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
                Arc::new(client)
            }
        };

        let mut catalog =
            ActionCatalog::new(Arc::clone(&self.registry), Arc::clone(&transport), &self.catalog);
        for definition in self.static_actions {
            catalog.register(definition);
        }

        let workflows = Arc::new(
            WorkflowRunner::new(
                self.workflows,
                Arc::clone(&self.registry),
                Arc::clone(&self.llm),
                self.extraction,
            )
            .with_audit_sink(Arc::clone(&self.audit)),
        );

        let mut pipeline = ExecutionPipeline::new(Arc::clone(&self.registry), transport)
            .with_workflows(Arc::clone(&workflows))
            .with_audit_sink(self.audit);
        if self.readiness {
            pipeline = pipeline.with_middleware(Arc::new(ReadinessMiddleware));
        }
        for middleware in self.middleware {
            pipeline = pipeline.with_middleware(middleware);
        }
        for (action_id, executor) in self.custom {
            pipeline = pipeline.with_custom(action_id, executor);
        }

        let extractor =
            ParameterExtractor::new(self.llm, Arc::clone(&self.registry), self.extraction);
        Ok(AgentRuntime {
            catalog,
            extractor,
            pipeline,
            workflows,
            store: self.store,
            extraction: self.extraction,
            sessions: Cache::builder()
                .max_capacity(SESSION_LOCK_CAPACITY)
                .time_to_idle(SESSION_LOCK_IDLE)
                .build(),
        })
    }
}
