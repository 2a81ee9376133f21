//! Dispatch of finalized invocations to their executors.
//!
//! Every path out of [`ExecutionPipeline::execute`] is an [`ActionResult`]:
//! executor errors and panics are caught here, classified, timed and stamped
//! with the action's identity.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, info, warn};

use parley_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use parley_core::capability::EntityRegistry;
use parley_core::context::{Role, UnifiedContext};
use parley_core::domain::action::{ActionDefinition, ActionInvocation, ActionResult, ExecutorKind};

use crate::catalog::DiscoveredCatalog;
use crate::middleware::{Middleware, MiddlewareDecision};
use crate::peer::{PeerExecuteRequest, PeerTransport};
use crate::workflow::WorkflowRunner;

/// Callable registered for a `custom` action id.
#[async_trait]
pub trait CustomExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: &ActionInvocation,
        context: &UnifiedContext,
    ) -> anyhow::Result<ActionResult>;
}

pub struct ExecutionPipeline {
    registry: Arc<EntityRegistry>,
    transport: Arc<dyn PeerTransport>,
    workflows: Option<Arc<WorkflowRunner>>,
    custom: BTreeMap<String, Arc<dyn CustomExecutor>>,
    middleware: Vec<Arc<dyn Middleware>>,
    audit: Arc<dyn AuditSink>,
}

impl ExecutionPipeline {
    pub fn new(registry: Arc<EntityRegistry>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            registry,
            transport,
            workflows: None,
            custom: BTreeMap::new(),
            middleware: Vec::new(),
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_workflows(mut self, runner: Arc<WorkflowRunner>) -> Self {
        self.workflows = Some(runner);
        self
    }

    pub fn with_custom(
        mut self,
        action_id: impl Into<String>,
        executor: Arc<dyn CustomExecutor>,
    ) -> Self {
        self.custom.insert(action_id.into(), executor);
        self
    }

    /// Appends to the chain; middleware runs in insertion order.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|middleware| middleware.name()).collect()
    }

    pub async fn execute(
        &self,
        catalog: &DiscoveredCatalog,
        invocation: ActionInvocation,
        context: &mut UnifiedContext,
    ) -> ActionResult {
        let started = Instant::now();
        let Some(definition) = catalog.get(&invocation.action_id) else {
            let result = ActionResult::failure(format!(
                "The action `{}` is not available.",
                invocation.action_id
            ))
            .with_error_class("configuration.unknown_action");
            return self.finish(&invocation.action_id, &invocation.label, result, started, context);
        };

        for middleware in &self.middleware {
            let decision = middleware.before(&invocation, definition, context).await;
            if let MiddlewareDecision::ShortCircuit(result) = decision {
                debug!(
                    event_name = "agent.pipeline.short_circuited",
                    action_id = %definition.id,
                    session_id = %context.session_id,
                    middleware = middleware.name(),
                    "middleware answered before dispatch"
                );
                return self.finish(&definition.id, &definition.label, result, started, context);
            }
        }

        let dispatched =
            AssertUnwindSafe(self.dispatch(definition, &invocation, context)).catch_unwind().await;
        let result = match dispatched {
            Ok(result) => result,
            Err(panic) => ActionResult::failure(format!(
                "{} failed unexpectedly: {}",
                definition.label,
                panic_message(panic.as_ref())
            ))
            .with_error_class("panic"),
        };
        self.finish(&definition.id, &definition.label, result, started, context)
    }

    async fn dispatch(
        &self,
        definition: &ActionDefinition,
        invocation: &ActionInvocation,
        context: &mut UnifiedContext,
    ) -> ActionResult {
        match definition.executor {
            ExecutorKind::LocalCreate => self.local_create(definition, invocation, context).await,
            ExecutorKind::RemoteCreate => self.remote_create(definition, invocation, context).await,
            ExecutorKind::Workflow => self.workflow(definition, invocation, context).await,
            ExecutorKind::Custom => match self.custom.get(&definition.id) {
                Some(executor) => match executor.execute(invocation, context).await {
                    Ok(result) => result,
                    Err(error) => ActionResult::failure(format!(
                        "I couldn't {}: {error:#}",
                        definition.label.to_lowercase()
                    ))
                    .with_error_class("custom.error"),
                },
                None => configuration_failure(
                    format!("No executor is registered for `{}`.", definition.id),
                    "configuration.unknown_executor",
                ),
            },
        }
    }

    async fn local_create(
        &self,
        definition: &ActionDefinition,
        invocation: &ActionInvocation,
        context: &UnifiedContext,
    ) -> ActionResult {
        let Some(entity_type) = definition.entity_type.as_deref() else {
            return configuration_failure(
                format!("`{}` is not bound to an entity type.", definition.id),
                "configuration.unbound_type",
            );
        };
        let capability = match self.registry.require(entity_type) {
            Ok(capability) => capability,
            Err(error) => {
                return configuration_failure(error.to_string(), "configuration.unknown_type");
            }
        };

        match capability.create(&invocation.payload.params, &context.user_id).await {
            Ok(record) => ActionResult::completed(
                format!("Created {}.", record.display_name),
                record.to_value(),
            ),
            Err(error) => ActionResult::failure(format!(
                "I couldn't {}: {error}",
                definition.label.to_lowercase()
            ))
            .with_error_class(error.error_class()),
        }
    }

    async fn remote_create(
        &self,
        definition: &ActionDefinition,
        invocation: &ActionInvocation,
        context: &UnifiedContext,
    ) -> ActionResult {
        let Some(peer) = definition.peer.as_ref() else {
            return configuration_failure(
                format!("`{}` has no owning peer.", definition.id),
                "configuration.missing_peer",
            );
        };
        let request = PeerExecuteRequest {
            entity_type: definition.entity_type.clone().unwrap_or_default(),
            params: invocation.payload.params.clone(),
            user_id: context.user_id.clone(),
        };

        match self.transport.execute_action(peer, &request).await {
            Ok(response) if response.success => {
                let message = response.message.unwrap_or_else(|| {
                    format!("{} finished on {}.", definition.label, peer.node_id)
                });
                ActionResult::completed(message, response.data)
            }
            Ok(response) => {
                let reason = response
                    .error
                    .or(response.message)
                    .unwrap_or_else(|| "the request was rejected".to_string());
                ActionResult::failure(format!("{} declined: {reason}", peer.node_id))
                    .with_error_class("peer.rejected")
            }
            Err(error) => ActionResult::failure(format!(
                "I couldn't reach {} to {}: {error}",
                peer.node_id,
                definition.label.to_lowercase()
            ))
            .with_error_class(error.error_class()),
        }
    }

    /// Starts or continues the bound workflow with the latest user message.
    async fn workflow(
        &self,
        definition: &ActionDefinition,
        invocation: &ActionInvocation,
        context: &mut UnifiedContext,
    ) -> ActionResult {
        let Some(runner) = self.workflows.as_ref() else {
            return configuration_failure(
                "Guided workflows are not enabled.",
                "configuration.no_workflow_runner",
            );
        };
        let Some(workflow_id) = definition.workflow_id.as_deref() else {
            return configuration_failure(
                format!("`{}` is not bound to a workflow.", definition.id),
                "configuration.unbound_workflow",
            );
        };

        let message = context
            .history
            .last()
            .filter(|entry| entry.role == Role::User)
            .map(|entry| entry.content.clone());
        runner
            .start_or_continue(
                workflow_id,
                invocation.payload.params.clone(),
                message.as_deref(),
                context,
            )
            .await
            .into_action_result()
    }

    fn finish(
        &self,
        action_id: &str,
        label: &str,
        result: ActionResult,
        started: Instant,
        context: &UnifiedContext,
    ) -> ActionResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = result.stamped(action_id, label, duration_ms);
        let audit = AuditContext::for_session(&context.session_id, context.user_id.clone())
            .with_action(action_id);

        if result.success {
            info!(
                event_name = "agent.pipeline.executed",
                action_id,
                session_id = %context.session_id,
                duration_ms,
                status = ?result.status,
                "action dispatched"
            );
            self.audit.emit(
                AuditEvent::new(
                    &audit,
                    "pipeline.action_executed",
                    AuditCategory::Execution,
                    AuditOutcome::Success,
                )
                .with_metadata("status", format!("{:?}", result.status).to_lowercase())
                .with_metadata("duration_ms", duration_ms.to_string()),
            );
        } else {
            let error_class = result.metadata.error_class.as_deref().unwrap_or("unclassified");
            warn!(
                event_name = "agent.pipeline.failed",
                action_id,
                session_id = %context.session_id,
                duration_ms,
                error_class,
                error = result.error.as_deref().unwrap_or_default(),
                "action failed"
            );
            self.audit.emit(
                AuditEvent::new(
                    &audit,
                    "pipeline.action_failed",
                    AuditCategory::Execution,
                    AuditOutcome::Failed,
                )
                .with_metadata("error_class", error_class)
                .with_metadata("duration_ms", duration_ms.to_string()),
            );
        }
        result
    }
}

fn configuration_failure(message: impl Into<String>, error_class: &str) -> ActionResult {
    ActionResult::failure(message).with_error_class(error_class)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use parley_core::audit::InMemoryAuditSink;
    use parley_core::capability::{CapabilityError, EntityCapability, EntityRegistry};
    use parley_core::context::UnifiedContext;
    use parley_core::domain::action::{
        ActionDefinition, ActionInvocation, ActionResult, ExecutorKind, ExtractionResult,
        FieldSpec, PeerRef,
    };
    use parley_core::domain::entity::EntityRecord;

    use super::{CustomExecutor, ExecutionPipeline};
    use crate::catalog::DiscoveredCatalog;
    use crate::middleware::ReadinessMiddleware;
    use crate::peer::{InMemoryPeerTransport, PeerExecuteResponse};

    struct Tags;

    #[async_trait]
    impl EntityCapability for Tags {
        fn entity_type(&self) -> &str {
            "tag"
        }

        fn field_schema(&self) -> BTreeMap<String, FieldSpec> {
            BTreeMap::from([("name".to_string(), FieldSpec::string("Tag name").required())])
        }

        async fn create(
            &self,
            params: &Map<String, Value>,
            _user_id: &str,
        ) -> Result<EntityRecord, CapabilityError> {
            match params.get("name").and_then(Value::as_str) {
                Some("reserved") => Err(CapabilityError::Rejected {
                    entity_type: "tag".to_string(),
                    message: "that name is reserved".to_string(),
                }),
                Some(name) => Ok(EntityRecord::new(12, "tag", name)),
                None => Err(CapabilityError::Validation("`name` is required".to_string())),
            }
        }

        async fn search(
            &self,
            _field: &str,
            _value: &str,
        ) -> Result<Vec<EntityRecord>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    struct Exploding;

    #[async_trait]
    impl CustomExecutor for Exploding {
        async fn execute(
            &self,
            invocation: &ActionInvocation,
            _context: &UnifiedContext,
        ) -> anyhow::Result<ActionResult> {
            if invocation.payload.params.contains_key("fail") {
                anyhow::bail!("report backend offline");
            }
            panic!("report generator crashed");
        }
    }

    fn catalog() -> DiscoveredCatalog {
        let peer = PeerRef { node_id: "north".to_string(), base_url: "http://north".to_string() };
        let mut remote = ActionDefinition::new("remote.north.vendor", ExecutorKind::RemoteCreate)
            .with_field("name", FieldSpec::string("Vendor").required())
            .for_entity("vendor");
        remote.peer = Some(peer);

        DiscoveredCatalog::from_actions([
            ActionDefinition::new("create_tag", ExecutorKind::LocalCreate)
                .with_field("name", FieldSpec::string("Tag name").required())
                .for_entity("tag"),
            remote,
            ActionDefinition::new("build_report", ExecutorKind::Custom),
            ActionDefinition::new("onboard", ExecutorKind::Workflow).with_workflow("onboard"),
        ])
    }

    fn invocation(catalog: &DiscoveredCatalog, id: &str, params: Value) -> ActionInvocation {
        let definition = catalog.get(id).cloned().unwrap_or_else(|| {
            ActionDefinition::new(id, ExecutorKind::Custom).normalized()
        });
        let params = params.as_object().cloned().unwrap_or_default();
        ActionInvocation::from_extraction(
            &definition,
            ExtractionResult { params, missing: Vec::new(), confidence: 1.0, duration_ms: 1 },
        )
    }

    fn pipeline(transport: InMemoryPeerTransport, audit: &InMemoryAuditSink) -> ExecutionPipeline {
        let mut registry = EntityRegistry::new();
        registry.register(Tags);
        ExecutionPipeline::new(Arc::new(registry), Arc::new(transport))
            .with_custom("build_report", Arc::new(Exploding))
            .with_audit_sink(Arc::new(audit.clone()))
    }

    #[tokio::test]
    async fn local_create_results_are_stamped_and_audited() {
        let audit = InMemoryAuditSink::default();
        let pipeline = pipeline(InMemoryPeerTransport::new(), &audit);
        let catalog = catalog();
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let tag = invocation(&catalog, "create_tag", json!({"name": "urgent"}));
        let result = pipeline.execute(&catalog, tag, &mut context).await;
        assert!(result.is_completed());
        assert_eq!(result.message, "Created urgent.");
        assert_eq!(result.data["id"], json!(12));
        assert_eq!(result.metadata.action_id, "create_tag");
        assert_eq!(result.metadata.action_label, "Create tag");

        let rejected = pipeline
            .execute(
                &catalog,
                invocation(&catalog, "create_tag", json!({"name": "reserved"})),
                &mut context,
            )
            .await;
        assert!(!rejected.success);
        assert_eq!(rejected.metadata.error_class.as_deref(), Some("capability.rejected"));
        assert_eq!(audit.event_types(), vec!["pipeline.action_executed", "pipeline.action_failed"]);
    }

    #[tokio::test]
    async fn unknown_actions_and_missing_wiring_fail_with_configuration_classes() {
        let audit = InMemoryAuditSink::default();
        let pipeline = pipeline(InMemoryPeerTransport::new(), &audit);
        let catalog = catalog();
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let launch = invocation(&catalog, "launch", json!({}));
        let unknown = pipeline.execute(&catalog, launch, &mut context).await;
        assert_eq!(unknown.metadata.error_class.as_deref(), Some("configuration.unknown_action"));
        assert_eq!(unknown.metadata.action_id, "launch");

        let onboard = invocation(&catalog, "onboard", json!({}));
        let workflow = pipeline.execute(&catalog, onboard, &mut context).await;
        assert_eq!(
            workflow.metadata.error_class.as_deref(),
            Some("configuration.no_workflow_runner")
        );
    }

    #[tokio::test]
    async fn remote_rejections_and_timeouts_become_failures() {
        let audit = InMemoryAuditSink::default();
        let catalog = catalog();
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let rejecting = InMemoryPeerTransport::new().with_response(
            "vendor",
            PeerExecuteResponse {
                success: false,
                message: None,
                data: Value::Null,
                error: Some("duplicate vendor".to_string()),
            },
        );
        let vendor = invocation(&catalog, "remote.north.vendor", json!({"name": "Hooli"}));
        let result = pipeline(rejecting.clone(), &audit)
            .execute(&catalog, vendor.clone(), &mut context)
            .await;
        assert_eq!(result.metadata.error_class.as_deref(), Some("peer.rejected"));
        assert_eq!(result.error.as_deref(), Some("north declined: duplicate vendor"));
        let executed = rejecting.executed();
        assert_eq!(executed[0].0, "north");
        assert_eq!(executed[0].1.params.get("name"), Some(&json!("Hooli")));
        assert_eq!(executed[0].1.user_id, "user-1");

        let silent = pipeline(InMemoryPeerTransport::new(), &audit)
            .execute(&catalog, vendor, &mut context)
            .await;
        assert_eq!(silent.metadata.error_class.as_deref(), Some("peer.timeout"));
    }

    #[tokio::test]
    async fn custom_executor_errors_and_panics_are_contained() {
        let audit = InMemoryAuditSink::default();
        let pipeline = pipeline(InMemoryPeerTransport::new(), &audit);
        let catalog = catalog();
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let report = invocation(&catalog, "build_report", json!({"fail": true}));
        let failed = pipeline.execute(&catalog, report, &mut context).await;
        assert_eq!(failed.metadata.error_class.as_deref(), Some("custom.error"));
        assert!(failed.message.contains("report backend offline"));

        let panicked = pipeline
            .execute(&catalog, invocation(&catalog, "build_report", json!({})), &mut context)
            .await;
        assert!(!panicked.success);
        assert_eq!(panicked.metadata.error_class.as_deref(), Some("panic"));
        assert!(panicked.message.contains("report generator crashed"));
    }

    #[tokio::test]
    async fn middleware_short_circuits_before_dispatch() {
        let audit = InMemoryAuditSink::default();
        let transport = InMemoryPeerTransport::new();
        let pipeline =
            pipeline(transport.clone(), &audit).with_middleware(Arc::new(ReadinessMiddleware));
        let catalog = catalog();
        let mut context = UnifiedContext::new("sess-1", "user-1");

        let definition = catalog.get("remote.north.vendor").cloned().expect("remote action");
        let invocation = ActionInvocation::from_extraction(
            &definition,
            ExtractionResult {
                params: Map::new(),
                missing: vec!["name".to_string()],
                confidence: 0.0,
                duration_ms: 1,
            },
        );
        let result = pipeline.execute(&catalog, invocation, &mut context).await;
        assert!(result.needs_more_input());
        assert!(transport.executed().is_empty());
        assert_eq!(pipeline.middleware_names(), vec!["readiness"]);
    }
}
