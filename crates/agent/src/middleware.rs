//! Cross-cutting checks that run before an invocation reaches its executor.
//!
//! The pipeline runs its chain in insertion order and stops at the first
//! short-circuit. An empty chain dispatches everything.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::json;

use parley_core::context::UnifiedContext;
use parley_core::domain::action::{ActionDefinition, ActionInvocation, ActionResult, ExecutorKind};

#[derive(Clone, Debug, PartialEq)]
pub enum MiddlewareDecision {
    Continue,
    ShortCircuit(ActionResult),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(
        &self,
        invocation: &ActionInvocation,
        definition: &ActionDefinition,
        context: &UnifiedContext,
    ) -> MiddlewareDecision;
}

/// Holds back direct actions that are still missing required parameters.
///
/// Workflow hand-offs pass through: collecting missing data is the
/// workflow's own job.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadinessMiddleware;

#[async_trait]
impl Middleware for ReadinessMiddleware {
    fn name(&self) -> &'static str {
        "readiness"
    }

    async fn before(
        &self,
        invocation: &ActionInvocation,
        definition: &ActionDefinition,
        _context: &UnifiedContext,
    ) -> MiddlewareDecision {
        let missing = &invocation.payload.missing;
        if missing.is_empty() || definition.executor == ExecutorKind::Workflow {
            return MiddlewareDecision::Continue;
        }
        let message = format!(
            "To {} I still need: {}.",
            definition.label.to_lowercase(),
            missing.join(", ")
        );
        MiddlewareDecision::ShortCircuit(ActionResult::needs_input(
            message,
            json!({"missing": missing, "params": invocation.payload.params}),
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionPolicy {
    pub allow_remote: bool,
    pub allow_custom: bool,
    pub denied_actions: BTreeSet<String>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self { allow_remote: true, allow_custom: true, denied_actions: BTreeSet::new() }
    }
}

impl PermissionPolicy {
    pub fn deny_action(mut self, action_id: impl Into<String>) -> Self {
        self.denied_actions.insert(action_id.into());
        self
    }

    pub fn evaluate(&self, definition: &ActionDefinition) -> PermissionDecision {
        if self.denied_actions.contains(&definition.id) {
            return PermissionDecision::Deny {
                reason_code: "action_denied",
                user_message: format!(
                    "I am not allowed to {} from chat.",
                    definition.label.to_lowercase()
                ),
            };
        }
        match definition.executor {
            ExecutorKind::RemoteCreate if !self.allow_remote => PermissionDecision::Deny {
                reason_code: "remote_disabled",
                user_message: "Actions on connected systems are currently disabled.".to_string(),
            },
            ExecutorKind::Custom if !self.allow_custom => PermissionDecision::Deny {
                reason_code: "custom_disabled",
                user_message: "Custom actions are currently disabled.".to_string(),
            },
            _ => PermissionDecision::Allow,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PermissionMiddleware {
    policy: PermissionPolicy,
}

impl PermissionMiddleware {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for PermissionMiddleware {
    fn name(&self) -> &'static str {
        "permission"
    }

    async fn before(
        &self,
        _invocation: &ActionInvocation,
        definition: &ActionDefinition,
        _context: &UnifiedContext,
    ) -> MiddlewareDecision {
        match self.policy.evaluate(definition) {
            PermissionDecision::Allow => MiddlewareDecision::Continue,
            PermissionDecision::Deny { reason_code, user_message } => {
                MiddlewareDecision::ShortCircuit(
                    ActionResult::failure(user_message)
                        .with_error_class(format!("permission.{reason_code}")),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use parley_core::context::UnifiedContext;
    use parley_core::domain::action::{
        ActionDefinition, ActionInvocation, ExecutorKind, ExtractionResult, FieldSpec,
    };

    use super::{
        Middleware, MiddlewareDecision, PermissionDecision, PermissionMiddleware,
        PermissionPolicy, ReadinessMiddleware,
    };

    fn contact_action(executor: ExecutorKind) -> ActionDefinition {
        ActionDefinition::new("create_contact", executor)
            .with_field("name", FieldSpec::string("Name").required())
            .with_field("email", FieldSpec::string("Email").required())
            .normalized()
    }

    fn invocation(definition: &ActionDefinition, missing: &[&str]) -> ActionInvocation {
        let mut params = Map::new();
        params.insert("name".to_string(), json!("Ada"));
        ActionInvocation::from_extraction(
            definition,
            ExtractionResult {
                params,
                missing: missing.iter().map(|name| name.to_string()).collect(),
                confidence: 0.35,
                duration_ms: 3,
            },
        )
    }

    #[tokio::test]
    async fn readiness_asks_for_missing_parameters_of_direct_actions() {
        let definition = contact_action(ExecutorKind::LocalCreate);
        let context = UnifiedContext::new("sess-1", "user-1");
        let decision = ReadinessMiddleware
            .before(&invocation(&definition, &["email"]), &definition, &context)
            .await;

        let MiddlewareDecision::ShortCircuit(result) = decision else {
            panic!("expected a short-circuit");
        };
        assert!(result.needs_more_input());
        assert_eq!(result.message, "To create contact I still need: email.");
    }

    #[tokio::test]
    async fn readiness_lets_workflows_collect_their_own_data() {
        let definition = contact_action(ExecutorKind::Workflow);
        let context = UnifiedContext::new("sess-1", "user-1");
        let decision = ReadinessMiddleware
            .before(&invocation(&definition, &["email"]), &definition, &context)
            .await;
        assert_eq!(decision, MiddlewareDecision::Continue);
    }

    #[test]
    fn denied_actions_and_disabled_executors_are_refused() {
        let policy = PermissionPolicy { allow_remote: false, ..PermissionPolicy::default() }
            .deny_action("delete_everything");

        let remote = contact_action(ExecutorKind::RemoteCreate);
        let PermissionDecision::Deny { reason_code, .. } = policy.evaluate(&remote) else {
            panic!("remote actions should be denied");
        };
        assert_eq!(reason_code, "remote_disabled");

        let denied = ActionDefinition::new("delete_everything", ExecutorKind::Custom).normalized();
        let PermissionDecision::Deny { reason_code, user_message } = policy.evaluate(&denied)
        else {
            panic!("listed actions should be denied");
        };
        assert_eq!(reason_code, "action_denied");
        assert!(user_message.contains("delete everything"));

        assert_eq!(
            policy.evaluate(&contact_action(ExecutorKind::LocalCreate)),
            PermissionDecision::Allow
        );
    }

    #[tokio::test]
    async fn permission_denials_become_classified_failures() {
        let middleware = PermissionMiddleware::new(PermissionPolicy {
            allow_custom: false,
            ..PermissionPolicy::default()
        });
        let definition = contact_action(ExecutorKind::Custom);
        let context = UnifiedContext::new("sess-1", "user-1");

        let decision =
            middleware.before(&invocation(&definition, &[]), &definition, &context).await;
        let MiddlewareDecision::ShortCircuit(result) = decision else {
            panic!("expected a short-circuit");
        };
        assert!(!result.success);
        assert_eq!(result.metadata.error_class.as_deref(), Some("permission.custom_disabled"));
    }
}
