pub mod audit;
pub mod capability;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod resolver;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink};
pub use capability::{CapabilityError, EntityCapability, EntityRegistry};
pub use context::{ContextFrame, PendingAction, Role, UnifiedContext};
pub use domain::action::{
    ActionDefinition, ActionInvocation, ActionOrigin, ActionResult, ExecutorKind,
    ExtractionResult, FieldSpec, FieldType, ResultStatus,
};
pub use domain::entity::{
    EntityConfig, EntityFilter, EntityId, EntityRecord, ResolutionState, SubWorkflowRef,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{StepGraph, StepKind, StepSignal, WorkflowConfig};
pub use resolver::{EntityResolver, Resolution, ResolutionError};
