//! Conversational action runtime.
//!
//! A turn flows through a fixed chain:
//! 1. **Discovery** (`catalog`) - local capabilities, peer listings and static
//!    actions merged into one catalog, cached per TTL
//! 2. **Extraction** (`extractor`) - the model fills an action's parameters
//!    from the scoped conversation; `parsing` reads short answers without it
//! 3. **Execution** (`pipeline`) - middleware, then dispatch to a local
//!    capability, a peer node, a guided workflow or a custom executor
//! 4. **Workflows** (`workflow`) - step graphs that collect data, resolve
//!    entities, nest sub-workflows and confirm before the final action
//!
//! `runtime::AgentRuntime` ties these together and owns session persistence.
//!
//! The model only translates text into parameters. It never decides which
//! record a reference resolves to or whether an action runs.

pub mod catalog;
pub mod extractor;
pub mod llm;
pub mod middleware;
pub mod parsing;
pub mod peer;
pub mod pipeline;
pub mod runtime;
pub mod workflow;

pub use catalog::{ActionCatalog, CatalogStats, DiscoveredCatalog};
pub use extractor::{HistoryScope, ParameterExtractor};
pub use llm::{DisabledLlmClient, HttpLlmClient, LlmClient, LlmError, ScriptedLlmClient};
pub use middleware::{Middleware, MiddlewareDecision, PermissionMiddleware, ReadinessMiddleware};
pub use peer::{HttpPeerTransport, InMemoryPeerTransport, PeerError, PeerTransport};
pub use pipeline::{CustomExecutor, ExecutionPipeline};
pub use runtime::{AgentRuntime, RuntimeBuilder, TurnOutcome};
pub use workflow::{FinalAction, WorkflowOutcome, WorkflowRegistry, WorkflowRunner};
