pub mod engine;
pub mod states;

pub use engine::{FlowTransitionError, StepGraph, WorkflowConfig};
pub use states::{step_names, StepDefinition, StepKind, StepSignal, TransitionOutcome};
