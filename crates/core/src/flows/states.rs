use serde::{Deserialize, Serialize};

pub mod step_names {
    pub const COLLECT_DATA: &str = "collect_data";
    pub const RESOLVE_ENTITY_PREFIX: &str = "resolve_entity_";
    pub const COLLECT_ARRAY_ITEM_FIELDS: &str = "collect_array_item_fields";
    pub const CONFIRM_ACTION: &str = "confirm_action";
    pub const EXECUTE_FINAL_ACTION: &str = "execute_final_action";
    pub const COMPLETE: &str = "complete";
    pub const ERROR: &str = "error";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum StepKind {
    CollectData,
    /// Index into the workflow's ordered entity configs.
    ResolveEntity(usize),
    CollectArrayItemFields,
    ConfirmAction,
    ExecuteFinalAction,
    Complete,
    Error,
}

impl StepKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepSignal {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub description: String,
    pub kind: StepKind,
    pub on_success: Option<String>,
    pub on_failure: Option<String>,
}

impl StepDefinition {
    pub fn target(&self, signal: StepSignal) -> Option<&str> {
        match signal {
            StepSignal::Succeeded => self.on_success.as_deref(),
            StepSignal::Failed => self.on_failure.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: String,
    pub to: String,
    pub signal: StepSignal,
}
