//! Per-session conversational state and the call-stack used for nested
//! sub-workflows.
//!
//! A [`UnifiedContext`] is loaded at the start of every turn, mutated by the
//! orchestrator and written back in full at the end of the turn.
//!
//! Entering a sub-workflow pushes an immutable [`ContextFrame`] holding the
//! parent's workflow id, step and serialized state, then replaces the live
//! state with a fresh one seeded only with the declared inputs. Exiting pops
//! that exact frame, restores it verbatim and merges back only the declared
//! result keys.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::entity::{EntityId, EntityResolution, ResolutionState};
use crate::errors::DomainError;

pub const MAX_CALL_DEPTH: usize = 4;

/// Well-known metadata keys.
pub mod keys {
    pub const IS_SUBWORKFLOW: &str = "is_subworkflow";
    pub const AWAITING_CONFIRMATION: &str = "awaiting_confirmation";
    pub const AWAITING_FIELD: &str = "awaiting_field";
    pub const AWAITING_ENTITY: &str = "awaiting_entity";
    pub const AWAITING_CREATE: &str = "awaiting_create";
    pub const AI_EXTRACTION_DONE: &str = "ai_extraction_done";
    pub const ITEM_CURSOR: &str = "item_cursor";
    pub const FINAL_RESULT: &str = "final_result";
    pub const SUBWORKFLOW_RESULT: &str = "subworkflow_result";
    pub const CANDIDATES_PREFIX: &str = "candidates:";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// A direct action that could not run yet because parameters are missing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub action_id: String,
    pub start_index: usize,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextFrame {
    pub workflow_id: Option<String>,
    pub step: Option<String>,
    pub state: Value,
    pub pushed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FrameState {
    workflow_state: Map<String, Value>,
    entities: BTreeMap<String, EntityResolution>,
    metadata: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedContext {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub workflow_state: Map<String, Value>,
    #[serde(default)]
    pub current_workflow: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityResolution>,
    #[serde(default)]
    pub call_stack: VecDeque<ContextFrame>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub pending_action: Option<PendingAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            history: Vec::new(),
            workflow_state: Map::new(),
            current_workflow: None,
            current_step: None,
            entities: BTreeMap::new(),
            call_stack: VecDeque::new(),
            metadata: BTreeMap::new(),
            pending_action: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn push_message(&mut self, role: Role, content: impl Into<String>) -> usize {
        self.history.push(HistoryEntry { role, content: content.into(), at: Utc::now() });
        self.history.len() - 1
    }

    pub fn history_since(&self, index: usize) -> &[HistoryEntry] {
        self.history.get(index..).unwrap_or(&[])
    }

    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        if value {
            self.metadata.insert(key.to_string(), Value::Bool(true));
        } else {
            self.metadata.remove(key);
        }
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn take_meta(&mut self, key: &str) -> Option<Value> {
        self.metadata.remove(key)
    }

    pub fn entity(&self, key: &str) -> EntityResolution {
        self.entities.get(key).cloned().unwrap_or_default()
    }

    pub fn mark_entity_pending(
        &mut self,
        key: &str,
        identifier: impl Into<String>,
    ) -> Result<(), DomainError> {
        self.transition_entity(key, ResolutionState::Pending)?;
        if let Some(entry) = self.entities.get_mut(key) {
            entry.identifier = Some(identifier.into());
        }
        Ok(())
    }

    pub fn mark_entity_resolved(&mut self, key: &str, id: EntityId) -> Result<(), DomainError> {
        self.transition_entity(key, ResolutionState::Resolved)?;
        if let Some(entry) = self.entities.get_mut(key) {
            entry.entity_id = Some(id);
        }
        Ok(())
    }

    pub fn mark_entity_missing(&mut self, key: &str) -> Result<(), DomainError> {
        self.transition_entity(key, ResolutionState::Missing)
    }

    pub fn mark_entity_failed(&mut self, key: &str) -> Result<(), DomainError> {
        self.transition_entity(key, ResolutionState::Failed)
    }

    /// Explicit invalidation: the only way back to `Unresolved`.
    pub fn invalidate_entity(&mut self, key: &str) {
        self.entities.remove(key);
    }

    fn transition_entity(&mut self, key: &str, next: ResolutionState) -> Result<(), DomainError> {
        let entry = self.entities.entry(key.to_string()).or_default();
        if !entry.state.can_transition_to(next) {
            return Err(DomainError::InvalidResolutionTransition {
                entity: key.to_string(),
                from: entry.state,
                to: next,
            });
        }
        entry.state = next;
        Ok(())
    }

    pub fn is_subworkflow(&self) -> bool {
        !self.call_stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Starts a fresh run of `workflow_id` at the top level or inside the
    /// current frame, discarding any state of a previous run.
    pub fn begin_workflow(&mut self, workflow_id: impl Into<String>, initial: Map<String, Value>) {
        let nested = self.is_subworkflow();
        self.current_workflow = Some(workflow_id.into());
        self.current_step = None;
        self.workflow_state = initial;
        self.entities.clear();
        self.metadata.clear();
        self.set_flag(keys::IS_SUBWORKFLOW, nested);
        self.touch();
    }

    /// Clears the run state once a top-level workflow reached a terminal step.
    pub fn finish_workflow(&mut self) {
        self.current_workflow = None;
        self.current_step = None;
        self.workflow_state.clear();
        self.entities.clear();
        self.metadata.clear();
        self.touch();
    }

    pub fn enter_sub_workflow(
        &mut self,
        child_workflow: impl Into<String>,
        seed: Map<String, Value>,
    ) -> Result<(), DomainError> {
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(DomainError::CallStackOverflow { max_depth: MAX_CALL_DEPTH });
        }

        let snapshot = FrameState {
            workflow_state: std::mem::take(&mut self.workflow_state),
            entities: std::mem::take(&mut self.entities),
            metadata: std::mem::take(&mut self.metadata),
        };
        let state = serde_json::to_value(&snapshot)
            .map_err(|error| DomainError::InvariantViolation(error.to_string()))?;

        self.call_stack.push_back(ContextFrame {
            workflow_id: self.current_workflow.take(),
            step: self.current_step.take(),
            state,
            pushed_at: Utc::now(),
        });

        self.current_workflow = Some(child_workflow.into());
        self.workflow_state = seed;
        self.set_flag(keys::IS_SUBWORKFLOW, true);
        self.touch();
        Ok(())
    }

    /// Pops the parent frame, restores it exactly, and copies only the
    /// declared `merge` keys (child key -> parent key) out of `result`.
    pub fn exit_sub_workflow(
        &mut self,
        result: &Map<String, Value>,
        merge: &BTreeMap<String, String>,
    ) -> Result<ContextFrame, DomainError> {
        let frame = self.call_stack.pop_back().ok_or(DomainError::EmptyCallStack)?;
        let restored: FrameState = serde_json::from_value(frame.state.clone())
            .map_err(|error| DomainError::InvariantViolation(error.to_string()))?;

        self.current_workflow = frame.workflow_id.clone();
        self.current_step = frame.step.clone();
        self.workflow_state = restored.workflow_state;
        self.entities = restored.entities;
        self.metadata = restored.metadata;

        for (child_key, parent_key) in merge {
            if let Some(value) = result.get(child_key) {
                self.workflow_state.insert(parent_key.clone(), value.clone());
            }
        }
        self.touch();
        Ok(frame)
    }
}
