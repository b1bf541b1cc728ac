use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::ScopeId;
use crate::flows::{FlowDefinition, FlowStep};
use crate::transaction::Transaction;
use crate::types::ContextEntry;

/// A strong intent for another flow, held until the user confirms it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingInterruption {
    pub target_flow: String,
    pub requested_at: DateTime<Utc>,
}

/// One in-progress flow or sub-flow activation.
///
/// `steps_stack` holds the remaining steps in reverse order so the next step
/// to run is always the last element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowFrame {
    pub flow_name: String,
    pub flow_id: String,
    pub flow_version: String,
    pub definition_hash: String,
    pub steps_stack: Vec<FlowStep>,
    pub context_stack: Vec<ContextEntry>,
    pub scope: ScopeId,
    pub transaction: Transaction,
    pub pending_variable: Option<String>,
    pub last_say_message: Option<String>,
    pub pending_interruption: Option<PendingInterruption>,
    #[serde(default)]
    pub just_resumed: bool,
    /// Closed transactions of flows this frame was replaced from, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaced_transactions: Vec<Transaction>,
}

impl FlowFrame {
    pub fn new(
        definition: &FlowDefinition,
        definition_hash: String,
        scope: ScopeId,
        transaction: Transaction,
    ) -> Self {
        Self {
            flow_name: definition.name.clone(),
            flow_id: definition.id.clone(),
            flow_version: definition.version.clone(),
            definition_hash,
            steps_stack: definition.steps.iter().rev().cloned().collect(),
            context_stack: Vec::new(),
            scope,
            transaction,
            pending_variable: None,
            last_say_message: None,
            pending_interruption: None,
            just_resumed: false,
            replaced_transactions: Vec::new(),
        }
    }

    pub fn peek_step(&self) -> Option<&FlowStep> {
        self.steps_stack.last()
    }

    pub fn pop_step(&mut self) -> Option<FlowStep> {
        self.steps_stack.pop()
    }

    /// Schedule `step` to run next
    pub fn push_step(&mut self, step: FlowStep) {
        self.steps_stack.push(step);
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps_stack.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.steps_stack.is_empty()
    }

    pub fn record(&mut self, entry: ContextEntry) {
        self.context_stack.push(entry);
    }

    /// Swap this frame over to another flow in place.
    ///
    /// The scope is kept; the previous transaction is returned so the caller
    /// can close it.
    pub fn replace_flow(
        &mut self,
        definition: &FlowDefinition,
        definition_hash: String,
        transaction: Transaction,
    ) -> Transaction {
        self.flow_name = definition.name.clone();
        self.flow_id = definition.id.clone();
        self.flow_version = definition.version.clone();
        self.definition_hash = definition_hash;
        self.steps_stack = definition.steps.iter().rev().cloned().collect();
        self.pending_variable = None;
        self.pending_interruption = None;
        self.just_resumed = false;
        std::mem::replace(&mut self.transaction, transaction)
    }
}
