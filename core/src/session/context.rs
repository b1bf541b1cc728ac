use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::scope::{ScopeArena, ScopeId, Variables};
use super::stacks::InterruptionStack;
use crate::error::{EngineError, EngineResult};
use crate::types::ContextEntry;

/// All mutable state of one conversation.
///
/// The engine keeps nothing between calls: the host stores this value and
/// hands back exactly what the previous call returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: String,
    pub flow_stacks: InterruptionStack,
    pub scopes: ScopeArena,
    pub global_accumulated_messages: Vec<String>,
    pub last_chat_turn: Option<ContextEntry>,
    pub global_variables: Variables,
    /// Conversation turns seen while no flow was active
    #[serde(default)]
    pub history: Vec<ContextEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>, globals: Variables) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: user_id.into(),
            flow_stacks: InterruptionStack::new(),
            scopes: ScopeArena::new(),
            global_accumulated_messages: Vec::new(),
            last_chat_turn: None,
            global_variables: globals,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check that every frame's scope still exists
    pub fn validate(&self) -> EngineResult<()> {
        for frame in self.flow_stacks.frames() {
            if !self.scopes.contains(frame.scope) {
                return Err(EngineError::SessionCorruption(format!(
                    "frame for flow '{}' refers to missing scope {}",
                    frame.flow_name, frame.scope.0
                )));
            }
        }
        Ok(())
    }

    pub fn variables(&self, scope: ScopeId) -> EngineResult<&Variables> {
        self.scopes.get(scope).ok_or_else(|| missing_scope(scope))
    }

    pub fn variables_mut(&mut self, scope: ScopeId) -> EngineResult<&mut Variables> {
        self.scopes.get_mut(scope).ok_or_else(|| missing_scope(scope))
    }

    /// Drop scopes no frame refers to any more
    pub fn collect_scopes(&mut self) {
        let live: BTreeSet<ScopeId> = self.flow_stacks.frames().map(|f| f.scope).collect();
        self.scopes.retain_live(&live);
    }

    /// Take all pending output as one response
    pub fn flush_messages(&mut self) -> Option<String> {
        if self.global_accumulated_messages.is_empty() {
            return None;
        }
        let messages = std::mem::take(&mut self.global_accumulated_messages);
        Some(messages.join("\n\n"))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn missing_scope(scope: ScopeId) -> EngineError {
    EngineError::SessionCorruption(format!("scope {} does not exist", scope.0))
}
