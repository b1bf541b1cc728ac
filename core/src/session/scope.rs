//! Variable scopes shared between frames
//!
//! Frames refer to their variables by `ScopeId`. A `call` sub-flow receives
//! its parent's id so writes are visible to both; every other activation
//! allocates a fresh scope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};

/// Variable bindings of one scope
pub type Variables = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeArena {
    next_id: u64,
    scopes: BTreeMap<ScopeId, Variables>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new scope seeded with `initial`
    pub fn allocate(&mut self, initial: Variables) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        self.scopes.insert(id, initial);
        id
    }

    pub fn get(&self, id: ScopeId) -> Option<&Variables> {
        self.scopes.get(&id)
    }

    pub fn get_mut(&mut self, id: ScopeId) -> Option<&mut Variables> {
        self.scopes.get_mut(&id)
    }

    pub fn contains(&self, id: ScopeId) -> bool {
        self.scopes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Drop every scope not in `live`
    pub fn retain_live(&mut self, live: &BTreeSet<ScopeId>) {
        self.scopes.retain(|id, _| live.contains(id));
    }
}
