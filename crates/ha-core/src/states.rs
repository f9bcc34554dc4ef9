//! In-memory entity state table
//!
//! Stores the latest state written for each entity along with a write
//! counter. The server uses it as its state machine and tests use it to
//! observe what entities rendered.

use dashmap::DashMap;
use tracing::trace;

use crate::{EntityState, StateWriter};

#[derive(Debug, Clone)]
struct StateRecord {
    state: EntityState,
    writes: usize,
}

/// Latest state per entity
#[derive(Debug, Default)]
pub struct MemoryStates {
    states: DashMap<String, StateRecord>,
}

impl MemoryStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|r| r.state.clone())
    }

    /// Get the state value as a string
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|r| r.state.state.clone())
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    /// Number of times a state was written for the entity
    pub fn write_count(&self, entity_id: &str) -> usize {
        self.states.get(entity_id).map(|r| r.writes).unwrap_or(0)
    }

    /// Forget an entity's state
    pub fn remove(&self, entity_id: &str) -> Option<EntityState> {
        self.states.remove(entity_id).map(|(_, r)| r.state)
    }

    /// All entity IDs with a state
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl StateWriter for MemoryStates {
    fn write_state(&self, entity_id: &str, state: EntityState) {
        trace!(entity_id, state = %state.state, "Writing entity state");
        self.states
            .entry(entity_id.to_string())
            .and_modify(|r| {
                r.state = state.clone();
                r.writes += 1;
            })
            .or_insert(StateRecord { state, writes: 1 });
    }
}
