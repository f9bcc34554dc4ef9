//! Entity capability interface and the state sink entities write to

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{STATE_UNAVAILABLE, STATE_UNKNOWN};

/// Rendered state of an entity: a state string plus attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// The state value (e.g., "on", "21.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl EntityState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// State written while the entity's source is failing
    pub fn unavailable() -> Self {
        Self::new(STATE_UNAVAILABLE)
    }

    /// State written before the first successful fetch
    pub fn unknown() -> Self {
        Self::new(STATE_UNKNOWN)
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }
}

/// Accepts entity state updates (the state machine, a recorder, a test log)
pub trait StateWriter: Send + Sync {
    fn write_state(&self, entity_id: &str, state: EntityState);
}

/// Shared handle to a state sink
pub type SharedStateWriter = Arc<dyn StateWriter>;

/// Lifecycle surface every entity exposes to the platform that owns it
///
/// Entities never poll on their own. They are attached when their platform
/// is set up and detached before their config entry finishes unloading.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    fn entity_id(&self) -> &str;

    /// Whether the entity currently reports real data
    fn available(&self) -> bool;

    /// Called once the entity has been added; subscribes to its data source
    fn added_to_hass(&self);

    /// Called before the entity is removed; must leave no listener behind
    fn will_remove_from_hass(&self);

    /// Explicit update request (the `homeassistant.update_entity` service)
    async fn update(&self) {}
}
