//! Core contracts for Home Assistant update coordination
//!
//! This crate provides the types shared between update sources, the
//! coordinators that poll them, and the config entry layer that owns the
//! coordinators: the error taxonomy, the entity capability interface, the
//! entity state sink, and the back-channel a coordinator uses to talk to
//! its config entry.

mod entity;
mod entry_link;
mod error;
mod states;

pub use entity::{Entity, EntityState, SharedStateWriter, StateWriter};
pub use entry_link::{EntryLink, UnloadHook};
pub use error::{SetupError, UpdateError, UpdateResult};
pub use states::MemoryStates;

/// State value written for entities whose source is failing
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value written for entities that have no data yet
pub const STATE_UNKNOWN: &str = "unknown";
