//! Home Assistant data update coordinator
//!
//! A coordinator polls one upstream source for many entities:
//!
//! - [`backoff`] - retry delay after consecutive failures
//! - [`source`] - the fetch capability the coordinator drives
//! - [`listeners`] - subscriber registry with isolated fan-out
//! - [`coordinator`] - snapshot, failure bookkeeping and scheduling
//! - [`entity`] - entities that render from the snapshot
//! - [`push`] - channel-fed updates from webhooks and sockets

pub mod backoff;
pub mod coordinator;
pub mod debounce;
pub mod entity;
pub mod listeners;
pub mod push;
pub mod source;

mod lock;

pub use backoff::BackoffPolicy;
pub use coordinator::{
    CoordinatorConfig, CoordinatorPhase, DataUpdateCoordinator, REQUEST_REFRESH_DEFAULT_COOLDOWN,
};
pub use debounce::Debouncer;
pub use entity::{CoordinatorEntity, SnapshotEntity};
pub use listeners::{ListenerHandle, ListenerId};
pub use push::PushEvent;
pub use source::{blocking, from_fn, BlockingSource, FnSource, UpdateSource};
