//! Entities backed by a coordinator
//!
//! An entity implements [`SnapshotEntity`] to render its state from the
//! coordinator's snapshot. [`CoordinatorEntity`] wraps it, subscribes while
//! the entity is added and enabled, and writes a fresh state on every
//! coordinator notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use ha_core::{Entity, EntityState, SharedStateWriter};
use tracing::debug;

use crate::coordinator::DataUpdateCoordinator;
use crate::listeners::ListenerHandle;
use crate::lock::lock;

/// What an entity backed by a coordinator has to provide
pub trait SnapshotEntity<T: Send + Sync + 'static>: Send + Sync + 'static {
    fn entity_id(&self) -> &str;

    /// Render state from the latest successful snapshot
    fn update_from_snapshot(&self, data: &T) -> EntityState;

    /// Override for finer-grained availability (a missing device in the snapshot)
    fn available(&self, coordinator: &DataUpdateCoordinator<T>) -> bool {
        coordinator.last_update_success()
    }

    /// Context registered with the listener, see [`DataUpdateCoordinator::contexts`]
    fn listener_context(&self) -> Option<String> {
        None
    }
}

pub struct CoordinatorEntity<T, E> {
    coordinator: DataUpdateCoordinator<T>,
    entity: E,
    writer: SharedStateWriter,
    listener: Mutex<Option<ListenerHandle>>,
    added: AtomicBool,
    enabled: AtomicBool,
    me: Weak<Self>,
}

impl<T, E> CoordinatorEntity<T, E>
where
    T: Send + Sync + 'static,
    E: SnapshotEntity<T>,
{
    pub fn new(coordinator: DataUpdateCoordinator<T>, entity: E, writer: SharedStateWriter) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            coordinator,
            entity,
            writer,
            listener: Mutex::new(None),
            added: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            me: me.clone(),
        })
    }

    pub fn coordinator(&self) -> &DataUpdateCoordinator<T> {
        &self.coordinator
    }

    /// The wrapped entity
    pub fn entity(&self) -> &E {
        &self.entity
    }

    /// State as it would be written now
    pub fn current_state(&self) -> EntityState {
        if !Entity::available(self) {
            return EntityState::unavailable();
        }
        match self.coordinator.data() {
            Some(data) => self.entity.update_from_snapshot(&data),
            None => EntityState::unknown(),
        }
    }

    pub fn write_state(&self) {
        self.writer.write_state(self.entity.entity_id(), self.current_state());
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Enable or disable the entity at runtime
    ///
    /// A disabled entity holds no listener, so it never keeps its
    /// coordinator polling. Re-enabling resubscribes and writes a fresh state.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        debug!(entity_id = self.entity.entity_id(), enabled, "Entity enabled state changed");
        if !self.added.load(Ordering::SeqCst) {
            return;
        }
        if enabled {
            self.subscribe();
        } else {
            self.unsubscribe();
        }
    }

    fn subscribe(&self) {
        {
            let mut slot = lock(&self.listener);
            if slot.is_some() {
                return;
            }
            let weak = self.me.clone();
            let callback = move || {
                if let Some(entity) = weak.upgrade() {
                    entity.handle_coordinator_update();
                }
            };
            let handle = match self.entity.listener_context() {
                Some(context) => self.coordinator.add_listener_with_context(callback, context),
                None => self.coordinator.add_listener(callback),
            };
            *slot = Some(handle);
        }
        self.write_state();
    }

    fn unsubscribe(&self) {
        if let Some(handle) = lock(&self.listener).take() {
            self.coordinator.remove_listener(&handle);
        }
    }

    fn handle_coordinator_update(&self) {
        if self.is_enabled() {
            self.write_state();
        }
    }
}

#[async_trait]
impl<T, E> Entity for CoordinatorEntity<T, E>
where
    T: Send + Sync + 'static,
    E: SnapshotEntity<T>,
{
    fn entity_id(&self) -> &str {
        self.entity.entity_id()
    }

    fn available(&self) -> bool {
        self.entity.available(&self.coordinator)
    }

    fn added_to_hass(&self) {
        self.added.store(true, Ordering::SeqCst);
        if self.is_enabled() {
            self.subscribe();
        }
    }

    fn will_remove_from_hass(&self) {
        self.added.store(false, Ordering::SeqCst);
        self.unsubscribe();
    }

    async fn update(&self) {
        if !self.is_enabled() {
            debug!(entity_id = self.entity.entity_id(), "Ignoring update request for disabled entity");
            return;
        }
        self.coordinator.request_refresh().await;
    }
}
