//! Push sources
//!
//! Webhooks and sockets publish typed events on a channel the coordinator
//! drains, instead of calling into the coordinator from arbitrary tasks.

use std::sync::Arc;

use ha_core::UpdateError;
use tokio::sync::mpsc;
use tracing::debug;

use crate::coordinator::DataUpdateCoordinator;
use crate::lock::lock;

/// Event published by a push source
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent<T> {
    /// A full snapshot; committed as if fetched
    Data(T),
    /// Something changed upstream; refresh through the request cooldown
    RefreshRequested,
    /// The push source lost its upstream
    Error(UpdateError),
}

impl<T: Send + Sync + 'static> DataUpdateCoordinator<T> {
    /// Drain `events` into this coordinator until the channel closes
    ///
    /// The forwarding task stops on shutdown and never keeps the
    /// coordinator alive on its own.
    pub fn attach_push_source(&self, mut events: mpsc::Receiver<PushEvent<T>>) {
        let weak = Arc::downgrade(&self.inner);
        let name = self.name().to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let coordinator = DataUpdateCoordinator { inner };
                if coordinator.is_shut_down() {
                    break;
                }
                match event {
                    PushEvent::Data(data) => coordinator.set_updated_data(data),
                    PushEvent::Error(err) => coordinator.set_update_error(err),
                    PushEvent::RefreshRequested => coordinator.request_refresh().await,
                }
            }
            debug!(coordinator = %name, "Push source closed");
        });
        lock(&self.inner.push_tasks).push(task);
    }

    /// Create a channel already attached to this coordinator
    pub fn push_channel(&self, capacity: usize) -> mpsc::Sender<PushEvent<T>> {
        let (sender, receiver) = mpsc::channel(capacity);
        self.attach_push_source(receiver);
        sender
    }
}
