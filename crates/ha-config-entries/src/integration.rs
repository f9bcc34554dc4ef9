//! What an integration provides to the config entry manager

use std::sync::Arc;

use async_trait::async_trait;
use ha_core::{Entity, SetupError};

use crate::context::EntryContext;
use crate::entry::ConfigEntry;

/// An integration that can be set up from config entries of its domain
#[async_trait]
pub trait Integration: Send + Sync + 'static {
    fn domain(&self) -> &str;

    /// Schema version of the entry data this integration expects
    fn version(&self) -> u32 {
        1
    }

    /// Upgrade `entry` in place to [`Integration::version`]
    ///
    /// Return `false` when the stored version cannot be migrated.
    async fn migrate_entry(&self, _entry: &mut ConfigEntry) -> bool {
        false
    }

    /// Set up one entry
    ///
    /// Usually builds a coordinator, awaits its first refresh, stores it as
    /// runtime data and forwards to the entity platforms.
    async fn setup_entry(&self, ctx: &EntryContext) -> Result<(), SetupError>;

    /// Unload one entry; returning `false` leaves it in `FailedUnload`
    async fn unload_entry(&self, ctx: &EntryContext) -> bool {
        ctx.unload_platforms().await
    }
}

/// Creates the entities of one platform ("sensor", "binary_sensor") for an entry
#[async_trait]
pub trait EntityPlatform: Send + Sync + 'static {
    fn platform(&self) -> &str;

    async fn setup_entry(&self, ctx: &EntryContext) -> Result<Vec<Arc<dyn Entity>>, SetupError>;
}
