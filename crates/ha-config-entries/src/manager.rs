//! Config Entries Manager
//!
//! Owns every config entry and drives its lifecycle: setup with retry,
//! unload, reload, option updates and reauthentication requests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use ha_core::{Entity, SetupError, SharedStateWriter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::EntryContext;
use crate::entry::{ConfigEntry, ConfigEntryDisabledBy, ConfigEntryState, ConfigEntryUpdate};
use crate::integration::Integration;
use crate::lock::lock;
use crate::state_machine::{setup_retry_delay, InvalidTransition};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Config entries errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Integration not found: {0}")]
    IntegrationNotFound(String),

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Unload of entry {0} failed")]
    UnloadFailed(String),

    #[error("Migration of entry {entry_id} from version {from} to {to} failed")]
    Migration { entry_id: String, from: u32, to: u32 },

    #[error("Setup of entry {entry_id} failed: {source}")]
    Setup {
        entry_id: String,
        #[source]
        source: SetupError,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Lifecycle notifications broadcast by the manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEntryEvent {
    StateChanged {
        entry_id: String,
        from: ConfigEntryState,
        to: ConfigEntryState,
        reason: Option<String>,
    },
    Updated {
        entry_id: String,
    },
    /// Credentials were rejected; the user has to reauthenticate
    ReauthRequested {
        entry_id: String,
        domain: String,
        title: String,
        reason: String,
    },
}

pub(crate) struct ManagerInner {
    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    integrations: DashMap<String, Arc<dyn Integration>>,

    /// Contexts of loaded entries
    contexts: DashMap<String, EntryContext>,

    /// Serializes setup, unload and reload per entry
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,

    /// Pending setup retries
    retries: DashMap<String, JoinHandle<()>>,

    writer: SharedStateWriter,
    events: broadcast::Sender<ConfigEntryEvent>,
    rng: Mutex<StdRng>,
    me: Weak<ManagerInner>,
}

impl ManagerInner {
    fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    fn require(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        self.get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    fn integration(&self, domain: &str) -> Option<Arc<dyn Integration>> {
        self.integrations.get(domain).map(|r| Arc::clone(r.value()))
    }

    fn context(&self, entry_id: &str) -> Option<EntryContext> {
        self.contexts.get(entry_id).map(|r| r.value().clone())
    }

    fn entry_lock(&self, entry_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.locks.entry(entry_id.to_string()).or_default())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.entries.insert(entry_id.clone(), entry.clone());

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }

        self.entries.remove(&entry.entry_id);
    }

    fn unique_id_owner(&self, domain: &str, unique_id: &str) -> Option<String> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .map(|r| r.value().clone())
    }

    /// Validate and apply a state change, then broadcast it
    fn set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let from = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            let from = entry.state;
            entry.try_set_state(state, reason.clone())?;
            from
        };

        debug!(entry_id, ?from, to = ?state, "Config entry state changed");
        let _ = self.events.send(ConfigEntryEvent::StateChanged {
            entry_id: entry_id.to_string(),
            from,
            to: state,
            reason,
        });
        Ok(())
    }

    async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        self.setup_locked(entry_id).await
    }

    async fn setup_locked(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self.require(entry_id)?;

        if entry.is_loaded() {
            debug!("Entry {} is already loaded", entry_id);
            return Ok(());
        }
        if entry.is_disabled() {
            debug!("Skipping setup for disabled entry: {}", entry_id);
            return Ok(());
        }

        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let Some(integration) = self.integration(&entry.domain) else {
            error!(
                "Error setting up entry {} for {}: integration not found",
                entry.title, entry.domain
            );
            self.set_state(
                entry_id,
                ConfigEntryState::SetupError,
                Some(format!("Integration {} not found", entry.domain)),
            )?;
            return Err(ConfigEntriesError::IntegrationNotFound(entry.domain));
        };

        let entry = self.migrate(entry_id, integration.as_ref()).await?;

        let ctx = EntryContext::new(entry.clone(), Arc::clone(&self.writer), self.me.clone());
        match integration.setup_entry(&ctx).await {
            Ok(()) => {
                self.cancel_retry(entry_id);
                self.contexts.insert(entry_id.to_string(), ctx);
                self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!(
                    "Setup of {} entry '{}' complete [{}]",
                    entry.domain, entry.title, entry_id
                );
                Ok(())
            }
            Err(err) => {
                ctx.teardown().await;
                self.setup_failed(&entry, err)
            }
        }
    }

    fn setup_failed(&self, entry: &ConfigEntry, err: SetupError) -> ConfigEntriesResult<()> {
        let entry_id = entry.entry_id.as_str();

        match &err {
            SetupError::NotReady(message) => {
                let tries = self.entries.get(entry_id).map(|e| e.tries).unwrap_or(0);
                let delay = {
                    let mut rng = lock(&self.rng);
                    setup_retry_delay(tries, &mut *rng)
                };
                self.set_state(entry_id, ConfigEntryState::SetupRetry, Some(message.clone()))?;
                if let Some(mut stored) = self.entries.get_mut(entry_id) {
                    stored.increment_tries();
                }

                if tries == 0 {
                    warn!(
                        "Config entry '{}' for {} integration not ready yet: {}; Retrying in background",
                        entry.title, entry.domain, message
                    );
                } else {
                    debug!(
                        "Config entry '{}' for {} integration not ready yet: {}; Retrying in {:.0} seconds",
                        entry.title,
                        entry.domain,
                        message,
                        delay.as_secs_f64()
                    );
                }
                self.schedule_retry(entry_id, delay);
            }
            SetupError::AuthFailed(message) => {
                warn!(
                    "Config entry '{}' for {} integration could not authenticate: {}",
                    entry.title, entry.domain, message
                );
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(err.to_string()))?;
                self.start_reauth(entry_id, message);
            }
            SetupError::Failed(message) => {
                error!(
                    "Error setting up entry {} for {}: {}",
                    entry.title, entry.domain, message
                );
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(message.clone()))?;
            }
        }

        Err(ConfigEntriesError::Setup {
            entry_id: entry_id.to_string(),
            source: err,
        })
    }

    /// Bring the stored entry to the integration's version
    async fn migrate(
        &self,
        entry_id: &str,
        integration: &dyn Integration,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self.require(entry_id)?;
        let (from, to) = (entry.version, integration.version());
        if from == to {
            return Ok(entry);
        }

        let mut migrated = entry.clone();
        // Downgrades are never attempted
        let ok = from < to && integration.migrate_entry(&mut migrated).await && migrated.version == to;
        if !ok {
            error!(
                "Migration of {} entry '{}' from version {} to {} failed",
                entry.domain, entry.title, from, to
            );
            self.set_state(
                entry_id,
                ConfigEntryState::MigrationError,
                Some("Migration failed".to_string()),
            )?;
            return Err(ConfigEntriesError::Migration {
                entry_id: entry_id.to_string(),
                from,
                to,
            });
        }

        if let Some(mut stored) = self.entries.get_mut(entry_id) {
            stored.title = migrated.title;
            stored.data = migrated.data;
            stored.options = migrated.options;
            stored.version = to;
            stored.modified_at = Utc::now();
        }
        info!(
            "Migrated {} entry '{}' from version {} to {}",
            entry.domain, entry.title, from, to
        );
        self.require(entry_id)
    }

    fn schedule_retry(&self, entry_id: &str, delay: Duration) {
        let weak = self.me.clone();
        let id = entry_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.retries.remove(&id);
            if let Err(err) = manager.setup(&id).await {
                debug!(entry_id = %id, "Setup retry failed: {}", err);
            }
        });

        if let Some(previous) = self.retries.insert(entry_id.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, task)) = self.retries.remove(entry_id) {
            task.abort();
            debug!(entry_id, "Cancelled pending setup retry");
        }
    }

    async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;
        self.unload_locked(entry_id).await
    }

    async fn unload_locked(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        let entry = self.require(entry_id)?;

        match entry.state {
            ConfigEntryState::NotLoaded => return Ok(true),
            ConfigEntryState::Loaded => {}
            state if !state.is_recoverable() => {
                return Err(ConfigEntriesError::CannotUnload(state));
            }
            _ => {
                // Failed or waiting setups hold nothing but a retry timer
                self.cancel_retry(entry_id);
                self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;
                self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
                return Ok(true);
            }
        }

        self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        let unloaded = match (self.context(entry_id), self.integration(&entry.domain)) {
            (Some(ctx), Some(integration)) => integration.unload_entry(&ctx).await,
            (Some(ctx), None) => ctx.unload_platforms().await,
            (None, _) => true,
        };

        if !unloaded {
            error!(
                "Error unloading entry {} for {}",
                entry.title, entry.domain
            );
            self.set_state(
                entry_id,
                ConfigEntryState::FailedUnload,
                Some("Unload failed".to_string()),
            )?;
            return Ok(false);
        }

        // Platforms are gone; now the hooks (coordinator shutdown) and runtime data
        if let Some((_, ctx)) = self.contexts.remove(entry_id) {
            ctx.teardown().await;
        }
        self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(true)
    }

    async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.cancel_retry(entry_id);

        let lock = self.entry_lock(entry_id);
        let _guard = lock.lock().await;

        if !self.unload_locked(entry_id).await? {
            return Err(ConfigEntriesError::UnloadFailed(entry_id.to_string()));
        }
        self.setup_locked(entry_id).await
    }

    async fn update(&self, entry_id: &str, update: ConfigEntryUpdate) -> ConfigEntriesResult<bool> {
        let current = self.require(entry_id)?;

        if let Some(Some(ref unique_id)) = update.unique_id {
            if let Some(owner) = self.unique_id_owner(&current.domain, unique_id) {
                if owner != entry_id {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: current.domain,
                        unique_id: unique_id.clone(),
                    });
                }
            }
        }

        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            if !update.apply(&mut entry) {
                return Ok(false);
            }
            entry.clone()
        };

        if updated.unique_id != current.unique_id {
            if let Some(ref old) = current.unique_id {
                self.by_unique_id.remove(&(current.domain.clone(), old.clone()));
            }
            if let Some(ref new) = updated.unique_id {
                self.by_unique_id
                    .insert((updated.domain.clone(), new.clone()), entry_id.to_string());
            }
        }

        debug!("Updated config entry: {}", entry_id);
        let _ = self.events.send(ConfigEntryEvent::Updated {
            entry_id: entry_id.to_string(),
        });

        if let Some(ctx) = self.context(entry_id) {
            ctx.entry_updated(updated).await;
        }
        Ok(true)
    }

    /// Flag the entry for reauthentication and announce it once
    pub(crate) fn start_reauth(&self, entry_id: &str, reason: &str) {
        let event = {
            let Some(mut entry) = self.entries.get_mut(entry_id) else {
                debug!(entry_id, "Ignoring reauth request for unknown entry");
                return;
            };
            if entry.reauth_pending {
                debug!(entry_id, "Reauthentication already in progress");
                return;
            }
            entry.reauth_pending = true;
            ConfigEntryEvent::ReauthRequested {
                entry_id: entry_id.to_string(),
                domain: entry.domain.clone(),
                title: entry.title.clone(),
                reason: reason.to_string(),
            }
        };

        warn!(entry_id, "Reauthentication required: {}", reason);
        let _ = self.events.send(event);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for task in self.retries.iter() {
            task.value().abort();
        }
    }
}

/// Config Entries Manager
///
/// Cloning is cheap; all clones share the same entries.
#[derive(Clone)]
pub struct ConfigEntries {
    inner: Arc<ManagerInner>,
}

impl ConfigEntries {
    /// Create a manager whose entities write to `writer`
    pub fn new(writer: SharedStateWriter) -> Self {
        Self::with_rng(writer, StdRng::from_entropy())
    }

    /// Create a manager with deterministic setup retry jitter
    pub fn with_jitter_seed(writer: SharedStateWriter, seed: u64) -> Self {
        Self::with_rng(writer, StdRng::seed_from_u64(seed))
    }

    fn with_rng(writer: SharedStateWriter, rng: StdRng) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new_cyclic(|me| ManagerInner {
                entries: DashMap::new(),
                by_domain: DashMap::new(),
                by_unique_id: DashMap::new(),
                integrations: DashMap::new(),
                contexts: DashMap::new(),
                locks: DashMap::new(),
                retries: DashMap::new(),
                writer,
                events,
                rng: Mutex::new(rng),
                me: me.clone(),
            }),
        }
    }

    /// Register the integration that sets up entries of its domain
    pub fn register_integration(&self, integration: Arc<dyn Integration>) {
        let domain = integration.domain().to_string();
        debug!("Registered integration: {}", domain);
        self.inner.integrations.insert(domain, integration);
    }

    pub fn has_integration(&self, domain: &str) -> bool {
        self.inner.integrations.contains_key(domain)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEntryEvent> {
        self.inner.events.subscribe()
    }

    /// Get an entry by ID
    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.inner.get(entry_id)
    }

    pub fn state(&self, entry_id: &str) -> Option<ConfigEntryState> {
        self.inner.entries.get(entry_id).map(|r| r.state)
    }

    /// Get all entries for a domain
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.inner
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.inner.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get entry by unique_id
    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.inner
            .unique_id_owner(domain, unique_id)
            .and_then(|entry_id| self.inner.get(&entry_id))
    }

    /// Add a new config entry without setting it up
    pub fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.inner.unique_id_owner(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.inner.index_entry(&entry);
        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Apply `update`; update listeners run only if something changed
    pub async fn update(&self, entry_id: &str, update: ConfigEntryUpdate) -> ConfigEntriesResult<bool> {
        self.inner.update(entry_id, update).await
    }

    /// Unload and forget an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let lock = self.inner.entry_lock(entry_id);
        let _guard = lock.lock().await;

        let entry = self.inner.require(entry_id)?;
        if entry.state.is_recoverable() {
            self.inner.unload_locked(entry_id).await?;
        }
        self.inner.cancel_retry(entry_id);
        if let Some((_, ctx)) = self.inner.contexts.remove(entry_id) {
            ctx.teardown().await;
        }
        self.inner.unindex_entry(&entry);
        self.inner.locks.remove(entry_id);

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    /// Set up an entry through its integration
    ///
    /// A not-ready setup lands in `SetupRetry` and is retried in the
    /// background; the returned error still reports the failed attempt.
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.inner.setup(entry_id).await
    }

    /// Unload an entry; `Ok(false)` means the integration refused
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<bool> {
        self.inner.cancel_retry(entry_id);
        self.inner.unload(entry_id).await
    }

    /// Reload an entry (unload + setup)
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.inner.reload(entry_id).await
    }

    /// Enable or disable an entry, unloading or setting it up accordingly
    pub async fn set_disabled_by(
        &self,
        entry_id: &str,
        disabled_by: Option<ConfigEntryDisabledBy>,
    ) -> ConfigEntriesResult<()> {
        let changed = {
            let mut entry = self
                .inner
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            let changed = entry.disabled_by != disabled_by;
            entry.disabled_by = disabled_by;
            changed
        };
        if !changed {
            return Ok(());
        }

        if disabled_by.is_some() {
            self.unload(entry_id).await.map(|_| ())
        } else {
            self.setup(entry_id).await
        }
    }

    /// Ask the user to reauthenticate; repeated requests are folded into one
    pub fn start_reauth(&self, entry_id: &str, reason: &str) {
        self.inner.start_reauth(entry_id, reason);
    }

    /// Store new credentials and reload the entry
    pub async fn complete_reauth(
        &self,
        entry_id: &str,
        data: std::collections::HashMap<String, serde_json::Value>,
    ) -> ConfigEntriesResult<()> {
        {
            let mut entry = self
                .inner
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            entry.reauth_pending = false;
        }
        self.inner
            .update(entry_id, ConfigEntryUpdate::new().data(data))
            .await?;
        info!(entry_id, "Reauthentication complete, reloading");
        self.inner.reload(entry_id).await
    }

    pub fn is_reauth_pending(&self, entry_id: &str) -> bool {
        self.inner
            .entries
            .get(entry_id)
            .map(|r| r.reauth_pending)
            .unwrap_or(false)
    }

    pub fn is_retry_scheduled(&self, entry_id: &str) -> bool {
        self.inner.retries.contains_key(entry_id)
    }

    /// Runtime data stored by a loaded entry, if it has type `R`
    pub fn runtime_data<R: std::any::Any + Send + Sync>(&self, entry_id: &str) -> Option<Arc<R>> {
        self.inner.context(entry_id)?.runtime_data::<R>()
    }

    /// Entities attached by a loaded entry
    pub fn entities(&self, entry_id: &str) -> Vec<Arc<dyn Entity>> {
        self.inner
            .context(entry_id)
            .map(|ctx| ctx.entities())
            .unwrap_or_default()
    }

    /// Get all entry IDs
    pub fn entry_ids(&self) -> Vec<String> {
        self.inner.entries.iter().map(|r| r.key().clone()).collect()
    }

    /// Get all domains with entries
    pub fn domains(&self) -> Vec<String> {
        self.inner.by_domain.iter().map(|r| r.key().clone()).collect()
    }

    /// Get count of entries
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Set up all entries concurrently
    pub async fn setup_all(&self) -> Vec<ConfigEntriesResult<()>> {
        let entry_ids = self.entry_ids();
        join_all(entry_ids.iter().map(|entry_id| self.setup(entry_id))).await
    }

    /// Unload every entry; used on shutdown
    pub async fn unload_all(&self) -> Vec<ConfigEntriesResult<bool>> {
        let entry_ids = self.entry_ids();
        join_all(entry_ids.iter().map(|entry_id| self.unload(entry_id))).await
    }
}

impl std::fmt::Debug for ConfigEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntries")
            .field("entries", &self.len())
            .field("integrations", &self.inner.integrations.len())
            .finish()
    }
}
