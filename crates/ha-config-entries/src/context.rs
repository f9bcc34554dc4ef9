//! Per-setup context handed to an integration
//!
//! An [`EntryContext`] lives from the start of an entry's setup until the
//! entry unloads. It owns what the integration created on the way: the
//! runtime data (usually a coordinator), the entities of each forwarded
//! platform, the unload hooks and the update listeners. It also serves as the
//! [`EntryLink`] a coordinator uses to reach its entry.

use std::any::Any;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::BoxFuture;
use ha_core::{Entity, EntryLink, SetupError, SharedStateWriter, UnloadHook};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::entry::ConfigEntry;
use crate::integration::EntityPlatform;
use crate::lock::{lock, read, write};
use crate::manager::ManagerInner;

/// Integration-owned state stored on a loaded entry
pub type RuntimeData = Arc<dyn Any + Send + Sync>;

/// Called with the updated entry whenever its data or options change
pub type UpdateListener = Arc<dyn Fn(ConfigEntry) -> BoxFuture<'static, ()> + Send + Sync>;

struct LoadedPlatform {
    platform: String,
    entities: Vec<Arc<dyn Entity>>,
}

struct ContextInner {
    entry_id: String,
    domain: String,
    title: String,
    entry: RwLock<ConfigEntry>,
    writer: SharedStateWriter,
    manager: Weak<ManagerInner>,
    runtime_data: RwLock<Option<RuntimeData>>,
    platforms: Mutex<Vec<LoadedPlatform>>,
    unload_hooks: Mutex<Vec<UnloadHook>>,
    update_listeners: Mutex<Vec<UpdateListener>>,
}

#[derive(Clone)]
pub struct EntryContext {
    inner: Arc<ContextInner>,
}

impl EntryContext {
    pub(crate) fn new(entry: ConfigEntry, writer: SharedStateWriter, manager: Weak<ManagerInner>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                entry_id: entry.entry_id.clone(),
                domain: entry.domain.clone(),
                title: entry.title.clone(),
                entry: RwLock::new(entry),
                writer,
                manager,
                runtime_data: RwLock::new(None),
                platforms: Mutex::new(Vec::new()),
                unload_hooks: Mutex::new(Vec::new()),
                update_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.inner.entry_id
    }

    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    pub fn title(&self) -> &str {
        &self.inner.title
    }

    /// Current snapshot of the entry, including options updated after setup
    pub fn entry(&self) -> ConfigEntry {
        read(&self.inner.entry).clone()
    }

    pub fn parse_data<C: DeserializeOwned>(&self) -> Result<C, SetupError> {
        read(&self.inner.entry).parse_data()
    }

    pub fn parse_options<C: DeserializeOwned>(&self) -> Result<C, SetupError> {
        read(&self.inner.entry).parse_options()
    }

    /// Where this entry's entities write their state
    pub fn state_writer(&self) -> SharedStateWriter {
        Arc::clone(&self.inner.writer)
    }

    /// The link to hand to a coordinator owned by this entry
    pub fn link(&self) -> Arc<dyn EntryLink> {
        self.inner.clone()
    }

    pub fn set_runtime_data<R: Any + Send + Sync>(&self, data: Arc<R>) {
        *write(&self.inner.runtime_data) = Some(data);
    }

    /// Runtime data, if it was stored with type `R`
    pub fn runtime_data<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        let data = read(&self.inner.runtime_data).clone()?;
        data.downcast::<R>().ok()
    }

    pub fn has_runtime_data(&self) -> bool {
        read(&self.inner.runtime_data).is_some()
    }

    /// Register cleanup to run when the entry unloads or its setup fails
    pub fn on_unload(&self, hook: UnloadHook) {
        self.inner.on_unload(hook);
    }

    pub fn add_update_listener(&self, listener: UpdateListener) {
        lock(&self.inner.update_listeners).push(listener);
    }

    /// Set up each platform and attach its entities
    ///
    /// Stops at the first platform that fails; entities attached so far stay
    /// attached and are detached when the entry tears down.
    pub async fn forward_entry_setups(&self, platforms: &[Arc<dyn EntityPlatform>]) -> Result<(), SetupError> {
        for platform in platforms {
            let entities = platform.setup_entry(self).await?;
            for entity in &entities {
                entity.added_to_hass();
            }
            debug!(
                entry_id = %self.inner.entry_id,
                platform = platform.platform(),
                count = entities.len(),
                "Added entities"
            );
            lock(&self.inner.platforms).push(LoadedPlatform {
                platform: platform.platform().to_string(),
                entities,
            });
        }
        Ok(())
    }

    /// Detach every entity of every forwarded platform
    pub async fn unload_platforms(&self) -> bool {
        let platforms: Vec<LoadedPlatform> = lock(&self.inner.platforms).drain(..).collect();

        for loaded in platforms.iter().rev() {
            for entity in &loaded.entities {
                entity.will_remove_from_hass();
            }
            debug!(
                entry_id = %self.inner.entry_id,
                platform = %loaded.platform,
                "Unloaded platform"
            );
        }
        true
    }

    /// Entities currently attached, in platform order
    pub fn entities(&self) -> Vec<Arc<dyn Entity>> {
        lock(&self.inner.platforms)
            .iter()
            .flat_map(|loaded| loaded.entities.iter().cloned())
            .collect()
    }

    pub fn platforms(&self) -> Vec<String> {
        lock(&self.inner.platforms)
            .iter()
            .map(|loaded| loaded.platform.clone())
            .collect()
    }

    /// Run unload hooks, most recently registered first
    pub(crate) async fn run_unload_hooks(&self) {
        loop {
            // Pop one at a time: a hook may register another
            let hook = lock(&self.inner.unload_hooks).pop();
            match hook {
                Some(hook) => hook().await,
                None => break,
            }
        }
    }

    /// Undo everything a setup created
    pub(crate) async fn teardown(&self) {
        self.unload_platforms().await;
        self.run_unload_hooks().await;
        self.clear_runtime_data();
        lock(&self.inner.update_listeners).clear();
    }

    pub(crate) fn clear_runtime_data(&self) {
        write(&self.inner.runtime_data).take();
    }

    /// Store the updated entry and invoke the update listeners in order
    pub(crate) async fn entry_updated(&self, entry: ConfigEntry) {
        *write(&self.inner.entry) = entry.clone();

        let listeners: Vec<UpdateListener> = lock(&self.inner.update_listeners).clone();
        for listener in listeners {
            listener(entry.clone()).await;
        }
    }
}

impl std::fmt::Debug for EntryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryContext")
            .field("entry_id", &self.inner.entry_id)
            .field("domain", &self.inner.domain)
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl EntryLink for ContextInner {
    fn entry_id(&self) -> &str {
        &self.entry_id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn polling_disabled(&self) -> bool {
        read(&self.entry).pref_disable_polling
    }

    fn start_reauth(&self, reason: &str) {
        match self.manager.upgrade() {
            Some(manager) => manager.start_reauth(&self.entry_id, reason),
            None => info!(entry_id = %self.entry_id, "Ignoring reauth request, manager is gone"),
        }
    }

    fn on_unload(&self, hook: UnloadHook) {
        lock(&self.unload_hooks).push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::FutureExt;
    use ha_core::MemoryStates;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn context() -> EntryContext {
        EntryContext::new(
            ConfigEntry::new("demo", "Station"),
            Arc::new(MemoryStates::new()),
            Weak::new(),
        )
    }

    struct Marker {
        entity_id: String,
        attached: AtomicBool,
    }

    #[async_trait]
    impl Entity for Marker {
        fn entity_id(&self) -> &str {
            &self.entity_id
        }

        fn available(&self) -> bool {
            true
        }

        fn added_to_hass(&self) {
            self.attached.store(true, Ordering::SeqCst);
        }

        fn will_remove_from_hass(&self) {
            self.attached.store(false, Ordering::SeqCst);
        }
    }

    struct MarkerPlatform {
        markers: Vec<Arc<Marker>>,
    }

    #[async_trait]
    impl EntityPlatform for MarkerPlatform {
        fn platform(&self) -> &str {
            "sensor"
        }

        async fn setup_entry(&self, _ctx: &EntryContext) -> Result<Vec<Arc<dyn Entity>>, SetupError> {
            Ok(self.markers.iter().map(|p| p.clone() as Arc<dyn Entity>).collect())
        }
    }

    #[test]
    fn test_runtime_data_is_typed() {
        let ctx = context();
        assert!(ctx.runtime_data::<u32>().is_none());

        ctx.set_runtime_data(Arc::new(42u32));
        assert_eq!(ctx.runtime_data::<u32>().as_deref(), Some(&42));
        assert!(ctx.runtime_data::<String>().is_none());

        ctx.clear_runtime_data();
        assert!(!ctx.has_runtime_data());
    }

    #[tokio::test]
    async fn test_unload_hooks_run_lifo() {
        let ctx = context();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            ctx.on_unload(Box::new(move || {
                async move { order.lock().unwrap().push(name) }.boxed()
            }));
        }

        ctx.run_unload_hooks().await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);

        // Hooks run once
        ctx.run_unload_hooks().await;
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_forward_and_unload_platforms() {
        let ctx = context();
        let marker = Arc::new(Marker {
            entity_id: "sensor.outside".into(),
            attached: AtomicBool::new(false),
        });
        let platform: Arc<dyn EntityPlatform> = Arc::new(MarkerPlatform {
            markers: vec![marker.clone()],
        });

        ctx.forward_entry_setups(&[platform]).await.unwrap();
        assert!(marker.attached.load(Ordering::SeqCst));
        assert_eq!(ctx.platforms(), vec!["sensor".to_string()]);
        assert_eq!(ctx.entities().len(), 1);

        assert!(ctx.unload_platforms().await);
        assert!(!marker.attached.load(Ordering::SeqCst));
        assert!(ctx.entities().is_empty());
    }

    #[tokio::test]
    async fn test_entry_updated_refreshes_snapshot_and_notifies() {
        let ctx = context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.add_update_listener(Arc::new(move |entry: ConfigEntry| {
            let sink = sink.clone();
            async move { sink.lock().unwrap().push(entry.title) }.boxed()
        }));

        let mut entry = ctx.entry();
        entry.title = "Roof".into();
        entry.pref_disable_polling = true;
        ctx.entry_updated(entry).await;

        assert_eq!(*seen.lock().unwrap(), vec!["Roof".to_string()]);
        assert!(ctx.link().polling_disabled());
        assert_eq!(ctx.entry().title, "Roof");
    }

    #[test]
    fn test_reauth_without_manager_is_ignored() {
        let ctx = context();
        ctx.link().start_reauth("expired");
    }
}
