//! Shared fixtures for config entry lifecycle tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use ha_config_entries::{
    ConfigEntries, ConfigEntry, ConfigEntryEvent, EntityPlatform, EntryContext, Integration,
};
use ha_core::{Entity, EntityState, MemoryStates, SetupError, UpdateResult};
use ha_update_coordinator::{
    BackoffPolicy, CoordinatorConfig, CoordinatorEntity, DataUpdateCoordinator, SnapshotEntity,
    UpdateSource,
};
use tokio::sync::broadcast;

pub const DOMAIN: &str = "station";
pub const ENTITY_ID: &str = "sensor.station_temperature";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub type Coordinator = DataUpdateCoordinator<f64>;

/// Replays scripted readings, then reports 21.5 forever
#[derive(Default)]
pub struct ScriptedSource {
    calls: AtomicUsize,
    script: Mutex<VecDeque<UpdateResult<f64>>>,
}

impl ScriptedSource {
    pub fn new(results: Vec<UpdateResult<f64>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource<f64> for ScriptedSource {
    async fn fetch(&self) -> UpdateResult<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(21.5))
    }
}

/// Ordered record of teardown steps
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().unwrap().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct Temperature;

impl SnapshotEntity<f64> for Temperature {
    fn entity_id(&self) -> &str {
        ENTITY_ID
    }

    fn update_from_snapshot(&self, data: &f64) -> EntityState {
        EntityState::new(format!("{data:.1}"))
    }
}

/// Coordinator entity that logs whether its coordinator was still alive on removal
struct TrackedEntity {
    inner: Arc<CoordinatorEntity<f64, Temperature>>,
    log: Log,
}

#[async_trait]
impl Entity for TrackedEntity {
    fn entity_id(&self) -> &str {
        self.inner.entity_id()
    }

    fn available(&self) -> bool {
        Entity::available(self.inner.as_ref())
    }

    fn added_to_hass(&self) {
        self.inner.added_to_hass();
    }

    fn will_remove_from_hass(&self) {
        let shut_down = self.inner.coordinator().is_shut_down();
        self.log.push(format!("entity removed, coordinator shut down: {shut_down}"));
        self.inner.will_remove_from_hass();
    }

    async fn update(&self) {
        self.inner.update().await;
    }
}

struct SensorPlatform {
    log: Log,
}

#[async_trait]
impl EntityPlatform for SensorPlatform {
    fn platform(&self) -> &str {
        "sensor"
    }

    async fn setup_entry(&self, ctx: &EntryContext) -> Result<Vec<Arc<dyn Entity>>, SetupError> {
        let coordinator = ctx
            .runtime_data::<Coordinator>()
            .ok_or_else(|| SetupError::failed("coordinator missing"))?;
        let entity = CoordinatorEntity::new((*coordinator).clone(), Temperature, ctx.state_writer());
        Ok(vec![Arc::new(TrackedEntity {
            inner: entity,
            log: self.log.clone(),
        })])
    }
}

/// Integration with one polled temperature sensor
pub struct StationIntegration {
    pub source: Arc<ScriptedSource>,
    pub log: Log,
    setups: AtomicUsize,
    refuse_unload: AtomicBool,
}

impl StationIntegration {
    pub fn new(source: Arc<ScriptedSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            log: Log::default(),
            setups: AtomicUsize::new(0),
            refuse_unload: AtomicBool::new(false),
        })
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn refuse_unload(&self) {
        self.refuse_unload.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Integration for StationIntegration {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn setup_entry(&self, ctx: &EntryContext) -> Result<(), SetupError> {
        self.setups.fetch_add(1, Ordering::SeqCst);

        let config = CoordinatorConfig::new(ctx.title())
            .with_update_interval(DEFAULT_INTERVAL)
            .with_backoff(BackoffPolicy::default().with_jitter(0.0))
            .with_jitter_seed(0);
        let coordinator = Coordinator::new(config, Arc::clone(&self.source), Some(ctx.link()));
        coordinator.config_entry_first_refresh().await?;
        ctx.set_runtime_data(Arc::new(coordinator.clone()));

        let listener_coordinator = coordinator.clone();
        ctx.add_update_listener(Arc::new(move |entry: ConfigEntry| {
            let coordinator = listener_coordinator.clone();
            async move {
                if let Some(secs) = entry.options.get("scan_interval").and_then(|v| v.as_u64()) {
                    coordinator.set_update_interval(Some(Duration::from_secs(secs)));
                }
            }
            .boxed()
        }));

        let log = self.log.clone();
        let observed = coordinator.clone();
        ctx.on_unload(Box::new(move || {
            async move {
                log.push(format!(
                    "unload hook, coordinator shut down: {}",
                    observed.is_shut_down()
                ));
            }
            .boxed()
        }));

        let platform: Arc<dyn EntityPlatform> = Arc::new(SensorPlatform {
            log: self.log.clone(),
        });
        ctx.forward_entry_setups(&[platform]).await
    }

    async fn unload_entry(&self, ctx: &EntryContext) -> bool {
        if self.refuse_unload.load(Ordering::SeqCst) {
            return false;
        }
        ctx.unload_platforms().await
    }
}

pub struct Harness {
    pub manager: ConfigEntries,
    pub states: Arc<MemoryStates>,
    pub integration: Arc<StationIntegration>,
    pub entry_id: String,
}

impl Harness {
    pub fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.manager.runtime_data::<Coordinator>(&self.entry_id)
    }
}

/// Manager with the station integration registered and one entry added
pub fn harness(script: Vec<UpdateResult<f64>>) -> Harness {
    let states = Arc::new(MemoryStates::new());
    let manager = ConfigEntries::with_jitter_seed(states.clone(), 0);
    let integration = StationIntegration::new(ScriptedSource::new(script));
    manager.register_integration(integration.clone());

    let entry = manager
        .add(
            ConfigEntry::new(DOMAIN, "Roof station")
                .with_data(HashMap::from([("host".to_string(), serde_json::json!("10.0.0.2"))])),
        )
        .unwrap();

    Harness {
        manager,
        states,
        integration,
        entry_id: entry.entry_id,
    }
}

/// Drain everything currently buffered on an event receiver
pub fn drain(events: &mut broadcast::Receiver<ConfigEntryEvent>) -> Vec<ConfigEntryEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn reauth_requests(events: &[ConfigEntryEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ConfigEntryEvent::ReauthRequested { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

/// Let spawned tasks run up to their next real suspension point
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
