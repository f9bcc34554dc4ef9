//! Demo integration: a simulated weather station
//!
//! Each config entry pairs with one station, identified by its host. The
//! station is polled through a [`DataUpdateCoordinator`] and can also push
//! readings through a webhook channel. Three sensors render the snapshot.
//!
//! Entry data:
//!
//! ```yaml
//! domain: demo
//! title: Roof station
//! data:
//!   host: 10.0.0.2
//!   token: !secret roof_station_token
//! options:
//!   scan_interval: 60
//! ```

mod sensor;
mod station;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use ha_config::CoordinatorDefaults;
use ha_config_entries::{ConfigEntry, EntityPlatform, EntryContext, Integration};
use ha_core::SetupError;
use ha_update_coordinator::{BackoffPolicy, CoordinatorConfig, DataUpdateCoordinator, PushEvent};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use sensor::{sensor_entity_id, SensorKind, SensorPlatform, WeatherSensor};
pub use station::{StationSource, WeatherReading, WeatherStation};

pub const DOMAIN: &str = "demo";

/// Buffered webhook deliveries before senders wait
const WEBHOOK_CAPACITY: usize = 16;

pub type StationCoordinator = DataUpdateCoordinator<WeatherReading>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemoConfig {
    pub host: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DemoOptions {
    /// Seconds between polls; overrides the hub default
    #[serde(default)]
    pub scan_interval: Option<f64>,
}

impl DemoOptions {
    fn update_interval(&self, defaults: &CoordinatorDefaults) -> Duration {
        match self.scan_interval.map(Duration::try_from_secs_f64) {
            Some(Ok(interval)) if !interval.is_zero() => interval,
            Some(_) => {
                warn!(
                    "Ignoring invalid scan_interval {:?}, using {}s",
                    self.scan_interval, defaults.scan_interval
                );
                defaults.scan_interval()
            }
            None => defaults.scan_interval(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("webhook for {0} is no longer accepting deliveries")]
    Closed(String),
}

/// Per-entry runtime data
pub struct DemoRuntime {
    pub coordinator: StationCoordinator,
    pub station: Arc<WeatherStation>,
    webhook: mpsc::Sender<PushEvent<WeatherReading>>,
}

impl DemoRuntime {
    /// Accept a reading pushed by the station
    pub async fn handle_webhook(&self, payload: serde_json::Value) -> Result<(), WebhookError> {
        let reading: WeatherReading = serde_json::from_value(payload)?;
        debug!(station = %self.station.host(), "Webhook delivered a reading");
        self.push(PushEvent::Data(reading)).await
    }

    /// The station announced a change without sending data
    pub async fn handle_change_notice(&self) -> Result<(), WebhookError> {
        self.push(PushEvent::RefreshRequested).await
    }

    async fn push(&self, event: PushEvent<WeatherReading>) -> Result<(), WebhookError> {
        self.webhook
            .send(event)
            .await
            .map_err(|_| WebhookError::Closed(self.coordinator.name().to_string()))
    }
}

pub struct DemoIntegration {
    defaults: CoordinatorDefaults,
    stations: DashMap<String, Arc<WeatherStation>>,
}

impl DemoIntegration {
    pub fn new(defaults: CoordinatorDefaults) -> Self {
        Self {
            defaults,
            stations: DashMap::new(),
        }
    }

    /// Register a station before any entry connects to it
    pub fn add_station(&self, station: WeatherStation) -> Arc<WeatherStation> {
        let station = Arc::new(station);
        self.stations
            .insert(station.host().to_string(), Arc::clone(&station));
        station
    }

    /// The station at `host`; unknown hosts get a station paired with `token`
    pub fn station(&self, host: &str, token: &str) -> Arc<WeatherStation> {
        self.stations
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(WeatherStation::new(host, token)))
            .value()
            .clone()
    }

    pub fn stations(&self) -> Vec<Arc<WeatherStation>> {
        self.stations.iter().map(|entry| entry.value().clone()).collect()
    }

    fn coordinator_config(&self, name: &str, options: &DemoOptions) -> CoordinatorConfig {
        let backoff = BackoffPolicy::default()
            .with_max_exponent(self.defaults.backoff_max_exponent)
            .with_jitter(self.defaults.backoff_jitter);
        let mut config = CoordinatorConfig::new(name)
            .with_update_interval(options.update_interval(&self.defaults))
            .with_request_refresh_cooldown(self.defaults.request_refresh_cooldown())
            .with_backoff(backoff);
        if let Some(timeout) = self.defaults.fetch_timeout() {
            config = config.with_fetch_timeout(timeout);
        }
        config
    }
}

#[async_trait]
impl Integration for DemoIntegration {
    fn domain(&self) -> &str {
        DOMAIN
    }

    fn version(&self) -> u32 {
        2
    }

    /// Version 1 stored the host as `ip` and the token as `api_key`
    async fn migrate_entry(&self, entry: &mut ConfigEntry) -> bool {
        if entry.version == 1 {
            for (old, new) in [("ip", "host"), ("api_key", "token")] {
                if let Some(value) = entry.data.remove(old) {
                    entry.data.insert(new.to_string(), value);
                }
            }
            entry.version = 2;
            debug!(entry_id = %entry.entry_id, "Renamed version 1 demo entry keys");
        }
        true
    }

    async fn setup_entry(&self, ctx: &EntryContext) -> Result<(), SetupError> {
        let config: DemoConfig = ctx.parse_data()?;
        let options: DemoOptions = ctx.parse_options()?;

        let station = self.station(&config.host, &config.token);
        let source = StationSource::new(Arc::clone(&station), config.token);
        let coordinator = StationCoordinator::new(
            self.coordinator_config(ctx.title(), &options),
            source,
            Some(ctx.link()),
        );
        coordinator.config_entry_first_refresh().await?;

        let webhook = coordinator.push_channel(WEBHOOK_CAPACITY);
        ctx.set_runtime_data(Arc::new(DemoRuntime {
            coordinator: coordinator.clone(),
            station,
            webhook,
        }));

        let defaults = self.defaults.clone();
        ctx.add_update_listener(Arc::new(move |entry: ConfigEntry| {
            let coordinator = coordinator.clone();
            let defaults = defaults.clone();
            async move {
                match entry.parse_options::<DemoOptions>() {
                    Ok(options) => {
                        coordinator.set_update_interval(Some(options.update_interval(&defaults)))
                    }
                    Err(err) => warn!(entry_id = %entry.entry_id, "Keeping update interval: {}", err),
                }
            }
            .boxed()
        }));

        let platforms: [Arc<dyn EntityPlatform>; 1] = [Arc::new(SensorPlatform)];
        ctx.forward_entry_setups(&platforms).await
    }
}
