//! Home Assistant Rust Server
//!
//! Loads the hub configuration, sets up every configured entry and runs
//! until interrupted, then unloads the entries in an orderly way.
//!
//! Usage: `homeassistant [CONFIG]`. The path defaults to `$HA_CONFIG`, then
//! `configuration.yaml` in the working directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ha_components::demo::{self, DemoIntegration};
use ha_config::{EntryConfig, HubConfig};
use ha_config_entries::{ConfigEntries, ConfigEntry, ConfigEntrySource};
use ha_core::MemoryStates;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "configuration.yaml";

/// How often the simulated stations drift
const WEATHER_TICK: Duration = Duration::from_secs(15);

/// The running hub
pub struct HomeAssistant {
    /// Latest state of every entity
    pub states: Arc<MemoryStates>,
    /// Config entries and their integrations
    pub entries: ConfigEntries,
    demo: Arc<DemoIntegration>,
}

impl HomeAssistant {
    pub fn new(config: &HubConfig) -> Self {
        let states = Arc::new(MemoryStates::new());
        let entries = ConfigEntries::new(states.clone());

        let demo = Arc::new(DemoIntegration::new(config.coordinator.clone()));
        entries.register_integration(demo.clone());

        Self {
            states,
            entries,
            demo,
        }
    }

    /// Add every configured entry; entries for unknown domains are skipped
    pub fn add_entries(&self, configs: &[EntryConfig]) {
        for config in configs {
            if !self.entries.has_integration(&config.domain) {
                warn!(domain = %config.domain, title = %config.title, "No integration for entry, skipping");
                continue;
            }
            match self.entries.add(config_entry(config)) {
                Ok(entry) => info!(entry_id = %entry.entry_id, domain = %entry.domain, "Added {}", entry.title),
                Err(err) => error!(title = %config.title, "Failed to add entry: {}", err),
            }
        }
    }

    pub async fn start(&self) {
        let results = self.entries.setup_all().await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        for err in results.into_iter().filter_map(Result::err) {
            // Retrying entries keep going in the background
            warn!("{}", err);
        }
        info!(
            "Set up {} config entries ({} not loaded yet)",
            self.entries.len(),
            failed
        );
    }

    /// Let the simulated stations drift so polls see changing readings
    pub fn spawn_weather(&self) -> JoinHandle<()> {
        let demo = Arc::clone(&self.demo);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WEATHER_TICK);
            loop {
                ticker.tick().await;
                for station in demo.stations() {
                    station.simulate_weather();
                }
            }
        })
    }

    pub async fn stop(&self) {
        for result in self.entries.unload_all().await {
            match result {
                Ok(true) => {}
                Ok(false) => warn!("An entry could not be unloaded"),
                Err(err) => error!("Unload failed: {}", err),
            }
        }
        info!("Unloaded config entries, {} entity states recorded", self.states.len());
    }
}

fn config_entry(config: &EntryConfig) -> ConfigEntry {
    let mut entry = ConfigEntry::new(&config.domain, &config.title)
        .with_data(config.data.clone())
        .with_options(config.options.clone())
        .with_version(config.version)
        .with_polling_disabled(config.pref_disable_polling)
        .with_source(ConfigEntrySource::Import);
    if let Some(unique_id) = &config.unique_id {
        entry = entry.with_unique_id(unique_id);
    }
    entry
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("HA_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn init_tracing(config: &HubConfig) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(config.logger.filter_directives())?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("Failed to install tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = HubConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    init_tracing(&config)?;

    info!("Starting Home Assistant (Rust) with {}", path.display());

    let hass = HomeAssistant::new(&config);
    hass.add_entries(&config.entries);
    hass.start().await;
    let weather = hass.spawn_weather();

    info!(
        "Home Assistant is running ({} demo entries)",
        hass.entries.get_by_domain(demo::DOMAIN).len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    weather.abort();
    hass.stop().await;

    Ok(())
}
