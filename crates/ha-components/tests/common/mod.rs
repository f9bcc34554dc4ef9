//! Shared fixtures for demo integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use ha_components::demo::{DemoIntegration, DemoRuntime, WeatherStation, DOMAIN};
use ha_config::CoordinatorDefaults;
use ha_config_entries::{ConfigEntries, ConfigEntry, ConfigEntryEvent};
use ha_core::MemoryStates;
use serde_json::json;
use tokio::sync::broadcast;

pub const HOST: &str = "10.0.0.2";
pub const TOKEN: &str = "roof-token";
pub const TITLE: &str = "Roof station";

pub const TEMPERATURE: &str = "sensor.roof_station_temperature";
pub const HUMIDITY: &str = "sensor.roof_station_humidity";
pub const PRESSURE: &str = "sensor.roof_station_pressure";

/// Hub defaults without backoff jitter
pub fn defaults() -> CoordinatorDefaults {
    CoordinatorDefaults {
        backoff_jitter: 0.0,
        ..CoordinatorDefaults::default()
    }
}

pub fn station_data(host: &str, token: &str) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("host".to_string(), json!(host)),
        ("token".to_string(), json!(token)),
    ])
}

pub struct Hub {
    pub manager: ConfigEntries,
    pub states: Arc<MemoryStates>,
    pub integration: Arc<DemoIntegration>,
    pub station: Arc<WeatherStation>,
    pub entry_id: String,
}

impl Hub {
    pub fn runtime(&self) -> Option<Arc<DemoRuntime>> {
        self.manager.runtime_data::<DemoRuntime>(&self.entry_id)
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.states.get_state(entity_id)
    }
}

/// Hub with the roof station registered and `entry` added, not yet set up
pub fn hub_with(entry: ConfigEntry) -> Hub {
    let states = Arc::new(MemoryStates::new());
    let manager = ConfigEntries::with_jitter_seed(states.clone(), 0);
    let integration = Arc::new(DemoIntegration::new(defaults()));
    let station = integration.add_station(WeatherStation::new(HOST, TOKEN));
    manager.register_integration(integration.clone());

    let entry = manager.add(entry).unwrap();

    Hub {
        manager,
        states,
        integration,
        station,
        entry_id: entry.entry_id,
    }
}

/// Hub with a correctly configured entry for the roof station
pub fn hub() -> Hub {
    hub_with(ConfigEntry::new(DOMAIN, TITLE).with_data(station_data(HOST, TOKEN)))
}

pub fn drain(events: &mut broadcast::Receiver<ConfigEntryEvent>) -> Vec<ConfigEntryEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn reauth_requests(events: &[ConfigEntryEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ConfigEntryEvent::ReauthRequested { .. }))
        .count()
}

/// Let spawned tasks run up to their next real suspension point
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
