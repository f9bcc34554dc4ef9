//! Sensor platform: one entity per measured quantity

use std::sync::Arc;

use async_trait::async_trait;
use ha_config_entries::{EntityPlatform, EntryContext};
use ha_core::{Entity, EntityState, SetupError};
use ha_update_coordinator::{CoordinatorEntity, SnapshotEntity};
use serde_json::json;

use super::station::WeatherReading;
use super::DemoRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [Self::Temperature, Self::Humidity, Self::Pressure];

    pub fn key(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Temperature => "Temperature",
            Self::Humidity => "Humidity",
            Self::Pressure => "Pressure",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
        }
    }

    fn value(self, reading: &WeatherReading) -> f64 {
        match self {
            Self::Temperature => reading.temperature,
            Self::Humidity => reading.humidity,
            Self::Pressure => reading.pressure,
        }
    }
}

pub struct WeatherSensor {
    entity_id: String,
    friendly_name: String,
    kind: SensorKind,
}

impl WeatherSensor {
    pub fn new(title: &str, kind: SensorKind) -> Self {
        Self {
            entity_id: sensor_entity_id(title, kind),
            friendly_name: format!("{title} {}", kind.name()),
            kind,
        }
    }
}

impl SnapshotEntity<WeatherReading> for WeatherSensor {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn update_from_snapshot(&self, data: &WeatherReading) -> EntityState {
        EntityState::new(format!("{:.1}", self.kind.value(data)))
            .with_attribute("unit_of_measurement", json!(self.kind.unit()))
            .with_attribute("friendly_name", json!(self.friendly_name))
            .with_attribute("observed_at", json!(data.observed_at.to_rfc3339()))
    }

    fn listener_context(&self) -> Option<String> {
        Some(self.kind.key().to_string())
    }
}

/// `sensor.<slug of title>_<kind>`
pub fn sensor_entity_id(title: &str, kind: SensorKind) -> String {
    format!("sensor.{}_{}", slugify(title), kind.key())
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    slug
}

pub struct SensorPlatform;

#[async_trait]
impl EntityPlatform for SensorPlatform {
    fn platform(&self) -> &str {
        "sensor"
    }

    async fn setup_entry(&self, ctx: &EntryContext) -> Result<Vec<Arc<dyn Entity>>, SetupError> {
        let runtime = ctx
            .runtime_data::<DemoRuntime>()
            .ok_or_else(|| SetupError::failed("demo runtime data missing"))?;

        Ok(SensorKind::ALL
            .into_iter()
            .map(|kind| {
                let sensor = WeatherSensor::new(ctx.title(), kind);
                CoordinatorEntity::new(runtime.coordinator.clone(), sensor, ctx.state_writer())
                    as Arc<dyn Entity>
            })
            .collect())
    }
}
