//! Simulated weather station
//!
//! Stands in for a vendor client: it can be taken offline, rate limit its
//! callers, or revoke the token it was paired with.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ha_core::{UpdateError, UpdateResult};
use ha_update_coordinator::UpdateSource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One observation reported by a station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Percent relative humidity
    pub humidity: f64,
    /// Hectopascal
    pub pressure: f64,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl WeatherReading {
    pub fn new(temperature: f64, humidity: f64, pressure: f64) -> Self {
        Self {
            temperature,
            humidity,
            pressure,
            observed_at: Utc::now(),
        }
    }
}

impl Default for WeatherReading {
    fn default() -> Self {
        Self::new(21.5, 48.0, 1013.2)
    }
}

struct StationState {
    online: bool,
    token: String,
    retry_after: Option<Duration>,
    reading: WeatherReading,
    reads: u64,
    rng: StdRng,
}

pub struct WeatherStation {
    host: String,
    state: Mutex<StationState>,
}

impl WeatherStation {
    /// A station at `host` that accepts `token`
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        let host = host.into();
        let seed = host
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
        Self {
            state: Mutex::new(StationState {
                online: true,
                token: token.into(),
                retry_after: None,
                reading: WeatherReading::default(),
                reads: 0,
                rng: StdRng::seed_from_u64(seed),
            }),
            host,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Accept only `token` from now on
    pub fn rotate_token(&self, token: impl Into<String>) {
        self.state().token = token.into();
    }

    /// Reject reads with a "come back later" hint until cleared
    pub fn set_rate_limited(&self, retry_after: Option<Duration>) {
        self.state().retry_after = retry_after;
    }

    pub fn set_reading(&self, reading: WeatherReading) {
        self.state().reading = reading;
    }

    /// Nudge the current reading by a small random step
    pub fn simulate_weather(&self) -> WeatherReading {
        let mut state = self.state();
        let dt = state.rng.gen_range(-0.3..=0.3);
        let dh = state.rng.gen_range(-1.0..=1.0);
        let dp = state.rng.gen_range(-0.5..=0.5);
        state.reading.temperature = round1(state.reading.temperature + dt);
        state.reading.humidity = round1((state.reading.humidity + dh).clamp(0.0, 100.0));
        state.reading.pressure = round1(state.reading.pressure + dp);
        state.reading.observed_at = Utc::now();
        state.reading.clone()
    }

    /// Number of successful reads served
    pub fn reads(&self) -> u64 {
        self.state().reads
    }

    /// Check credentials without reading
    pub fn authenticate(&self, token: &str) -> UpdateResult<()> {
        let state = self.state();
        if !state.online {
            return Err(self.unreachable());
        }
        if state.token != token {
            return Err(UpdateError::auth_failed(format!(
                "station {} rejected the token",
                self.host
            )));
        }
        Ok(())
    }

    pub fn read(&self, token: &str) -> UpdateResult<WeatherReading> {
        self.authenticate(token)?;

        let mut state = self.state();
        if let Some(retry_after) = state.retry_after {
            return Err(UpdateError::failed_with_retry_after(
                format!("station {} is rate limiting requests", self.host),
                retry_after,
            ));
        }
        state.reads += 1;
        Ok(state.reading.clone())
    }

    fn unreachable(&self) -> UpdateError {
        UpdateError::failed(format!("station {} is unreachable", self.host))
    }
}

/// Update source reading one station with the entry's token
pub struct StationSource {
    station: Arc<WeatherStation>,
    token: String,
}

impl StationSource {
    pub fn new(station: Arc<WeatherStation>, token: impl Into<String>) -> Self {
        Self {
            station,
            token: token.into(),
        }
    }
}

#[async_trait]
impl UpdateSource<WeatherReading> for StationSource {
    async fn setup(&self) -> UpdateResult<()> {
        self.station.authenticate(&self.token)
    }

    async fn fetch(&self) -> UpdateResult<WeatherReading> {
        self.station.read(&self.token)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
