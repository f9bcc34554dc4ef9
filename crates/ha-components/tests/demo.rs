//! Demo integration driven through the config entry manager

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use ha_components::demo::{WebhookError, DOMAIN};
use ha_config_entries::{ConfigEntriesError, ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use ha_core::{SetupError, STATE_UNAVAILABLE};
use serde_json::json;
use tokio::time::{sleep, Instant};

// ==================== Setup ====================

#[tokio::test(start_paused = true)]
async fn test_setup_creates_sensors() {
    let hub = hub();

    tokio_test::assert_ok!(hub.manager.setup(&hub.entry_id).await);

    assert_eq!(hub.manager.state(&hub.entry_id), Some(ConfigEntryState::Loaded));
    assert_eq!(hub.manager.entities(&hub.entry_id).len(), 3);
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some("21.5"));
    assert_eq!(hub.state(HUMIDITY).as_deref(), Some("48.0"));
    assert_eq!(hub.state(PRESSURE).as_deref(), Some("1013.2"));

    let temperature = hub.states.get(TEMPERATURE).unwrap();
    assert_eq!(temperature.attributes["unit_of_measurement"], json!("°C"));
    assert_eq!(temperature.attributes["friendly_name"], json!("Roof station Temperature"));
}

#[tokio::test(start_paused = true)]
async fn test_polls_on_default_interval() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    assert_eq!(hub.station.reads(), 1);

    hub.station.simulate_weather();
    sleep(Duration::from_secs(31)).await;
    settle().await;

    assert_eq!(hub.station.reads(), 2);
    let runtime = hub.runtime().unwrap();
    let coordinator = &runtime.coordinator;
    let expected = format!("{:.1}", coordinator.data().unwrap().temperature);
    assert_eq!(hub.state(TEMPERATURE), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn test_offline_station_is_retried() {
    let hub = hub();
    hub.station.set_online(false);

    let err = hub.manager.setup(&hub.entry_id).await.unwrap_err();
    assert!(matches!(
        err,
        ConfigEntriesError::Setup { source: SetupError::NotReady(_), .. }
    ));
    assert_eq!(hub.manager.state(&hub.entry_id), Some(ConfigEntryState::SetupRetry));
    assert!(hub.manager.is_retry_scheduled(&hub.entry_id));
    assert!(hub.state(TEMPERATURE).is_none());

    hub.station.set_online(true);
    sleep(Duration::from_secs(6)).await;
    settle().await;

    assert_eq!(hub.manager.state(&hub.entry_id), Some(ConfigEntryState::Loaded));
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some("21.5"));
}

#[tokio::test]
async fn test_missing_host_is_a_setup_error() {
    let hub = hub_with(
        ConfigEntry::new(DOMAIN, TITLE)
            .with_data(HashMap::from([("token".to_string(), json!(TOKEN))])),
    );

    let err = hub.manager.setup(&hub.entry_id).await.unwrap_err();

    assert!(matches!(
        err,
        ConfigEntriesError::Setup { source: SetupError::Failed(_), .. }
    ));
    assert_eq!(hub.manager.state(&hub.entry_id), Some(ConfigEntryState::SetupError));
    assert!(!hub.manager.is_retry_scheduled(&hub.entry_id));
    assert!(hub.runtime().is_none());
}

#[tokio::test]
async fn test_version_one_entry_is_migrated() {
    let hub = hub_with(
        ConfigEntry::new(DOMAIN, TITLE)
            .with_version(1)
            .with_data(HashMap::from([
                ("ip".to_string(), json!(HOST)),
                ("api_key".to_string(), json!(TOKEN)),
            ])),
    );

    hub.manager.setup(&hub.entry_id).await.unwrap();

    let entry = hub.manager.get(&hub.entry_id).unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.data, station_data(HOST, TOKEN));
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some("21.5"));
}

// ==================== Push ====================

#[tokio::test]
async fn test_webhook_reading_updates_sensors() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    let runtime = hub.runtime().unwrap();

    runtime
        .handle_webhook(json!({ "temperature": 25.0, "humidity": 50, "pressure": 1001.4 }))
        .await
        .unwrap();
    settle().await;

    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some("25.0"));
    assert_eq!(hub.state(HUMIDITY).as_deref(), Some("50.0"));
    assert_eq!(hub.state(PRESSURE).as_deref(), Some("1001.4"));
    assert_eq!(hub.station.reads(), 1);
}

#[tokio::test]
async fn test_invalid_webhook_payload_is_rejected() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    let runtime = hub.runtime().unwrap();

    let err = runtime
        .handle_webhook(json!({ "temperature": "hot" }))
        .await
        .unwrap_err();

    assert!(matches!(err, WebhookError::InvalidPayload(_)));
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some("21.5"));
}

#[tokio::test]
async fn test_webhook_closes_on_unload() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    let runtime = hub.runtime().unwrap();

    assert!(hub.manager.unload(&hub.entry_id).await.unwrap());
    settle().await;

    let err = runtime.handle_change_notice().await.unwrap_err();
    assert!(matches!(err, WebhookError::Closed(_)));
    assert!(runtime.coordinator.is_shut_down());
    assert!(hub.runtime().is_none());
}

// ==================== Options ====================

#[tokio::test(start_paused = true)]
async fn test_scan_interval_option_applies_without_reload() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    let before = hub.runtime().unwrap();
    assert_eq!(before.coordinator.update_interval(), Some(Duration::from_secs(30)));

    let changed = hub
        .manager
        .update(
            &hub.entry_id,
            ConfigEntryUpdate::new().options(HashMap::from([(
                "scan_interval".to_string(),
                json!(120),
            )])),
        )
        .await
        .unwrap();
    assert!(changed);

    let after = hub.runtime().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.coordinator.update_interval(), Some(Duration::from_secs(120)));

    let next = after.coordinator.next_refresh_at().unwrap();
    assert_eq!(next - Instant::now(), Duration::from_secs(120));

    sleep(Duration::from_secs(31)).await;
    settle().await;
    assert_eq!(hub.station.reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_delays_next_poll() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    hub.station.set_rate_limited(Some(Duration::from_secs(120)));

    sleep(Duration::from_secs(31)).await;
    settle().await;

    let runtime = hub.runtime().unwrap();
    let coordinator = &runtime.coordinator;
    assert!(!coordinator.last_update_success());
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some(STATE_UNAVAILABLE));

    let wait = coordinator.next_refresh_at().unwrap() - Instant::now();
    assert!(wait > Duration::from_secs(100), "next poll in {wait:?}");
    assert!(wait <= Duration::from_secs(120), "next poll in {wait:?}");
}

// ==================== Reauth ====================

#[tokio::test]
async fn test_wrong_token_at_setup_requests_reauth() {
    let hub = hub_with(ConfigEntry::new(DOMAIN, TITLE).with_data(station_data(HOST, "stale")));
    let mut events = hub.manager.subscribe();

    let err = hub.manager.setup(&hub.entry_id).await.unwrap_err();

    assert!(matches!(
        err,
        ConfigEntriesError::Setup { source: SetupError::AuthFailed(_), .. }
    ));
    assert_eq!(hub.manager.state(&hub.entry_id), Some(ConfigEntryState::SetupError));
    assert_eq!(reauth_requests(&drain(&mut events)), 1);
    assert!(hub.manager.is_reauth_pending(&hub.entry_id));
    assert!(!hub.manager.is_retry_scheduled(&hub.entry_id));
}

#[tokio::test(start_paused = true)]
async fn test_rotated_token_requests_reauth_and_recovers() {
    let hub = hub();
    hub.manager.setup(&hub.entry_id).await.unwrap();
    let mut events = hub.manager.subscribe();

    hub.station.rotate_token("rotated");
    sleep(Duration::from_secs(31)).await;
    settle().await;

    assert_eq!(reauth_requests(&drain(&mut events)), 1);
    assert!(hub.manager.is_reauth_pending(&hub.entry_id));
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some(STATE_UNAVAILABLE));
    let coordinator = hub.runtime().unwrap().coordinator.clone();
    assert!(coordinator.next_refresh_at().is_none());

    hub.manager
        .complete_reauth(&hub.entry_id, station_data(HOST, "rotated"))
        .await
        .unwrap();

    assert!(!hub.manager.is_reauth_pending(&hub.entry_id));
    assert_eq!(hub.manager.state(&hub.entry_id), Some(ConfigEntryState::Loaded));
    assert_eq!(hub.state(TEMPERATURE).as_deref(), Some("21.5"));
    assert!(coordinator.is_shut_down());
}
