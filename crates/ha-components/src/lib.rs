//! Built-in integrations
//!
//! Each integration implements `ha_config_entries::Integration` and is
//! registered with the config entry manager at startup. The only one shipped
//! so far is [`demo`], a simulated weather station.

pub mod demo;
