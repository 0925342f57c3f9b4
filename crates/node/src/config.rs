//! TOML config file loading, environment overrides and validation.
//!
//! Every field has a default, so an empty file is a valid (development)
//! configuration.  Credentials are usually injected through the environment
//! at deploy time rather than committed to the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use crate::meter::DEFAULT_SETTLE;

/// Default pause between two telemetry cycles.
pub const DEFAULT_CYCLE_PERIOD: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceSettings,
    pub mqtt: MqttSettings,
    pub meter: MeterSettings,
    pub climate: ClimateSettings,
    pub switch: SwitchSettings,
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Topic-safe id, also the discovery device identifier.
    pub id: String,
    /// Display name of the device in the hub.
    pub name: String,
    /// Fixed IP to report; discovered from the broker route when unset.
    pub ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MeterSettings {
    /// UART device path.
    pub port: String,
    pub baud_rate: u32,
    /// Modbus slave address of the meter.
    pub address: u8,
    pub settle_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClimateSettings {
    /// IIO `in_temp_input` file of the DHT22.  Unset: simulated sensor.
    pub temp_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SwitchSettings {
    pub name: String,
    pub gpio_pin: u8,
    pub active_low: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub cycle_sec: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            id: "node01".into(),
            name: "Meter Node".into(),
            ip: None,
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "ha-meter-node".into(),
            username: String::new(),
            password: String::new(),
            keep_alive_sec: 30,
        }
    }
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            port: "/dev/serial0".into(),
            baud_rate: 9600,
            address: crate::frame::DEFAULT_ADDRESS,
            settle_ms: DEFAULT_SETTLE.as_millis() as u64,
        }
    }
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            name: "Switch".into(),
            gpio_pin: 2,
            active_low: false,
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            cycle_sec: DEFAULT_CYCLE_PERIOD.as_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins on the 40-pin header.  GPIO 0-1 are reserved for the ID
/// EEPROM; GPIO 28+ are not exposed.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// Baud rates the meter can be configured for.
const VALID_BAUD_RATES: &[u32] = &[1200, 2400, 4800, 9600, 19200];

/// Valid Modbus slave addresses.
const MODBUS_ADDRESSES: std::ops::RangeInclusive<u8> = 1..=247;

/// rumqttc refuses keep-alive intervals below this.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl Config {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.schedule.cycle_sec)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.meter.settle_ms)
    }

    /// Override connection settings from the environment (`MQTT_HOST`,
    /// `MQTT_PORT`, `MQTT_USER`, `MQTT_PASS`, `DEVICE_ID`).
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(user) = var("MQTT_USER") {
            self.mqtt.username = user;
        }
        if let Some(pass) = var("MQTT_PASS") {
            self.mqtt.password = pass;
        }
        if let Some(id) = var("DEVICE_ID") {
            self.device.id = id;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_meter(&mut errors);
        self.validate_switch(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.id.trim().is_empty() {
            errors.push("device.id is empty".into());
        } else if !d
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            // The id is spliced into topic paths: no '/', '+', '#' or spaces.
            errors.push(format!(
                "device.id '{}' may only contain ASCII letters, digits, '_' and '-'",
                d.id
            ));
        }
        if d.name.trim().is_empty() {
            errors.push("device.name is empty".into());
        }
        if let Some(ip) = &d.ip {
            if ip.parse::<IpAddr>().is_err() {
                errors.push(format!("device.ip '{ip}' is not an IP address"));
            }
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.keep_alive_sec < MIN_KEEP_ALIVE_SEC {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least {MIN_KEEP_ALIVE_SEC}, got {}",
                m.keep_alive_sec
            ));
        }
    }

    fn validate_meter(&self, errors: &mut Vec<String>) {
        let m = &self.meter;
        if m.port.trim().is_empty() {
            errors.push("meter.port is empty".into());
        }
        if !VALID_BAUD_RATES.contains(&m.baud_rate) {
            errors.push(format!(
                "meter.baud_rate {} not supported (allowed: {VALID_BAUD_RATES:?})",
                m.baud_rate
            ));
        }
        if !MODBUS_ADDRESSES.contains(&m.address) {
            errors.push(format!(
                "meter.address {} outside Modbus range 1-247",
                m.address
            ));
        }
        if self.schedule.cycle_sec == 0 {
            errors.push("schedule.cycle_sec must be positive".into());
        }
        if m.settle_ms == 0 {
            errors.push("meter.settle_ms must be positive".into());
        } else if self.schedule.cycle_sec > 0 && m.settle_ms >= self.schedule.cycle_sec * 1000 {
            errors.push(format!(
                "meter.settle_ms ({}) must be shorter than the cycle ({}s)",
                m.settle_ms, self.schedule.cycle_sec
            ));
        }
    }

    fn validate_switch(&self, errors: &mut Vec<String>) {
        let s = &self.switch;
        if s.name.trim().is_empty() {
            errors.push("switch.name is empty".into());
        }
        if !VALID_GPIO_PINS.contains(&s.gpio_pin) {
            errors.push(format!(
                "switch.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                s.gpio_pin
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, validate.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        device = %config.device.id,
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
