mod climate;
mod clock;
mod command;
mod config;
mod discovery;
mod frame;
mod meter;
mod mqtt;
mod net;
mod relay;
#[cfg(feature = "sim")]
mod sim;
mod telemetry;

#[cfg(not(any(feature = "sim", feature = "hardware")))]
compile_error!("enable the `sim` feature, the `hardware` feature, or both");

use anyhow::Result;
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use climate::{ClimateSensor, IioClimateSensor};
use command::CommandRouter;
use config::Config;
use discovery::{DeviceInfo, DiscoveryRegistry, Topics};
use frame::ReadRequest;
use meter::MeterChannel;
use mqtt::MqttLink;
use telemetry::TelemetryLoop;

/// Centre of the simulated room temperature, °C.
#[cfg(feature = "sim")]
const SIM_ROOM_TEMP_C: f64 = 21.0;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    match clock::check_sync() {
        Ok(now) => info!(%now, "system clock synchronised"),
        Err(e) => warn!("{e}"),
    }

    // ── Identity + discovery ────────────────────────────────────────
    let ip = net::device_ip(cfg.device.ip.as_deref(), &cfg.mqtt.host, cfg.mqtt.port);
    let device = DeviceInfo {
        id: cfg.device.id.clone(),
        display_name: cfg.device.name.clone(),
    };
    let topics = Topics::for_device(&device.id);
    let registry = DiscoveryRegistry::new(&device, &topics, &ip, &cfg.switch.name)?;
    info!(device = %device.id, %ip, "device identity resolved");

    // ── Peripherals ─────────────────────────────────────────────────
    let climate = climate_sensor(&cfg)?;

    #[cfg(feature = "hardware")]
    let (port, relay) = (
        meter::UartPort::open(&cfg.meter.port, cfg.meter.baud_rate)?,
        relay::GpioRelay::new(cfg.switch.gpio_pin, cfg.switch.active_low)?,
    );
    #[cfg(not(feature = "hardware"))]
    let (port, relay) = {
        warn!("built without `hardware`: meter and switch are simulated");
        (
            sim::SimMeterPort::new(cfg.meter.address),
            relay::MockRelay::new(cfg.switch.gpio_pin),
        )
    };

    let meter = MeterChannel::new(port, ReadRequest::measurements(cfg.meter.address), cfg.settle());
    let router = CommandRouter::new(&topics, relay);

    // ── Loop ────────────────────────────────────────────────────────
    let mut node = TelemetryLoop::new(
        MqttLink::new(&cfg.mqtt),
        meter,
        climate,
        router,
        registry,
        topics,
        cfg.cycle_period(),
    );

    if let Err(e) = node.start().await {
        // The loop reconnects and re-announces on its own.
        error!("startup failed: {e}");
    }
    node.run().await;
    Ok(())
}

fn climate_sensor(cfg: &Config) -> Result<Box<dyn ClimateSensor>> {
    match &cfg.climate.temp_path {
        Some(path) => {
            info!(path = %path, "reading temperature from iio sysfs");
            Ok(Box::new(IioClimateSensor::new(path)))
        }
        #[cfg(feature = "sim")]
        None => {
            warn!("climate.temp_path not set: temperature is simulated");
            Ok(Box::new(sim::SimClimateSensor::new(SIM_ROOM_TEMP_C)))
        }
        #[cfg(not(feature = "sim"))]
        None => anyhow::bail!("climate.temp_path is required without the `sim` feature"),
    }
}
