//! Temperature/humidity sensor seam.
//!
//! On the device the DHT22 is handled by the Linux `dht11` IIO driver; a read
//! of `in_temp_input` triggers a measurement and returns millidegrees Celsius.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorFault {
    #[error("sensor read failed: {0}")]
    Io(#[from] io::Error),
    #[error("unparseable sensor value {0:?}")]
    Parse(String),
}

/// Trigger a measurement and return the temperature in °C.
pub trait ClimateSensor {
    fn measure(&mut self) -> Result<f32, SensorFault>;
}

impl<T: ClimateSensor + ?Sized> ClimateSensor for Box<T> {
    fn measure(&mut self) -> Result<f32, SensorFault> {
        (**self).measure()
    }
}

// ---------------------------------------------------------------------------
// IIO sysfs sensor
// ---------------------------------------------------------------------------

pub struct IioClimateSensor {
    temp_path: PathBuf,
}

impl IioClimateSensor {
    pub fn new(temp_path: impl Into<PathBuf>) -> Self {
        Self {
            temp_path: temp_path.into(),
        }
    }
}

impl ClimateSensor for IioClimateSensor {
    fn measure(&mut self) -> Result<f32, SensorFault> {
        let raw = std::fs::read_to_string(&self.temp_path)?;
        parse_millidegrees(&raw)
    }
}

fn parse_millidegrees(raw: &str) -> Result<f32, SensorFault> {
    let trimmed = raw.trim();
    trimmed
        .parse::<i32>()
        .map(|milli| milli as f32 / 1000.0)
        .map_err(|_| SensorFault::Parse(trimmed.to_string()))
}

// ===========================================================================
// Tests
// ===========================================================================
