//! Simulated hardware for running the node on a development machine.
//!
//! - A meter port that answers valid read requests with well-formed frames,
//!   modelling a household load as a mean-reverting random walk
//! - Occasional silence and truncated frames (serial flakiness)
//! - A temperature sensor drifting slowly around room temperature

use std::io;

use crate::climate::{ClimateSensor, SensorFault};
use crate::frame::{self, FUNC_READ_INPUT_REGISTERS, RESPONSE_LEN};
use crate::meter::SerialLink;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Meter
// ---------------------------------------------------------------------------

/// Nominal mains values the simulated meter hovers around.
const NOMINAL_VOLTS: f64 = 230.0;
const NOMINAL_HZ: f64 = 50.0;
const MAX_LOAD_W: f64 = 3500.0;

/// Simulated meter behind a serial port.
pub struct SimMeterPort {
    address: u8,
    load_w: f64,
    mean_load_w: f64,
    energy_wh: f64,
    pending: Vec<u8>,
    drop_prob: f32,
    truncate_prob: f32,
}

impl SimMeterPort {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            load_w: 400.0,
            mean_load_w: 400.0,
            energy_wh: 1_000.0,
            pending: Vec::new(),
            drop_prob: 0.02,
            truncate_prob: 0.02,
        }
    }

    /// Probability that a request gets no answer / a cut-off answer.
    pub fn with_flakiness(mut self, drop_prob: f32, truncate_prob: f32) -> Self {
        self.drop_prob = drop_prob;
        self.truncate_prob = truncate_prob;
        self
    }

    fn is_read_request(&self, bytes: &[u8]) -> bool {
        bytes.len() == 8
            && bytes[0] == self.address
            && bytes[1] == FUNC_READ_INPUT_REGISTERS
            && frame::crc16(&bytes[..6]).to_le_bytes() == bytes[6..8]
    }

    /// Advance the load model by one sample and encode the response.
    fn next_frame(&mut self) -> Vec<u8> {
        let pull = 0.1 * (self.mean_load_w - self.load_w);
        // Appliances switching on/off now and then.
        let step = if fastrand::f32() < 0.1 {
            gaussian(0.0, 800.0)
        } else {
            gaussian(0.0, 40.0)
        };
        self.load_w = (self.load_w + pull + step).clamp(0.0, MAX_LOAD_W);

        let voltage = gaussian(NOMINAL_VOLTS, 1.5);
        let power_factor = gaussian(0.93, 0.02).clamp(0.5, 1.0);
        let current = self.load_w / (voltage * power_factor);
        // One sample roughly every 5 s.
        self.energy_wh += self.load_w * 5.0 / 3600.0;
        let frequency = gaussian(NOMINAL_HZ, 0.03);

        encode_response(
            self.address,
            (voltage * 10.0).round() as u16,
            (current * 1000.0).round() as u32,
            (self.load_w * 10.0).round() as u32,
            self.energy_wh as u32,
            (frequency * 10.0).round() as u16,
            (power_factor * 100.0).round() as u16,
        )
    }
}

impl SerialLink for SimMeterPort {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.pending.clear();
        if !self.is_read_request(bytes) {
            // A real meter stays silent on a bad request.
            return Ok(());
        }
        if fastrand::f32() < self.drop_prob {
            return Ok(());
        }
        let mut response = self.next_frame();
        if fastrand::f32() < self.truncate_prob {
            response.truncate(fastrand::usize(1..RESPONSE_LEN));
        }
        self.pending = response;
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.pending.len())
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.pending))
    }
}

/// Build a 25-byte response frame, 32-bit values low word first.
fn encode_response(
    address: u8,
    voltage: u16,
    current: u32,
    power: u32,
    energy: u32,
    frequency: u16,
    power_factor: u16,
) -> Vec<u8> {
    let mut f = Vec::with_capacity(RESPONSE_LEN);
    f.extend_from_slice(&[address, FUNC_READ_INPUT_REGISTERS, 20]);
    f.extend_from_slice(&voltage.to_be_bytes());
    for v in [current, power, energy] {
        f.extend_from_slice(&(v as u16).to_be_bytes());
        f.extend_from_slice(&((v >> 16) as u16).to_be_bytes());
    }
    f.extend_from_slice(&frequency.to_be_bytes());
    f.extend_from_slice(&power_factor.to_be_bytes());
    f.extend_from_slice(&[0, 0]); // alarm
    let crc = frame::crc16(&f);
    f.extend_from_slice(&crc.to_le_bytes());
    f
}

// ---------------------------------------------------------------------------
// Climate
// ---------------------------------------------------------------------------

/// Room temperature drifting slowly around a set point.
pub struct SimClimateSensor {
    temp_c: f64,
    center_c: f64,
}

impl SimClimateSensor {
    pub fn new(center_c: f64) -> Self {
        Self {
            temp_c: center_c,
            center_c,
        }
    }
}

impl ClimateSensor for SimClimateSensor {
    fn measure(&mut self) -> Result<f32, SensorFault> {
        let pull = 0.05 * (self.center_c - self.temp_c);
        self.temp_c = (self.temp_c + pull + gaussian(0.0, 0.1)).clamp(-40.0, 80.0);
        // DHT22 resolution is 0.1 °C.
        Ok(((self.temp_c * 10.0).round() / 10.0) as f32)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
