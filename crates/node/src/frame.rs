//! PZEM-004T v3 Modbus-RTU frames: read-request encoding and response decode.
//!
//! The meter answers a "read input registers" request for registers
//! 0x0000..0x000A with a 25-byte frame:
//!
//! ```text
//!  0      1      2      3..5   5..9      9..13    13..17    17..19  19..21  21..23  23..25
//!  addr   func   len    volt   current   power    energy    freq    pf      alarm   crc
//! ```
//!
//! 32-bit quantities are split across two registers, low word first.

use crc::{Crc, CRC_16_MODBUS};
use thiserror::Error;

// ── Protocol constants ──────────────────────────────────────────────────────

/// Modbus function code "read input registers".
pub const FUNC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Factory default slave address of the meter.
pub const DEFAULT_ADDRESS: u8 = 0x01;

/// Number of registers covering every measurement.
const MEASUREMENT_REGISTERS: u16 = 0x000A;

/// Length of a complete response: 3 header + 20 data + 2 CRC.
pub const RESPONSE_LEN: usize = 25;

/// Shortest buffer that still holds every decoded field (pf ends at 21).
pub const MIN_DECODE_LEN: usize = 21;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// Field offsets inside the response frame.
const OFF_VOLTAGE: usize = 3;
const OFF_CURRENT: usize = 5;
const OFF_POWER: usize = 9;
const OFF_ENERGY: usize = 13;
const OFF_FREQUENCY: usize = 17;
const OFF_POWER_FACTOR: usize = 19;

// ── Request ─────────────────────────────────────────────────────────────────

/// A "read input registers" request addressed to one meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u8,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    /// Request every measurement register from the meter at `address`.
    pub fn measurements(address: u8) -> Self {
        Self {
            address,
            start: 0x0000,
            count: MEASUREMENT_REGISTERS,
        }
    }

    /// Encode as the 8-byte wire frame, CRC trailer in little-endian order.
    pub fn encode(&self) -> [u8; 8] {
        let mut frame = [0u8; 8];
        frame[0] = self.address;
        frame[1] = FUNC_READ_INPUT_REGISTERS;
        frame[2..4].copy_from_slice(&self.start.to_be_bytes());
        frame[4..6].copy_from_slice(&self.count.to_be_bytes());
        let crc = crc16(&frame[..6]);
        frame[6..8].copy_from_slice(&crc.to_le_bytes());
        frame
    }
}

impl Default for ReadRequest {
    fn default() -> Self {
        Self::measurements(DEFAULT_ADDRESS)
    }
}

/// CRC-16/MODBUS over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

// ── Response ────────────────────────────────────────────────────────────────

/// One decoded set of electrical measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectricalSample {
    /// Volts, 0.1 V resolution.
    pub voltage: f64,
    /// Amperes, 0.001 A resolution.
    pub current: f64,
    /// Watts, 0.1 W resolution.
    pub power: f64,
    /// Accumulated energy in watt-hours.
    pub energy_wh: u32,
    /// Hertz, 0.1 Hz resolution.
    pub frequency: f64,
    /// Power factor, 0.01 resolution.
    pub power_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, need at least {MIN_DECODE_LEN}")]
    TooShort { len: usize },
    #[error("field at offset {offset} out of bounds")]
    OutOfBounds { offset: usize },
}

/// Decode a meter response.  Pure: identical bytes always give identical
/// output, and a failure never yields a partially filled sample.
pub fn decode(frame: &[u8]) -> Result<ElectricalSample, DecodeError> {
    if frame.len() < MIN_DECODE_LEN {
        return Err(DecodeError::TooShort { len: frame.len() });
    }

    let voltage = read_u16(frame, OFF_VOLTAGE)?;
    let current = read_u32_low_first(frame, OFF_CURRENT)?;
    let power = read_u32_low_first(frame, OFF_POWER)?;
    let energy_wh = read_u32_low_first(frame, OFF_ENERGY)?;
    let frequency = read_u16(frame, OFF_FREQUENCY)?;
    let power_factor = read_u16(frame, OFF_POWER_FACTOR)?;

    Ok(ElectricalSample {
        voltage: f64::from(voltage) / 10.0,
        current: f64::from(current) / 1000.0,
        power: f64::from(power) / 10.0,
        energy_wh,
        frequency: f64::from(frequency) / 10.0,
        power_factor: f64::from(power_factor) / 100.0,
    })
}

/// Big-endian u16 at `offset`.
fn read_u16(frame: &[u8], offset: usize) -> Result<u16, DecodeError> {
    frame
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DecodeError::OutOfBounds { offset })
}

/// Two big-endian registers, low word at `offset`, high word right after.
fn read_u32_low_first(frame: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let low = read_u16(frame, offset)?;
    let high = read_u16(frame, offset + 2)?;
    Ok(u32::from(high) << 16 | u32::from(low))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Well-formed 25-byte response for a 220 V line, with distinct
    /// low/high words in current and power so a word swap cannot go unnoticed.
    fn sample_frame() -> Vec<u8> {
        let mut f = vec![
            0x01, 0x04, 0x14, // addr, func, byte count
            0x08, 0x98, // voltage 2200
            0x86, 0xA0, 0x00, 0x01, // current low 0x86A0, high 0x0001 -> 100000
            0x4E, 0x20, 0x00, 0x02, // power low 0x4E20, high 0x0002 -> 151072
            0x30, 0x39, 0x00, 0x00, // energy 12345
            0x01, 0xF4, // frequency 500
            0x00, 0x5F, // power factor 95
            0x00, 0x00, // alarm
        ];
        let crc = crc16(&f);
        f.extend_from_slice(&crc.to_le_bytes());
        f
    }

    // -- Request encoding -----------------------------------------------------

    #[test]
    fn default_request_matches_wire_bytes() {
        assert_eq!(
            ReadRequest::default().encode(),
            [0x01, 0x04, 0x00, 0x00, 0x00, 0x0A, 0x70, 0x0D]
        );
    }

    #[test]
    fn request_crc_covers_address() {
        let a = ReadRequest::measurements(1).encode();
        let b = ReadRequest::measurements(2).encode();
        assert_eq!(a[1..6], b[1..6]);
        assert_ne!(a[6..], b[6..]);
    }

    #[test]
    fn request_trailer_verifies() {
        let frame = ReadRequest::measurements(0x11).encode();
        let crc = u16::from_le_bytes([frame[6], frame[7]]);
        assert_eq!(crc16(&frame[..6]), crc);
    }

    // -- Decoding ---------------------------------------------------------------

    #[test]
    fn decodes_full_frame() {
        let s = decode(&sample_frame()).unwrap();
        assert_eq!(s.voltage, 220.0);
        assert_eq!(s.current, 100.0);
        assert_eq!(s.power, 15107.2);
        assert_eq!(s.energy_wh, 12345);
        assert_eq!(s.frequency, 50.0);
        assert_eq!(s.power_factor, 0.95);
    }

    #[test]
    fn current_high_word_is_second_register() {
        // low = 0x0000, high = 0x0001 -> 65536 mA
        let mut f = sample_frame();
        f[5..9].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(decode(&f).unwrap().current, 65.536);

        // low = 0x0001, high = 0x0000 -> 1 mA
        f[5..9].copy_from_slice(&[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(decode(&f).unwrap().current, 0.001);
    }

    #[test]
    fn power_high_word_is_second_register() {
        let mut f = sample_frame();
        f[9..13].copy_from_slice(&[0x03, 0xE8, 0x00, 0x00]);
        assert_eq!(decode(&f).unwrap().power, 100.0);
    }

    #[test]
    fn minimum_length_frame_decodes() {
        let f = sample_frame();
        let s = decode(&f[..MIN_DECODE_LEN]).unwrap();
        assert_eq!(s.voltage, 220.0);
        assert_eq!(s.power_factor, 0.95);
    }

    #[test]
    fn every_short_buffer_fails() {
        let f = sample_frame();
        for len in 0..MIN_DECODE_LEN {
            assert_eq!(
                decode(&f[..len]),
                Err(DecodeError::TooShort { len }),
                "len {len} should fail"
            );
        }
    }

    #[test]
    fn empty_buffer_fails() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn decode_is_deterministic() {
        let f = sample_frame();
        assert_eq!(decode(&f), decode(&f));
    }

    #[test]
    fn zero_frame_decodes_to_zeros() {
        let s = decode(&[0u8; RESPONSE_LEN]).unwrap();
        assert_eq!(s.voltage, 0.0);
        assert_eq!(s.current, 0.0);
        assert_eq!(s.power, 0.0);
        assert_eq!(s.frequency, 0.0);
    }

    #[test]
    fn max_registers_do_not_overflow() {
        let s = decode(&[0xFF; RESPONSE_LEN]).unwrap();
        assert_eq!(s.current, f64::from(u32::MAX) / 1000.0);
        assert_eq!(s.voltage, 6553.5);
    }
}
