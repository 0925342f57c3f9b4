//! The switch output via GPIO.  The `hardware` feature gates the real rppal
//! driver; without it, a mock relay logs state changes.

/// A single on/off output.
pub trait Actuator {
    fn set(&mut self, on: bool);
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "hardware")]
pub struct GpioRelay {
    pin: rppal::gpio::OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "hardware")]
impl GpioRelay {
    pub fn new(pin_num: u8, active_low: bool) -> anyhow::Result<Self> {
        let gpio = rppal::gpio::Gpio::new()?;
        let pin = gpio.get(pin_num)?.into_output();

        let mut relay = Self { pin, active_low };
        // Fail-safe: the node announces OFF at startup, so the pin must agree.
        relay.set(false);

        tracing::info!(gpio = pin_num, active_low, "switch relay initialised");
        Ok(relay)
    }
}

#[cfg(feature = "hardware")]
impl Actuator for GpioRelay {
    fn set(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        tracing::info!(state = if on { "ON" } else { "OFF" }, "switch output set");
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development: no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(any(test, not(feature = "hardware")))]
pub struct MockRelay {
    pub(crate) on: bool,
    pub(crate) writes: usize,
}

#[cfg(any(test, not(feature = "hardware")))]
impl MockRelay {
    pub fn new(pin_num: u8) -> Self {
        tracing::info!(gpio = pin_num, "[mock-gpio] switch relay registered (not wired)");
        Self { on: false, writes: 0 }
    }
}

#[cfg(any(test, not(feature = "hardware")))]
impl Actuator for MockRelay {
    fn set(&mut self, on: bool) {
        self.on = on;
        self.writes += 1;
        tracing::info!(state = if on { "ON" } else { "OFF" }, "[mock-gpio] switch output set");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
