use rppal::gpio::{Gpio, OutputPin};
use std::fmt;
use tracing::info;

use super::OutputLine;

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("Failed to access GPIO pin {pin}: {source}")]
    Access {
        pin: u8,
        source: rppal::gpio::Error,
    },
}

/// Relay driven from a Raspberry Pi GPIO line.
pub struct RelayPin {
    pin: OutputPin,
    active_low: bool,
}

impl fmt::Debug for RelayPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayPin")
            .field("pin", &self.pin.pin())
            .field("active_low", &self.active_low)
            .finish()
    }
}

impl RelayPin {
    /// Claims BCM pin `bcm_pin` as output, starting in the off level.
    pub fn open(bcm_pin: u8, active_low: bool) -> Result<Self, GpioError> {
        let access = |source| GpioError::Access {
            pin: bcm_pin,
            source,
        };

        let pin = Gpio::new().map_err(access)?.get(bcm_pin).map_err(access)?;
        let pin = if physical_level(false, active_low) {
            pin.into_output_high()
        } else {
            pin.into_output_low()
        };

        info!(
            "Relay on GPIO {} ready (active {})",
            bcm_pin,
            if active_low { "low" } else { "high" }
        );
        Ok(Self { pin, active_low })
    }
}

impl OutputLine for RelayPin {
    fn set_level(&mut self, on: bool) {
        if physical_level(on, self.active_low) {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

fn physical_level(on: bool, active_low: bool) -> bool {
    on != active_low
}

#[cfg(test)]
mod tests {
    use super::physical_level;

    #[test]
    fn test_polarity() {
        assert!(physical_level(true, false));
        assert!(!physical_level(false, false));
        assert!(!physical_level(true, true));
        assert!(physical_level(false, true));
    }
}
