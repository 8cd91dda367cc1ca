//! The two GPIO-switched light sources illuminating the viewing port.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hardware::capabilities::{Gpio, PinLevel};

/// On/off state of both light sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightSourceState {
    /// Light source 1 (absorbance lamp).
    pub light_source_1_on: bool,
    /// Light source 2.
    pub light_source_2_on: bool,
}

impl LightSourceState {
    /// Both off.
    pub const OFF: Self = Self {
        light_source_1_on: false,
        light_source_2_on: false,
    };

    /// Lamp 1 on, lamp 2 off; the absorbance configuration.
    pub const ABSORBANCE: Self = Self {
        light_source_1_on: true,
        light_source_2_on: false,
    };

    /// Explicit state.
    pub fn new(light_source_1_on: bool, light_source_2_on: bool) -> Self {
        Self {
            light_source_1_on,
            light_source_2_on,
        }
    }
}

/// GPIO pin assignment of the light sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightSourcePins {
    /// Pin driving light source 1.
    pub pin_1: u8,
    /// Pin driving light source 2.
    pub pin_2: u8,
}

impl LightSourcePins {
    /// Pin pair.
    pub fn new(pin_1: u8, pin_2: u8) -> Self {
        Self { pin_1, pin_2 }
    }

    /// Drive both pins to `state`. Caller holds the GPIO lock.
    pub async fn apply(&self, gpio: &dyn Gpio, state: LightSourceState) -> Result<()> {
        gpio.output(self.pin_1, PinLevel::from(state.light_source_1_on))
            .await?;
        gpio.output(self.pin_2, PinLevel::from(state.light_source_2_on))
            .await?;
        debug!(
            light_source_1_on = state.light_source_1_on,
            light_source_2_on = state.light_source_2_on,
            "Light sources set"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockGpio;

    #[tokio::test]
    async fn apply_drives_both_pins() {
        let gpio = MockGpio::new();
        let pins = LightSourcePins::new(18, 13);

        pins.apply(&gpio, LightSourceState::ABSORBANCE).await.unwrap();
        assert_eq!(gpio.level(18), Some(PinLevel::High));
        assert_eq!(gpio.level(13), Some(PinLevel::Low));

        pins.apply(&gpio, LightSourceState::OFF).await.unwrap();
        assert_eq!(gpio.level(18), Some(PinLevel::Low));
    }
}
