//! Reactor Device Capabilities
//!
//! Fine-grained capability traits for the devices a flow reactor drives.
//! The orchestration engine only ever talks to these traits; serial framing,
//! vendor SDKs and unit conversion live in the drivers behind them.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Takes `&self`; drivers keep state behind interior mutability
//!
//! Mutual exclusion between callers is NOT the driver's job. Every device is
//! reached through [`DeviceLockRegistry`](crate::hardware::locks::DeviceLockRegistry),
//! which holds one lock per logical device.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ReactorError;

// =============================================================================
// Pumps
// =============================================================================

/// Units a pump rate is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateUnit {
    /// µL/min
    MicrolitersPerMinute,
    /// µL/h
    MicrolitersPerHour,
    /// mL/min
    MillilitersPerMinute,
    /// mL/h
    MillilitersPerHour,
}

/// A volumetric flow rate with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowRate {
    /// Magnitude in `unit`.
    pub value: f64,
    /// Unit of `value`.
    pub unit: RateUnit,
}

impl FlowRate {
    /// Rate in µL/min, the unit procedures are written in.
    pub fn microliters_per_minute(value: f64) -> Self {
        Self {
            value,
            unit: RateUnit::MicrolitersPerMinute,
        }
    }

    /// Rate in µL/h, the unit syringe maxima are quoted in.
    pub fn microliters_per_hour(value: f64) -> Self {
        Self {
            value,
            unit: RateUnit::MicrolitersPerHour,
        }
    }
}

/// Pumping direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpDirection {
    /// Push fluid into the reactor.
    #[default]
    Infuse,
    /// Pull fluid back.
    Withdraw,
}

/// Pump self-description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpInfo {
    /// Last rate set, if any.
    pub rate: Option<FlowRate>,
    /// Model string reported by the pump.
    pub model: String,
    /// Bus address.
    pub address: String,
    /// Syringe inner diameter in mm, when the pump knows it.
    pub diameter: Option<f64>,
}

/// Capability: Volumetric Pumping
///
/// Syringe or piston pumps feeding liquid or gas into the reactor.
///
/// # Contract
/// - `set_rate` configures the rate but does not start pumping
/// - `run` starts pumping at the configured rate
/// - `stop` halts pumping; calling it on a stopped pump succeeds
#[async_trait]
pub trait Pump: Send + Sync {
    /// Report rate, model, address and syringe diameter.
    async fn get_info(&self) -> Result<PumpInfo>;

    /// Configure rate and direction.
    ///
    /// # Arguments
    /// * `rate` - Target flow rate
    /// * `direction` - Infuse or withdraw
    async fn set_rate(&self, rate: FlowRate, direction: PumpDirection) -> Result<()>;

    /// Start pumping at the configured rate.
    async fn run(&self) -> Result<()>;

    /// Stop pumping.
    async fn stop(&self) -> Result<()>;
}

// =============================================================================
// Temperature
// =============================================================================

/// Set point and measured temperature in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Commanded set point.
    pub temp_set_point: f64,
    /// Measured temperature.
    pub current_temp: f64,
}

impl TemperatureReading {
    /// Whether the measured temperature is within `tolerance` of the set point.
    pub fn within(&self, tolerance: f64) -> bool {
        (self.current_temp - self.temp_set_point).abs() <= tolerance
    }
}

/// Capability: Temperature Control
///
/// Heaters/chillers holding the reactor coil at a set point.
#[async_trait]
pub trait TemperatureController: Send + Sync {
    /// Read set point and measured temperature.
    async fn get_current_temperature(&self) -> Result<TemperatureReading>;

    /// Command a new set point in °C. Returns once the command is accepted;
    /// reaching the set point takes longer.
    async fn set_temperature(&self, value: f64) -> Result<()>;
}

// =============================================================================
// Stage
// =============================================================================

/// Capability: Viewing Stage Motion
///
/// Linear stage carrying the optical probe along the reactor coil.
///
/// # Contract
/// - Positions are in device-native units
/// - `move_abs` initiates motion but may return before completion
/// - `wait_settled` blocks until motion completes
/// - `home` returns to the reference position and blocks until there
#[async_trait]
pub trait Stage: Send + Sync {
    /// Move to the home/reference position.
    async fn home(&self) -> Result<()>;

    /// Move to absolute position.
    ///
    /// # Arguments
    /// * `position` - Target position in device-native units
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Get current position.
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle.
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately.
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

// =============================================================================
// Spectrometer
// =============================================================================

/// Paired wavelength/value arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Wavelengths in nm.
    pub wavelengths: Vec<f64>,
    /// Intensity or absorbance, one per wavelength.
    pub values: Vec<f64>,
}

impl Spectrum {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    /// Whether the spectrum holds no points.
    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }
}

/// Parameters of an absorbance acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorbanceSettings {
    /// Integration time in µs.
    pub integration_time_us: u32,
    /// Number of scans averaged together.
    pub scans_to_average: u32,
    /// Leading points discarded (detector edge noise).
    pub cutoff: usize,
    /// Scale the result so its maximum is 1.
    pub normalized: bool,
}

/// Capability: Absorbance Spectroscopy
///
/// # Contract
/// - `open`/`close` acquire and release the device handle; they are
///   synchronous so a scope guard can release the device on drop
/// - Reads are only valid between `open` and `close`
/// - `absorbance_read` requires a stored blank and dark
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Acquire the device handle.
    fn open(&self) -> Result<()>;

    /// Release the device handle. Must not fail.
    fn close(&self);

    /// Raw intensity spectrum at the given integration time.
    async fn raw_read(&self, integration_time_us: u32) -> Result<Spectrum>;

    /// Absorbance spectrum relative to the stored blank and dark.
    async fn absorbance_read(&self, settings: AbsorbanceSettings) -> Result<Spectrum>;

    /// Store the reference (solvent) spectrum.
    async fn store_blank(&self, blank: Spectrum) -> Result<()>;

    /// Store the dark (shutter closed) spectrum.
    async fn store_dark(&self, dark: Spectrum) -> Result<()>;

    /// Fluorescence acquisition.
    ///
    /// # Default Implementation
    /// Fails with [`ReactorError::NotImplemented`].
    async fn fluorescence_read(&self, _integration_time_us: u32) -> Result<Spectrum> {
        Err(ReactorError::NotImplemented("fluorescence read").into())
    }
}

// =============================================================================
// GPIO
// =============================================================================

/// Digital output level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    /// Logic high.
    High,
    /// Logic low.
    Low,
}

impl From<bool> for PinLevel {
    fn from(on: bool) -> Self {
        if on {
            PinLevel::High
        } else {
            PinLevel::Low
        }
    }
}

/// Capability: Digital Outputs
#[async_trait]
pub trait Gpio: Send + Sync {
    /// Drive `pin` to `level`.
    async fn output(&self, pin: u8, level: PinLevel) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_within_tolerance_is_symmetric() {
        let warm = TemperatureReading {
            temp_set_point: 90.0,
            current_temp: 91.5,
        };
        let cold = TemperatureReading {
            temp_set_point: 90.0,
            current_temp: 87.0,
        };
        assert!(warm.within(2.0));
        assert!(!cold.within(2.0));
        assert!(cold.within(3.0));
    }

    #[test]
    fn pin_level_from_bool() {
        assert_eq!(PinLevel::from(true), PinLevel::High);
        assert_eq!(PinLevel::from(false), PinLevel::Low);
    }
}
