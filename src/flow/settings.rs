//! Runtime settings of a flow reactor.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hardware::LightSourcePins;

/// Ambient temperature the coil returns to after a run, in °C.
pub const ROOM_TEMPERATURE_C: f64 = 25.0;

/// Maximum syringe pump rate used to flush the coil, in µL/h.
pub const MAX_SYRINGE_FLOW_RATE_UL_PER_HR: f64 = 1_880_770.0;

/// Coil dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReactorGeometry {
    /// Inner diameter in mm.
    pub tube_diameter_mm: f64,
    /// Length in cm.
    pub total_tube_length_cm: f64,
}

impl Default for ReactorGeometry {
    fn default() -> Self {
        Self {
            tube_diameter_mm: 1.59,
            total_tube_length_cm: 30.0,
        }
    }
}

impl ReactorGeometry {
    /// Internal volume in µL (1 mm³ = 1 µL).
    pub fn dead_volume_ul(&self) -> f64 {
        let length_mm = self.total_tube_length_cm * 10.0;
        length_mm * std::f64::consts::PI * self.tube_diameter_mm.powi(2) / 4.0
    }

    /// Time to push one coil volume through at `rate_ul_per_hr`.
    pub fn flush_time(&self, rate_ul_per_hr: f64) -> Duration {
        if rate_ul_per_hr <= 0.0 || !rate_ul_per_hr.is_finite() {
            return Duration::ZERO;
        }
        let hours = self.dead_volume_ul() / rate_ul_per_hr;
        Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::ZERO)
    }
}

/// Waits applied during steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowTiming {
    /// Between setting pump rates and starting the pumps.
    pub pump_settle: Duration,
    /// Before checking temperature in a procedure step.
    pub pre_measurement: Duration,
    /// Between temperature checks.
    pub temperature_poll_interval: Duration,
    /// Give up on temperature stabilization after this long; `None` waits forever.
    pub temperature_max_wait: Option<Duration>,
    /// Accepted deviation from the set point, in °C.
    pub temperature_tolerance_c: f64,
    /// Set point applied when a run stops, in °C.
    pub ambient_temperature_c: f64,
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self {
            pump_settle: Duration::from_secs(2),
            pre_measurement: Duration::from_secs(30),
            temperature_poll_interval: Duration::from_secs(1),
            temperature_max_wait: Some(Duration::from_secs(3600)),
            temperature_tolerance_c: 2.0,
            ambient_temperature_c: ROOM_TEMPERATURE_C,
        }
    }
}

impl FlowTiming {
    /// No settling delays; temperature polled every millisecond for at most
    /// a second. For simulations and tests.
    pub fn immediate() -> Self {
        Self {
            pump_settle: Duration::ZERO,
            pre_measurement: Duration::ZERO,
            temperature_poll_interval: Duration::from_millis(1),
            temperature_max_wait: Some(Duration::from_secs(1)),
            ..Self::default()
        }
    }
}

/// Blank calibration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    /// CSV the flush readings are appended to.
    pub blank_output: PathBuf,
    /// Pump rate used to flush the coil, in µL/h.
    pub max_syringe_flow_rate_ul_per_hr: f64,
    /// Integration time for calibration reads, in µs.
    pub integration_time_us: u32,
    /// Pause between calibration reads.
    pub read_interval: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            blank_output: PathBuf::from("blank.csv"),
            max_syringe_flow_rate_ul_per_hr: MAX_SYRINGE_FLOW_RATE_UL_PER_HR,
            integration_time_us: 1000,
            read_interval: Duration::from_millis(500),
        }
    }
}

/// What to do with unread spectra when a new run is submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingSpectraPolicy {
    /// Leave them buffered.
    #[default]
    Keep,
    /// Drop them and start the run.
    Discard,
    /// Refuse the run unless the caller allows discarding.
    Reject,
}

/// Everything a [`FlowExecutor`](crate::flow::FlowExecutor) needs besides devices.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    /// Coil dimensions.
    pub geometry: ReactorGeometry,
    /// Light source wiring.
    pub light_pins: LightSourcePins,
    /// Step waits.
    pub timing: FlowTiming,
    /// Blank calibration.
    pub calibration: CalibrationSettings,
    /// Unread spectra handling.
    pub pending_spectra: PendingSpectraPolicy,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            geometry: ReactorGeometry::default(),
            light_pins: LightSourcePins::new(18, 13),
            timing: FlowTiming::default(),
            calibration: CalibrationSettings::default(),
            pending_spectra: PendingSpectraPolicy::default(),
        }
    }
}

impl FlowSettings {
    /// Defaults with [`FlowTiming::immediate`].
    pub fn immediate() -> Self {
        Self {
            timing: FlowTiming::immediate(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_volume_of_default_coil() {
        // 300 mm of 1.59 mm bore
        let volume = ReactorGeometry::default().dead_volume_ul();
        assert!((volume - 595.67).abs() < 0.01, "got {volume}");
    }

    #[test]
    fn flush_time_scales_with_rate() {
        let geometry = ReactorGeometry {
            tube_diameter_mm: 2.0,
            total_tube_length_cm: 100.0 / std::f64::consts::PI,
        };
        // 1000 µL at 3600 µL/h is 1000 s
        let flush = geometry.flush_time(3600.0);
        assert!((flush.as_secs_f64() - 1000.0).abs() < 1e-6);
        assert_eq!(geometry.flush_time(0.0), Duration::ZERO);
    }
}
