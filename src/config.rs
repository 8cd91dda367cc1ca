//! Reactor configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/reactor.toml`)
//! 2. environment variables prefixed with `REACTOR_DAQ_`, nested with `__`
//!
//! Every section and field has a default, so an empty or missing file yields
//! a usable configuration for the reference coil.
//!
//! # Example
//! ```no_run
//! use reactor_daq::config::ReactorConfig;
//!
//! // REACTOR_DAQ_TIMING__PRE_MEASUREMENT=5s shortens the settle before readings
//! let config = ReactorConfig::load()?;
//! config.validate().map_err(reactor_daq::error::ReactorError::Configuration)?;
//! println!("Reactor at {}", config.reactor.ip_address);
//! # Ok::<(), reactor_daq::error::ReactorError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::flow::{
    CalibrationSettings, FlowSettings, FlowTiming, PendingSpectraPolicy, ReactorGeometry,
    MAX_SYRINGE_FLOW_RATE_UL_PER_HR, ROOM_TEMPERATURE_C,
};
use crate::hardware::LightSourcePins;
use crate::reactor::ReactorIdentity;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/reactor.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "REACTOR_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Reactor identity and hardware layout
    pub reactor: ReactorSection,
    /// Step waits
    pub timing: TimingConfig,
    /// Blank calibration and startup files
    pub calibration: CalibrationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Reactor DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Reactor identity and hardware layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorSection {
    /// Fixed reactor id; a random one is generated when absent
    pub uuid: Option<String>,
    /// Address the reactor reports
    pub ip_address: String,
    /// Coil inner diameter in mm
    pub tube_diameter_mm: f64,
    /// Coil length in cm
    pub total_tube_length_cm: f64,
    /// GPIO pin of the first light source
    pub light_source_1_pin: u8,
    /// GPIO pin of the second light source
    pub light_source_2_pin: u8,
    /// Unread spectra handling when a new run is submitted
    pub pending_spectra: PendingSpectraPolicy,
}

impl Default for ReactorSection {
    fn default() -> Self {
        let geometry = ReactorGeometry::default();
        Self {
            uuid: None,
            ip_address: "127.0.0.1".to_string(),
            tube_diameter_mm: geometry.tube_diameter_mm,
            total_tube_length_cm: geometry.total_tube_length_cm,
            light_source_1_pin: 18,
            light_source_2_pin: 13,
            pending_spectra: PendingSpectraPolicy::default(),
        }
    }
}

/// Step waits, as humantime strings ("2s", "1h 30m")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Between setting pump rates and starting the pumps
    #[serde(with = "humantime_serde")]
    pub pump_settle: Duration,
    /// Before checking temperature in a procedure step
    #[serde(with = "humantime_serde")]
    pub pre_measurement: Duration,
    /// Between temperature checks
    #[serde(with = "humantime_serde")]
    pub temperature_poll_interval: Duration,
    /// Give up waiting for temperature after this long; `"forever"` removes the bound
    #[serde(with = "optional_wait")]
    pub temperature_max_wait: Option<Duration>,
    /// Accepted deviation from the set point in °C
    pub temperature_tolerance_c: f64,
    /// Set point applied when a run stops
    pub ambient_temperature_c: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let timing = FlowTiming::default();
        Self {
            pump_settle: timing.pump_settle,
            pre_measurement: timing.pre_measurement,
            temperature_poll_interval: timing.temperature_poll_interval,
            temperature_max_wait: timing.temperature_max_wait,
            temperature_tolerance_c: timing.temperature_tolerance_c,
            ambient_temperature_c: ROOM_TEMPERATURE_C,
        }
    }
}

/// A humantime duration, or `"forever"` (also `"none"`) for no bound.
mod optional_wait {
    use std::time::Duration;

    use humantime_serde::re::humantime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    const UNBOUNDED: &str = "forever";

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_str(UNBOUNDED),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let text = text.trim();
        if text.eq_ignore_ascii_case(UNBOUNDED) || text.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        humantime::parse_duration(text)
            .map(Some)
            .map_err(D::Error::custom)
    }
}

/// Blank calibration and startup files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// CSV the blank flush readings are appended to
    pub blank_output: PathBuf,
    /// Flush rate in µL/h
    pub max_syringe_flow_rate_ul_per_hr: f64,
    /// Integration time for blank readings in µs
    pub integration_time_us: u32,
    /// Pause between blank readings
    #[serde(with = "humantime_serde")]
    pub read_interval: Duration,
    /// Stage positions CSV loaded at startup
    pub stage_positions_file: Option<PathBuf>,
    /// Blank spectrum CSV loaded at startup
    pub blank_file: Option<PathBuf>,
    /// Dark spectrum CSV loaded at startup
    pub dark_file: Option<PathBuf>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let calibration = CalibrationSettings::default();
        Self {
            blank_output: calibration.blank_output,
            max_syringe_flow_rate_ul_per_hr: MAX_SYRINGE_FLOW_RATE_UL_PER_HR,
            integration_time_us: calibration.integration_time_us,
            read_interval: calibration.read_interval,
            stage_positions_file: None,
            blank_file: None,
            dark_file: None,
        }
    }
}

impl ReactorConfig {
    /// Load configuration from `config/reactor.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `REACTOR_DAQ_`.
    /// Example: `REACTOR_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.reactor.ip_address.trim().is_empty() {
            return Err("ip_address must not be empty".to_string());
        }

        let positive = |value: f64| value.is_finite() && value > 0.0;

        let reactor = &self.reactor;
        if !positive(reactor.tube_diameter_mm) || !positive(reactor.total_tube_length_cm) {
            return Err(format!(
                "Invalid coil {} mm x {} cm. Both dimensions must be positive",
                reactor.tube_diameter_mm, reactor.total_tube_length_cm
            ));
        }

        if reactor.light_source_1_pin == reactor.light_source_2_pin {
            return Err(format!(
                "Light sources share GPIO pin {}",
                reactor.light_source_1_pin
            ));
        }

        if self.timing.temperature_poll_interval.is_zero() {
            return Err("temperature_poll_interval must be greater than zero".to_string());
        }

        let tolerance = self.timing.temperature_tolerance_c;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(format!(
                "Invalid temperature_tolerance_c {}. Must be non-negative",
                self.timing.temperature_tolerance_c
            ));
        }

        if !positive(self.calibration.max_syringe_flow_rate_ul_per_hr) {
            return Err(format!(
                "Invalid max_syringe_flow_rate_ul_per_hr {}. Must be positive",
                self.calibration.max_syringe_flow_rate_ul_per_hr
            ));
        }

        if self.calibration.integration_time_us == 0 {
            return Err("integration_time_us must be greater than zero".to_string());
        }

        if self.calibration.blank_file.is_some() != self.calibration.dark_file.is_some() {
            return Err("blank_file and dark_file must be given together".to_string());
        }

        Ok(())
    }

    /// Settings for a [`FlowExecutor`](crate::flow::FlowExecutor).
    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            geometry: ReactorGeometry {
                tube_diameter_mm: self.reactor.tube_diameter_mm,
                total_tube_length_cm: self.reactor.total_tube_length_cm,
            },
            light_pins: LightSourcePins::new(
                self.reactor.light_source_1_pin,
                self.reactor.light_source_2_pin,
            ),
            timing: FlowTiming {
                pump_settle: self.timing.pump_settle,
                pre_measurement: self.timing.pre_measurement,
                temperature_poll_interval: self.timing.temperature_poll_interval,
                temperature_max_wait: self.timing.temperature_max_wait,
                temperature_tolerance_c: self.timing.temperature_tolerance_c,
                ambient_temperature_c: self.timing.ambient_temperature_c,
            },
            calibration: CalibrationSettings {
                blank_output: self.calibration.blank_output.clone(),
                max_syringe_flow_rate_ul_per_hr: self.calibration.max_syringe_flow_rate_ul_per_hr,
                integration_time_us: self.calibration.integration_time_us,
                read_interval: self.calibration.read_interval,
            },
            pending_spectra: self.reactor.pending_spectra,
        }
    }

    /// Reactor identity; generates an id when none is configured.
    pub fn identity(&self) -> ReactorIdentity {
        match &self.reactor.uuid {
            Some(uuid) => ReactorIdentity::new(uuid.clone(), self.reactor.ip_address.clone()),
            None => ReactorIdentity::generate(self.reactor.ip_address.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ReactorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flow_settings(), FlowSettings::default());
    }

    #[test]
    fn test_load_from_file() {
        let file = toml_file(
            r#"
            [application]
            name = "Bench reactor"
            log_level = "debug"

            [reactor]
            uuid = "reactor-7"
            ip_address = "192.168.1.1"
            pending_spectra = "reject"

            [timing]
            pre_measurement = "5s"
            temperature_max_wait = "10m"
            "#,
        );

        let config = ReactorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Bench reactor");
        assert_eq!(config.reactor.pending_spectra, PendingSpectraPolicy::Reject);
        assert_eq!(config.timing.pre_measurement, Duration::from_secs(5));
        assert_eq!(
            config.timing.temperature_max_wait,
            Some(Duration::from_secs(600))
        );
        // Untouched fields keep their defaults.
        assert_eq!(config.timing.pump_settle, Duration::from_secs(2));
        assert_eq!(config.identity().uuid, "reactor-7");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unbounded_temperature_wait() {
        let file = toml_file(
            r#"
            [timing]
            temperature_max_wait = "forever"
            "#,
        );

        let config = ReactorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.timing.temperature_max_wait, None);
        assert_eq!(config.flow_settings().timing.temperature_max_wait, None);

        let rendered = toml::to_string(&config).unwrap();
        assert!(rendered.contains(r#"temperature_max_wait = "forever""#));
    }

    #[test]
    fn test_omitted_temperature_wait_keeps_one_hour_bound() {
        let file = toml_file(
            r#"
            [timing]
            pre_measurement = "5s"
            "#,
        );
        let config = ReactorConfig::load_from(file.path()).unwrap();
        assert_eq!(
            config.timing.temperature_max_wait,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_malformed_temperature_wait_rejected() {
        let file = toml_file(
            r#"
            [timing]
            temperature_max_wait = "soon"
            "#,
        );
        assert!(ReactorConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = ReactorConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.reactor.light_source_1_pin, 18);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ReactorConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_light_pin_rejected() {
        let mut config = ReactorConfig::default();
        config.reactor.light_source_2_pin = config.reactor.light_source_1_pin;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_without_dark_rejected() {
        let mut config = ReactorConfig::default();
        config.calibration.blank_file = Some(PathBuf::from("blank.csv"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_identity_is_unique() {
        let config = ReactorConfig::default();
        assert_ne!(config.identity().uuid, config.identity().uuid);
    }
}
