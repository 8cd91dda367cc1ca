//! Custom error types for the reactor.
//!
//! `ReactorError` is the error type for the whole crate API. Device capability
//! traits speak `anyhow::Result` (drivers wrap whatever their transport
//! produces); those errors enter the crate through [`ReactorError::Device`],
//! which keeps the name of the logical device that failed.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: malformed instructions, missing stage positions, bad
//!   calibration files. Raised before any run state changes.
//! - **`RunActive`**: a configuration change was attempted while a run holds
//!   the reactor.
//! - **`Device`**: a device operation failed. Inside a step these are logged
//!   and tolerated; they only surface from direct device calls.
//! - **`Timeout`**: a bounded wait (temperature stabilization) expired.
//! - **`NotImplemented`**: a reserved extension point was invoked.
//! - **`Io` / `Csv` / `Json` / `Config`**: ambient failures, converted with `?`.
//!
//! A rejected instruction (for example while a procedure is running) is not an
//! error; see [`CommandAck`](crate::run_state::CommandAck).

use thiserror::Error;

/// Convenience alias for results using the reactor error type.
pub type AppResult<T> = std::result::Result<T, ReactorError>;

/// Errors produced by the reactor engine.
#[derive(Error, Debug)]
pub enum ReactorError {
    /// Malformed input; no state was changed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation is not allowed while a run is active.
    #[error("Operation not allowed while a run is active")]
    RunActive,

    /// A device operation failed.
    #[error("Device '{device}' error: {source}")]
    Device {
        /// Logical device name (e.g. `pump_1`, `stage`).
        device: &'static str,
        /// Underlying driver error.
        #[source]
        source: anyhow::Error,
    },

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A reserved operation that has no implementation.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// A background step ended without reporting a result.
    #[error("Step task ended without reporting a result")]
    StepAborted,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl ReactorError {
    /// Wrap a driver error with the logical device name.
    pub fn device(device: &'static str, source: anyhow::Error) -> Self {
        Self::Device { device, source }
    }

    /// Whether the failure came from hardware rather than caller input.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::Device { .. })
    }
}

impl From<figment::Error> for ReactorError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_names_the_device() {
        let err = ReactorError::device("pump_1", anyhow::anyhow!("port closed"));
        assert!(err.is_device_error());
        assert_eq!(err.to_string(), "Device 'pump_1' error: port closed");
    }

    #[test]
    fn not_implemented_is_distinct() {
        let err = ReactorError::NotImplemented("fluorescence read");
        assert!(!err.is_device_error());
        assert!(matches!(err, ReactorError::NotImplemented(_)));
        assert_eq!(err.to_string(), "Not implemented: fluorescence read");
    }
}
