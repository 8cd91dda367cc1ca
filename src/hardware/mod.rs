//! Reactor hardware: capability traits, per-device locking and simulated devices.

pub mod capabilities;
pub mod light_source;
pub mod locks;
pub mod mock;

pub use capabilities::{
    AbsorbanceSettings, FlowRate, Gpio, PinLevel, Pump, PumpDirection, PumpInfo, RateUnit,
    Spectrometer, Spectrum, Stage, TemperatureController, TemperatureReading,
};
pub use light_source::{LightSourcePins, LightSourceState};
pub use locks::{DeviceLockRegistry, PumpRole, ReactorDevices, SpectrometerSession};
