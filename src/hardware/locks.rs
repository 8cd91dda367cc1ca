//! Per-device mutual exclusion.
//!
//! Every logical device sits inside its own `tokio::sync::Mutex`, so holding
//! the guard is the only way to reach the device. Locks are held for one
//! device operation at a time. The exception is [`DeviceLockRegistry::pumps`],
//! which takes all three pump locks so rates change together.
//!
//! # Lock Order
//!
//! `pump_1 < pump_2 < gas < stage`. Code that holds more than one device lock
//! must acquire them in this order.

use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::hardware::capabilities::{Gpio, Pump, Spectrometer, Stage, TemperatureController};

/// The three reactor pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpRole {
    /// Precursor liquid.
    Pump1,
    /// Second liquid.
    Pump2,
    /// Gas.
    Gas,
}

impl PumpRole {
    /// All pumps in lock order.
    pub const ALL: [PumpRole; 3] = [PumpRole::Pump1, PumpRole::Pump2, PumpRole::Gas];

    /// Logical device name, used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            PumpRole::Pump1 => "pump_1",
            PumpRole::Pump2 => "pump_2",
            PumpRole::Gas => "gas",
        }
    }
}

impl std::fmt::Display for PumpRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Device handles a reactor is built from.
#[derive(Clone)]
pub struct ReactorDevices {
    /// Precursor pump.
    pub pump_1: Arc<dyn Pump>,
    /// Second liquid pump.
    pub pump_2: Arc<dyn Pump>,
    /// Gas pump.
    pub gas: Arc<dyn Pump>,
    /// Viewing stage.
    pub stage: Arc<dyn Stage>,
    /// Absorbance spectrometer.
    pub spectrometer: Arc<dyn Spectrometer>,
    /// Coil temperature controller.
    pub temperature_controller: Arc<dyn TemperatureController>,
    /// GPIO bank driving the light sources.
    pub gpio: Arc<dyn Gpio>,
}

/// One named lock per logical device.
pub struct DeviceLockRegistry {
    pump_1: Mutex<Arc<dyn Pump>>,
    pump_2: Mutex<Arc<dyn Pump>>,
    gas: Mutex<Arc<dyn Pump>>,
    stage: Mutex<Arc<dyn Stage>>,
    spectrometer: Mutex<Arc<dyn Spectrometer>>,
    temperature_controller: Mutex<Arc<dyn TemperatureController>>,
    gpio: Mutex<Arc<dyn Gpio>>,
}

impl DeviceLockRegistry {
    /// Wrap each device in its lock.
    pub fn new(devices: ReactorDevices) -> Self {
        Self {
            pump_1: Mutex::new(devices.pump_1),
            pump_2: Mutex::new(devices.pump_2),
            gas: Mutex::new(devices.gas),
            stage: Mutex::new(devices.stage),
            spectrometer: Mutex::new(devices.spectrometer),
            temperature_controller: Mutex::new(devices.temperature_controller),
            gpio: Mutex::new(devices.gpio),
        }
    }

    fn pump_lock(&self, role: PumpRole) -> &Mutex<Arc<dyn Pump>> {
        match role {
            PumpRole::Pump1 => &self.pump_1,
            PumpRole::Pump2 => &self.pump_2,
            PumpRole::Gas => &self.gas,
        }
    }

    /// Lock a single pump.
    pub async fn pump(&self, role: PumpRole) -> MutexGuard<'_, Arc<dyn Pump>> {
        self.pump_lock(role).lock().await
    }

    /// Lock all three pumps in order.
    pub async fn pumps(&self) -> PumpGuards<'_> {
        let pump_1 = self.pump_1.lock().await;
        let pump_2 = self.pump_2.lock().await;
        let gas = self.gas.lock().await;
        PumpGuards {
            pump_1,
            pump_2,
            gas,
        }
    }

    /// Lock the stage.
    pub async fn stage(&self) -> MutexGuard<'_, Arc<dyn Stage>> {
        self.stage.lock().await
    }

    /// Lock the temperature controller.
    pub async fn temperature_controller(
        &self,
    ) -> MutexGuard<'_, Arc<dyn TemperatureController>> {
        self.temperature_controller.lock().await
    }

    /// Lock the GPIO bank.
    pub async fn gpio(&self) -> MutexGuard<'_, Arc<dyn Gpio>> {
        self.gpio.lock().await
    }

    /// Lock and open the spectrometer.
    ///
    /// The returned session closes the device when dropped, before the lock
    /// is released. If `open` fails the lock is released and nothing needs
    /// closing.
    pub async fn spectrometer(&self) -> Result<SpectrometerSession<'_>> {
        let guard = self.spectrometer.lock().await;
        guard.open()?;
        debug!("Spectrometer session opened");
        Ok(SpectrometerSession { device: guard })
    }
}

/// All three pump guards, held together.
pub struct PumpGuards<'a> {
    pump_1: MutexGuard<'a, Arc<dyn Pump>>,
    pump_2: MutexGuard<'a, Arc<dyn Pump>>,
    gas: MutexGuard<'a, Arc<dyn Pump>>,
}

impl PumpGuards<'_> {
    /// The pump for `role`.
    pub fn get(&self, role: PumpRole) -> &dyn Pump {
        match role {
            PumpRole::Pump1 => self.pump_1.as_ref(),
            PumpRole::Pump2 => self.pump_2.as_ref(),
            PumpRole::Gas => self.gas.as_ref(),
        }
    }
}

/// Exclusive, open spectrometer.
///
/// Derefs to the device. Dropping it closes the device and then releases the
/// spectrometer lock, on every exit path including early returns and panics.
pub struct SpectrometerSession<'a> {
    device: MutexGuard<'a, Arc<dyn Spectrometer>>,
}

impl Deref for SpectrometerSession<'_> {
    type Target = dyn Spectrometer;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl Drop for SpectrometerSession<'_> {
    fn drop(&mut self) {
        // Fields drop after this body, so the lock outlives the close.
        self.device.close();
        debug!("Spectrometer session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockDevices;
    use std::time::Duration;

    #[tokio::test]
    async fn session_closes_on_drop() {
        let mocks = MockDevices::new();
        let registry = DeviceLockRegistry::new(mocks.devices());

        {
            let session = registry.spectrometer().await.unwrap();
            assert!(mocks.spectrometer.is_open());
            session.raw_read(1000).await.unwrap();
        }

        assert!(!mocks.spectrometer.is_open());
        assert_eq!(mocks.spectrometer.open_count(), 1);
        assert_eq!(mocks.spectrometer.close_count(), 1);
    }

    #[tokio::test]
    async fn session_closes_when_read_fails() {
        let mocks = MockDevices::new();
        let registry = DeviceLockRegistry::new(mocks.devices());
        mocks.spectrometer.faults().set_failing(true);

        let result = async {
            let session = registry.spectrometer().await?;
            let read = session.raw_read(1000).await;
            read
        }
        .await;

        assert!(result.is_err());
        assert_eq!(mocks.spectrometer.open_count(), 1);
        assert_eq!(mocks.spectrometer.close_count(), 1);
    }

    #[tokio::test]
    async fn spectrometer_lock_is_exclusive() {
        let mocks = MockDevices::new();
        let registry = Arc::new(DeviceLockRegistry::new(mocks.devices()));

        let session = registry.spectrometer().await.unwrap();
        let contender = registry.clone();
        let waiter = tokio::spawn(async move {
            let _session = contender.spectrometer().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(session);
        waiter.await.unwrap();
        assert_eq!(mocks.spectrometer.open_count(), 2);
        assert_eq!(mocks.spectrometer.close_count(), 2);
    }

    #[test]
    fn pump_roles_have_stable_names() {
        let names: Vec<_> = PumpRole::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["pump_1", "pump_2", "gas"]);
    }
}
