//! Mock Hardware Implementations
//!
//! Simulated reactor devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockPump` - Syringe pump remembering rate, direction and run state
//! - `MockTemperatureController` - Heater that either tracks its set point
//!   instantly or holds a manually driven temperature
//! - `MockStage` - Linear stage with optional travel time and unreachable positions
//! - `MockSpectrometer` - Absorbance spectrometer with a simulated sample peak
//! - `MockGpio` - Digital outputs recording every write
//!
//! Every mock carries a [`FaultSwitch`] so tests can make it fail on demand.
//! [`MockDevices`] bundles one of each and hands out [`ReactorDevices`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{
    AbsorbanceSettings, FlowRate, Gpio, PinLevel, Pump, PumpDirection, PumpInfo, Spectrometer,
    Spectrum, Stage, TemperatureController, TemperatureReading,
};
use crate::hardware::locks::ReactorDevices;
use crate::spectrum::compute_absorbance;

// =============================================================================
// Fault injection
// =============================================================================

/// On/off failure injection shared by all mocks.
#[derive(Debug, Default)]
pub struct FaultSwitch {
    failing: AtomicBool,
}

impl FaultSwitch {
    /// Make subsequent operations fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, device: &str, operation: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("{device}: simulated {operation} failure");
        }
        Ok(())
    }
}

// =============================================================================
// MockPump
// =============================================================================

#[derive(Debug, Default)]
struct PumpState {
    rate: Option<FlowRate>,
    direction: PumpDirection,
    running: bool,
}

/// Mock syringe pump.
///
/// # Example
///
/// ```rust,ignore
/// let pump = MockPump::new("1");
/// pump.set_rate(FlowRate::microliters_per_minute(6.25), PumpDirection::Infuse).await?;
/// pump.run().await?;
/// assert!(pump.is_running().await);
/// ```
pub struct MockPump {
    address: String,
    state: RwLock<PumpState>,
    runs: AtomicUsize,
    faults: FaultSwitch,
}

impl MockPump {
    /// Pump at bus `address`, stopped, no rate set.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: RwLock::new(PumpState::default()),
            runs: AtomicUsize::new(0),
            faults: FaultSwitch::default(),
        }
    }

    /// Last rate set.
    pub async fn rate(&self) -> Option<FlowRate> {
        self.state.read().await.rate
    }

    /// Last direction set.
    pub async fn direction(&self) -> PumpDirection {
        self.state.read().await.direction
    }

    /// Whether the pump is running.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    /// How many times `run` was called.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Failure injection.
    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

#[async_trait]
impl Pump for MockPump {
    async fn get_info(&self) -> Result<PumpInfo> {
        self.faults.check("MockPump", "get_info")?;
        let state = self.state.read().await;
        Ok(PumpInfo {
            rate: state.rate,
            model: "Chemyx".to_string(),
            address: self.address.clone(),
            diameter: None,
        })
    }

    async fn set_rate(&self, rate: FlowRate, direction: PumpDirection) -> Result<()> {
        self.faults.check("MockPump", "set_rate")?;
        let mut state = self.state.write().await;
        state.rate = Some(rate);
        state.direction = direction;
        debug!(address = %self.address, rate = rate.value, unit = ?rate.unit, "MockPump: rate set");
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.faults.check("MockPump", "run")?;
        self.state.write().await.running = true;
        self.runs.fetch_add(1, Ordering::SeqCst);
        debug!(address = %self.address, "MockPump: running");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.faults.check("MockPump", "stop")?;
        self.state.write().await.running = false;
        debug!(address = %self.address, "MockPump: stopped");
        Ok(())
    }
}

// =============================================================================
// MockTemperatureController
// =============================================================================

/// Mock heater.
///
/// In tracking mode (the default) the measured temperature jumps to every new
/// set point. [`MockTemperatureController::holding`] builds one whose
/// temperature only changes through [`MockTemperatureController::set_current`],
/// for exercising stabilization waits.
pub struct MockTemperatureController {
    reading: RwLock<TemperatureReading>,
    tracking: bool,
    history: Mutex<Vec<f64>>,
    faults: FaultSwitch,
}

impl MockTemperatureController {
    /// Controller at `ambient` °C that reaches every set point instantly.
    pub fn new(ambient: f64) -> Self {
        Self::build(ambient, true)
    }

    /// Controller at `current` °C that never heats on its own.
    pub fn holding(current: f64) -> Self {
        Self::build(current, false)
    }

    fn build(current: f64, tracking: bool) -> Self {
        Self {
            reading: RwLock::new(TemperatureReading {
                temp_set_point: current,
                current_temp: current,
            }),
            tracking,
            history: Mutex::new(Vec::new()),
            faults: FaultSwitch::default(),
        }
    }

    /// Force the measured temperature.
    pub async fn set_current(&self, value: f64) {
        self.reading.write().await.current_temp = value;
    }

    /// Every set point commanded so far, in order.
    pub fn set_point_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }

    /// Failure injection.
    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

#[async_trait]
impl TemperatureController for MockTemperatureController {
    async fn get_current_temperature(&self) -> Result<TemperatureReading> {
        self.faults.check("MockTemperatureController", "read")?;
        Ok(*self.reading.read().await)
    }

    async fn set_temperature(&self, value: f64) -> Result<()> {
        self.faults.check("MockTemperatureController", "set")?;
        let mut reading = self.reading.write().await;
        reading.temp_set_point = value;
        if self.tracking {
            reading.current_temp = value;
        }
        self.history.lock().push(value);
        debug!(set_point = value, "MockTemperatureController: set point changed");
        Ok(())
    }
}

// =============================================================================
// MockStage
// =============================================================================

/// Mock viewing stage.
///
/// Moves complete after `travel_time` (zero by default). Positions registered
/// with [`MockStage::make_unreachable`] fail to move.
pub struct MockStage {
    position: RwLock<f64>,
    travel_time: Duration,
    moves: Mutex<Vec<f64>>,
    unreachable: Mutex<Vec<f64>>,
    homes: AtomicUsize,
    stops: AtomicUsize,
    faults: FaultSwitch,
}

impl MockStage {
    /// Stage at 0.0 with instant moves.
    pub fn new() -> Self {
        Self::with_travel_time(Duration::ZERO)
    }

    /// Stage at 0.0 where every move takes `travel_time`.
    pub fn with_travel_time(travel_time: Duration) -> Self {
        Self {
            position: RwLock::new(0.0),
            travel_time,
            moves: Mutex::new(Vec::new()),
            unreachable: Mutex::new(Vec::new()),
            homes: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            faults: FaultSwitch::default(),
        }
    }

    /// Reject moves to `position`.
    pub fn make_unreachable(&self, position: f64) {
        self.unreachable.lock().push(position);
    }

    /// Every completed absolute move, in order.
    pub fn moves(&self) -> Vec<f64> {
        self.moves.lock().clone()
    }

    /// How many times the stage was homed.
    pub fn home_count(&self) -> usize {
        self.homes.load(Ordering::SeqCst)
    }

    /// How many times motion was stopped.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Failure injection.
    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn home(&self) -> Result<()> {
        self.faults.check("MockStage", "home")?;
        sleep(self.travel_time).await;
        *self.position.write().await = 0.0;
        self.homes.fetch_add(1, Ordering::SeqCst);
        debug!("MockStage: homed");
        Ok(())
    }

    async fn move_abs(&self, target: f64) -> Result<()> {
        self.faults.check("MockStage", "move")?;
        if self.unreachable.lock().contains(&target) {
            return Err(anyhow!("MockStage: position {target} is unreachable"));
        }
        sleep(self.travel_time).await;
        *self.position.write().await = target;
        self.moves.lock().push(target);
        debug!(position = target, "MockStage: reached position");
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockSpectrometer
// =============================================================================

/// Number of detector pixels simulated.
const MOCK_PIXELS: usize = 1024;

/// Mock absorbance spectrometer.
///
/// Simulates a 200-1000 nm detector looking at a sample with a single
/// absorbance band at 520 nm. [`MockSpectrometer::new`] starts with a blank
/// and dark already stored; [`MockSpectrometer::uncalibrated`] starts without.
pub struct MockSpectrometer {
    wavelengths: Vec<f64>,
    blank: Mutex<Option<Spectrum>>,
    dark: Mutex<Option<Spectrum>>,
    open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    last_settings: Mutex<Option<AbsorbanceSettings>>,
    faults: FaultSwitch,
}

impl MockSpectrometer {
    /// Spectrometer with simulated blank and dark references stored.
    pub fn new() -> Self {
        let spectrometer = Self::uncalibrated();
        *spectrometer.blank.lock() = Some(spectrometer.lamp_spectrum());
        *spectrometer.dark.lock() = Some(Spectrum {
            wavelengths: spectrometer.wavelengths.clone(),
            values: vec![DARK_COUNTS; MOCK_PIXELS],
        });
        spectrometer
    }

    /// Spectrometer without references; absorbance reads fail until both are stored.
    pub fn uncalibrated() -> Self {
        let step = 800.0 / (MOCK_PIXELS - 1) as f64;
        Self {
            wavelengths: (0..MOCK_PIXELS).map(|i| 200.0 + i as f64 * step).collect(),
            blank: Mutex::new(None),
            dark: Mutex::new(None),
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            last_settings: Mutex::new(None),
            faults: FaultSwitch::default(),
        }
    }

    fn lamp_spectrum(&self) -> Spectrum {
        Spectrum {
            wavelengths: self.wavelengths.clone(),
            values: vec![LAMP_COUNTS + DARK_COUNTS; MOCK_PIXELS],
        }
    }

    fn sample_intensities(&self) -> Vec<f64> {
        self.wavelengths
            .iter()
            .map(|&nm| {
                let band = 0.8 * (-((nm - 520.0) / 40.0).powi(2)).exp();
                DARK_COUNTS + LAMP_COUNTS * 10f64.powf(-band)
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            bail!("MockSpectrometer: device not open");
        }
        Ok(())
    }

    /// Whether a session currently holds the device open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of `open` calls.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Settings of the most recent absorbance read.
    pub fn last_settings(&self) -> Option<AbsorbanceSettings> {
        *self.last_settings.lock()
    }

    /// Stored blank, if any.
    pub fn blank(&self) -> Option<Spectrum> {
        self.blank.lock().clone()
    }

    /// Stored dark, if any.
    pub fn dark(&self) -> Option<Spectrum> {
        self.dark.lock().clone()
    }

    /// Failure injection for reads.
    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

const DARK_COUNTS: f64 = 100.0;
const LAMP_COUNTS: f64 = 40_000.0;

impl Default for MockSpectrometer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn raw_read(&self, integration_time_us: u32) -> Result<Spectrum> {
        self.ensure_open()?;
        self.faults.check("MockSpectrometer", "raw read")?;
        debug!(integration_time_us, "MockSpectrometer: raw read");
        Ok(Spectrum {
            wavelengths: self.wavelengths.clone(),
            values: self.sample_intensities(),
        })
    }

    async fn absorbance_read(&self, settings: AbsorbanceSettings) -> Result<Spectrum> {
        self.ensure_open()?;
        self.faults.check("MockSpectrometer", "absorbance read")?;
        *self.last_settings.lock() = Some(settings);

        let blank = self
            .blank
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("MockSpectrometer: no blank stored"))?;
        let dark = self
            .dark
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("MockSpectrometer: no dark stored"))?;

        let scans = vec![self.sample_intensities(); settings.scans_to_average.max(1) as usize];
        let spectrum = compute_absorbance(
            &blank,
            &dark,
            &scans,
            settings.cutoff,
            settings.normalized,
        )?;
        Ok(spectrum)
    }

    async fn store_blank(&self, blank: Spectrum) -> Result<()> {
        self.ensure_open()?;
        *self.blank.lock() = Some(blank);
        Ok(())
    }

    async fn store_dark(&self, dark: Spectrum) -> Result<()> {
        self.ensure_open()?;
        *self.dark.lock() = Some(dark);
        Ok(())
    }
}

// =============================================================================
// MockGpio
// =============================================================================

/// Mock GPIO bank recording every write.
#[derive(Default)]
pub struct MockGpio {
    levels: Mutex<HashMap<u8, PinLevel>>,
    writes: Mutex<Vec<(u8, PinLevel)>>,
    faults: FaultSwitch,
}

impl MockGpio {
    /// All pins undriven.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level of `pin`, if it was ever driven.
    pub fn level(&self, pin: u8) -> Option<PinLevel> {
        self.levels.lock().get(&pin).copied()
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<(u8, PinLevel)> {
        self.writes.lock().clone()
    }

    /// Failure injection.
    pub fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

#[async_trait]
impl Gpio for MockGpio {
    async fn output(&self, pin: u8, level: PinLevel) -> Result<()> {
        self.faults.check("MockGpio", "output")?;
        self.levels.lock().insert(pin, level);
        self.writes.lock().push((pin, level));
        Ok(())
    }
}

// =============================================================================
// MockDevices
// =============================================================================

/// One of every mock, kept as concrete types for inspection.
#[derive(Clone)]
pub struct MockDevices {
    /// Precursor pump (address "1").
    pub pump_1: Arc<MockPump>,
    /// Second liquid pump (address "2").
    pub pump_2: Arc<MockPump>,
    /// Gas pump (address "3").
    pub gas: Arc<MockPump>,
    /// Viewing stage.
    pub stage: Arc<MockStage>,
    /// Spectrometer.
    pub spectrometer: Arc<MockSpectrometer>,
    /// Temperature controller at 25 °C, tracking.
    pub temperature_controller: Arc<MockTemperatureController>,
    /// GPIO bank.
    pub gpio: Arc<MockGpio>,
}

impl MockDevices {
    /// Default mock set.
    pub fn new() -> Self {
        Self::with_temperature_controller(MockTemperatureController::new(25.0))
    }

    /// Mock set using a specific temperature controller.
    pub fn with_temperature_controller(controller: MockTemperatureController) -> Self {
        Self {
            pump_1: Arc::new(MockPump::new("1")),
            pump_2: Arc::new(MockPump::new("2")),
            gas: Arc::new(MockPump::new("3")),
            stage: Arc::new(MockStage::new()),
            spectrometer: Arc::new(MockSpectrometer::new()),
            temperature_controller: Arc::new(controller),
            gpio: Arc::new(MockGpio::new()),
        }
    }

    /// Trait-object handles sharing these mocks.
    pub fn devices(&self) -> ReactorDevices {
        ReactorDevices {
            pump_1: self.pump_1.clone(),
            pump_2: self.pump_2.clone(),
            gas: self.gas.clone(),
            stage: self.stage.clone(),
            spectrometer: self.spectrometer.clone(),
            temperature_controller: self.temperature_controller.clone(),
            gpio: self.gpio.clone(),
        }
    }
}

impl Default for MockDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::DEFAULT_SPECTRAL_CUTOFF;

    #[tokio::test]
    async fn pump_reports_rate_in_info() {
        let pump = MockPump::new("1");
        pump.set_rate(FlowRate::microliters_per_minute(120.1), PumpDirection::Infuse)
            .await
            .unwrap();
        let info = pump.get_info().await.unwrap();
        assert_eq!(info.rate.map(|r| r.value), Some(120.1));
        assert_eq!(info.model, "Chemyx");
        assert_eq!(info.address, "1");
    }

    #[tokio::test]
    async fn failing_pump_rejects_commands() {
        let pump = MockPump::new("1");
        pump.faults().set_failing(true);
        assert!(pump.run().await.is_err());
        assert!(!pump.is_running().await);
        pump.faults().set_failing(false);
        pump.run().await.unwrap();
        assert!(pump.is_running().await);
    }

    #[tokio::test]
    async fn holding_controller_ignores_set_point() {
        let controller = MockTemperatureController::holding(25.0);
        controller.set_temperature(90.0).await.unwrap();
        let reading = controller.get_current_temperature().await.unwrap();
        assert_eq!(reading.temp_set_point, 90.0);
        assert_eq!(reading.current_temp, 25.0);
        assert_eq!(controller.set_point_history(), vec![90.0]);
    }

    #[tokio::test]
    async fn stage_rejects_unreachable_positions() {
        let stage = MockStage::new();
        stage.make_unreachable(4.0);
        assert!(stage.move_abs(4.0).await.is_err());
        stage.move_abs(2.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 2.0);
        assert_eq!(stage.moves(), vec![2.0]);
    }

    #[tokio::test]
    async fn spectrometer_requires_open_device() {
        let spectrometer = MockSpectrometer::new();
        assert!(spectrometer.raw_read(1000).await.is_err());
    }

    #[tokio::test]
    async fn absorbance_peaks_near_band_center() {
        let spectrometer = MockSpectrometer::new();
        spectrometer.open().unwrap();
        let spectrum = spectrometer
            .absorbance_read(AbsorbanceSettings {
                integration_time_us: 3000,
                scans_to_average: 10,
                cutoff: DEFAULT_SPECTRAL_CUTOFF,
                normalized: false,
            })
            .await
            .unwrap();
        spectrometer.close();

        assert_eq!(spectrum.len(), MOCK_PIXELS - DEFAULT_SPECTRAL_CUTOFF);
        let (peak_index, _) = spectrum
            .values
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        assert!((spectrum.wavelengths[peak_index] - 520.0).abs() < 2.0);
    }

    #[tokio::test]
    async fn uncalibrated_spectrometer_cannot_read_absorbance() {
        let spectrometer = MockSpectrometer::uncalibrated();
        spectrometer.open().unwrap();
        let settings = AbsorbanceSettings {
            integration_time_us: 1000,
            scans_to_average: 1,
            cutoff: 0,
            normalized: false,
        };
        assert!(spectrometer.absorbance_read(settings).await.is_err());
    }
}
