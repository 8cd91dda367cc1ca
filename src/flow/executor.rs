//! Device work for the three-pump flow reactor.
//!
//! A single instruction sets temperature and pump rates, drives the stage to
//! one viewing port and takes one absorbance reading. A procedure step sets
//! rates, waits for the coil temperature and then sweeps every loaded stage
//! position, pushing one [`SpectrumRecord`] per position it reached.
//!
//! Device failures inside a step are logged and the step carries on; only an
//! expired temperature wait fails the step.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::{AppResult, ReactorError};
use crate::flow::rates::FlowRates;
use crate::flow::settings::{FlowSettings, PendingSpectraPolicy};
use crate::hardware::{
    AbsorbanceSettings, DeviceLockRegistry, FlowRate, LightSourceState, PumpDirection, PumpRole,
    ReactorDevices, Spectrum,
};
use crate::instruction::Step;
use crate::reactor::{Admission, StepExecutor};
use crate::run_state::{RunKind, StepContext};
use crate::settle::{self, WaitOutcome};
use crate::spectrum::{SpectrumBuffer, SpectrumRecord, DEFAULT_SPECTRAL_CUTOFF};

/// Refusal text when unread spectra block a new run.
pub const SPECTRA_REMAINING: &str = "The spectrum buffer has spectra remaining";

/// Settings last applied to the optics and stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    /// Light source outputs.
    pub light_sources: LightSourceState,
    /// Spectrometer integration time in µs.
    pub integration_time_us: u32,
    /// Spectrometer scans averaged per read.
    pub scans_to_average: u32,
    /// Last stage coordinate reached.
    pub stage_position: Option<f64>,
    /// Viewing port of that coordinate (1-based).
    pub viewing_port: Option<u32>,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            light_sources: LightSourceState::OFF,
            integration_time_us: 1000,
            scans_to_average: 10,
            stage_position: None,
            viewing_port: None,
        }
    }
}

/// Values read back from the devices for a status report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceReadback {
    /// Pump rates in pump order; `None` when the pump did not answer.
    pub pump_rates: [Option<f64>; 3],
    /// Temperature controller set point.
    pub temp_set_point: Option<f64>,
}

/// Map a 1-based viewing port onto the loaded stage positions.
///
/// Ports outside `1..=positions.len()` go to the largest position. Returns
/// the port actually used with its coordinate, or `None` with no positions.
pub fn resolve_viewing_port(positions: &[f64], port: u32) -> Option<(u32, f64)> {
    let requested = port
        .checked_sub(1)
        .and_then(|index| positions.get(index as usize))
        .copied();
    if let Some(position) = requested {
        return Some((port, position));
    }

    let (index, position) = positions
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
            Some((_, b)) if b >= p => best,
            _ => Some((i, p)),
        })?;
    warn!(
        requested = port,
        position, "Viewing port out of range, going to maximum position"
    );
    Some((index as u32 + 1, position))
}

fn tolerate(device: &'static str, action: &str, result: anyhow::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(device, action, error = %e, "Device operation failed, continuing");
            false
        }
    }
}

/// [`StepExecutor`] for the flow reactor.
pub struct FlowExecutor {
    devices: DeviceLockRegistry,
    settings: FlowSettings,
    stage_positions: RwLock<Vec<f64>>,
    spectra: SpectrumBuffer,
    live: Mutex<LiveSettings>,
}

impl FlowExecutor {
    /// Executor with no stage positions loaded.
    pub fn new(devices: ReactorDevices, settings: FlowSettings) -> Self {
        Self {
            devices: DeviceLockRegistry::new(devices),
            settings,
            stage_positions: RwLock::new(Vec::new()),
            spectra: SpectrumBuffer::new(),
            live: Mutex::new(LiveSettings::default()),
        }
    }

    /// Device locks.
    pub fn devices(&self) -> &DeviceLockRegistry {
        &self.devices
    }

    /// Reactor settings.
    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Measured spectra waiting to be collected.
    pub fn spectra(&self) -> &SpectrumBuffer {
        &self.spectra
    }

    /// Current optics and stage settings.
    pub fn live(&self) -> LiveSettings {
        *self.live.lock()
    }

    /// Loaded stage coordinates, one per viewing port.
    pub fn stage_positions(&self) -> Vec<f64> {
        self.stage_positions.read().clone()
    }

    pub(crate) fn replace_stage_positions(&self, positions: Vec<f64>) {
        info!(count = positions.len(), "Stage positions loaded");
        *self.stage_positions.write() = positions;
    }

    fn update_live(&self, f: impl FnOnce(&mut LiveSettings)) {
        f(&mut self.live.lock());
    }

    /// Query pumps and the temperature controller, each under its own lock.
    pub async fn read_devices(&self) -> DeviceReadback {
        let pump_rates = join_all(PumpRole::ALL.map(|role| async move {
            let pump = self.devices.pump(role).await;
            match pump.get_info().await {
                Ok(info) => info.rate.map(|rate| rate.value),
                Err(e) => {
                    warn!(device = role.name(), error = %e, "Pump did not report its rate");
                    None
                }
            }
        }))
        .await;

        let temp_set_point = {
            let controller = self.devices.temperature_controller().await;
            match controller.get_current_temperature().await {
                Ok(reading) => Some(reading.temp_set_point),
                Err(e) => {
                    warn!(device = "temperature_controller", error = %e, "Temperature read failed");
                    None
                }
            }
        };

        DeviceReadback {
            pump_rates: [pump_rates[0], pump_rates[1], pump_rates[2]],
            temp_set_point,
        }
    }

    async fn set_temperature(&self, value: f64) {
        let controller = self.devices.temperature_controller().await;
        tolerate(
            "temperature_controller",
            "set temperature",
            controller.set_temperature(value).await,
        );
    }

    async fn set_lights(&self, state: LightSourceState) {
        let gpio = self.devices.gpio().await;
        let applied = self.settings.light_pins.apply(gpio.as_ref(), state).await;
        if tolerate("gpio", "switch light sources", applied) {
            self.update_live(|live| live.light_sources = state);
        }
    }

    async fn home_stage(&self) {
        let stage = self.devices.stage().await;
        let homed = async {
            stage.home().await?;
            stage.wait_settled().await
        }
        .await;
        tolerate("stage", "home", homed);
    }

    async fn move_stage(&self, position: f64, stop_first: bool) -> bool {
        let stage = self.devices.stage().await;
        if stop_first {
            tolerate("stage", "stop", stage.stop().await);
        }
        let moved = async {
            stage.move_abs(position).await?;
            stage.wait_settled().await
        }
        .await;
        tolerate("stage", "move", moved)
    }

    async fn read_absorbance(&self, integration_time_us: u32, scans_to_average: u32) -> Option<Spectrum> {
        let settings = AbsorbanceSettings {
            integration_time_us,
            scans_to_average,
            cutoff: DEFAULT_SPECTRAL_CUTOFF,
            normalized: false,
        };
        let result = async {
            let session = self.devices.spectrometer().await?;
            let spectrum = session.absorbance_read(settings).await;
            spectrum
        }
        .await;
        match result {
            Ok(spectrum) => Some(spectrum),
            Err(e) => {
                warn!(device = "spectrometer", error = %e, "Absorbance read failed");
                None
            }
        }
    }

    async fn wait_for_temperature(&self, set_point: f64) -> WaitOutcome {
        let timing = self.settings.timing;
        let tolerance = timing.temperature_tolerance_c;
        info!(set_point, tolerance, "Waiting for coil temperature");
        settle::poll_until(
            timing.temperature_poll_interval,
            timing.temperature_max_wait,
            move || async move {
                let controller = self.devices.temperature_controller().await;
                match controller.get_current_temperature().await {
                    Ok(reading) => {
                        debug!(current = reading.current_temp, set_point, "Coil temperature");
                        (reading.current_temp - set_point).abs() <= tolerance
                    }
                    Err(e) => {
                        warn!(device = "temperature_controller", error = %e, "Temperature read failed");
                        false
                    }
                }
            },
        )
        .await
    }

    async fn run_single_instruction(&self, context: &StepContext, step: &Step) -> AppResult<()> {
        let rates = FlowRates::for_single_instruction(step);
        info!(
            pump_1 = rates.pump_1,
            pump_2 = rates.pump_2,
            gas = rates.gas,
            temperature = step.temp_set_point,
            "Applying single instruction"
        );
        self.set_temperature(step.temp_set_point).await;

        for role in PumpRole::ALL {
            let pump = self.devices.pump(role).await;
            let rate = FlowRate::microliters_per_minute(rates.for_pump(role));
            tolerate(role.name(), "set rate", pump.set_rate(rate, PumpDirection::Infuse).await);
        }
        settle::pause("pump rates", self.settings.timing.pump_settle).await;
        for role in PumpRole::ALL {
            let pump = self.devices.pump(role).await;
            tolerate(role.name(), "run", pump.run().await);
        }

        let positions = self.stage_positions();
        let (port, position) = resolve_viewing_port(&positions, step.viewing_port)
            .ok_or_else(|| ReactorError::Validation("no stage positions loaded".into()))?;
        if self.move_stage(position, true).await {
            self.update_live(|live| {
                live.stage_position = Some(position);
                live.viewing_port = Some(port);
            });
        }

        self.set_lights(LightSourceState::new(
            step.light_source_1_on,
            step.light_source_2_on,
        ))
        .await;
        self.update_live(|live| {
            live.integration_time_us = step.integration_time;
            live.scans_to_average = step.scans_to_average;
        });

        // A single instruction always measures.
        let absorbance = self
            .read_absorbance(step.integration_time, step.scans_to_average)
            .await;
        self.spectra.push(SpectrumRecord::new(
            context.run_id.clone(),
            context.step,
            position,
            absorbance,
        ));
        Ok(())
    }

    async fn run_procedure_step(&self, context: &StepContext, step: &Step) -> AppResult<()> {
        let rates = FlowRates::for_procedure_step(step);
        info!(
            step = context.step,
            pump_1 = rates.pump_1,
            pump_2 = rates.pump_2,
            gas = rates.gas,
            temperature = step.temp_set_point,
            "Applying procedure step"
        );
        self.set_temperature(step.temp_set_point).await;

        {
            let pumps = self.devices.pumps().await;
            for role in PumpRole::ALL {
                let rate = FlowRate::microliters_per_minute(rates.for_pump(role));
                tolerate(
                    role.name(),
                    "set rate",
                    pumps.get(role).set_rate(rate, PumpDirection::Infuse).await,
                );
            }
            if context.is_first_step() {
                for role in PumpRole::ALL {
                    tolerate(role.name(), "run", pumps.get(role).run().await);
                }
            }
        }

        self.home_stage().await;
        settle::pause("pre-measurement", self.settings.timing.pre_measurement).await;

        if !self.wait_for_temperature(step.temp_set_point).await.is_settled() {
            return Err(ReactorError::Timeout(format!(
                "coil did not reach {:.1} °C (step {})",
                step.temp_set_point, context.step
            )));
        }

        let positions = self.stage_positions();
        for (index, &position) in positions.iter().enumerate() {
            if !self.move_stage(position, false).await {
                warn!(position, "Skipping unreachable stage position");
                continue;
            }
            self.update_live(|live| {
                live.stage_position = Some(position);
                live.viewing_port = Some(index as u32 + 1);
            });

            let absorbance = if step.absorbance {
                self.set_lights(LightSourceState::ABSORBANCE).await;
                self.update_live(|live| {
                    live.integration_time_us = step.integration_time;
                    live.scans_to_average = step.scans_to_average;
                });
                self.read_absorbance(step.integration_time, step.scans_to_average)
                    .await
            } else {
                None
            };
            if step.fluorescence {
                warn!(position, "Fluorescence measurement not implemented, skipping");
            }
            self.set_lights(LightSourceState::OFF).await;

            self.spectra.push(SpectrumRecord::new(
                context.run_id.clone(),
                context.step,
                position,
                absorbance,
            ));
        }
        Ok(())
    }

    /// Stop the pumps, return to ambient temperature, home the stage and
    /// switch the lights off. Every action is attempted.
    pub async fn shutdown_devices(&self) {
        for role in PumpRole::ALL {
            let pump = self.devices.pump(role).await;
            tolerate(role.name(), "stop", pump.stop().await);
        }
        self.set_temperature(self.settings.timing.ambient_temperature_c)
            .await;
        self.home_stage().await;
        self.set_lights(LightSourceState::OFF).await;
    }

    /// Run the two liquid pumps at `rate`.
    pub(crate) async fn start_flush(&self, rate: FlowRate) -> AppResult<()> {
        for role in [PumpRole::Pump1, PumpRole::Pump2] {
            let pump = self.devices.pump(role).await;
            pump.set_rate(rate, PumpDirection::Infuse)
                .await
                .map_err(|e| ReactorError::device(role.name(), e))?;
            pump.run()
                .await
                .map_err(|e| ReactorError::device(role.name(), e))?;
        }
        Ok(())
    }

    pub(crate) async fn stop_flush(&self) {
        for role in [PumpRole::Pump1, PumpRole::Pump2] {
            let pump = self.devices.pump(role).await;
            tolerate(role.name(), "stop", pump.stop().await);
        }
    }

    /// Move to a viewing port outside a run.
    pub(crate) async fn go_to_port(&self, port: u32) -> Option<f64> {
        let positions = self.stage_positions();
        let Some((port, position)) = resolve_viewing_port(&positions, port) else {
            warn!("No stage positions loaded, stage not moved");
            return None;
        };
        if !self.move_stage(position, true).await {
            return None;
        }
        self.update_live(|live| {
            live.stage_position = Some(position);
            live.viewing_port = Some(port);
        });
        Some(position)
    }
}

#[async_trait]
impl StepExecutor for FlowExecutor {
    #[instrument(skip_all, fields(kind = ?context.kind, step = context.step))]
    async fn execute(&self, context: &StepContext, step: &Step) -> AppResult<()> {
        match context.kind {
            RunKind::SingleInstruction => self.run_single_instruction(context, step).await,
            RunKind::Procedure => self.run_procedure_step(context, step).await,
        }
    }

    fn preflight(&self) -> AppResult<()> {
        if self.stage_positions.read().is_empty() {
            return Err(ReactorError::Validation(
                "stage positions not loaded".into(),
            ));
        }
        Ok(())
    }

    fn admit(&self, discard_pending: bool) -> Admission {
        if self.spectra.is_empty() {
            return Admission::Accept;
        }
        match self.settings.pending_spectra {
            _ if discard_pending => Admission::AcceptDiscardingPending,
            PendingSpectraPolicy::Keep => Admission::Accept,
            PendingSpectraPolicy::Discard => Admission::AcceptDiscardingPending,
            PendingSpectraPolicy::Reject => Admission::Reject(SPECTRA_REMAINING.to_string()),
        }
    }

    fn discard_pending(&self) {
        let dropped = self.spectra.clear();
        if dropped > 0 {
            info!(dropped, "Discarded unread spectra");
        }
    }

    async fn on_stop(&self) {
        info!("Returning devices to rest");
        self.shutdown_devices().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockDevices;
    use crate::instruction::Step;
    use tracing_test::traced_test;

    fn executor(mocks: &MockDevices) -> FlowExecutor {
        let executor = FlowExecutor::new(mocks.devices(), FlowSettings::immediate());
        executor.replace_stage_positions(vec![10.0, 20.0, 30.0]);
        executor
    }

    fn procedure_context(step: u32) -> StepContext {
        StepContext {
            kind: RunKind::Procedure,
            run_id: Some("run-1".into()),
            step,
            total_steps: 2,
        }
    }

    #[test]
    fn viewing_port_maps_to_position() {
        let positions = [10.0, 20.0, 30.0];
        assert_eq!(resolve_viewing_port(&positions, 2), Some((2, 20.0)));
        assert_eq!(resolve_viewing_port(&positions, 9), Some((3, 30.0)));
        assert_eq!(resolve_viewing_port(&positions, 0), Some((3, 30.0)));
        assert_eq!(resolve_viewing_port(&[], 1), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn out_of_range_port_picks_largest_position() {
        assert_eq!(resolve_viewing_port(&[5.0, 40.0, 12.0], 7), Some((2, 40.0)));
        assert!(logs_contain("going to maximum position"));
    }

    #[tokio::test]
    async fn procedure_step_measures_every_position() {
        let mocks = MockDevices::new();
        let executor = executor(&mocks);
        let step = Step {
            temp_set_point: 25.0,
            ..Step::default()
        };

        executor.execute(&procedure_context(1), &step).await.unwrap();

        assert_eq!(executor.spectra().len(), 3);
        assert_eq!(mocks.stage.moves(), vec![10.0, 20.0, 30.0]);
        assert!(mocks.pump_1.is_running().await);
        let live = executor.live();
        assert_eq!(live.viewing_port, Some(3));
        assert_eq!(live.light_sources, LightSourceState::OFF);
        assert_eq!(mocks.spectrometer.close_count(), 3);
    }

    #[tokio::test]
    async fn single_instruction_always_reads_absorbance() {
        let mocks = MockDevices::new();
        let executor = executor(&mocks);
        let context = StepContext {
            kind: RunKind::SingleInstruction,
            run_id: None,
            step: 0,
            total_steps: 1,
        };
        let step = Step {
            absorbance: false,
            viewing_port: 2,
            ..Step::default()
        };

        executor.execute(&context, &step).await.unwrap();

        let record = executor.spectra().try_pop().unwrap();
        assert!(record.absorbance.is_some());
        assert_eq!(record.stage_position, 20.0);
        assert_eq!(mocks.spectrometer.open_count(), 1);
    }

    #[tokio::test]
    async fn pumps_start_only_on_first_step() {
        let mocks = MockDevices::new();
        let executor = executor(&mocks);
        let step = Step {
            absorbance: false,
            ..Step::default()
        };

        executor.execute(&procedure_context(2), &step).await.unwrap();
        assert_eq!(mocks.pump_1.run_count(), 0);
        executor.execute(&procedure_context(1), &step).await.unwrap();
        assert_eq!(mocks.pump_1.run_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_position_is_skipped() {
        let mocks = MockDevices::new();
        mocks.stage.make_unreachable(20.0);
        let executor = executor(&mocks);

        executor
            .execute(&procedure_context(1), &Step::default())
            .await
            .unwrap();

        let positions: Vec<f64> = std::iter::from_fn(|| executor.spectra().try_pop())
            .map(|record| record.stage_position)
            .collect();
        assert_eq!(positions, vec![10.0, 30.0]);
    }

    #[tokio::test]
    async fn failed_read_still_records_position() {
        let mocks = MockDevices::new();
        mocks.spectrometer.faults().set_failing(true);
        let executor = executor(&mocks);

        executor
            .execute(&procedure_context(1), &Step::default())
            .await
            .unwrap();

        let record = executor.spectra().try_pop().unwrap();
        assert_eq!(record.absorbance, None);
        assert_eq!(mocks.spectrometer.open_count(), mocks.spectrometer.close_count());
    }

    #[tokio::test]
    async fn temperature_that_never_settles_times_out() {
        let mocks = MockDevices::new();
        let executor = executor(&mocks);
        mocks.temperature_controller.faults().set_failing(true);

        let result = executor
            .execute(&procedure_context(1), &Step::default())
            .await;

        assert!(matches!(result, Err(ReactorError::Timeout(_))));
        assert!(executor.spectra().is_empty());
    }

    #[tokio::test]
    async fn reject_policy_refuses_until_discard_allowed() {
        let mocks = MockDevices::new();
        let settings = FlowSettings {
            pending_spectra: PendingSpectraPolicy::Reject,
            ..FlowSettings::immediate()
        };
        let executor = FlowExecutor::new(mocks.devices(), settings);
        executor
            .spectra()
            .push(SpectrumRecord::new(None, 1, 10.0, None));

        assert_eq!(
            executor.admit(false),
            Admission::Reject(SPECTRA_REMAINING.to_string())
        );
        assert_eq!(executor.admit(true), Admission::AcceptDiscardingPending);
        // Admission alone leaves the buffer untouched.
        assert_eq!(executor.spectra().len(), 1);

        executor.discard_pending();
        assert!(executor.spectra().is_empty());
    }

    #[tokio::test]
    async fn keep_policy_leaves_spectra_buffered() {
        let mocks = MockDevices::new();
        let executor = FlowExecutor::new(mocks.devices(), FlowSettings::immediate());
        executor
            .spectra()
            .push(SpectrumRecord::new(None, 1, 10.0, None));

        assert_eq!(executor.admit(false), Admission::Accept);
        assert_eq!(executor.spectra().len(), 1);
    }

    #[tokio::test]
    async fn preflight_requires_stage_positions() {
        let mocks = MockDevices::new();
        let executor = FlowExecutor::new(mocks.devices(), FlowSettings::immediate());
        assert!(matches!(
            executor.preflight(),
            Err(ReactorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_continues_past_failures() {
        let mocks = MockDevices::new();
        let executor = executor(&mocks);
        mocks.pump_1.faults().set_failing(true);

        executor.shutdown_devices().await;

        assert!(!mocks.pump_2.is_running().await);
        assert_eq!(mocks.stage.home_count(), 1);
        assert_eq!(
            mocks.temperature_controller.set_point_history().last(),
            Some(&25.0)
        );
    }
}
