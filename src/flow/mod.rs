//! The three-pump flow reactor.
//!
//! [`FlowReactor`] is a [`Reactor`] driven by a [`FlowExecutor`]. On top of
//! the generic run control it adds status aggregation, spectrum collection,
//! blank calibration and stage position management.
//!
//! ```rust,ignore
//! let mocks = MockDevices::new();
//! let reactor = FlowReactor::flow(ReactorIdentity::generate("192.168.1.1"), mocks.devices(), FlowSettings::default());
//! reactor.load_stage_positions(Path::new("stage_positions.csv"))?;
//! reactor.new_instruction(&Instruction::from_json(text)?).await?;
//! reactor.advance().await?;
//! let spectrum = reactor.get_spectrum(true, Duration::from_secs(5)).await;
//! ```

mod calibration;
mod executor;
mod rates;
mod settings;
mod status;

use std::time::Duration;

pub use calibration::{read_spectrum_csv, read_stage_positions_csv};
pub use executor::{resolve_viewing_port, DeviceReadback, FlowExecutor, LiveSettings, SPECTRA_REMAINING};
pub use rates::FlowRates;
pub use settings::{
    CalibrationSettings, FlowSettings, FlowTiming, PendingSpectraPolicy, ReactorGeometry,
    MAX_SYRINGE_FLOW_RATE_UL_PER_HR, ROOM_TEMPERATURE_C,
};
pub use status::ReactorStatus;

use crate::hardware::ReactorDevices;
use crate::reactor::{Reactor, ReactorIdentity};
use crate::spectrum::SpectrumPoll;

/// Reactor with the flow executor.
pub type FlowReactor = Reactor<FlowExecutor>;

impl Reactor<FlowExecutor> {
    /// Idle flow reactor over `devices`.
    pub fn flow(identity: ReactorIdentity, devices: ReactorDevices, settings: FlowSettings) -> Self {
        Reactor::new(identity, FlowExecutor::new(devices, settings))
    }

    /// Oldest unread spectrum.
    ///
    /// Non-blocking calls return [`SpectrumPoll::Empty`] straight away when
    /// nothing is buffered; blocking calls wait up to `timeout`.
    pub async fn get_spectrum(&self, blocking: bool, timeout: Duration) -> SpectrumPoll {
        self.executor().spectra().get(blocking, timeout).await
    }

    /// Loaded stage coordinates.
    pub fn stage_positions(&self) -> Vec<f64> {
        self.executor().stage_positions()
    }
}
