//! # Reactor DAQ Core Library
//!
//! Orchestration engine for an automated continuous-flow reactor: three
//! syringe pumps feed a heated coil, a motorized stage carries a fiber probe
//! between viewing ports, and a spectrometer measures absorbance at each port.
//! A remote controller submits procedures (ordered set-point steps) or single
//! instructions, drives them step by step and drains the measured spectra.
//!
//! ## Crate Structure
//!
//! - **`reactor`**: the generic [`Reactor`](reactor::Reactor): run state machine
//!   plus a [`StepExecutor`](reactor::StepExecutor) that does the device work.
//! - **`run_state`**: the closed run status set and its transition table.
//! - **`flow`**: the three-pump flow reactor: step execution, rate math,
//!   status aggregation, blank calibration and stage positions.
//! - **`hardware`**: capability traits for pumps, stage, spectrometer,
//!   temperature controller and GPIO; per-device locks; simulated devices.
//! - **`instruction`**: the JSON instruction format.
//! - **`spectrum`**: spectral records, the spectrum buffer and absorbance math.
//! - **`settle`**: fixed pauses and polled waits.
//! - **`config`** / **`logging`**: Figment configuration and `tracing` setup.
//! - **`error`**: the crate-wide [`ReactorError`](error::ReactorError).

pub mod config;
pub mod error;
pub mod flow;
pub mod hardware;
pub mod instruction;
pub mod logging;
pub mod reactor;
pub mod run_state;
pub mod settle;
pub mod spectrum;
