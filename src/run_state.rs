//! Run state machine.
//!
//! Tracks what the reactor is doing (status, step counters, run id) and
//! decides what each `advance` means. It performs no device work: the
//! [`Reactor`](crate::reactor::Reactor) pairs it with a step executor.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  SingleInstruction  ┌────────────────────────────┐
//! │ Idle │────────────────────▶│ running single instruction │
//! └──────┘                     └────────────────────────────┘
//!    ▲  │      Procedure       ┌───────────────────┐
//!    │  └─────────────────────▶│ running procedure │
//!    │                         └─────────┬─────────┘
//!    │                                   │ advance past last step, or Stop
//!    │  reset after cleanup    ┌─────────▼─────────┐
//!    └─────────────────────────│      stopped      │
//!                              └───────────────────┘
//! ```
//!
//! The run-state lock is a short-held `parking_lot::Mutex`; it is never held
//! across an `.await`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AppResult;
use crate::instruction::{Instruction, Step};

/// Rejection text when a procedure already holds the reactor.
pub const PROCEDURE_ALREADY_RUNNING: &str = "Procedure already running";

/// Reactor run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Not connected.
    #[serde(rename = "offline")]
    Offline,
    /// Powering up.
    #[serde(rename = "starting")]
    Starting,
    /// Executing a single instruction.
    #[serde(rename = "running single instruction")]
    RunningInstruction,
    /// Executing a procedure.
    #[serde(rename = "running procedure")]
    RunningProcedure,
    /// Stopped; cleanup pending or in progress.
    #[serde(rename = "stopped")]
    Stopped,
    /// Ready for an instruction.
    #[serde(rename = "idle")]
    Idle,
    /// Faulted.
    #[serde(rename = "error")]
    Error,
}

impl RunStatus {
    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Offline => "offline",
            RunStatus::Starting => "starting",
            RunStatus::RunningInstruction => "running single instruction",
            RunStatus::RunningProcedure => "running procedure",
            RunStatus::Stopped => "stopped",
            RunStatus::Idle => "idle",
            RunStatus::Error => "error",
        }
    }

    /// Whether a run is in progress.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            RunStatus::RunningInstruction | RunStatus::RunningProcedure
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of the loaded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// One ad-hoc step.
    SingleInstruction,
    /// A multi-step procedure.
    Procedure,
}

/// Status, counters and identity of the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    /// Current status.
    pub status: RunStatus,
    /// Procedure run id; only set while a procedure runs.
    pub run_id: Option<String>,
    /// Steps started so far.
    pub step: Option<u32>,
    /// Steps in the loaded run.
    pub total_steps: Option<u32>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            run_id: None,
            step: None,
            total_steps: None,
        }
    }
}

/// Answer to an instruction or calibration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAck {
    /// Accepted, with a status message.
    Accepted(&'static str),
    /// Refused; nothing changed.
    Rejected(String),
}

impl CommandAck {
    /// Status message.
    pub fn message(&self) -> &str {
        match self {
            CommandAck::Accepted(message) => message,
            CommandAck::Rejected(reason) => reason,
        }
    }

    /// Whether the request was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandAck::Accepted(_))
    }
}

impl std::fmt::Display for CommandAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// What an `advance` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceStatus {
    /// No run is loaded.
    NoProcedureLoaded,
    /// The single instruction already executed.
    InstructionRunning,
    /// The last procedure step already executed; the run is over.
    RunComplete,
    /// The single instruction is executing.
    SingleInstructionInitiated,
    /// The next procedure step is executing.
    NextStepInitiated,
}

impl AdvanceStatus {
    /// Status message.
    pub fn as_str(self) -> &'static str {
        match self {
            AdvanceStatus::NoProcedureLoaded => "No procedure loaded",
            AdvanceStatus::InstructionRunning => "Instruction running",
            AdvanceStatus::RunComplete => "Run Complete",
            AdvanceStatus::SingleInstructionInitiated => "Single Instruction Initiated",
            AdvanceStatus::NextStepInitiated => "Next Step Initiated",
        }
    }
}

impl std::fmt::Display for AdvanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a step sits in its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    /// Kind of run.
    pub kind: RunKind,
    /// Procedure run id.
    pub run_id: Option<String>,
    /// 1-based step number.
    pub step: u32,
    /// Steps in the run.
    pub total_steps: u32,
}

impl StepContext {
    /// Whether this is the first step of its run.
    pub fn is_first_step(&self) -> bool {
        self.step == 1
    }
}

/// A step the caller must now execute.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStep {
    /// Position in the run.
    pub context: StepContext,
    /// Set points.
    pub definition: Step,
}

/// Result of [`RunStateMachine::advance`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// What happened.
    pub status: AdvanceStatus,
    /// Work to do, for the two "initiated" outcomes.
    pub pending: Option<PendingStep>,
}

/// Progress fields reported only while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    /// Steps in the run.
    pub total_steps: u32,
    /// Steps not yet started.
    pub steps_remaining: u32,
}

/// Serializable view of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// Status string.
    pub status: RunStatus,
    /// Reactor id.
    pub uuid: String,
    /// Procedure run id.
    pub run_uuid: Option<String>,
    /// Steps started so far.
    pub procedure_step: Option<u32>,
    /// Present only while running.
    #[serde(flatten)]
    pub progress: Option<StepProgress>,
}

impl RunSnapshot {
    /// Snapshot of `state` for reactor `uuid`.
    pub fn new(uuid: impl Into<String>, state: &RunState) -> Self {
        let progress = match (state.status.is_running(), state.step, state.total_steps) {
            (true, Some(step), Some(total_steps)) => Some(StepProgress {
                total_steps,
                steps_remaining: total_steps.saturating_sub(step),
            }),
            _ => None,
        };
        Self {
            status: state.status,
            uuid: uuid.into(),
            run_uuid: state.run_id.clone(),
            procedure_step: state.step,
            progress,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: RunState,
    steps: Vec<Step>,
}

/// The run state machine, guarded by the run-state lock.
#[derive(Debug, Default)]
pub struct RunStateMachine {
    inner: Mutex<Inner>,
}

impl RunStateMachine {
    /// Idle machine with nothing loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current run state.
    pub fn state(&self) -> RunState {
        self.inner.lock().state.clone()
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.inner.lock().state.status
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Run `f` with the run-state lock held.
    ///
    /// Lets callers assemble a composite view that cannot interleave with a
    /// transition. `f` must not block.
    pub fn with_state<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.state)
    }

    /// Accept or reject an instruction.
    pub fn new_instruction(&self, instruction: &Instruction) -> AppResult<CommandAck> {
        instruction.validate()?;
        let mut inner = self.inner.lock();

        match instruction {
            Instruction::Stop => {
                Self::stop_locked(&mut inner);
                Ok(CommandAck::Accepted("Stopped"))
            }
            _ if inner.state.status == RunStatus::RunningProcedure => {
                debug!("Instruction rejected: procedure running");
                Ok(CommandAck::Rejected(PROCEDURE_ALREADY_RUNNING.to_string()))
            }
            Instruction::SingleInstruction { instruction } => {
                inner.steps = vec![instruction.clone()];
                inner.state = RunState {
                    status: RunStatus::RunningInstruction,
                    run_id: None,
                    step: Some(0),
                    total_steps: Some(1),
                };
                info!("Single instruction loaded");
                Ok(CommandAck::Accepted("Single Instruction Created"))
            }
            Instruction::Procedure(procedure) => {
                let total_steps = u32::try_from(procedure.steps.len()).unwrap_or(u32::MAX);
                inner.steps = procedure.steps.clone();
                inner.state = RunState {
                    status: RunStatus::RunningProcedure,
                    run_id: Some(procedure.run_id.clone()),
                    step: Some(0),
                    total_steps: Some(total_steps),
                };
                info!(run_id = %procedure.run_id, total_steps, "Procedure loaded");
                Ok(CommandAck::Accepted("Procedure Created"))
            }
        }
    }

    /// Move to the next step, if there is one.
    pub fn advance(&self) -> Transition {
        let mut inner = self.inner.lock();
        let status = inner.state.status;
        if !status.is_running() {
            return Transition {
                status: AdvanceStatus::NoProcedureLoaded,
                pending: None,
            };
        }

        let step = inner.state.step.unwrap_or(0);
        let total_steps = inner.state.total_steps.unwrap_or(0);
        if step >= total_steps {
            if status == RunStatus::RunningInstruction {
                return Transition {
                    status: AdvanceStatus::InstructionRunning,
                    pending: None,
                };
            }
            info!(run_id = ?inner.state.run_id, "Run complete");
            Self::stop_locked(&mut inner);
            return Transition {
                status: AdvanceStatus::RunComplete,
                pending: None,
            };
        }

        let next = step + 1;
        inner.state.step = Some(next);
        let Some(definition) = inner.steps.get(step as usize).cloned() else {
            // Counters and program disagree; treat the run as finished.
            Self::stop_locked(&mut inner);
            return Transition {
                status: AdvanceStatus::RunComplete,
                pending: None,
            };
        };
        let (kind, advance_status) = match status {
            RunStatus::RunningInstruction => (
                RunKind::SingleInstruction,
                AdvanceStatus::SingleInstructionInitiated,
            ),
            _ => (RunKind::Procedure, AdvanceStatus::NextStepInitiated),
        };
        debug!(step = next, total_steps, "Advancing");
        Transition {
            status: advance_status,
            pending: Some(PendingStep {
                context: StepContext {
                    kind,
                    run_id: inner.state.run_id.clone(),
                    step: next,
                    total_steps,
                },
                definition,
            }),
        }
    }

    /// Stop unconditionally.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        Self::stop_locked(&mut inner);
    }

    fn stop_locked(inner: &mut Inner) {
        if inner.state.status != RunStatus::Stopped {
            info!(from = %inner.state.status, "Run stopped");
        }
        inner.state.status = RunStatus::Stopped;
        inner.state.run_id = None;
    }

    /// Return to Idle if stopped, clearing counters. Returns whether it did.
    pub fn reset_if_stopped(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.status != RunStatus::Stopped {
            return false;
        }
        *inner = Inner::default();
        true
    }
}
