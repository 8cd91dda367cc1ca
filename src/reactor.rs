//! Reactor: a run state machine composed with a step executor.
//!
//! [`Reactor`] owns the reactor identity, the [`RunStateMachine`] and a
//! [`StepExecutor`] that does the device work of each step. Reactor types
//! differ only in their executor; see [`FlowExecutor`](crate::flow::FlowExecutor).
//!
//! # Usage
//!
//! ```rust,ignore
//! let reactor = Reactor::new(ReactorIdentity::generate("192.168.1.1"), executor);
//! reactor.new_instruction(&instruction).await?;
//! while reactor.advance().await? != AdvanceStatus::RunComplete {
//!     println!("{}", serde_json::to_string(&reactor.status())?);
//! }
//! ```
//!
//! `advance` resolves only after the step's device work is done. A
//! step-in-progress lock serializes overlapping `advance` calls and stop
//! cleanup; `status` and the run-state transitions never wait on it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, ReactorError};
use crate::instruction::{Instruction, Step};
use crate::run_state::{
    AdvanceStatus, CommandAck, RunSnapshot, RunStateMachine, RunStatus, StepContext,
    PROCEDURE_ALREADY_RUNNING,
};

/// Whether an executor lets a new run start.
///
/// Admission has no side effects. The reactor applies a discard only after the
/// run state has accepted the instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Start the run.
    Accept,
    /// Start the run, then drop data left over from earlier runs.
    AcceptDiscardingPending,
    /// Refuse with a reason.
    Reject(String),
}

/// Device work for one step.
///
/// Only [`execute`](StepExecutor::execute) is required. The hooks default to
/// doing nothing.
#[async_trait]
pub trait StepExecutor: Send + Sync + 'static {
    /// Perform one step. Returns once all of the step's device work is done.
    async fn execute(&self, context: &StepContext, step: &Step) -> AppResult<()>;

    /// Checked before a running reactor advances. An error leaves the run
    /// state untouched.
    fn preflight(&self) -> AppResult<()> {
        Ok(())
    }

    /// Decide whether a new run may start. `discard_pending` is the caller's
    /// permission to throw away data left over from the previous run.
    fn admit(&self, _discard_pending: bool) -> Admission {
        Admission::Accept
    }

    /// Drop data left over from earlier runs. Called after a run admitted with
    /// [`Admission::AcceptDiscardingPending`] has been loaded.
    fn discard_pending(&self) {}

    /// Bring devices to a safe resting state after a run ends.
    async fn on_stop(&self) {}
}

/// Who this reactor is on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorIdentity {
    /// Reactor id.
    pub uuid: String,
    /// Address the reactor is reachable at.
    pub ip_address: String,
}

impl ReactorIdentity {
    /// Identity with an explicit id.
    pub fn new(uuid: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ip_address: ip_address.into(),
        }
    }

    /// Identity with a fresh random id.
    pub fn generate(ip_address: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), ip_address)
    }
}

/// Run state machine plus step executor.
pub struct Reactor<E> {
    identity: RwLock<ReactorIdentity>,
    machine: RunStateMachine,
    executor: E,
    step_in_progress: Mutex<()>,
}

impl<E: StepExecutor> Reactor<E> {
    /// Idle reactor.
    pub fn new(identity: ReactorIdentity, executor: E) -> Self {
        info!(uuid = %identity.uuid, ip = %identity.ip_address, "Reactor created");
        Self {
            identity: RwLock::new(identity),
            machine: RunStateMachine::new(),
            executor,
            step_in_progress: Mutex::new(()),
        }
    }

    /// The step executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The run state machine.
    pub fn machine(&self) -> &RunStateMachine {
        &self.machine
    }

    /// Reactor id.
    pub fn uuid(&self) -> String {
        self.identity.read().uuid.clone()
    }

    /// Reactor address.
    pub fn ip_address(&self) -> String {
        self.identity.read().ip_address.clone()
    }

    /// Replace the reactor id.
    pub fn update_uuid(&self, uuid: impl Into<String>) {
        let uuid = uuid.into();
        info!(uuid = %uuid, "Reactor id updated");
        self.identity.write().uuid = uuid;
    }

    /// Replace the reactor address.
    pub fn update_ip(&self, ip_address: impl Into<String>) {
        let ip_address = ip_address.into();
        info!(ip = %ip_address, "Reactor address updated");
        self.identity.write().ip_address = ip_address;
    }

    /// Submit an instruction, keeping data from earlier runs.
    pub async fn new_instruction(&self, instruction: &Instruction) -> AppResult<CommandAck> {
        self.submit(instruction, false).await
    }

    /// Submit an instruction.
    ///
    /// `Stop` performs a full [`stop`](Self::stop). Other instructions are
    /// validated, refused while a procedure runs, offered to the executor for
    /// admission and then loaded.
    pub async fn submit(
        &self,
        instruction: &Instruction,
        discard_pending: bool,
    ) -> AppResult<CommandAck> {
        instruction.validate()?;
        if let Instruction::Stop = instruction {
            self.stop().await;
            return Ok(CommandAck::Accepted("Stopped"));
        }
        if self.machine.status() == RunStatus::RunningProcedure {
            return Ok(CommandAck::Rejected(PROCEDURE_ALREADY_RUNNING.to_string()));
        }
        let admission = self.executor.admit(discard_pending);
        if let Admission::Reject(reason) = admission {
            warn!(reason = %reason, "Instruction refused");
            return Ok(CommandAck::Rejected(reason));
        }
        let ack = self.machine.new_instruction(instruction)?;
        if ack.is_accepted() && admission == Admission::AcceptDiscardingPending {
            self.executor.discard_pending();
        }
        Ok(ack)
    }

    /// Execute the next step of the loaded run.
    ///
    /// Resolves after the step's device work completes. Advancing past the
    /// last procedure step stops the run and cleans up.
    pub async fn advance(&self) -> AppResult<AdvanceStatus> {
        let _in_flight = self.step_in_progress.lock().await;
        if self.machine.is_running() {
            self.executor.preflight()?;
        }

        let transition = self.machine.advance();
        if let Some(pending) = transition.pending {
            let context = pending.context;
            info!(
                run_id = ?context.run_id,
                step = context.step,
                total_steps = context.total_steps,
                "{}",
                transition.status
            );
            if let Err(e) = self.executor.execute(&context, &pending.definition).await {
                error!(step = context.step, error = %e, "Step failed");
                return Err(e);
            }
        } else if transition.status == AdvanceStatus::RunComplete {
            self.finish().await;
        }
        Ok(transition.status)
    }

    /// Stop the run.
    ///
    /// The status reads `stopped` immediately. Cleanup waits for an in-flight
    /// step to finish, then the reactor returns to idle.
    pub async fn stop(&self) {
        self.machine.stop();
        let _in_flight = self.step_in_progress.lock().await;
        self.finish().await;
    }

    /// Hold off steps and stop cleanup while the guard lives. For device work
    /// outside a run, such as calibration.
    pub(crate) async fn exclusive_device_access(&self) -> MutexGuard<'_, ()> {
        self.step_in_progress.lock().await
    }

    async fn finish(&self) {
        self.executor.on_stop().await;
        if self.machine.reset_if_stopped() {
            info!("Reactor idle");
        }
    }

    /// Run, identity and progress.
    pub fn status(&self) -> RunSnapshot {
        let uuid = self.uuid();
        self.machine.with_state(|state| RunSnapshot::new(uuid, state))
    }
}

impl<E: StepExecutor> Reactor<E> {
    /// Run [`advance`](Self::advance) on the runtime and return a handle that
    /// resolves when the step completes.
    pub fn advance_in_background(self: &Arc<Self>) -> StepCompletion {
        let (tx, rx) = oneshot::channel();
        let reactor = Arc::clone(self);
        tokio::spawn(async move {
            let result = reactor.advance().await;
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        });
        StepCompletion { rx }
    }
}

/// One-shot completion of a background step.
#[derive(Debug)]
pub struct StepCompletion {
    rx: oneshot::Receiver<AppResult<AdvanceStatus>>,
}

impl StepCompletion {
    /// Wait for the step. Wrap in `tokio::time::timeout` for a deadline.
    pub async fn wait(self) -> AppResult<AdvanceStatus> {
        self.rx.await.map_err(|_| ReactorError::StepAborted)?
    }
}
