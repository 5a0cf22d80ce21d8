use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::{fmt, time};

use crate::codec::{DecodedEvent, ValidatorState};
use crate::command::Operation;
use crate::event::{DomainEvent, EventSink, Note};
use crate::retry;
use crate::sequencer::{InitializationSequencer, Ready};
use crate::transport::read_status;
use crate::{
    DeviceConfiguration, DeviceTransport, Error, PollConfig, PollMode, Protocol, ProtocolDialect,
    Result, TransportError,
};

use super::DeviceStatus;

/// Requests marshaled into the polling loop from other threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stack the note in escrow.
    Stack,
    /// Return the note in escrow.
    Return,
    /// Re-run the initialization sequence.
    Reinitialize,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Sending end of a polling loop's command queue.
///
/// Cheap to clone, and safe to use from any thread, including from inside an [EventSink].
#[derive(Clone, Debug)]
pub struct Controller(mpsc::Sender<ControlCommand>);

impl Controller {
    /// Creates a connected [Controller] and command queue receiver.
    pub fn channel() -> (Self, mpsc::Receiver<ControlCommand>) {
        let (tx, rx) = mpsc::channel();
        (Self(tx), rx)
    }

    /// Queues a [ControlCommand] for the polling loop.
    pub fn send(&self, command: ControlCommand) -> Result<()> {
        self.0.send(command).map_err(|_| Error::NotPolling)
    }

    /// Queues a request to return the escrowed note.
    pub fn request_return(&self) -> Result<()> {
        self.send(ControlCommand::Return)
    }

    /// Queues a request to stack the escrowed note.
    pub fn request_stack(&self) -> Result<()> {
        self.send(ControlCommand::Stack)
    }

    /// Queues a request to re-run the initialization sequence.
    pub fn reinitialize(&self) -> Result<()> {
        self.send(ControlCommand::Reinitialize)
    }
}

/// Per-device polling state, owned and mutated only by its [PollingEngine].
///
/// `state` holds the phase of the current note cycle: [Enable](ValidatorState::Enable) while
/// idle, then [Accepting](ValidatorState::Accepting), [Escrow](ValidatorState::Escrow),
/// [Stacking](ValidatorState::Stacking), [VendValid](ValidatorState::VendValid) or
/// [Returning](ValidatorState::Returning). [Failure](ValidatorState::Failure) parks the session
/// until the device is re-initialized.
#[derive(Clone, Debug)]
pub struct PollSession {
    state: ValidatorState,
    retries_in_state: u32,
    entered: time::Instant,
    last_observed: ValidatorState,
    note: Option<Note>,
    stack_issued: bool,
    stacked_seen: bool,
    ack_resends: u32,
    disabled_reported: bool,
    rejecting_reported: bool,
}

impl Default for PollSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PollSession {
    /// Creates a new idle [PollSession].
    pub fn new() -> Self {
        Self {
            state: ValidatorState::Enable,
            retries_in_state: 0,
            entered: time::Instant::now(),
            last_observed: ValidatorState::Unknown,
            note: None,
            stack_issued: false,
            stacked_seen: false,
            ack_resends: 0,
            disabled_reported: false,
            rejecting_reported: false,
        }
    }

    /// Gets the phase of the current note cycle.
    pub fn state(&self) -> ValidatorState {
        self.state
    }

    /// Gets the number of polls spent in the current phase.
    pub fn retries_in_state(&self) -> u32 {
        self.retries_in_state
    }

    /// Gets the time spent in the current phase.
    pub fn elapsed_in_state(&self) -> time::Duration {
        self.entered.elapsed()
    }

    /// Gets the device state reported by the most recent status read.
    pub fn last_observed(&self) -> ValidatorState {
        self.last_observed
    }

    /// Gets the note tracked by the current cycle.
    pub fn note(&self) -> Option<&Note> {
        self.note.as_ref()
    }

    /// Gets whether a note cycle is in progress.
    pub fn in_cycle(&self) -> bool {
        !matches!(self.state, ValidatorState::Enable | ValidatorState::Failure)
    }

    fn transition(&mut self, state: ValidatorState) {
        if self.state != state {
            log::debug!("Poll session: {} -> {state}", self.state);
        }

        self.state = state;
        self.retries_in_state = 0;
        self.entered = time::Instant::now();
    }

    // Counts a poll in the current phase, returning whether `bound` was reached.
    fn wait(&mut self, bound: u32) -> bool {
        self.retries_in_state = self.retries_in_state.saturating_add(1);
        self.retries_in_state >= bound
    }

    fn reset(&mut self) {
        self.transition(ValidatorState::Enable);
        self.note = None;
        self.stack_issued = false;
        self.stacked_seen = false;
        self.ack_resends = 0;
    }
}

/// Protocol-agnostic polling state machine for a single device.
///
/// Owns the device's transport exclusively: status reads, stack, return, and acknowledgement
/// all happen on the thread driving [tick](Self::tick). Requests from other threads arrive
/// through the [Controller] command queue, and are applied at the start of a tick, or right
/// after a [BillEscrowed](DomainEvent::BillEscrowed) event is delivered.
pub struct PollingEngine {
    transport: Box<dyn DeviceTransport>,
    dialect: Box<dyn ProtocolDialect>,
    sink: Box<dyn EventSink>,
    commands: mpsc::Receiver<ControlCommand>,
    poll: PollConfig,
    requested: DeviceConfiguration,
    configuration: Option<Arc<DeviceConfiguration>>,
    session: PollSession,
    status: Arc<DeviceStatus>,
    cancel: Arc<AtomicBool>,
}

impl PollingEngine {
    /// Creates a new [PollingEngine].
    ///
    /// The device must be [initialized](Self::initialize) before polling.
    pub fn new<T, S>(
        transport: T,
        protocol: Protocol,
        sink: S,
        commands: mpsc::Receiver<ControlCommand>,
    ) -> Self
    where
        T: DeviceTransport + 'static,
        S: EventSink + 'static,
    {
        Self {
            transport: Box::new(transport),
            dialect: protocol.dialect(),
            sink: Box::new(sink),
            commands,
            poll: PollConfig::default(),
            requested: DeviceConfiguration::default(),
            configuration: None,
            session: PollSession::new(),
            status: Arc::new(DeviceStatus::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builder function that sets the [PollConfig].
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Builder function that sets the [DeviceConfiguration] written on initialization.
    pub fn with_configuration(mut self, configuration: DeviceConfiguration) -> Self {
        self.requested = configuration;
        self
    }

    pub(crate) fn with_status(mut self, status: Arc<DeviceStatus>) -> Self {
        self.status = status;
        self
    }

    /// Gets the [Protocol] spoken by the device.
    pub fn protocol(&self) -> Protocol {
        self.dialect.protocol()
    }

    /// Gets the [PollConfig].
    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    /// Gets the [PollSession].
    pub fn session(&self) -> &PollSession {
        &self.session
    }

    /// Gets the configuration applied by the last successful initialization.
    pub fn configuration(&self) -> Option<Arc<DeviceConfiguration>> {
        self.configuration.clone()
    }

    /// Opens the transport.
    pub fn open(&mut self, port_id: &str) -> Result<()> {
        self.transport.open(port_id)?;
        Ok(())
    }

    /// Closes the transport.
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        Ok(())
    }

    /// Resets and configures the device, replacing any previous configuration.
    ///
    /// Emits [DeviceReady](DomainEvent::DeviceReady) on success. On failure the device is not
    /// ready, and polling cannot start until a later run succeeds.
    pub fn initialize(&mut self) -> Result<Ready> {
        self.session.reset();
        self.status.set_escrowed(false);
        self.set_configuration(None);

        let ready = InitializationSequencer::new(
            self.dialect.as_ref(),
            self.requested.clone(),
            self.poll.init_retry,
        )
        .run(self.transport.as_mut(), Some(self.cancel.as_ref()))?;

        self.set_configuration(Some(Arc::clone(&ready.configuration)));
        self.emit(DomainEvent::DeviceReady);

        Ok(ready)
    }

    /// Runs the polling loop until `stop` is raised, or the transport disconnects.
    ///
    /// Every run starts from a fresh [PollSession]. A cycle left in progress by an earlier run
    /// is abandoned with a [ProtocolError](DomainEvent::ProtocolError).
    pub fn run(&mut self, stop: Arc<AtomicBool>) {
        self.cancel = stop;
        self.discard_session();

        log::info!("Starting {} polling loop", self.protocol());

        while !self.cancel.load(Ordering::Relaxed) {
            match self.tick() {
                Ok(()) => (),
                Err(Error::Transport(err)) if err.is_fatal() => {
                    log::error!("Stopping polling loop: {err}");
                    break;
                }
                Err(err) => log::warn!("Polling tick failed: {err}"),
            }

            if !retry::sleep(self.poll.poll_interval, Some(self.cancel.as_ref())) {
                break;
            }
        }

        log::info!("Stopped {} polling loop", self.protocol());
    }

    /// Runs a single polling tick: applies queued commands, reads the device status, and
    /// advances the session.
    ///
    /// Non-fatal transport errors abort the current cycle and return `Ok(())`. Only a
    /// disconnected transport is returned as an error.
    pub fn tick(&mut self) -> Result<()> {
        match self.step() {
            Err(Error::Transport(err)) => self.abort_cycle(err),
            res => res,
        }
    }

    fn step(&mut self) -> Result<()> {
        self.process_commands()?;

        if self.session.state == ValidatorState::Failure {
            log::trace!("Device failed, waiting for re-initialization");
            return Ok(());
        }

        let (raw, event, observed) = self.read_state()?;

        self.session.last_observed = observed;
        if observed != ValidatorState::Disabled {
            self.session.disabled_reported = false;
        }
        if observed != ValidatorState::Rejecting {
            self.session.rejecting_reported = false;
        }

        if observed == ValidatorState::Failure {
            self.on_failure(&raw);
            return Ok(());
        }

        match self.session.state {
            ValidatorState::Accepting => self.on_accepting(observed, &raw, event)?,
            ValidatorState::Escrow => self.on_escrow_hold(observed, &raw)?,
            ValidatorState::Stacking => self.on_stacking(observed, &raw)?,
            ValidatorState::VendValid => self.on_vend_valid(observed)?,
            ValidatorState::Returning => self.on_returning(observed)?,
            _ => self.on_idle(observed, &raw, event)?,
        }

        // a cycle may have just ended on a disabled device
        if observed == ValidatorState::Disabled && !self.session.in_cycle() {
            self.on_disabled()?;
        }

        Ok(())
    }

    fn read_state(&mut self) -> Result<(Vec<u8>, DecodedEvent, ValidatorState)> {
        let config = self.active_configuration()?;
        let mut cmd = self.dialect.require(Operation::GetStatus, &config)?;

        let len = read_status(self.transport.as_mut(), &mut cmd)?;
        let raw = cmd.output()[..len].to_vec();

        let event = self.dialect.decode(&raw);
        let state = self.dialect.state(&event);

        log::trace!("Decoded status: {event}, state: {state}");

        Ok((raw, event, state))
    }

    fn on_idle(&mut self, observed: ValidatorState, raw: &[u8], event: DecodedEvent) -> Result<()> {
        match observed {
            ValidatorState::Disabled => return self.on_disabled(),
            ValidatorState::Accepting => {
                self.session.transition(ValidatorState::Accepting);
                return Ok(());
            }
            ValidatorState::Escrow => return self.on_escrow(event),
            ValidatorState::Rejecting => self.on_rejecting(raw),
            ValidatorState::VendValid => {
                // Without a Stack there is no note to credit, but the device stays stuck
                // until acknowledged.
                log::warn!("Device reported vend valid with no stack issued");
                self.emit(DomainEvent::ProtocolError {
                    detail: "vend valid reported with no stack issued".into(),
                });
                self.send_ack()?;
            }
            ValidatorState::Initializing => log::debug!("Device is initializing"),
            _ => (),
        }

        if self.session.wait(self.poll.accept_timeout) {
            log::trace!(
                "Nothing inserted after {} polls, restarting wait",
                self.session.retries_in_state
            );
            self.session.reset();
        }

        Ok(())
    }

    fn on_accepting(
        &mut self,
        observed: ValidatorState,
        raw: &[u8],
        event: DecodedEvent,
    ) -> Result<()> {
        match observed {
            ValidatorState::Escrow => return self.on_escrow(event),
            ValidatorState::Disabled => return self.on_disabled(),
            ValidatorState::Rejecting => {
                self.on_rejecting(raw);
                self.session.reset();
                return Ok(());
            }
            ValidatorState::Returning => {
                log::info!("Note returned before reaching escrow");
                self.session.reset();
                return Ok(());
            }
            _ => (),
        }

        if self.session.wait(self.poll.escrow_timeout) {
            log::warn!(
                "Timed out waiting for escrow after {} polls, abandoning cycle",
                self.session.retries_in_state
            );
            self.session.reset();
        }

        Ok(())
    }

    fn on_escrow(&mut self, event: DecodedEvent) -> Result<()> {
        let (denomination, barcode) = match event {
            DecodedEvent::Escrowed {
                denomination_index,
                barcode,
            } => (denomination_index, barcode),
            _ => (None, None),
        };

        let value = match (denomination, self.configuration.as_ref()) {
            (Some(denom), Some(config)) => config.channel_value(denom),
            _ => None,
        };

        let note = Note {
            denomination,
            barcode,
            value,
        };

        self.session.transition(ValidatorState::Escrow);
        self.session.note = Some(note.clone());
        self.status.set_escrowed(true);

        self.emit(DomainEvent::BillEscrowed { note });

        // A sink may have queued a decision while handling the escrow event.
        self.process_commands()?;

        if self.session.state == ValidatorState::Escrow {
            match self.poll.mode {
                PollMode::Auto => self.issue_stack()?,
                PollMode::Interactive => {
                    log::info!("Holding note in escrow, waiting for stack or return");
                    self.hold()?;
                }
            }
        }

        Ok(())
    }

    fn on_escrow_hold(&mut self, observed: ValidatorState, raw: &[u8]) -> Result<()> {
        match observed {
            ValidatorState::Returning => {
                self.session.transition(ValidatorState::Returning);
                Ok(())
            }
            ValidatorState::Rejecting => {
                self.on_rejecting(raw);
                self.finish_cycle();
                Ok(())
            }
            state if state.is_idle() => {
                log::warn!("Device released the escrowed note on its own");
                self.complete_return();
                Ok(())
            }
            _ if self.session.wait(self.poll.escrow_hold_timeout) => {
                log::warn!(
                    "No decision after {} polls in escrow, returning note",
                    self.session.retries_in_state
                );
                self.issue_return()
            }
            ValidatorState::Escrow => self.hold(),
            _ => Ok(()),
        }
    }

    fn on_stacking(&mut self, observed: ValidatorState, raw: &[u8]) -> Result<()> {
        let acknowledges = self.dialect.acknowledges_vend();

        match observed {
            ValidatorState::VendValid => {
                self.session.transition(ValidatorState::VendValid);
                if acknowledges {
                    self.send_ack()?;
                }
                return Ok(());
            }
            ValidatorState::Stacked => {
                self.session.stacked_seen = true;
                if acknowledges {
                    self.session.transition(ValidatorState::VendValid);
                } else {
                    self.complete_stack();
                }
                return Ok(());
            }
            state if state.is_idle() => {
                if acknowledges {
                    log::warn!("Device went idle after stack without vend valid");
                    self.emit(DomainEvent::ProtocolError {
                        detail: "device went idle after stack without vend valid".into(),
                    });
                    self.finish_cycle();
                } else {
                    self.complete_stack();
                }
                return Ok(());
            }
            ValidatorState::Returning => {
                log::warn!("Device is returning the note instead of stacking");
                self.session.transition(ValidatorState::Returning);
                return Ok(());
            }
            ValidatorState::Rejecting => {
                self.on_rejecting(raw);
                self.finish_cycle();
                return Ok(());
            }
            _ => (),
        }

        if self.session.wait(self.poll.vend_valid_timeout) {
            let detail = format!(
                "no stack outcome after {} polls, note state unknown",
                self.session.retries_in_state
            );
            log::warn!("Abandoning cycle: {detail}");
            self.emit(DomainEvent::ProtocolError { detail });
            self.finish_cycle();
        }

        Ok(())
    }

    fn on_vend_valid(&mut self, observed: ValidatorState) -> Result<()> {
        match observed {
            ValidatorState::VendValid => {
                if self.session.ack_resends < self.poll.ack_resend_limit {
                    self.session.ack_resends += 1;
                    log::debug!("Vend valid repeated, resending ack #{}", self.session.ack_resends);
                    self.send_ack()?;
                }
            }
            ValidatorState::Stacked => self.session.stacked_seen = true,
            state if state.is_idle() => {
                self.complete_stack();
                return Ok(());
            }
            _ => (),
        }

        if self.session.wait(self.poll.idle_timeout) {
            if self.session.stacked_seen {
                log::warn!("Device did not return to idle, crediting observed stack");
                self.complete_stack();
            } else {
                let detail = format!(
                    "device did not confirm stack after {} polls",
                    self.session.retries_in_state
                );
                log::warn!("Abandoning cycle: {detail}");
                self.emit(DomainEvent::ProtocolError { detail });
                self.finish_cycle();
            }
        }

        Ok(())
    }

    fn on_returning(&mut self, observed: ValidatorState) -> Result<()> {
        if observed.is_idle() {
            self.complete_return();
        } else if self.session.wait(self.poll.idle_timeout) {
            let detail = format!(
                "note not returned after {} polls",
                self.session.retries_in_state
            );
            log::warn!("Abandoning cycle: {detail}");
            self.emit(DomainEvent::ProtocolError { detail });
            self.finish_cycle();
        }

        Ok(())
    }

    fn on_disabled(&mut self) -> Result<()> {
        if self.session.disabled_reported {
            return Ok(());
        }

        let config = self.active_configuration()?;
        if let Some(mut cmd) = self.dialect.command(Operation::SetInhibit, &config) {
            log::debug!("Device disabled, re-enabling: {cmd}");
            self.transport.set(&mut cmd)?;
        }

        self.session.disabled_reported = true;
        self.emit(DomainEvent::DeviceDisabled);

        Ok(())
    }

    fn on_rejecting(&mut self, raw: &[u8]) {
        if !self.session.rejecting_reported {
            self.session.rejecting_reported = true;
            let reason = self.dialect.reject_reason(raw);
            self.emit(DomainEvent::BillRejected { reason });
        }
    }

    fn on_failure(&mut self, raw: &[u8]) {
        let code = self.dialect.status_code(raw);

        if let Some(note) = self.session.note.as_ref() {
            log::warn!("Device failed with {note} in the note path");
        }
        log::error!("Device failure, status code: 0x{code:02x}");

        self.finish_cycle();
        self.session.transition(ValidatorState::Failure);
        self.emit(DomainEvent::DeviceFailure { code });
    }

    fn process_commands(&mut self) -> Result<()> {
        while let Ok(command) = self.commands.try_recv() {
            log::debug!("Received control command: {command}");

            match command {
                ControlCommand::Stack if self.session.state == ValidatorState::Escrow => {
                    self.issue_stack()?
                }
                ControlCommand::Return if self.session.state == ValidatorState::Escrow => {
                    self.issue_return()?
                }
                ControlCommand::Stack => self.send_outside_escrow(Operation::Stack)?,
                ControlCommand::Return => self.send_outside_escrow(Operation::Return)?,
                ControlCommand::Reinitialize => self.reinitialize(),
            }
        }

        Ok(())
    }

    fn discard_session(&mut self) {
        let failed = self.session.state == ValidatorState::Failure;

        if self.session.in_cycle() {
            let detail = match self.session.note.as_ref() {
                Some(note) => format!(
                    "session discarded with {note} in the note path, {} cycle abandoned",
                    self.session.state
                ),
                None => format!("session discarded during {} cycle", self.session.state),
            };
            log::warn!("{detail}");
            self.emit(DomainEvent::ProtocolError { detail });
        }

        self.session = PollSession::new();
        self.status.set_escrowed(false);

        // a failed device stays parked until re-initialized
        if failed {
            self.session.transition(ValidatorState::Failure);
        }
    }

    fn reinitialize(&mut self) {
        if self.session.in_cycle() {
            log::warn!("Re-initializing with a {} cycle in progress", self.session.state);
        }

        if let Err(err) = self.initialize() {
            log::error!("Re-initialization failed: {err}");
            self.session.transition(ValidatorState::Failure);
            self.emit(DomainEvent::ProtocolError {
                detail: format!("re-initialization failed: {err}"),
            });
        }
    }

    fn send_outside_escrow(&mut self, operation: Operation) -> Result<()> {
        log::warn!(
            "{operation} requested outside escrow, session state: {}",
            self.session.state
        );

        match self.execute(operation) {
            Err(Error::Transport(err)) if !err.is_fatal() => {
                self.emit(DomainEvent::ProtocolError {
                    detail: format!("{operation} outside escrow failed: {err}"),
                });
                Ok(())
            }
            res => res,
        }
    }

    fn issue_stack(&mut self) -> Result<()> {
        self.execute(Operation::Stack)?;
        self.status.set_escrowed(false);
        self.session.stack_issued = true;
        self.session.transition(ValidatorState::Stacking);
        Ok(())
    }

    fn issue_return(&mut self) -> Result<()> {
        self.execute(Operation::Return)?;
        self.status.set_escrowed(false);
        self.session.transition(ValidatorState::Returning);
        Ok(())
    }

    fn hold(&mut self) -> Result<()> {
        let config = self.active_configuration()?;

        match self.dialect.command(Operation::Hold, &config) {
            Some(mut cmd) => {
                self.transport.execute(&mut cmd)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn send_ack(&mut self) -> Result<()> {
        if self.session.last_observed != ValidatorState::VendValid {
            return Err(Error::Protocol(format!(
                "refusing to ack, last observed state: {}",
                self.session.last_observed
            )));
        }

        self.execute(Operation::Ack)
    }

    fn execute(&mut self, operation: Operation) -> Result<()> {
        let config = self.active_configuration()?;
        let mut cmd = self.dialect.require(operation, &config)?;

        log::debug!("Sending {cmd}");
        self.transport.execute(&mut cmd)?;

        Ok(())
    }

    fn complete_stack(&mut self) {
        match self.session.note.take() {
            Some(note) => self.emit(DomainEvent::BillStacked { note }),
            None => self.emit(DomainEvent::ProtocolError {
                detail: "stack completed with no escrowed note".into(),
            }),
        }

        self.finish_cycle();
    }

    fn complete_return(&mut self) {
        let note = self.session.note.take();
        self.emit(DomainEvent::BillReturned { note });
        self.finish_cycle();
    }

    fn finish_cycle(&mut self) {
        self.session.reset();
        self.status.set_escrowed(false);
    }

    fn abort_cycle(&mut self, err: TransportError) -> Result<()> {
        if err.is_fatal() {
            return Err(err.into());
        }

        if self.session.in_cycle() {
            let detail = format!("{} cycle aborted: {err}", self.session.state);
            log::warn!("{detail}");
            self.emit(DomainEvent::ProtocolError { detail });
            self.finish_cycle();
        } else {
            log::warn!("Transport error while idle: {err}");
            if self.session.state != ValidatorState::Failure {
                self.session.reset();
            }
        }

        Ok(())
    }

    fn active_configuration(&self) -> Result<Arc<DeviceConfiguration>> {
        self.configuration.clone().ok_or(Error::NotReady)
    }

    fn set_configuration(&mut self, configuration: Option<Arc<DeviceConfiguration>>) {
        self.configuration = configuration.clone();
        if let Err(err) = self.status.set_configuration(configuration) {
            log::warn!("Failed to publish device configuration: {err}");
        }
    }

    fn emit(&mut self, event: DomainEvent) {
        log::info!("Device event: {event}");
        self.sink.deliver(event);
    }
}
