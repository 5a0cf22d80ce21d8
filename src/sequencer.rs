//! Brings a freshly reset device into a known, configured state.

use std::sync::{atomic::AtomicBool, Arc};
use std::time;

use crate::command::Operation;
use crate::retry::{Attempt, Exhausted};
use crate::transport::read_status;
use crate::{
    DeviceConfiguration, DeviceTransport, Error, ProtocolDialect, Result, RetryPolicy,
    ValidatorState,
};

/// Configuration commands in the order they are written to the device.
///
/// Operations a protocol does not support are skipped.
pub const CONFIG_SEQUENCE: [Operation; 15] = [
    Operation::SetDenomination,
    Operation::SetEnable,
    Operation::SetInterruptMode,
    Operation::SetSecurity,
    Operation::SetOrientation,
    Operation::SetOptionalFunction,
    Operation::SetInhibit,
    Operation::SetEscrowMode,
    Operation::SetPushMode,
    Operation::SetBarcodeDecoding,
    Operation::SetBarcodeInhibit,
    Operation::SetPowerup,
    Operation::SetExtendedNoteReporting,
    Operation::SetExtendedInhibits,
    Operation::SetExtendedCouponReporting,
];

/// Progress of an [InitializationSequencer] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SequencerState {
    #[default]
    Reset,
    WaitReady,
    Configuring,
    Ready,
    Failed,
}

/// Outcome of a successful sequencer run.
#[derive(Clone, Debug, PartialEq)]
pub struct Ready {
    /// Snapshot of the configuration written to the device.
    pub configuration: Arc<DeviceConfiguration>,
    /// Status reads that reported the device still initializing.
    pub wait_retries: u32,
    /// Configuration commands written, in order.
    pub applied: Vec<Operation>,
    /// State the device reported once it finished initializing.
    pub device_state: ValidatorState,
}

/// Drives reset and configuration: `Reset -> WaitReady -> Configuring -> Ready | Failed`.
///
/// Runs to completion once; it never loops indefinitely. Any failed configuration write
/// aborts the run, and a partially configured device is never reported ready.
pub struct InitializationSequencer<'a> {
    dialect: &'a dyn ProtocolDialect,
    configuration: DeviceConfiguration,
    retry: RetryPolicy,
    state: SequencerState,
}

impl<'a> InitializationSequencer<'a> {
    /// Creates a new [InitializationSequencer].
    pub fn new(
        dialect: &'a dyn ProtocolDialect,
        configuration: DeviceConfiguration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            dialect,
            configuration,
            retry,
            state: SequencerState::Reset,
        }
    }

    /// Gets the current [SequencerState].
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Runs the full sequence against `transport`.
    ///
    /// `cancel` is checked between status reads while waiting for the device to come up.
    pub fn run<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        cancel: Option<&AtomicBool>,
    ) -> Result<Ready> {
        let now = time::Instant::now();
        let protocol = self.dialect.protocol();

        self.state = SequencerState::Reset;
        log::info!("Resetting {protocol} device");

        let mut reset = self.dialect.require(Operation::Reset, &self.configuration)?;
        if let Err(source) = transport.execute(&mut reset) {
            log::error!("Failed to reset device: {source}");
            self.state = SequencerState::Failed;
            return Err(Error::Configuration {
                step: Operation::Reset.name(),
                source,
            });
        }

        self.state = SequencerState::WaitReady;
        let (device_state, wait_retries) = self.wait_ready(transport, cancel)?;

        log::info!("Device ready, status: {device_state}, retries: {wait_retries}");

        self.state = SequencerState::Configuring;
        let mut applied = Vec::with_capacity(CONFIG_SEQUENCE.len());

        for operation in CONFIG_SEQUENCE {
            let Some(mut cmd) = self.dialect.command(operation, &self.configuration) else {
                log::trace!("{protocol} has no {operation} command, skipping");
                continue;
            };

            log::debug!("Writing configuration: {cmd}");

            if let Err(source) = transport.set(&mut cmd) {
                log::error!("Configuration step {operation} failed: {source}");
                self.state = SequencerState::Failed;
                return Err(Error::Configuration {
                    step: operation.name(),
                    source,
                });
            }

            applied.push(operation);
        }

        self.state = SequencerState::Ready;
        log::info!(
            "Initialized {protocol} device in {} ms",
            now.elapsed().as_millis()
        );

        Ok(Ready {
            configuration: Arc::new(self.configuration.clone()),
            wait_retries,
            applied,
            device_state,
        })
    }

    fn wait_ready<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        cancel: Option<&AtomicBool>,
    ) -> Result<(ValidatorState, u32)> {
        let dialect = self.dialect;
        let mut status = dialect.require(Operation::GetStatus, &self.configuration)?;

        let res = self.retry.retry(cancel, |attempt| {
            match read_status(transport, &mut status) {
                Ok(len) => {
                    let state = dialect.state(&dialect.decode(&status.output()[..len]));
                    if state == ValidatorState::Initializing {
                        log::debug!("Device still initializing, attempt #{}", attempt + 1);
                        Attempt::Retry
                    } else {
                        Attempt::Done(state)
                    }
                }
                Err(err) => {
                    log::debug!("Waiting for device, attempt #{}: {err}", attempt + 1);
                    Attempt::Retry
                }
            }
        });

        res.map_err(|exhausted| {
            self.state = SequencerState::Failed;
            match exhausted {
                Exhausted::Attempts(attempts) => {
                    log::error!("Device still initializing after {attempts} status reads");
                    Error::InitTimeout { attempts }
                }
                Exhausted::Cancelled => Error::Cancelled("initialization".into()),
            }
        })
    }
}
