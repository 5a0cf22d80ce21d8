use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::{thread, time};

use parking_lot::{Mutex, MutexGuard};

use crate::sequencer::Ready;
use crate::{
    DeviceConfiguration, DeviceTransport, Error, EventSink, PollConfig, Protocol, Result,
};

mod engine;

pub use engine::{ControlCommand, Controller, PollSession, PollingEngine};

/// Timeout for waiting for lock on a mutex (milliseconds).
pub const LOCK_TIMEOUT_MS: u64 = 5_000;

/// Status snapshot shared between a [DeviceHandle] and its polling thread.
#[derive(Debug, Default)]
pub(crate) struct DeviceStatus {
    escrowed: AtomicBool,
    polling: AtomicBool,
    configuration: Mutex<Option<Arc<DeviceConfiguration>>>,
}

impl DeviceStatus {
    pub(crate) fn escrowed(&self) -> bool {
        self.escrowed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_escrowed(&self, escrowed: bool) -> bool {
        self.escrowed.swap(escrowed, Ordering::SeqCst)
    }

    pub(crate) fn polling(&self) -> bool {
        self.polling.load(Ordering::Relaxed)
    }

    pub(crate) fn set_polling(&self, polling: bool) -> bool {
        self.polling.swap(polling, Ordering::SeqCst)
    }

    pub(crate) fn configuration(&self) -> Result<Option<Arc<DeviceConfiguration>>> {
        Ok(self.lock_configuration()?.clone())
    }

    pub(crate) fn set_configuration(
        &self,
        configuration: Option<Arc<DeviceConfiguration>>,
    ) -> Result<()> {
        *self.lock_configuration()? = configuration;
        Ok(())
    }

    fn lock_configuration(&self) -> Result<MutexGuard<'_, Option<Arc<DeviceConfiguration>>>> {
        self.configuration
            .try_lock_for(time::Duration::from_millis(LOCK_TIMEOUT_MS))
            .ok_or(Error::Timeout("waiting for device configuration lock".into()))
    }
}

/// Handle for operating a single validator.
///
/// The handle owns the device's [PollingEngine]. While polling, the engine lives on a
/// dedicated thread with exclusive access to the transport; stack and return requests are
/// queued to it rather than sent from the caller's thread.
///
/// ```no_run
/// # fn main() -> validator_server::Result<()> {
/// use validator_server::{mock::MockDevice, DeviceHandle, Protocol, PushEventReceiver};
///
/// let (tx, rx) = PushEventReceiver::channel();
/// let mut handle = DeviceHandle::new("/dev/ttyS3", MockDevice::new(), Protocol::Jcm, tx);
///
/// handle.open()?;
/// handle.initialize()?;
/// handle.start_polling()?;
///
/// while let Ok(event) = rx.pop_event() {
///     log::debug!("Received an event: {event}");
/// }
///
/// handle.stop_polling()?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceHandle {
    port: String,
    engine: Option<PollingEngine>,
    worker: Option<thread::JoinHandle<PollingEngine>>,
    stop: Arc<AtomicBool>,
    controller: Controller,
    status: Arc<DeviceStatus>,
}

impl DeviceHandle {
    /// Creates a new [DeviceHandle] for the device on `port`.
    pub fn new<T, S>(port: &str, transport: T, protocol: Protocol, sink: S) -> Self
    where
        T: DeviceTransport + 'static,
        S: EventSink + 'static,
    {
        let (controller, commands) = Controller::channel();
        let status = Arc::new(DeviceStatus::default());

        let engine =
            PollingEngine::new(transport, protocol, sink, commands).with_status(Arc::clone(&status));

        Self {
            port: port.into(),
            engine: Some(engine),
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            controller,
            status,
        }
    }

    /// Builder function that sets the [PollConfig].
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.engine = self.engine.take().map(|e| e.with_poll_config(poll));
        self
    }

    /// Builder function that sets the [DeviceConfiguration] written on initialization.
    pub fn with_configuration(mut self, configuration: DeviceConfiguration) -> Self {
        self.engine = self.engine.take().map(|e| e.with_configuration(configuration));
        self
    }

    /// Gets the port identifier of the device.
    pub fn port(&self) -> &str {
        self.port.as_str()
    }

    /// Gets a [Controller] for queuing requests to the polling loop.
    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    /// Opens the transport to the device.
    pub fn open(&mut self) -> Result<()> {
        let port = self.port.clone();
        self.engine_mut()?.open(port.as_str())
    }

    /// Closes the transport to the device.
    pub fn close(&mut self) -> Result<()> {
        self.engine_mut()?.close()
    }

    /// Resets and configures the device.
    ///
    /// Must complete successfully before [start_polling](Self::start_polling).
    pub fn initialize(&mut self) -> Result<Ready> {
        self.engine_mut()?.initialize()
    }

    /// Starts the background polling routine.
    ///
    /// Returns `Err(_)` if polling already started, or the device is not initialized.
    pub fn start_polling(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::PollingReinit);
        }

        let mut engine = self.engine.take().ok_or(Error::PollingReinit)?;

        if engine.configuration().is_none() {
            self.engine = Some(engine);
            return Err(Error::NotReady);
        }

        self.stop.store(false, Ordering::SeqCst);
        self.status.set_polling(true);

        let stop = Arc::clone(&self.stop);
        let status = Arc::clone(&self.status);

        self.worker = Some(thread::spawn(move || {
            engine.run(stop);
            status.set_polling(false);
            engine
        }));

        log::debug!("Background polling started for {}", self.port);

        Ok(())
    }

    /// Stops the background polling routine, waiting for the current tick to finish.
    pub fn stop_polling(&mut self) -> Result<()> {
        let worker = self.worker.take().ok_or(Error::NotPolling)?;

        self.stop.store(true, Ordering::SeqCst);

        let engine = worker
            .join()
            .map_err(|_| Error::Io(format!("polling thread for {} panicked", self.port)))?;

        self.engine = Some(engine);
        self.status.set_polling(false);

        log::debug!("Background polling stopped for {}", self.port);

        Ok(())
    }

    /// Requests the note in escrow be returned.
    pub fn request_return(&self) -> Result<()> {
        self.check_polling()?;
        self.controller.request_return()
    }

    /// Requests the note in escrow be stacked.
    pub fn request_stack(&self) -> Result<()> {
        self.check_polling()?;
        self.controller.request_stack()
    }

    /// Requests the note in escrow be stacked, failing if no note is currently escrowed.
    pub fn escrow_stack(&self) -> Result<()> {
        if !self.escrowed() {
            Err(Error::Protocol("no note in escrow".into()))
        } else {
            self.request_stack()
        }
    }

    /// Re-runs the initialization sequence.
    ///
    /// While polling, the request is queued and runs on the polling thread.
    pub fn reinitialize(&mut self) -> Result<()> {
        if self.is_polling() {
            self.controller.reinitialize()
        } else {
            self.initialize().map(|_| ())
        }
    }

    /// Gets whether a note is held in escrow waiting for a stack or return decision.
    ///
    /// Turns `false` as soon as the stack or return is sent to the device.
    pub fn escrowed(&self) -> bool {
        self.status.escrowed()
    }

    /// Gets whether the background polling routine is running.
    pub fn is_polling(&self) -> bool {
        self.status.polling()
    }

    /// Gets the configuration applied by the last successful initialization.
    ///
    /// Returns `Ok(None)` if the device is not initialized.
    pub fn configuration(&self) -> Result<Option<Arc<DeviceConfiguration>>> {
        self.status.configuration()
    }

    /// Gets the [PollSession], available while polling is stopped.
    pub fn session(&self) -> Option<&PollSession> {
        self.engine.as_ref().map(|e| e.session())
    }

    fn check_polling(&self) -> Result<()> {
        if self.is_polling() {
            Ok(())
        } else {
            Err(Error::NotPolling)
        }
    }

    fn engine_mut(&mut self) -> Result<&mut PollingEngine> {
        self.engine.as_mut().ok_or(Error::PollingReinit)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.stop_polling() {
                log::warn!("Failed to stop polling for {}: {err}", self.port);
            }
        }
    }
}
