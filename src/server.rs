use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::{fmt, thread, time};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    continue_on_err, DeviceEntry, DeviceHandle, DeviceTransport, DomainEvent, Error, EventSink,
    Result, ServerConfig,
};

const BUS_TIMEOUT_MS: u64 = 5_000;
const BUS_CAPACITY: usize = 1024;
const SERVE_INTERVAL_MS: u64 = 250;
/// Default number of initialization attempts per device.
pub const MAX_RESETS: u64 = 10;

/// A [DomainEvent] tagged with the port of the device that emitted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceEvent {
    pub port: String,
    pub event: DomainEvent,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.port, self.event)
    }
}

/// [EventSink] broadcasting every event on a shared [Bus](bus::Bus).
pub struct BusSink {
    port: String,
    bus: Arc<Mutex<bus::Bus<DeviceEvent>>>,
}

impl BusSink {
    /// Creates a new [BusSink] tagging events with `port`.
    pub fn new(port: &str, bus: Arc<Mutex<bus::Bus<DeviceEvent>>>) -> Self {
        Self {
            port: port.into(),
            bus,
        }
    }
}

impl EventSink for BusSink {
    fn deliver(&mut self, event: DomainEvent) {
        let msg = DeviceEvent {
            port: self.port.clone(),
            event,
        };

        match self
            .bus
            .try_lock_for(time::Duration::from_millis(BUS_TIMEOUT_MS))
        {
            Some(mut bus) => {
                if let Err(msg) = bus.try_broadcast(msg) {
                    log::warn!("Event bus full, dropping event: {msg}");
                }
            }
            None => log::warn!("Timed out waiting for event bus, dropping event: {msg}"),
        }
    }
}

/// Server operating every configured validator.
///
/// Events from all devices are broadcast on one bus; downstream consumers (printer, LEDs,
/// client bridge) each attach their own reader with [add_rx](Self::add_rx).
pub struct Server {
    handles: Vec<DeviceHandle>,
    bus: Arc<Mutex<bus::Bus<DeviceEvent>>>,
    max_resets: u64,
}

impl Server {
    /// Creates a new [Server], opening a transport for each configured device.
    ///
    /// `connect` builds the transport for a [DeviceEntry].
    pub fn new<F, T>(config: &ServerConfig, mut connect: F) -> Result<Self>
    where
        F: FnMut(&DeviceEntry) -> Result<T>,
        T: DeviceTransport + 'static,
    {
        if config.devices.is_empty() {
            return Err(Error::Config("no devices configured".into()));
        }

        let bus = Arc::new(Mutex::new(bus::Bus::new(BUS_CAPACITY)));
        let mut handles = Vec::with_capacity(config.devices.len());

        for entry in config.devices.iter() {
            let transport = connect(entry)?;
            let sink = BusSink::new(entry.port.as_str(), Arc::clone(&bus));

            let mut handle = DeviceHandle::new(entry.port.as_str(), transport, entry.protocol, sink)
                .with_poll_config(config.poll.clone())
                .with_configuration(entry.configuration.clone());

            handle.open()?;

            log::info!("Opened {} device on {}", entry.protocol, entry.port);

            handles.push(handle);
        }

        Ok(Self {
            handles,
            bus,
            max_resets: MAX_RESETS,
        })
    }

    /// Builder function that sets the number of initialization attempts per device.
    pub fn with_max_resets(mut self, max_resets: u64) -> Self {
        self.max_resets = max_resets.max(1);
        self
    }

    /// Gets the [DeviceHandle]s for every device.
    pub fn handles(&self) -> &[DeviceHandle] {
        self.handles.as_ref()
    }

    /// Gets the [DeviceHandle] for the device on `port`.
    pub fn handle(&self, port: &str) -> Option<&DeviceHandle> {
        self.handles.iter().find(|h| h.port() == port)
    }

    /// Gets a mutable reference to the [DeviceHandle] for the device on `port`.
    pub fn handle_mut(&mut self, port: &str) -> Option<&mut DeviceHandle> {
        self.handles.iter_mut().find(|h| h.port() == port)
    }

    /// Adds a reader to the event bus.
    ///
    /// Readers only see events broadcast after they were added.
    pub fn add_rx(&self) -> Result<bus::BusReader<DeviceEvent>> {
        self.bus
            .try_lock_for(time::Duration::from_millis(BUS_TIMEOUT_MS))
            .map(|mut bus| bus.add_rx())
            .ok_or(Error::Timeout("waiting for event bus".into()))
    }

    /// Initializes every device, re-running the sequence up to the reset limit.
    pub fn initialize(&mut self) -> Result<()> {
        for handle in self.handles.iter_mut() {
            let mut reset_count = 0;

            while let Err(err) = handle.initialize() {
                log::error!("error initializing device on {}: {err}", handle.port());

                reset_count += 1;

                if reset_count >= self.max_resets {
                    log::error!("maximum resets reached: {}", self.max_resets);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Starts polling every device.
    pub fn start(&mut self) -> Result<()> {
        for handle in self.handles.iter_mut() {
            handle.start_polling()?;
        }

        Ok(())
    }

    /// Stops polling every device that is still polling.
    pub fn stop(&mut self) {
        for handle in self.handles.iter_mut() {
            continue_on_err!(handle.stop_polling(), "Failed to stop polling");
        }
    }

    /// Initializes and polls every device until `stop` is raised.
    pub fn serve(&mut self, stop: &AtomicBool) -> Result<()> {
        self.initialize()?;
        self.start()?;

        let mut stopped = vec![false; self.handles.len()];

        while !stop.load(Ordering::Relaxed) {
            for (handle, stopped) in self.handles.iter().zip(stopped.iter_mut()) {
                if !handle.is_polling() && !*stopped {
                    log::warn!("Polling loop for {} exited", handle.port());
                    *stopped = true;
                }
            }

            thread::sleep(time::Duration::from_millis(SERVE_INTERVAL_MS));
        }

        self.stop();

        Ok(())
    }
}
