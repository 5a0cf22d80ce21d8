#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use parking_lot::{Mutex, MutexGuard};

use validator_server::mock::MockDevice;
use validator_server::{
    Controller, DeviceConfiguration, DomainEvent, Error, PollConfig, PollMode, PollingEngine,
    Protocol, PushEventReceiver, Result, RetryPolicy,
};

static INIT: AtomicBool = AtomicBool::new(false);
static LOCK: Mutex<()> = Mutex::new(());

/// Interval between polls in threaded tests (milliseconds).
pub const TEST_POLL_MS: u64 = 5;
/// Upper bound on waiting for a threaded test to make progress (milliseconds).
pub const TEST_TIMEOUT_MS: u64 = 5_000;

fn is_init() -> bool {
    INIT.load(Ordering::Relaxed)
}

fn set_init(val: bool) {
    INIT.store(val, Ordering::SeqCst);
}

pub fn init() -> Result<MutexGuard<'static, ()>> {
    if !is_init() {
        set_init(true);
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
            .is_test(true)
            .try_init()
            .ok();
    }

    LOCK.try_lock_for(time::Duration::from_secs(5))
        .ok_or(Error::Io("lock test mutex".into()))
}

/// Poll settings with no delays, so tests run at the speed of their ticks.
pub fn poll_config(mode: PollMode) -> PollConfig {
    PollConfig::default()
        .with_mode(mode)
        .with_poll_interval(time::Duration::from_millis(TEST_POLL_MS))
        .with_init_retry(RetryPolicy::new(30, time::Duration::ZERO))
}

/// Channel table used by tests: denomination index `i` is worth `VALUES[i]`.
pub const VALUES: [u32; 8] = [1, 2, 5, 10, 20, 50, 100, 200];

pub fn configuration() -> DeviceConfiguration {
    DeviceConfiguration {
        channel_values: VALUES.to_vec(),
        ..Default::default()
    }
}

/// An initialized engine, its event queue, and its command queue.
pub struct Harness {
    pub engine: PollingEngine,
    pub events: PushEventReceiver,
    pub controller: Controller,
}

impl Harness {
    /// Builds and initializes an engine over `device`.
    ///
    /// The first frame of the script is consumed by initialization.
    pub fn new(device: MockDevice, protocol: Protocol, poll: PollConfig) -> Result<Self> {
        let (tx, events) = PushEventReceiver::channel();
        let (controller, commands) = Controller::channel();

        let mut engine = PollingEngine::new(device, protocol, tx, commands)
            .with_poll_config(poll)
            .with_configuration(configuration());

        engine.initialize()?;

        assert_eq!(events.drain(), vec![DomainEvent::DeviceReady]);

        Ok(Self {
            engine,
            events,
            controller,
        })
    }

    /// Runs `count` polling ticks.
    pub fn ticks(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.engine.tick()?;
        }

        Ok(())
    }
}

/// Polls `f` until it returns `true`, or [TEST_TIMEOUT_MS] elapses.
pub fn wait_for<F: FnMut() -> bool>(mut f: F) -> bool {
    let now = time::Instant::now();

    while now.elapsed() < time::Duration::from_millis(TEST_TIMEOUT_MS) {
        if f() {
            return true;
        }
        thread::sleep(time::Duration::from_millis(TEST_POLL_MS));
    }

    f()
}

/// Collects events until one matches `done`, or [TEST_TIMEOUT_MS] elapses.
pub fn collect_until<F: Fn(&DomainEvent) -> bool>(
    rx: &PushEventReceiver,
    done: F,
) -> Vec<DomainEvent> {
    let now = time::Instant::now();
    let mut events = Vec::new();

    while now.elapsed() < time::Duration::from_millis(TEST_TIMEOUT_MS) {
        if let Ok(event) = rx.pop_event() {
            let finished = done(&event);
            events.push(event);
            if finished {
                break;
            }
        }
    }

    events
}
