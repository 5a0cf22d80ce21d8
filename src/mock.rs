//! Scripted in-memory [DeviceTransport] for demos and tests.
//!
//! ```
//! use validator_server::mock::{self, MockDevice};
//! use validator_server::protocol::jcm::status;
//!
//! let device = MockDevice::new()
//!     .then_frame(mock::jcm_status(status::ENABLE))
//!     .then_frame(mock::jcm_escrow(2));
//! let calls = device.calls();
//! # let _ = (device, calls);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec;
use crate::command::{Command, Operation};
use crate::protocol::{jcm, mei, Protocol};
use crate::{DeviceTransport, TransportError};

/// A transport call recorded by [MockDevice].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Open(String),
    Execute(Operation),
    Get(Operation),
    Set(Operation, Vec<u8>),
    Close,
}

impl Call {
    /// Gets the [Operation] carried by the call, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Execute(op) | Self::Get(op) | Self::Set(op, _) => Some(*op),
            Self::Open(_) | Self::Close => None,
        }
    }
}

/// Shared view of the calls made to a [MockDevice].
///
/// Stays readable after the device has moved into a polling thread.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().push(call);
    }

    /// Gets a copy of every recorded call.
    pub fn snapshot(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    /// Gets the operations of every recorded call, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.0.lock().iter().filter_map(Call::operation).collect()
    }

    /// Counts the calls carrying `operation`.
    pub fn count(&self, operation: Operation) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|c| c.operation() == Some(operation))
            .count()
    }

    /// Forgets every recorded call.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

#[derive(Clone, Debug)]
enum Step {
    Frame(Vec<u8>),
    Fail(TransportError),
}

/// Transport answering status reads from a script of frames.
///
/// Once the script is used up, the last frame is repeated, unless the script was marked
/// [looping](Self::looping).
#[derive(Debug, Default)]
pub struct MockDevice {
    script: VecDeque<Step>,
    replay: Vec<Step>,
    looping: bool,
    last: Option<Vec<u8>>,
    failures: HashMap<Operation, TransportError>,
    reactions: HashMap<Operation, Vec<Vec<u8>>>,
    calls: CallLog,
    open: bool,
}

impl MockDevice {
    /// Creates a new [MockDevice] with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a [MockDevice] answering with each of `frames` in turn.
    pub fn with_frames<I: IntoIterator<Item = Vec<u8>>>(frames: I) -> Self {
        frames.into_iter().fold(Self::new(), Self::then_frame)
    }

    /// Builder function that appends a status frame to the script.
    pub fn then_frame(mut self, frame: Vec<u8>) -> Self {
        self.push(Step::Frame(frame));
        self
    }

    /// Builder function that appends `count` copies of a status frame.
    pub fn then_repeat(mut self, frame: Vec<u8>, count: usize) -> Self {
        for _ in 0..count {
            self.push(Step::Frame(frame.clone()));
        }
        self
    }

    /// Builder function that appends a failed status read to the script.
    pub fn then_error(mut self, err: TransportError) -> Self {
        self.push(Step::Fail(err));
        self
    }

    /// Builder function that replays the script from the start once it is used up.
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Builder function that fails every call carrying `operation`.
    pub fn fail_on(mut self, operation: Operation, err: TransportError) -> Self {
        self.failures.insert(operation, err);
        self
    }

    /// Builder function that replaces the rest of the script with `frames` whenever
    /// `operation` is executed.
    pub fn on_execute(mut self, operation: Operation, frames: Vec<Vec<u8>>) -> Self {
        self.reactions.insert(operation, frames);
        self
    }

    /// Gets a handle to the recorded calls.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    fn push(&mut self, step: Step) {
        self.replay.push(step.clone());
        self.script.push_back(step);
    }

    fn check(&self, operation: Operation) -> Result<(), TransportError> {
        match self.failures.get(&operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn next_step(&mut self) -> Option<Step> {
        if self.script.is_empty() && self.looping {
            self.script.extend(self.replay.iter().cloned());
        }

        match self.script.pop_front() {
            Some(step) => Some(step),
            None => self.last.clone().map(Step::Frame),
        }
    }
}

impl DeviceTransport for MockDevice {
    fn open(&mut self, port_id: &str) -> Result<(), TransportError> {
        self.calls.push(Call::Open(port_id.into()));
        self.open = true;
        Ok(())
    }

    fn execute(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        let operation = cmd.operation();
        self.calls.push(Call::Execute(operation));
        self.check(operation)?;

        if let Some(frames) = self.reactions.get(&operation) {
            self.script = frames.iter().cloned().map(Step::Frame).collect();
        }

        Ok(())
    }

    fn get(&mut self, cmd: &mut Command) -> Result<usize, TransportError> {
        let operation = cmd.operation();
        self.calls.push(Call::Get(operation));
        self.check(operation)?;

        if operation != Operation::GetStatus {
            return Ok(0);
        }

        match self.next_step() {
            Some(Step::Frame(frame)) => {
                let out = cmd.output_mut();
                let len = frame.len().min(out.len());
                out[..len].copy_from_slice(&frame[..len]);
                self.last = Some(frame);
                Ok(len)
            }
            Some(Step::Fail(err)) => Err(err),
            None => Err(TransportError::Timeout),
        }
    }

    fn set(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        let operation = cmd.operation();
        self.calls.push(Call::Set(operation, cmd.input().to_vec()));
        self.check(operation)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::Close);
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Builds a looping demo device that accepts a note, holds it in escrow, and stacks or
/// returns it on command.
pub fn demo(protocol: Protocol) -> MockDevice {
    let (idle, accepting, escrow, stacked, returned) = match protocol {
        Protocol::Jcm => (
            jcm_status(jcm::status::ENABLE),
            jcm_status(jcm::status::ACCEPTING),
            jcm_escrow(2),
            vec![
                jcm_status(jcm::status::STACKING),
                jcm_status(jcm::status::VEND_VALID),
                jcm_status(jcm::status::STACKED),
                jcm_status(jcm::status::ENABLE),
            ],
            vec![
                jcm_status(jcm::status::RETURNING),
                jcm_status(jcm::status::ENABLE),
            ],
        ),
        Protocol::Mei => (
            mei_idle(),
            mei_status(mei::status::ACCEPTING | mei::status::CASSETTE_ATTACHED),
            mei_escrow(2),
            vec![
                mei_status(mei::status::STACKING | mei::status::CASSETTE_ATTACHED),
                mei_status(
                    mei::status::STACKED | mei::status::IDLING | mei::status::CASSETTE_ATTACHED,
                ),
                mei_idle(),
            ],
            vec![
                mei_status(mei::status::RETURNED | mei::status::CASSETTE_ATTACHED),
                mei_idle(),
            ],
        ),
    };

    MockDevice::new()
        .then_repeat(idle, 25)
        .then_frame(accepting)
        .then_repeat(escrow, 100)
        .on_execute(Operation::Stack, stacked)
        .on_execute(Operation::Return, returned)
        .looping()
}

/// Builds a Protocol J status frame carrying a single status code.
pub fn jcm_status(code: u8) -> Vec<u8> {
    vec![code]
}

/// Builds a Protocol J escrow frame for a denomination index (0-7).
pub fn jcm_escrow(denomination: u8) -> Vec<u8> {
    vec![jcm::status::ESCROW, 0x62, 0x00, (denomination & 0x07) << 3]
}

/// Builds a Protocol J ticket escrow frame.
pub fn jcm_ticket(barcode: &str) -> Vec<u8> {
    let mut frame = vec![jcm::status::ESCROW, jcm::ESCROW_TICKET];
    frame.extend_from_slice(barcode.as_bytes());
    frame
}

/// Builds a Protocol J rejecting frame carrying a reject reason code.
pub fn jcm_reject(reason: u8) -> Vec<u8> {
    vec![jcm::status::REJECTING, reason]
}

/// Builds a short-form Protocol M status frame.
pub fn mei_status(word: u32) -> Vec<u8> {
    let mut frame = vec![0x20];
    frame.extend_from_slice(&word.to_le_bytes());
    frame.push(0x00);
    frame
}

/// Builds an idle Protocol M status frame, with the cash box attached.
pub fn mei_idle() -> Vec<u8> {
    mei_status(mei::status::IDLING | mei::status::CASSETTE_ATTACHED)
}

/// Builds a short-form Protocol M escrow frame for a denomination index (0-7).
pub fn mei_escrow(denomination: u8) -> Vec<u8> {
    let mut frame = mei_status(mei::status::ESCROWED | mei::status::CASSETTE_ATTACHED);
    frame[3] |= (denomination & 0x07) << 3;
    frame
}

/// Builds an extended-form (0x70) Protocol M escrow frame for a denomination index (0-7).
pub fn mei_extended_escrow(denomination: u8) -> Vec<u8> {
    let mut frame = vec![0u8; codec::MEI_EXTENDED_LEN];
    frame[0] = mei::MeiInstruction::ExtendedMsgSet as u8;
    frame[1] = mei::MeiExtendedSubtype::ExtendedNoteSpecification as u8;
    frame[2..6].copy_from_slice(&mei::status::ESCROWED.to_le_bytes());
    frame[3] |= (denomination & 0x07) << 3;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, DecodedEvent};
    use crate::protocol::{Jcm, ProtocolDialect};
    use crate::DeviceConfiguration;

    fn status_cmd() -> Command {
        Jcm.command(Operation::GetStatus, &DeviceConfiguration::default())
            .unwrap()
    }

    #[test]
    fn test_script_repeats_last_frame() {
        let mut device = MockDevice::with_frames([jcm_status(0x1b), jcm_status(0x11)]);
        let mut cmd = status_cmd();

        for exp in [0x1b, 0x11, 0x11, 0x11] {
            assert_eq!(device.get(&mut cmd), Ok(1));
            assert_eq!(cmd.output()[0], exp);
        }
    }

    #[test]
    fn test_script_looping() {
        let mut device = MockDevice::with_frames([jcm_status(0x11), jcm_status(0x12)]).looping();
        let mut cmd = status_cmd();

        for exp in [0x11, 0x12, 0x11, 0x12] {
            device.get(&mut cmd).unwrap();
            assert_eq!(cmd.output()[0], exp);
        }
    }

    #[test]
    fn test_empty_script_times_out() {
        let mut device = MockDevice::new();

        assert_eq!(device.get(&mut status_cmd()), Err(TransportError::Timeout));
    }

    #[test]
    fn test_fail_on_and_call_log() {
        let mut device = MockDevice::new().fail_on(Operation::Ack, TransportError::Nak(0x15));
        let calls = device.calls();
        let config = DeviceConfiguration::default();

        let mut ack = Jcm.command(Operation::Ack, &config).unwrap();
        let mut inhibit = Jcm.command(Operation::SetInhibit, &config).unwrap();

        assert_eq!(device.execute(&mut ack), Err(TransportError::Nak(0x15)));
        assert_eq!(device.set(&mut inhibit), Ok(()));

        assert_eq!(
            calls.snapshot(),
            vec![
                Call::Execute(Operation::Ack),
                Call::Set(Operation::SetInhibit, vec![0x00]),
            ]
        );
        assert_eq!(calls.count(Operation::Ack), 1);
    }

    #[test]
    fn test_frame_helpers_decode() {
        assert_eq!(
            codec::decode(Protocol::Mei, &mei_escrow(5)),
            DecodedEvent::Escrowed {
                denomination_index: Some(5),
                barcode: None,
            }
        );
        assert_eq!(
            codec::decode(Protocol::Jcm, &jcm_escrow(3)),
            DecodedEvent::Escrowed {
                denomination_index: Some(3),
                barcode: None,
            }
        );
    }

    #[test]
    fn test_on_execute_replaces_script() {
        let config = DeviceConfiguration::default();
        let mut device = MockDevice::with_frames([jcm_escrow(1)])
            .on_execute(Operation::Return, vec![jcm_status(0x18), jcm_status(0x11)]);
        let mut cmd = status_cmd();

        device.get(&mut cmd).unwrap();
        device.get(&mut cmd).unwrap();
        assert_eq!(cmd.output()[0], jcm::status::ESCROW);

        device
            .execute(&mut Jcm.command(Operation::Return, &config).unwrap())
            .unwrap();

        for exp in [0x18, 0x11, 0x11] {
            device.get(&mut cmd).unwrap();
            assert_eq!(cmd.output()[0], exp);
        }
    }
}
