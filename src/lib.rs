//! Host-side control of banknote and ticket validators.
//!
//! A [DeviceHandle] brings a validator through reset and configuration with the
//! [InitializationSequencer], then runs a [PollingEngine] on a dedicated thread, turning
//! repeated status reads into [DomainEvent]s. Both supported protocols share one state
//! machine, parameterized over a [ProtocolDialect].

#[macro_use]
mod macros;

pub mod codec;
pub mod command;
pub mod config;
pub mod device_handle;
pub mod error;
pub mod event;
pub mod mock;
pub mod protocol;
pub mod retry;
pub mod sequencer;
pub mod server;
pub mod transport;

pub use codec::{DecodedEvent, RejectReason, ValidatorState};
pub use command::{Command, Opcode, Operation};
pub use config::{
    DeviceConfiguration, DeviceEntry, NoteReporting, PollConfig, PollMode, ServerConfig,
};
pub use device_handle::{ControlCommand, Controller, DeviceHandle, PollSession, PollingEngine};
pub use error::{Error, Result, TransportError};
pub use event::{Dispatch, DomainEvent, EventHandler, EventSink, Note, PushEventReceiver};
pub use protocol::{Protocol, ProtocolDialect};
pub use retry::RetryPolicy;
pub use sequencer::{InitializationSequencer, Ready, SequencerState};
pub use server::{BusSink, DeviceEvent, Server};
pub use transport::DeviceTransport;
