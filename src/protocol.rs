//! Protocol dialects: the command table and status decoding for each supported protocol.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::codec::{self, DecodedEvent, RejectReason, ValidatorState};
use crate::command::{Command, Operation};
use crate::{DeviceConfiguration, Error, Result};

pub mod jcm;
pub mod mei;

pub use jcm::Jcm;
pub use mei::Mei;

/// Serial protocol spoken by a validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// ID003-style protocol with discrete single-byte status codes.
    Jcm,
    /// EBDS-style protocol with a 32-bit status bitmask.
    Mei,
}

impl Protocol {
    /// Gets the [ProtocolDialect] implementing this protocol.
    pub fn dialect(&self) -> Box<dyn ProtocolDialect> {
        match self {
            Self::Jcm => Box::new(Jcm),
            Self::Mei => Box::new(Mei),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Jcm => write!(f, "jcm"),
            Self::Mei => write!(f, "mei"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "jcm" | "id003" | "j" => Ok(Self::Jcm),
            "mei" | "ebds" | "m" => Ok(Self::Mei),
            _ => Err(Error::Config(format!("unknown protocol: {s}"))),
        }
    }
}

/// Capability bundle the polling engine and sequencer are parameterized over.
///
/// Combines the protocol's command table with its status decoding, so the state machine
/// itself never branches on the protocol.
pub trait ProtocolDialect: Send + Sync {
    /// Gets the [Protocol] this dialect implements.
    fn protocol(&self) -> Protocol;

    /// Builds the [Command] for a logical operation, with any payload taken from `config`.
    ///
    /// Returns `None` if the protocol has no equivalent of the operation.
    fn command(&self, operation: Operation, config: &DeviceConfiguration) -> Option<Command>;

    /// Whether the device expects the host to acknowledge a vend-valid report.
    fn acknowledges_vend(&self) -> bool;

    /// Builds the [Command] for an operation the caller requires.
    fn require(&self, operation: Operation, config: &DeviceConfiguration) -> Result<Command> {
        self.command(operation, config)
            .ok_or(Error::Unsupported(operation))
    }

    /// Decodes a raw status response.
    fn decode(&self, raw: &[u8]) -> DecodedEvent {
        codec::decode(self.protocol(), raw)
    }

    /// Normalizes a decoded status response.
    fn state(&self, event: &DecodedEvent) -> ValidatorState {
        codec::normalize(self.protocol(), event)
    }

    /// Gets the reason carried by a rejection response.
    fn reject_reason(&self, raw: &[u8]) -> RejectReason {
        codec::reject_reason(self.protocol(), raw)
    }

    /// Gets the raw status code for diagnostics.
    fn status_code(&self, raw: &[u8]) -> u32 {
        codec::status_code(self.protocol(), raw)
    }
}
