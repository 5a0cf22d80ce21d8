//! Boundary to the byte-level device transport.
//!
//! Port handling, framing, and checksums live behind this trait. The transport hands back
//! decoded command responses, and every call blocks until the frame round-trip completes or
//! the transport's own timeout elapses.

use crate::command::Command;
use crate::TransportError;

/// Blocking transport to a single validator.
///
/// A handle is used by one caller at a time: the device's polling loop owns it exclusively.
pub trait DeviceTransport: Send {
    /// Opens the connection to the device on `port_id`.
    fn open(&mut self, port_id: &str) -> Result<(), TransportError>;

    /// Sends a command that carries no response data (Reset, Stack, Return, Ack).
    fn execute(&mut self, cmd: &mut Command) -> Result<(), TransportError>;

    /// Sends a command and writes the response into [Command::output_mut].
    ///
    /// Returns the number of response bytes written.
    fn get(&mut self, cmd: &mut Command) -> Result<usize, TransportError>;

    /// Writes a configuration command.
    fn set(&mut self, cmd: &mut Command) -> Result<(), TransportError>;

    /// Closes the connection.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the connection is open.
    fn is_open(&self) -> bool;
}

impl<T: DeviceTransport + ?Sized> DeviceTransport for Box<T> {
    fn open(&mut self, port_id: &str) -> Result<(), TransportError> {
        (**self).open(port_id)
    }

    fn execute(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        (**self).execute(cmd)
    }

    fn get(&mut self, cmd: &mut Command) -> Result<usize, TransportError> {
        (**self).get(cmd)
    }

    fn set(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        (**self).set(cmd)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Reads the device status, checking the response meets the command's minimum length.
///
/// Returns the number of valid bytes in [Command::output].
pub fn read_status<T: DeviceTransport + ?Sized>(
    transport: &mut T,
    cmd: &mut Command,
) -> Result<usize, TransportError> {
    cmd.clear_output();

    let len = transport.get(cmd)?.min(cmd.output().len());
    let expected = cmd.expected_min_output_len();

    if len < expected {
        Err(TransportError::ShortResponse {
            expected,
            actual: len,
        })
    } else {
        log::trace!("Status response: {:02x?}", &cmd.output()[..len]);
        Ok(len)
    }
}
