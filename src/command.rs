//! Protocol-neutral command buffers exchanged with a [DeviceTransport](crate::DeviceTransport).

use std::fmt;

use crate::protocol::{jcm::JcmInstruction, mei::MeiExtendedSubtype, mei::MeiInstruction};

/// Maximum length of a command response buffer (bytes).
pub const MAX_OUTPUT_LEN: usize = 128;

/// Logical operations understood by every protocol dialect.
///
/// A dialect maps each operation onto its own opcode, or reports it as unsupported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Reset,
    GetStatus,
    SetEnable,
    SetSecurity,
    SetInhibit,
    Stack,
    Return,
    Hold,
    Ack,
    SetDenomination,
    SetInterruptMode,
    SetOrientation,
    SetOptionalFunction,
    SetEscrowMode,
    SetPushMode,
    SetBarcodeDecoding,
    SetBarcodeInhibit,
    SetPowerup,
    SetExtendedNoteReporting,
    SetExtendedInhibits,
    SetExtendedCouponReporting,
}

impl Operation {
    /// Gets the name used to report this operation in logs and errors.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::GetStatus => "GetStatus",
            Self::SetEnable => "SetEnable",
            Self::SetSecurity => "SetSecurity",
            Self::SetInhibit => "SetInhibit",
            Self::Stack => "Stack",
            Self::Return => "Return",
            Self::Hold => "Hold",
            Self::Ack => "Ack",
            Self::SetDenomination => "SetDenomination",
            Self::SetInterruptMode => "SetInterruptMode",
            Self::SetOrientation => "SetOrientation",
            Self::SetOptionalFunction => "SetOptionalFunction",
            Self::SetEscrowMode => "SetEscrowMode",
            Self::SetPushMode => "SetPushMode",
            Self::SetBarcodeDecoding => "SetBarcodeDecoding",
            Self::SetBarcodeInhibit => "SetBarcodeInhibit",
            Self::SetPowerup => "SetPowerup",
            Self::SetExtendedNoteReporting => "SetExtendedNoteReporting",
            Self::SetExtendedInhibits => "SetExtendedInhibits",
            Self::SetExtendedCouponReporting => "SetExtendedCouponReporting",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Protocol-specific opcode carried by a [Command].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Jcm(JcmInstruction),
    Mei(MeiInstruction),
    MeiExtended(MeiExtendedSubtype),
}

impl Opcode {
    /// Gets the raw opcode byte.
    pub fn to_u8(&self) -> u8 {
        match self {
            Self::Jcm(i) => *i as u8,
            Self::Mei(i) => *i as u8,
            Self::MeiExtended(s) => *s as u8,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Jcm(i) => write!(f, "JCM {i:?} (0x{:02x})", self.to_u8()),
            Self::Mei(i) => write!(f, "MEI {i:?} (0x{:02x})", self.to_u8()),
            Self::MeiExtended(s) => write!(f, "MEI extended {s:?} (0x{:02x})", self.to_u8()),
        }
    }
}

/// A single request/response cycle with the device.
///
/// Input and output buffers have a fixed length chosen at construction. The
/// transport fills `output` on [get](crate::DeviceTransport::get) and reports
/// how many bytes it wrote.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    operation: Operation,
    opcode: Opcode,
    input: Vec<u8>,
    output: Vec<u8>,
    expected_min_output_len: usize,
}

impl Command {
    /// Creates a new [Command] with zeroed buffers.
    ///
    /// `output_len` is clamped to [MAX_OUTPUT_LEN].
    pub fn new(operation: Operation, opcode: Opcode, input_len: usize, output_len: usize) -> Self {
        Self {
            operation,
            opcode,
            input: vec![0u8; input_len],
            output: vec![0u8; output_len.min(MAX_OUTPUT_LEN)],
            expected_min_output_len: 0,
        }
    }

    /// Builder function that copies `data` into the start of the input buffer.
    ///
    /// Bytes beyond the input length are ignored.
    pub fn with_input(mut self, data: &[u8]) -> Self {
        let len = data.len().min(self.input.len());
        self.input[..len].copy_from_slice(&data[..len]);
        self
    }

    /// Builder function that sets the minimum response length the caller requires.
    pub fn with_min_output_len(mut self, len: usize) -> Self {
        self.expected_min_output_len = len.min(self.output.len());
        self
    }

    /// Gets the logical [Operation].
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Gets the protocol [Opcode].
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Gets the input buffer.
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Gets a mutable reference to the input buffer.
    pub fn input_mut(&mut self) -> &mut [u8] {
        &mut self.input
    }

    /// Gets the output buffer.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Gets a mutable reference to the output buffer, for the transport to fill.
    pub fn output_mut(&mut self) -> &mut [u8] {
        &mut self.output
    }

    /// Gets the minimum number of response bytes the caller requires.
    pub fn expected_min_output_len(&self) -> usize {
        self.expected_min_output_len
    }

    /// Clears the output buffer before reuse.
    pub fn clear_output(&mut self) {
        self.output.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}], input: {:02x?}",
            self.operation, self.opcode, self.input
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_buffers() {
        let cmd = Command::new(
            Operation::SetSecurity,
            Opcode::Jcm(JcmInstruction::SetSecurity),
            2,
            MAX_OUTPUT_LEN * 2,
        )
        .with_input(&[0x01, 0x02, 0x03]);

        assert_eq!(cmd.input(), [0x01, 0x02].as_ref());
        assert_eq!(cmd.output().len(), MAX_OUTPUT_LEN);
        assert_eq!(cmd.opcode().to_u8(), 0xc1);
    }

    #[test]
    fn test_min_output_len_clamped() {
        let cmd = Command::new(
            Operation::GetStatus,
            Opcode::Mei(MeiInstruction::StdHostToAcc),
            0,
            4,
        )
        .with_min_output_len(5);

        assert_eq!(cmd.expected_min_output_len(), 4);
    }
}
