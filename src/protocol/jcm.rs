//! Command table for the ID003-style protocol (Protocol J).

use crate::command::{Command, Opcode, Operation, MAX_OUTPUT_LEN};
use crate::DeviceConfiguration;

use super::{Protocol, ProtocolDialect};

/// Escrow code identifying a barcode ticket rather than a banknote.
pub const ESCROW_TICKET: u8 = 0x6f;

/// Discrete status codes returned in the first byte of a status response.
pub mod status {
    pub const ENABLE: u8 = 0x11;
    pub const ACCEPTING: u8 = 0x12;
    pub const ESCROW: u8 = 0x13;
    pub const STACKING: u8 = 0x14;
    pub const VEND_VALID: u8 = 0x15;
    pub const STACKED: u8 = 0x16;
    pub const REJECTING: u8 = 0x17;
    pub const RETURNING: u8 = 0x18;
    pub const HOLDING: u8 = 0x19;
    pub const DISABLED: u8 = 0x1a;
    pub const INITIALIZING: u8 = 0x1b;
    pub const POWER_UP: u8 = 0x40;
    pub const POWER_UP_WITH_BILL_IN_ACCEPTOR: u8 = 0x41;
    pub const POWER_UP_WITH_BILL_IN_STACKER: u8 = 0x42;
    pub const STACKER_FULL: u8 = 0x43;
    pub const STACKER_OPEN: u8 = 0x44;
    pub const JAM_IN_ACCEPTOR: u8 = 0x45;
    pub const JAM_IN_STACKER: u8 = 0x46;
    pub const PAUSE: u8 = 0x47;
    pub const CHEATED: u8 = 0x48;
    pub const FAILURE: u8 = 0x49;
    pub const COMMUNICATION_ERROR: u8 = 0x4a;
}

/// Protocol J instruction opcodes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JcmInstruction {
    GetStatus = 0x11,
    Reset = 0x40,
    Stack1 = 0x41,
    Stack2 = 0x42,
    Return = 0x43,
    Hold = 0x44,
    Wait = 0x45,
    Ack = 0x50,
    SetEnableDisable = 0xc0,
    SetSecurity = 0xc1,
    SetCommunicationMode = 0xc2,
    SetInhibit = 0xc3,
    SetDirection = 0xc4,
    SetOptionalFunction = 0xc5,
    SetBarcodeFunction = 0xc6,
    SetBarInhibit = 0xc7,
}

/// [ProtocolDialect] for Protocol J devices.
#[derive(Clone, Copy, Debug, Default)]
pub struct Jcm;

impl Jcm {
    fn op(operation: Operation, instruction: JcmInstruction, input_len: usize) -> Command {
        Command::new(operation, Opcode::Jcm(instruction), input_len, 0)
    }
}

impl ProtocolDialect for Jcm {
    fn protocol(&self) -> Protocol {
        Protocol::Jcm
    }

    fn command(&self, operation: Operation, config: &DeviceConfiguration) -> Option<Command> {
        use JcmInstruction as I;

        let cmd = match operation {
            Operation::Reset => Self::op(operation, I::Reset, 0),
            Operation::GetStatus => Command::new(
                operation,
                Opcode::Jcm(I::GetStatus),
                0,
                MAX_OUTPUT_LEN,
            )
            .with_min_output_len(1),
            Operation::Stack => Self::op(operation, I::Stack1, 0),
            Operation::Return => Self::op(operation, I::Return, 0),
            Operation::Hold => Self::op(operation, I::Hold, 0),
            Operation::Ack => Self::op(operation, I::Ack, 0),
            Operation::SetEnable => Self::op(operation, I::SetEnableDisable, 2)
                .with_input(&config.enable_mask.to_le_bytes()),
            Operation::SetSecurity => {
                Self::op(operation, I::SetSecurity, 2).with_input(&config.security_mask.to_le_bytes())
            }
            Operation::SetOptionalFunction => Self::op(operation, I::SetOptionalFunction, 2)
                .with_input(&config.optional_function.to_le_bytes()),
            Operation::SetInhibit => {
                Self::op(operation, I::SetInhibit, 1).with_input(&[config.inhibit])
            }
            Operation::SetBarcodeDecoding => Self::op(operation, I::SetBarcodeFunction, 2)
                .with_input(&[config.barcode_decoding as u8, config.barcode_function]),
            Operation::SetBarcodeInhibit => {
                Self::op(operation, I::SetBarInhibit, 1).with_input(&[config.barcode_inhibit])
            }
            Operation::SetDenomination
            | Operation::SetInterruptMode
            | Operation::SetOrientation
            | Operation::SetEscrowMode
            | Operation::SetPushMode
            | Operation::SetPowerup
            | Operation::SetExtendedNoteReporting
            | Operation::SetExtendedInhibits
            | Operation::SetExtendedCouponReporting => return None,
        };

        Some(cmd)
    }

    fn acknowledges_vend(&self) -> bool {
        true
    }
}
