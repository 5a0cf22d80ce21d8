//! Command table for the EBDS-style protocol (Protocol M).

use crate::command::{Command, Opcode, Operation, MAX_OUTPUT_LEN};
use crate::{DeviceConfiguration, NoteReporting};

use super::{Protocol, ProtocolDialect};

/// Bits of the little-endian 32-bit status word.
pub mod status {
    pub const IDLING: u32 = 0x0000_0001;
    pub const ACCEPTING: u32 = 0x0000_0002;
    pub const ESCROWED: u32 = 0x0000_0004;
    pub const STACKING: u32 = 0x0000_0008;
    pub const STACKED: u32 = 0x0000_0010;
    pub const RETURNING: u32 = 0x0000_0020;
    pub const RETURNED: u32 = 0x0000_0040;
    pub const CHEATED: u32 = 0x0000_0100;
    pub const REJECTED: u32 = 0x0000_0200;
    pub const JAMMED: u32 = 0x0000_0400;
    pub const STACKER_FULL: u32 = 0x0000_0800;
    pub const CASSETTE_ATTACHED: u32 = 0x0000_1000;
    pub const PAUSED: u32 = 0x0000_4000;
    pub const POWER_UP: u32 = 0x0001_0000;
    pub const INVALID_COMMAND: u32 = 0x0002_0000;
    pub const FAILURE: u32 = 0x0004_0000;
}

/// Protocol M instruction opcodes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeiInstruction {
    StdHostToAcc = 0x10,
    Stack = 0x11,
    Return = 0x12,
    SetDenomination = 0x20,
    SetSpecialInterruptMode = 0x21,
    SetSecurity = 0x22,
    SetOrientation = 0x23,
    SetEscrowMode = 0x24,
    SetPushMode = 0x25,
    SetBarcodeDecoding = 0x26,
    SetPowerup = 0x27,
    SetExtendedNoteReporting = 0x28,
    SetExtendedCouponReporting = 0x29,
    SoftReset = 0x60,
    ExtendedMsgSet = 0x70,
}

/// Subtypes of the Protocol M extended message set.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeiExtendedSubtype {
    ExtendedBarcodeReply = 0x01,
    ExtendedNoteSpecification = 0x02,
    SetExtendedNoteInhibits = 0x03,
}

/// Length of the per-denomination extended inhibit mask (bytes).
pub const EXTENDED_INHIBITS_LEN: usize = 8;

/// [ProtocolDialect] for Protocol M devices.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mei;

impl Mei {
    fn op(operation: Operation, instruction: MeiInstruction, input: &[u8]) -> Command {
        Command::new(operation, Opcode::Mei(instruction), input.len(), 0).with_input(input)
    }
}

impl ProtocolDialect for Mei {
    fn protocol(&self) -> Protocol {
        Protocol::Mei
    }

    fn command(&self, operation: Operation, config: &DeviceConfiguration) -> Option<Command> {
        use MeiInstruction as I;

        let cmd = match operation {
            Operation::Reset => Self::op(operation, I::SoftReset, &[]),
            // Input length 0: the transport fills in the current configuration bytes.
            Operation::GetStatus => Command::new(
                operation,
                Opcode::Mei(I::StdHostToAcc),
                0,
                MAX_OUTPUT_LEN,
            )
            .with_min_output_len(5),
            Operation::Stack => Self::op(operation, I::Stack, &[]),
            Operation::Return => Self::op(operation, I::Return, &[]),
            Operation::SetDenomination => {
                Self::op(operation, I::SetDenomination, &[config.denomination_mask])
            }
            Operation::SetInterruptMode => {
                Self::op(operation, I::SetSpecialInterruptMode, &[config.interrupt_mode])
            }
            Operation::SetSecurity => {
                Self::op(operation, I::SetSecurity, &[config.security_mask as u8])
            }
            Operation::SetOrientation => Self::op(
                operation,
                I::SetOrientation,
                &config.orientation_mask.to_le_bytes(),
            ),
            Operation::SetEscrowMode => {
                Self::op(operation, I::SetEscrowMode, &[config.escrow_enabled as u8])
            }
            Operation::SetPushMode => Self::op(operation, I::SetPushMode, &[config.push_mode as u8]),
            Operation::SetBarcodeDecoding => Self::op(
                operation,
                I::SetBarcodeDecoding,
                &[config.barcode_decoding as u8],
            ),
            Operation::SetPowerup => {
                Self::op(operation, I::SetPowerup, &config.powerup_mode.to_le_bytes())
            }
            Operation::SetExtendedNoteReporting => Self::op(
                operation,
                I::SetExtendedNoteReporting,
                &[config.note_reporting.mode()],
            ),
            Operation::SetExtendedInhibits => match config.note_reporting {
                NoteReporting::Plain => return None,
                NoteReporting::Cfsc | NoteReporting::Scr => Command::new(
                    operation,
                    Opcode::MeiExtended(MeiExtendedSubtype::SetExtendedNoteInhibits),
                    EXTENDED_INHIBITS_LEN,
                    0,
                )
                .with_input(&config.extended_inhibits),
            },
            Operation::SetExtendedCouponReporting => Self::op(
                operation,
                I::SetExtendedCouponReporting,
                &[config.coupon_reporting as u8],
            ),
            Operation::SetEnable
            | Operation::SetInhibit
            | Operation::Hold
            | Operation::Ack
            | Operation::SetOptionalFunction
            | Operation::SetBarcodeInhibit => return None,
        };

        Some(cmd)
    }

    fn acknowledges_vend(&self) -> bool {
        false
    }
}
