//! Decodes raw status responses into domain meaning.
//!
//! Every function in this module is pure: the same input bytes always decode to the same value.

use std::fmt;

use serde::Serialize;

use crate::protocol::{jcm, mei, Protocol};

/// Byte offset holding the escrowed denomination index.
pub const DENOMINATION_BYTE: usize = 3;
/// Bits of the denomination byte holding the denomination index.
pub const DENOMINATION_MASK: u8 = 0x38;
/// Shift applied after masking the denomination byte.
pub const DENOMINATION_SHIFT: u8 = 3;
/// Offset of the barcode payload in an extended barcode reply.
pub const BARCODE_OFFSET: usize = 8;
/// Maximum number of barcode characters.
pub const BARCODE_MAX_LEN: usize = 20;
/// Blank fill byte padding a barcode payload.
pub const BARCODE_PAD: u8 = 0x28;

/// Minimum length of a short-form Protocol M status response.
pub const MEI_SHORT_LEN: usize = 5;
/// Minimum length of an extended-form Protocol M status response.
pub const MEI_EXTENDED_LEN: usize = 10;

/// Domain meaning extracted from a single status response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedEvent {
    /// A note or ticket is held in escrow.
    Escrowed {
        denomination_index: Option<u8>,
        barcode: Option<String>,
    },
    /// A status response carrying no escrow information.
    StatusOnly { raw: u32 },
    /// A response too short or malformed to interpret.
    Unrecognized { raw_bytes: Vec<u8> },
}

impl DecodedEvent {
    /// Gets whether the response reports a note in escrow.
    pub fn is_escrowed(&self) -> bool {
        matches!(self, Self::Escrowed { .. })
    }
}

impl fmt::Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Escrowed {
                denomination_index,
                barcode,
            } => write!(
                f,
                "Escrowed {{ denomination: {denomination_index:?}, barcode: {barcode:?} }}"
            ),
            Self::StatusOnly { raw } => write!(f, "Status 0x{raw:08x}"),
            Self::Unrecognized { raw_bytes } => write!(f, "Unrecognized {raw_bytes:02x?}"),
        }
    }
}

/// Protocol-agnostic device state, normalized from either protocol's status encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ValidatorState {
    Initializing,
    /// Idle and ready to accept.
    #[default]
    Enable,
    Disabled,
    Accepting,
    Escrow,
    Stacking,
    VendValid,
    Stacked,
    Rejecting,
    Returning,
    Failure,
    Unknown,
}

impl ValidatorState {
    /// Gets whether the device is idle (enabled or inhibited) with no note in the path.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Enable | Self::Disabled)
    }
}

impl fmt::Display for ValidatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Reason a note was rejected by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    Insertion,
    Magnetic,
    RemainedInHead,
    Compensation,
    Conveying,
    Denomination,
    PhotoPattern,
    PhotoLevel,
    Inhibited,
    Operation,
    RemainedInStacker,
    Length,
    PhotoPatternSecondary,
    Feature,
    /// The protocol reports a rejection without a reason.
    Unspecified,
    Unknown(u8),
}

impl From<u8> for RejectReason {
    fn from(val: u8) -> Self {
        match val {
            0x71 => Self::Insertion,
            0x72 => Self::Magnetic,
            0x73 => Self::RemainedInHead,
            0x74 => Self::Compensation,
            0x75 => Self::Conveying,
            0x76 => Self::Denomination,
            0x77 => Self::PhotoPattern,
            0x78 => Self::PhotoLevel,
            0x79 => Self::Inhibited,
            0x7b => Self::Operation,
            0x7c => Self::RemainedInStacker,
            0x7d => Self::Length,
            0x7e => Self::PhotoPatternSecondary,
            0x7f => Self::Feature,
            _ => Self::Unknown(val),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Insertion => write!(f, "insertion error"),
            Self::Magnetic => write!(f, "magnetic pattern error"),
            Self::RemainedInHead => write!(f, "note remained in head"),
            Self::Compensation => write!(f, "compensation error"),
            Self::Conveying => write!(f, "conveying error"),
            Self::Denomination => write!(f, "denomination assessment error"),
            Self::PhotoPattern => write!(f, "photo pattern error"),
            Self::PhotoLevel => write!(f, "photo level error"),
            Self::Inhibited => write!(f, "returned by inhibit"),
            Self::Operation => write!(f, "operation error"),
            Self::RemainedInStacker => write!(f, "note remained in stacker"),
            Self::Length => write!(f, "length error"),
            Self::PhotoPatternSecondary => write!(f, "secondary photo pattern error"),
            Self::Feature => write!(f, "feature check error"),
            Self::Unspecified => write!(f, "unspecified"),
            Self::Unknown(code) => write!(f, "unknown reject code 0x{code:02x}"),
        }
    }
}

/// Decodes a raw status response for the given protocol.
pub fn decode(protocol: Protocol, raw: &[u8]) -> DecodedEvent {
    match protocol {
        Protocol::Jcm => decode_jcm(raw),
        Protocol::Mei => decode_mei(raw),
    }
}

fn decode_jcm(raw: &[u8]) -> DecodedEvent {
    match raw.first() {
        Some(&jcm::status::ESCROW) => {
            if raw.get(1) == Some(&jcm::ESCROW_TICKET) {
                DecodedEvent::Escrowed {
                    denomination_index: None,
                    barcode: decode_barcode(&raw[2..]),
                }
            } else {
                DecodedEvent::Escrowed {
                    denomination_index: denomination_index(raw),
                    barcode: None,
                }
            }
        }
        Some(&code) => DecodedEvent::StatusOnly { raw: code as u32 },
        None => DecodedEvent::Unrecognized {
            raw_bytes: Vec::new(),
        },
    }
}

fn decode_mei(raw: &[u8]) -> DecodedEvent {
    let len = raw.len();

    if is_mei_extended(raw) {
        if len < MEI_EXTENDED_LEN {
            return DecodedEvent::Unrecognized {
                raw_bytes: raw.into(),
            };
        }

        let word = status_word(raw, 2);

        return if word & mei::status::ESCROWED != 0 {
            DecodedEvent::Escrowed {
                denomination_index: denomination_index(raw),
                barcode: mei_extended_barcode(raw),
            }
        } else {
            DecodedEvent::StatusOnly { raw: word }
        };
    }

    if len < MEI_SHORT_LEN {
        return DecodedEvent::Unrecognized {
            raw_bytes: raw.into(),
        };
    }

    let word = status_word(raw, 1);

    if word & mei::status::ESCROWED != 0 {
        DecodedEvent::Escrowed {
            denomination_index: denomination_index(raw),
            barcode: None,
        }
    } else {
        DecodedEvent::StatusOnly { raw: word }
    }
}

fn is_mei_extended(raw: &[u8]) -> bool {
    raw.first() == Some(&(mei::MeiInstruction::ExtendedMsgSet as u8))
}

fn mei_extended_barcode(raw: &[u8]) -> Option<String> {
    if is_mei_extended(raw)
        && raw.get(1) == Some(&(mei::MeiExtendedSubtype::ExtendedBarcodeReply as u8))
        && raw.len() > BARCODE_OFFSET
    {
        decode_barcode(&raw[BARCODE_OFFSET..])
    } else {
        None
    }
}

// Little-endian status word starting at `offset`; caller guarantees four bytes are present.
fn status_word(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        raw[offset],
        raw[offset + 1],
        raw[offset + 2],
        raw[offset + 3],
    ])
}

/// Extracts the denomination index from bits 3-5 of the denomination byte.
pub fn denomination_index(raw: &[u8]) -> Option<u8> {
    raw.get(DENOMINATION_BYTE)
        .map(|b| (b & DENOMINATION_MASK) >> DENOMINATION_SHIFT)
}

/// Decodes a left-justified, blank-filled ASCII barcode.
///
/// Decoding stops at the first [BARCODE_PAD] byte, or after [BARCODE_MAX_LEN] bytes.
/// Returns `None` for an empty barcode.
pub fn decode_barcode(bytes: &[u8]) -> Option<String> {
    let barcode: String = bytes
        .iter()
        .take(BARCODE_MAX_LEN)
        .take_while(|&&b| b != BARCODE_PAD)
        .map(|&b| b as char)
        .collect();

    if barcode.is_empty() {
        None
    } else {
        Some(barcode)
    }
}

/// Normalizes a decoded response into a [ValidatorState].
pub fn normalize(protocol: Protocol, event: &DecodedEvent) -> ValidatorState {
    match event {
        DecodedEvent::Escrowed { .. } => ValidatorState::Escrow,
        DecodedEvent::StatusOnly { raw } => match protocol {
            Protocol::Jcm => normalize_jcm(*raw as u8),
            Protocol::Mei => normalize_mei(*raw),
        },
        DecodedEvent::Unrecognized { .. } => ValidatorState::Unknown,
    }
}

fn normalize_jcm(code: u8) -> ValidatorState {
    use jcm::status;

    match code {
        status::ENABLE => ValidatorState::Enable,
        status::ACCEPTING => ValidatorState::Accepting,
        status::ESCROW | status::HOLDING => ValidatorState::Escrow,
        status::STACKING => ValidatorState::Stacking,
        status::VEND_VALID => ValidatorState::VendValid,
        status::STACKED => ValidatorState::Stacked,
        status::REJECTING => ValidatorState::Rejecting,
        status::RETURNING => ValidatorState::Returning,
        status::DISABLED => ValidatorState::Disabled,
        status::INITIALIZING => ValidatorState::Initializing,
        status::POWER_UP..=status::POWER_UP_WITH_BILL_IN_STACKER => {
            ValidatorState::Initializing
        }
        status::STACKER_FULL..=status::JAM_IN_STACKER | status::CHEATED | status::FAILURE => {
            ValidatorState::Failure
        }
        _ => ValidatorState::Unknown,
    }
}

fn normalize_mei(word: u32) -> ValidatorState {
    use mei::status;

    if word & (status::FAILURE | status::JAMMED | status::STACKER_FULL) != 0 {
        ValidatorState::Failure
    } else if word & status::ESCROWED != 0 {
        ValidatorState::Escrow
    } else if word & status::STACKED != 0 {
        ValidatorState::Stacked
    } else if word & status::STACKING != 0 {
        ValidatorState::Stacking
    } else if word & (status::RETURNING | status::RETURNED) != 0 {
        ValidatorState::Returning
    } else if word & (status::REJECTED | status::CHEATED) != 0 {
        ValidatorState::Rejecting
    } else if word & status::ACCEPTING != 0 {
        ValidatorState::Accepting
    } else if word & status::POWER_UP != 0 {
        ValidatorState::Initializing
    } else if word & status::IDLING != 0 {
        ValidatorState::Enable
    } else {
        ValidatorState::Unknown
    }
}

/// Gets the reason carried by a rejection response.
pub fn reject_reason(protocol: Protocol, raw: &[u8]) -> RejectReason {
    match protocol {
        Protocol::Jcm => raw
            .get(1)
            .map(|&b| RejectReason::from(b))
            .unwrap_or(RejectReason::Unspecified),
        Protocol::Mei => RejectReason::Unspecified,
    }
}

/// Gets the raw status code reported for diagnostics (failure codes, unknown states).
pub fn status_code(protocol: Protocol, raw: &[u8]) -> u32 {
    match decode(protocol, raw) {
        DecodedEvent::StatusOnly { raw } => raw,
        _ => raw.first().copied().unwrap_or_default() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mei_frame(word: u32, byte3: Option<u8>) -> Vec<u8> {
        let mut frame = vec![0x20];
        frame.extend_from_slice(&word.to_le_bytes());
        if let Some(b) = byte3 {
            frame[3] = b;
        }
        frame
    }

    #[test]
    fn test_mei_escrow_denomination_index() {
        for byte3 in 0..=u8::MAX {
            let frame = mei_frame(mei::status::ESCROWED, Some(byte3));

            match decode(Protocol::Mei, &frame) {
                DecodedEvent::Escrowed {
                    denomination_index, ..
                } => assert_eq!(denomination_index, Some((byte3 & 0x38) >> 3)),
                other => panic!("expected escrow, got {other}"),
            }
        }
    }

    #[test]
    fn test_mei_idle_status() {
        let frame = mei_frame(mei::status::IDLING | mei::status::CASSETTE_ATTACHED, None);
        let event = decode(Protocol::Mei, &frame);

        assert_eq!(event, DecodedEvent::StatusOnly { raw: 0x1001 });
        assert_eq!(normalize(Protocol::Mei, &event), ValidatorState::Enable);
    }

    #[test]
    fn test_mei_short_frame_unrecognized() {
        let event = decode(Protocol::Mei, &[0x20, 0x01, 0x10]);

        assert_eq!(
            event,
            DecodedEvent::Unrecognized {
                raw_bytes: vec![0x20, 0x01, 0x10]
            }
        );
        assert_eq!(normalize(Protocol::Mei, &event), ValidatorState::Unknown);
    }

    #[test]
    fn test_mei_extended_barcode_escrow() {
        let mut frame = vec![0u8; 28];
        frame[0] = mei::MeiInstruction::ExtendedMsgSet as u8;
        frame[1] = mei::MeiExtendedSubtype::ExtendedBarcodeReply as u8;
        frame[2..6].copy_from_slice(&mei::status::ESCROWED.to_le_bytes());
        frame[8..11].copy_from_slice(b"ABC");
        frame[11..].iter_mut().for_each(|b| *b = BARCODE_PAD);

        assert_eq!(
            decode(Protocol::Mei, &frame),
            DecodedEvent::Escrowed {
                denomination_index: Some(0),
                barcode: Some("ABC".into()),
            }
        );
    }

    #[test]
    fn test_mei_long_standard_frame_uses_short_form() {
        // 0x04 in byte 2 is the jammed bit of a standard reply, not an escrow flag
        let mut frame = mei_frame(mei::status::JAMMED | mei::status::CASSETTE_ATTACHED, None);
        frame.resize(11, 0);

        let event = decode(Protocol::Mei, &frame);

        assert_eq!(event, DecodedEvent::StatusOnly { raw: 0x1400 });
        assert_eq!(normalize(Protocol::Mei, &event), ValidatorState::Failure);
    }

    #[test]
    fn test_mei_extended_status_only() {
        let mut frame = vec![0u8; 10];
        frame[0] = mei::MeiInstruction::ExtendedMsgSet as u8;
        frame[1] = mei::MeiExtendedSubtype::ExtendedNoteSpecification as u8;
        frame[2..6].copy_from_slice(&(mei::status::IDLING | mei::status::CASSETTE_ATTACHED).to_le_bytes());

        let event = decode(Protocol::Mei, &frame);

        assert_eq!(event, DecodedEvent::StatusOnly { raw: 0x1001 });
        assert_eq!(normalize(Protocol::Mei, &event), ValidatorState::Enable);

        // an extended reply cut short is not read as a standard one
        assert!(matches!(
            decode(Protocol::Mei, &frame[..7]),
            DecodedEvent::Unrecognized { .. }
        ));
    }

    #[test]
    fn test_barcode_pad_and_length() {
        let mut bytes = b"ABC".to_vec();
        bytes.extend_from_slice(&[BARCODE_PAD, BARCODE_PAD, b'Z']);
        assert_eq!(decode_barcode(&bytes).as_deref(), Some("ABC"));

        let long = b"0123456789012345678901234".to_vec();
        assert_eq!(
            decode_barcode(&long).as_deref(),
            Some("01234567890123456789")
        );

        assert_eq!(decode_barcode(&[BARCODE_PAD; 4]), None);
        assert_eq!(decode_barcode(&[]), None);
    }

    #[test]
    fn test_decode_is_pure() {
        let frame = [jcm::status::ESCROW, 0x62, 0x00, 0x18];

        assert_eq!(decode(Protocol::Jcm, &frame), decode(Protocol::Jcm, &frame));
    }

    #[test]
    fn test_jcm_escrow_channel() {
        let frame = [jcm::status::ESCROW, 0x62, 0x00, 0x18];

        assert_eq!(
            decode(Protocol::Jcm, &frame),
            DecodedEvent::Escrowed {
                denomination_index: Some(3),
                barcode: None,
            }
        );
    }

    #[test]
    fn test_jcm_ticket_escrow() {
        let mut frame = vec![jcm::status::ESCROW, jcm::ESCROW_TICKET];
        frame.extend_from_slice(b"123456789012345678");

        assert_eq!(
            decode(Protocol::Jcm, &frame),
            DecodedEvent::Escrowed {
                denomination_index: None,
                barcode: Some("123456789012345678".into()),
            }
        );
    }

    #[test]
    fn test_jcm_normalize() {
        let cases = [
            (jcm::status::ENABLE, ValidatorState::Enable),
            (jcm::status::ACCEPTING, ValidatorState::Accepting),
            (jcm::status::STACKING, ValidatorState::Stacking),
            (jcm::status::VEND_VALID, ValidatorState::VendValid),
            (jcm::status::STACKED, ValidatorState::Stacked),
            (jcm::status::REJECTING, ValidatorState::Rejecting),
            (jcm::status::RETURNING, ValidatorState::Returning),
            (jcm::status::DISABLED, ValidatorState::Disabled),
            (jcm::status::INITIALIZING, ValidatorState::Initializing),
            (jcm::status::POWER_UP, ValidatorState::Initializing),
            (jcm::status::JAM_IN_ACCEPTOR, ValidatorState::Failure),
            (jcm::status::FAILURE, ValidatorState::Failure),
            (0x30, ValidatorState::Unknown),
        ];

        for (code, exp) in cases {
            assert_eq!(
                normalize(Protocol::Jcm, &decode(Protocol::Jcm, &[code])),
                exp,
                "status code 0x{code:02x}"
            );
        }
    }

    #[test]
    fn test_reject_reason() {
        assert_eq!(
            reject_reason(Protocol::Jcm, &[jcm::status::REJECTING, 0x79]),
            RejectReason::Inhibited
        );
        assert_eq!(
            reject_reason(Protocol::Jcm, &[jcm::status::REJECTING, 0x10]),
            RejectReason::Unknown(0x10)
        );
        assert_eq!(
            reject_reason(Protocol::Jcm, &[jcm::status::REJECTING]),
            RejectReason::Unspecified
        );
        assert_eq!(
            reject_reason(Protocol::Mei, &mei_frame(mei::status::REJECTED, None)),
            RejectReason::Unspecified
        );
    }
}
