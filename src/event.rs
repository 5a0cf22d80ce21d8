//! Domain events emitted by the polling engine, and the sinks that receive them.

use std::fmt;
use std::sync::mpsc;
use std::time;

use serde::Serialize;

use crate::codec::RejectReason;
use crate::{Error, Result};

/// Timeout for retrieving an event from a queue (milliseconds).
pub const QUEUE_TIMEOUT_MS: u64 = 50;

/// A note or ticket moving through the validator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Note {
    pub denomination: Option<u8>,
    pub barcode: Option<String>,
    /// Configured value of the denomination, if known.
    pub value: Option<u32>,
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.barcode, self.denomination) {
            (Some(barcode), _) => write!(f, "ticket {barcode}"),
            (None, Some(denom)) => match self.value {
                Some(value) => write!(f, "note #{denom} (value {value})"),
                None => write!(f, "note #{denom}"),
            },
            (None, None) => write!(f, "unidentified note"),
        }
    }
}

/// Event delivered to the application layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Initialization completed, the device is configured.
    DeviceReady,
    /// The device reported it is inhibited from accepting notes.
    DeviceDisabled,
    /// A note is held in escrow pending stack or return.
    BillEscrowed { note: Note },
    /// The escrowed note was moved into the cash box.
    BillStacked { note: Note },
    /// A note was handed back to the customer.
    BillReturned { note: Option<Note> },
    /// The device refused a note before escrow.
    BillRejected { reason: RejectReason },
    /// The device reported a failure; polling is parked until re-initialization.
    DeviceFailure { code: u32 },
    /// An unexpected status sequence, or a cycle abandoned with the note state unknown.
    ProtocolError { detail: String },
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DeviceReady => write!(f, "DeviceReady"),
            Self::DeviceDisabled => write!(f, "DeviceDisabled"),
            Self::BillEscrowed { note } => write!(f, "BillEscrowed: {note}"),
            Self::BillStacked { note } => write!(f, "BillStacked: {note}"),
            Self::BillReturned { note: Some(note) } => write!(f, "BillReturned: {note}"),
            Self::BillReturned { note: None } => write!(f, "BillReturned"),
            Self::BillRejected { reason } => write!(f, "BillRejected: {reason}"),
            Self::DeviceFailure { code } => write!(f, "DeviceFailure: 0x{code:02x}"),
            Self::ProtocolError { detail } => write!(f, "ProtocolError: {detail}"),
        }
    }
}

/// Single dispatch point receiving every [DomainEvent].
///
/// Called synchronously on the device's polling thread. A sink may react to
/// [DomainEvent::BillEscrowed] by calling
/// [request_return](crate::DeviceHandle::request_return) before returning; the engine checks
/// its command queue right after delivery.
pub trait EventSink: Send {
    fn deliver(&mut self, event: DomainEvent);
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn deliver(&mut self, event: DomainEvent) {
        (**self).deliver(event)
    }
}

impl EventSink for mpsc::Sender<DomainEvent> {
    fn deliver(&mut self, event: DomainEvent) {
        if let Err(err) = self.send(event) {
            log::warn!("Failed to send event: {err}");
        }
    }
}

impl EventSink for Vec<DomainEvent> {
    fn deliver(&mut self, event: DomainEvent) {
        self.push(event);
    }
}

/// Per-event callbacks, for consumers that prefer handler methods over matching on
/// [DomainEvent].
///
/// Wrap a handler in [Dispatch] to use it as an [EventSink].
pub trait EventHandler: Send {
    fn on_escrowed(&mut self, _denomination: Option<u8>, _barcode: Option<&str>) {}
    fn on_stacked(&mut self, _denomination: Option<u8>) {}
    fn on_returned(&mut self) {}
    fn on_rejected(&mut self, _reason: RejectReason) {}
    fn on_device_ready(&mut self) {}
    fn on_device_disabled(&mut self) {}
    fn on_device_failure(&mut self, _code: u32) {}
    fn on_protocol_error(&mut self, detail: &str) {
        log::warn!("Unhandled protocol error: {detail}");
    }
}

/// Routes each [DomainEvent] to the matching [EventHandler] callback.
pub struct Dispatch<H>(pub H);

impl<H: EventHandler> EventSink for Dispatch<H> {
    fn deliver(&mut self, event: DomainEvent) {
        let handler = &mut self.0;

        match event {
            DomainEvent::DeviceReady => handler.on_device_ready(),
            DomainEvent::DeviceDisabled => handler.on_device_disabled(),
            DomainEvent::BillEscrowed { note } => {
                handler.on_escrowed(note.denomination, note.barcode.as_deref())
            }
            DomainEvent::BillStacked { note } => handler.on_stacked(note.denomination),
            DomainEvent::BillReturned { .. } => handler.on_returned(),
            DomainEvent::BillRejected { reason } => handler.on_rejected(reason),
            DomainEvent::DeviceFailure { code } => handler.on_device_failure(code),
            DomainEvent::ProtocolError { detail } => handler.on_protocol_error(detail.as_str()),
        }
    }
}

/// Receiver end of the device-sent event queue.
///
/// Owner of the receiver can regularly attempt to pop events from the queue,
/// and decide how to handle any returned event(s).
pub struct PushEventReceiver(pub mpsc::Receiver<DomainEvent>);

impl PushEventReceiver {
    /// Creates a new [PushEventReceiver] from the provided `queue`.
    pub fn new(queue: mpsc::Receiver<DomainEvent>) -> Self {
        Self(queue)
    }

    /// Creates a connected sender and [PushEventReceiver] pair.
    pub fn channel() -> (mpsc::Sender<DomainEvent>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self::new(rx))
    }

    /// Attempt to pop an event from the queue.
    ///
    /// Returns `Err(_)` if an event could not be retrieved before the timeout.
    pub fn pop_event(&self) -> Result<DomainEvent> {
        self.0
            .recv_timeout(time::Duration::from_millis(QUEUE_TIMEOUT_MS))
            .map_err(|_| Error::QueueTimeout)
    }

    /// Pops every event currently in the queue without waiting.
    pub fn drain(&self) -> Vec<DomainEvent> {
        self.0.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        escrowed: Vec<Option<u8>>,
        stacked: usize,
        errors: usize,
    }

    impl EventHandler for Counter {
        fn on_escrowed(&mut self, denomination: Option<u8>, _barcode: Option<&str>) {
            self.escrowed.push(denomination);
        }

        fn on_stacked(&mut self, _denomination: Option<u8>) {
            self.stacked += 1;
        }

        fn on_protocol_error(&mut self, _detail: &str) {
            self.errors += 1;
        }
    }

    #[test]
    fn test_dispatch_routes_events() {
        let note = Note {
            denomination: Some(2),
            ..Default::default()
        };

        let mut sink = Dispatch(Counter::default());
        sink.deliver(DomainEvent::BillEscrowed { note: note.clone() });
        sink.deliver(DomainEvent::BillStacked { note });
        sink.deliver(DomainEvent::ProtocolError {
            detail: "vend valid timeout".into(),
        });
        sink.deliver(DomainEvent::DeviceReady);

        assert_eq!(sink.0.escrowed, vec![Some(2)]);
        assert_eq!(sink.0.stacked, 1);
        assert_eq!(sink.0.errors, 1);
    }

    #[test]
    fn test_push_event_receiver() {
        let (mut tx, rx) = PushEventReceiver::channel();

        assert_eq!(rx.pop_event(), Err(Error::QueueTimeout));

        tx.deliver(DomainEvent::DeviceDisabled);
        assert_eq!(rx.pop_event(), Ok(DomainEvent::DeviceDisabled));
    }

    #[test]
    fn test_event_json() -> Result<()> {
        let event = DomainEvent::BillEscrowed {
            note: Note {
                denomination: Some(1),
                barcode: None,
                value: Some(5),
            },
        };

        let json = serde_json::to_value(&event)?;
        assert_eq!(json["event"], "bill_escrowed");
        assert_eq!(json["note"]["denomination"], 1);
        assert_eq!(json["note"]["value"], 5);

        Ok(())
    }
}
