//! Error types for transport, sequencing, and polling failures.

use crate::command::Operation;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure at the byte-transport layer.
///
/// The core never retries a transport call on its own; every call is a single attempt.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timed out waiting for a response frame")]
    Timeout,
    #[error("device rejected the command (NAK: 0x{0:02x})")]
    Nak(u8),
    #[error("short response, expected at least {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("transport is not open")]
    NotOpen,
    #[error("device disconnected")]
    Disconnected,
}

impl TransportError {
    /// Whether the transport can no longer be used, ending the polling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => {
                Self::Disconnected
            }
            _ => Self::Io(format!("{err}")),
        }
    }
}

/// Crate-level error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("device still initializing after {attempts} status reads")]
    InitTimeout { attempts: u32 },
    #[error("configuration step {step} failed: {source}")]
    Configuration {
        step: &'static str,
        source: TransportError,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("operation {0} is not supported by this protocol")]
    Unsupported(Operation),
    #[error("device has not completed initialization")]
    NotReady,
    #[error("polling routine already running")]
    PollingReinit,
    #[error("polling routine is not running")]
    NotPolling,
    #[error("timed out waiting for an event on the queue")]
    QueueTimeout,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("JSON error: {0}")]
    Json(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(format!("{err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(format!("{err}"))
    }
}
