//! Host engine error types

use thiserror::Error;
use transport::{CompletionStatus, TransportError};

/// Errors surfaced by the host engine.
///
/// Contract violations (wrong endpoint, transfer reuse) are reported
/// synchronously by the call that commits them; I/O outcomes (stall,
/// timeout, overflow, disconnect) arrive as the terminal status of the
/// affected transfer or stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// The endpoint does not exist, has the wrong direction/kind, or its
    /// interface is not claimed
    #[error("invalid endpoint for this operation")]
    InvalidEndpoint,

    /// The transfer was submitted again while still in flight
    #[error("transfer already pending")]
    AlreadyPending,

    /// The device or interface is held by another owner
    #[error("resource busy")]
    Busy,

    /// The interface number is not part of the active configuration
    #[error("no such interface: {0}")]
    NoSuchInterface(u8),

    /// No device at the given address
    #[error("device not found")]
    NotFound,

    /// The device cannot be opened (permissions, platform policy)
    #[error("access denied")]
    AccessDenied,

    /// The device is already open through this engine
    #[error("device already open")]
    AlreadyOpen,

    /// No registered driver matched the device
    #[error("no driver matched")]
    NoDriver,

    /// The endpoint is halted
    #[error("endpoint stalled")]
    Stall,

    /// The operation's timeout elapsed
    #[error("operation timed out")]
    Timeout,

    /// The device produced `attempted` bytes into a smaller buffer
    #[error("buffer overflow: device attempted {attempted} bytes")]
    Overflow {
        /// Length the device attempted to transfer
        attempted: usize,
    },

    /// The device left the bus
    #[error("device disconnected")]
    DeviceDisconnected,

    /// The transfer or stream was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Teardown did not quiesce within its deadline; resources are
    /// reclaimed in the background
    #[error("teardown incomplete")]
    TeardownIncomplete,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine thread is gone or its channels are closed
    #[error("engine channel error: {0}")]
    Channel(String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, UsbError>;

impl From<TransportError> for UsbError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound => UsbError::NotFound,
            TransportError::AccessDenied => UsbError::AccessDenied,
            TransportError::Busy => UsbError::Busy,
            TransportError::NoSuchInterface(n) => UsbError::NoSuchInterface(n),
            TransportError::Disconnected => UsbError::DeviceDisconnected,
            TransportError::InvalidSubmission(_) => UsbError::InvalidEndpoint,
            TransportError::Io(message) => UsbError::Transport(message),
        }
    }
}

impl UsbError {
    /// Maps a completion to the transfer's terminal result: bytes
    /// transferred on success, the corresponding error otherwise.
    pub(crate) fn from_completion(status: CompletionStatus, length: usize) -> Result<usize> {
        match status {
            CompletionStatus::Success => Ok(length),
            CompletionStatus::Stall => Err(UsbError::Stall),
            CompletionStatus::Timeout => Err(UsbError::Timeout),
            CompletionStatus::Overflow => Err(UsbError::Overflow { attempted: length }),
            CompletionStatus::Cancelled => Err(UsbError::Cancelled),
            CompletionStatus::Disconnected => Err(UsbError::DeviceDisconnected),
            CompletionStatus::Io(message) => Err(UsbError::Transport(message)),
        }
    }
}
