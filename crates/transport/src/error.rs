//! Transport error types

use thiserror::Error;

use crate::transfer::Submission;

/// Errors a transport can report for lifecycle and submission calls.
///
/// Completion-time failures (stall, timeout, overflow, cancellation) are not
/// errors at this level; they arrive as [`CompletionStatus`] values through
/// `poll_completions`.
///
/// [`CompletionStatus`]: crate::transfer::CompletionStatus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No device at the given address
    #[error("device not found")]
    NotFound,

    /// The device exists but cannot be opened (permissions, platform policy)
    #[error("access denied")]
    AccessDenied,

    /// The device or interface is held by another owner
    #[error("resource busy")]
    Busy,

    /// The interface number is not part of the active configuration
    #[error("no such interface: {0}")]
    NoSuchInterface(u8),

    /// The device has departed the bus
    #[error("device disconnected")]
    Disconnected,

    /// The submission is malformed (wrong kind/setup pairing, empty buffer)
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// Transport-internal failure
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// A rejected submission, buffer ownership handed back to the caller.
///
/// `submit` moves the data buffer into the transport; when the transport
/// refuses the submission outright there is no completion to return the
/// buffer through, so the error carries the whole submission back.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SubmitError {
    /// The submission that was refused, buffer intact
    pub submission: Submission,
    /// Why it was refused
    pub error: TransportError,
}

impl SubmitError {
    pub fn new(submission: Submission, error: TransportError) -> Self {
        Self { submission, error }
    }
}
