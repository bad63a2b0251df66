//! Transfer submission and completion types
//!
//! A [`Submission`] moves a data buffer into the transport; the matching
//! [`Completion`] moves it back out, exactly once, whatever the outcome.
//! The host engine never copies transfer payloads across this boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{EndpointAddress, TransferKind};

/// Opaque identifier for an accepted submission.
///
/// Handles are unique for the lifetime of the transport and are never
/// reused, so a stale handle can be detected instead of aliasing a live
/// transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferHandle(pub u64);

/// The SETUP packet fields of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

/// A transfer handed to the transport for asynchronous execution.
///
/// For IN transfers `data` is the receive buffer and its length is the
/// requested transfer length. For OUT transfers `data` is the payload to
/// send. `timeout` of zero means no timeout.
#[derive(Debug)]
pub struct Submission {
    /// Target endpoint, direction bit included
    pub endpoint: EndpointAddress,
    /// Transfer kind; must match the endpoint's descriptor
    pub kind: TransferKind,
    /// SETUP fields, present exactly when `kind` is `Control`
    pub setup: Option<ControlSetup>,
    /// Data buffer, ownership moves into the transport
    pub data: Vec<u8>,
    /// Per-transfer timeout; `Duration::ZERO` disables it
    pub timeout: Duration,
}

impl Submission {
    /// Builds an IN submission with a zeroed receive buffer of `capacity` bytes.
    pub fn input(
        endpoint: EndpointAddress,
        kind: TransferKind,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            kind,
            setup: None,
            data: vec![0u8; capacity],
            timeout,
        }
    }

    /// Builds an OUT submission carrying `data` as the payload.
    pub fn output(
        endpoint: EndpointAddress,
        kind: TransferKind,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            kind,
            setup: None,
            data,
            timeout,
        }
    }

    /// Builds a control submission on the default endpoint.
    ///
    /// The direction bit of `setup.request_type` decides whether `data` is a
    /// receive buffer or a payload.
    pub fn control(setup: ControlSetup, data: Vec<u8>, timeout: Duration) -> Self {
        let endpoint = if setup.request_type & 0x80 != 0 {
            EndpointAddress::input(0)
        } else {
            EndpointAddress::output(0)
        };
        Self {
            endpoint,
            kind: TransferKind::Control,
            setup: Some(setup),
            data,
            timeout,
        }
    }

    /// Requested transfer length: buffer capacity for IN, payload length for OUT.
    pub fn requested_length(&self) -> usize {
        self.data.len()
    }
}

/// Terminal outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Transfer finished; `length` bytes are valid (may be short, may be zero)
    Success,
    /// The endpoint is halted; requires a clear-feature to recover
    Stall,
    /// The transfer's timeout elapsed before it finished
    Timeout,
    /// The device produced more data than the buffer could hold
    Overflow,
    /// The transfer was cancelled before it finished
    Cancelled,
    /// The device left the bus while the transfer was in flight
    Disconnected,
    /// Transport-internal failure
    Io(String),
}

/// A finished transfer, reported by `poll_completions`.
///
/// `data` is the buffer from the original [`Submission`], returned to the
/// caller here and nowhere else. `length` is the number of bytes actually
/// transferred; for `Overflow` it is the length the device attempted, which
/// exceeds `data.len()`.
#[derive(Debug)]
pub struct Completion {
    /// Handle returned by `submit`
    pub handle: TransferHandle,
    /// Terminal status
    pub status: CompletionStatus,
    /// The submission's buffer, ownership returned
    pub data: Vec<u8>,
    /// Bytes transferred (attempted length for `Overflow`)
    pub length: usize,
}
