//! One-shot asynchronous transfers
//!
//! A [`Transfer`] targets one endpoint of an open device and carries at most
//! one submission at a time. Submitting moves the buffer into the transport;
//! the buffer comes back through [`take_buffer`] exactly once per
//! submission, whatever the outcome. The object is reusable: once a
//! submission reaches a terminal state a new one may be issued.
//!
//! [`take_buffer`]: Transfer::take_buffer

use std::sync::Arc;
use std::time::Duration;

use transport::{ControlSetup, EndpointAddress, EndpointDescriptor, TransferKind};

use crate::command::{Command, EngineHandle};
use crate::device::{Device, DeviceShared};
use crate::error::{Result, UsbError};
use crate::signal::TransferSignal;

/// Slack added to a blocking wait beyond the transfer's own timeout, so the
/// transport's timeout completion wins the race against the caller-side wait.
const WAIT_GRACE: Duration = Duration::from_millis(250);

/// Whether `submit` returns immediately or blocks for the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Block the calling thread until the transfer reaches a terminal state
    Blocking,
    /// Return as soon as the transport accepts the submission
    Background,
}

/// Lifecycle state of a [`Transfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// No submission has been issued yet (or the last one was consumed)
    Idle,
    /// A submission is in flight
    Pending,
    /// The submission finished; this many bytes were transferred
    Completed(usize),
    /// The submission failed
    Error(UsbError),
    /// The submission was cancelled before it finished
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Idle | TransferStatus::Pending)
    }

    fn from_result(result: Result<usize>) -> Self {
        match result {
            Ok(length) => TransferStatus::Completed(length),
            Err(UsbError::Cancelled) => TransferStatus::Cancelled,
            Err(error) => TransferStatus::Error(error),
        }
    }
}

/// Terminal result of a blocking submission: the buffer back from the
/// transport plus the number of bytes actually transferred.
///
/// For IN transfers `length ≤ data.len()`; a short transfer is not an error.
#[derive(Debug)]
pub struct TransferOutcome {
    /// The submission's buffer, ownership returned
    pub data: Vec<u8>,
    /// Bytes transferred
    pub length: usize,
}

/// A reusable one-shot transfer bound to one endpoint.
#[derive(Debug)]
pub struct Transfer {
    engine: EngineHandle,
    device: Arc<DeviceShared>,
    endpoint: EndpointDescriptor,
    setup: Option<ControlSetup>,
    signal: Option<Arc<TransferSignal>>,
    status: TransferStatus,
}

impl Transfer {
    /// Binds a transfer to `endpoint`, resolving it against the device's
    /// descriptor table. Fails with [`UsbError::InvalidEndpoint`] when the
    /// endpoint is absent or its interface is not claimed.
    pub fn new(device: &Device, endpoint: EndpointAddress) -> Result<Self> {
        let descriptor = device.require_endpoint(endpoint)?;
        Ok(Self {
            engine: device.engine().clone(),
            device: device.shared(),
            endpoint: descriptor,
            setup: None,
            signal: None,
            status: TransferStatus::Idle,
        })
    }

    /// A transfer on the default control endpoint. The control endpoint
    /// belongs to no interface, so there is no claim to check.
    pub(crate) fn control(device: &Device, setup: ControlSetup) -> Self {
        Self {
            engine: device.engine().clone(),
            device: device.shared(),
            endpoint: EndpointDescriptor {
                address: EndpointAddress::CONTROL,
                kind: TransferKind::Control,
                max_packet_size: 64,
                interval: 0,
            },
            setup: Some(setup),
            signal: None,
            status: TransferStatus::Idle,
        }
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// Current status, refreshed without blocking.
    pub fn status(&mut self) -> TransferStatus {
        self.refresh();
        self.status.clone()
    }

    /// Picks up a completion the engine has delivered since the last check.
    fn refresh(&mut self) {
        if self.status == TransferStatus::Pending
            && let Some(signal) = &self.signal
            && let Some(result) = signal.peek()
        {
            self.status = TransferStatus::from_result(result);
        }
    }

    /// Submits `buffer` on the bound endpoint. For IN endpoints the buffer's
    /// length is the requested transfer length; for OUT it is the payload.
    ///
    /// Fails with [`UsbError::AlreadyPending`] while an earlier submission
    /// is still in flight, and [`UsbError::DeviceDisconnected`] once the
    /// device is gone. In [`SubmitMode::Blocking`] the returned status is
    /// terminal; in [`SubmitMode::Background`] it is `Pending` and the
    /// outcome arrives through [`wait`](Transfer::wait).
    pub fn submit(
        &mut self,
        buffer: Vec<u8>,
        timeout: Duration,
        mode: SubmitMode,
    ) -> Result<TransferStatus> {
        self.refresh();
        if self.status == TransferStatus::Pending {
            return Err(UsbError::AlreadyPending);
        }
        if !self.device.is_open() {
            return Err(UsbError::DeviceDisconnected);
        }

        let signal = Arc::new(TransferSignal::new());
        self.signal = Some(Arc::clone(&signal));
        self.status = TransferStatus::Pending;
        self.engine.send(Command::Submit {
            address: self.device.address(),
            endpoint: self.endpoint,
            setup: self.setup,
            data: buffer,
            timeout,
            signal,
        })?;

        match mode {
            SubmitMode::Background => Ok(TransferStatus::Pending),
            SubmitMode::Blocking => {
                let bound = (!timeout.is_zero()).then(|| timeout + WAIT_GRACE);
                self.wait(bound)
            }
        }
    }

    /// Submits in blocking mode and unwraps the terminal state into the
    /// returned buffer and transferred length; errors become `Err`.
    pub fn submit_wait(&mut self, buffer: Vec<u8>, timeout: Duration) -> Result<TransferOutcome> {
        match self.submit(buffer, timeout, SubmitMode::Blocking)? {
            TransferStatus::Completed(length) => Ok(TransferOutcome {
                data: self.take_buffer().unwrap_or_default(),
                length,
            }),
            TransferStatus::Cancelled => Err(UsbError::Cancelled),
            TransferStatus::Error(error) => Err(error),
            TransferStatus::Idle | TransferStatus::Pending => Err(UsbError::Timeout),
        }
    }

    /// Blocks until the in-flight submission reaches a terminal state.
    ///
    /// `bound` of `None` waits indefinitely. When the bound elapses first
    /// the call fails with [`UsbError::Timeout`] and the submission stays
    /// pending; it may still complete later.
    pub fn wait(&mut self, bound: Option<Duration>) -> Result<TransferStatus> {
        self.refresh();
        if self.status != TransferStatus::Pending {
            return Ok(self.status.clone());
        }
        let Some(signal) = &self.signal else {
            return Ok(self.status.clone());
        };
        match signal.wait(bound) {
            Some(result) => {
                self.status = TransferStatus::from_result(result);
                Ok(self.status.clone())
            }
            None => Err(UsbError::Timeout),
        }
    }

    /// Requests cancellation of the in-flight submission. Idempotent; a
    /// no-op once the transfer is in a terminal state. The terminal outcome
    /// still arrives through [`wait`](Transfer::wait) — cancellation can
    /// race a real completion, and the completion wins.
    pub fn cancel(&mut self) -> Result<()> {
        self.refresh();
        if self.status != TransferStatus::Pending {
            return Ok(());
        }
        let Some(signal) = &self.signal else {
            return Ok(());
        };
        self.engine.send(Command::CancelTransfer {
            signal: Arc::clone(signal),
        })
    }

    /// The completed submission's buffer. Returns `Some` exactly once per
    /// submission, after it reaches a terminal state.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.signal.as_ref().and_then(|signal| signal.take_buffer())
    }
}
