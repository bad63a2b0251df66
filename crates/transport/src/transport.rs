//! The transport trait the host engine drives

use std::time::Duration;

use crate::error::{SubmitError, TransportError};
use crate::transfer::{Completion, Submission, TransferHandle};
use crate::types::{BusAddress, DeviceInfo, InterfaceDescriptor};

/// Hotplug notification, reported by [`HostTransport::poll_hotplug`].
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A device appeared on the bus
    Arrived(DeviceInfo),
    /// The device at this address departed
    Left(BusAddress),
}

/// Asynchronous host-controller access.
///
/// Implementations are driven from exactly one thread; none of the methods
/// need to be re-entrant and `&mut self` reflects that. The engine calls
/// `poll_completions` in a loop and interleaves the other methods between
/// polls.
///
/// # Submission contract
///
/// Every submission accepted by [`submit`] produces exactly one
/// [`Completion`] from [`poll_completions`], carrying the submission's
/// buffer back. This holds across every outcome:
///
/// - [`cancel`] is a request, not a synchronous kill. The cancelled
///   transfer still completes (usually with `Cancelled`, but a race with
///   real completion is allowed), and cancelling an already-finished or
///   unknown handle is a harmless no-op.
/// - When a device departs, its in-flight transfers complete with
///   `Disconnected`. The transport must not swallow them.
///
/// The engine relies on this to account for every buffer it owns; a
/// transport that drops a completion leaks the buffer and wedges teardown
/// until the caller-side timeout fires.
///
/// [`submit`]: HostTransport::submit
/// [`cancel`]: HostTransport::cancel
/// [`poll_completions`]: HostTransport::poll_completions
pub trait HostTransport: Send {
    /// Lists the devices currently on the bus.
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Opens the device at `address` for I/O.
    fn open(&mut self, address: BusAddress) -> Result<(), TransportError>;

    /// Closes a previously opened device. In-flight transfers must already
    /// be quiesced; the engine guarantees this ordering.
    fn close(&mut self, address: BusAddress) -> Result<(), TransportError>;

    /// Returns the interface topology of an open device's active
    /// configuration.
    fn interfaces(&mut self, address: BusAddress) -> Result<Vec<InterfaceDescriptor>, TransportError>;

    /// Claims an interface for exclusive use, detaching any kernel driver
    /// where the platform supports it.
    fn claim_interface(&mut self, address: BusAddress, interface: u8) -> Result<(), TransportError>;

    /// Releases a claimed interface.
    fn release_interface(&mut self, address: BusAddress, interface: u8)
    -> Result<(), TransportError>;

    /// Submits a transfer for asynchronous execution. On refusal the
    /// buffer comes back inside the [`SubmitError`].
    fn submit(
        &mut self,
        address: BusAddress,
        submission: Submission,
    ) -> Result<TransferHandle, SubmitError>;

    /// Requests cancellation of an in-flight transfer. The completion still
    /// arrives through `poll_completions`.
    fn cancel(&mut self, handle: TransferHandle) -> Result<(), TransportError>;

    /// Collects finished transfers, blocking up to `wait` when none are
    /// ready. An empty vector after `wait` is normal.
    fn poll_completions(&mut self, wait: Duration) -> Result<Vec<Completion>, TransportError>;

    /// Drains pending hotplug events. Never blocks.
    fn poll_hotplug(&mut self) -> Vec<HotplugEvent>;
}
