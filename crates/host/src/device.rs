//! An opened USB device
//!
//! A [`Device`] owns the transport handle for one device: its descriptor
//! table, its claimed interfaces, and the entry points for one-shot
//! transfers, control requests, and streams. The handle is released exactly
//! once, by [`close`](Device::close) or on drop; closing cancels every
//! outstanding transfer and stops every stream first, waiting for the
//! transport to confirm quiescence.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;
use transport::{
    BusAddress, DeviceInfo, Direction, EndpointAddress, EndpointDescriptor, InterfaceDescriptor,
    TransferKind,
};

use crate::command::{Command, EngineHandle, OpenReply};
use crate::control::{self, ControlRequest};
use crate::error::{Result, UsbError};
use crate::stream::{Stream, StreamConfig};
use crate::transfer::Transfer;

/// State shared with the engine thread. The engine clears `open` when the
/// device departs, so callers fail fast instead of queueing doomed commands.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    address: BusAddress,
    open: AtomicBool,
}

impl DeviceShared {
    pub(crate) fn new(address: BusAddress) -> Self {
        Self {
            address,
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn address(&self) -> BusAddress {
        self.address
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// One opened USB device.
///
/// Obtained from [`DeviceManager::open`]; not clonable — the handle has one
/// owner, and [`close`](Device::close) consumes it.
///
/// [`DeviceManager::open`]: crate::manager::DeviceManager::open
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    interfaces: Vec<InterfaceDescriptor>,
    claimed: HashSet<u8>,
    engine: EngineHandle,
    shared: Arc<DeviceShared>,
    closed: bool,
}

impl Device {
    pub(crate) fn new(engine: EngineHandle, reply: OpenReply) -> Self {
        Self {
            info: reply.info,
            interfaces: reply.interfaces,
            claimed: HashSet::new(),
            engine,
            shared: reply.shared,
            closed: false,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn address(&self) -> BusAddress {
        self.shared.address()
    }

    /// Interface topology of the active configuration, cached at open.
    pub fn interfaces(&self) -> &[InterfaceDescriptor] {
        &self.interfaces
    }

    pub fn interface(&self, number: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    /// Interfaces currently claimed through this handle, sorted.
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        let mut claimed: Vec<u8> = self.claimed.iter().copied().collect();
        claimed.sort_unstable();
        claimed
    }

    /// Whether the device is still attached and open. Cleared by the engine
    /// on disconnect; operations on a closed device fail fast with
    /// [`UsbError::DeviceDisconnected`].
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// The default timeout for transfers that don't carry their own.
    pub fn default_timeout(&self) -> Duration {
        self.engine.config.default_timeout()
    }

    /// Claims an interface for exclusive use. Required before any transfer
    /// targets one of its endpoints. Claiming an interface already held by
    /// this handle is a no-op.
    pub fn claim_interface(&mut self, interface: u8) -> Result<()> {
        self.ensure_open()?;
        if !self.interfaces.iter().any(|i| i.number == interface) {
            return Err(UsbError::NoSuchInterface(interface));
        }
        if self.claimed.contains(&interface) {
            return Ok(());
        }
        let address = self.shared.address();
        self.engine.request(|reply| Command::ClaimInterface {
            address,
            interface,
            reply,
        })?;
        self.claimed.insert(interface);
        Ok(())
    }

    /// Releases a claimed interface. Transfers already in flight on its
    /// endpoints run to completion.
    pub fn release_interface(&mut self, interface: u8) -> Result<()> {
        self.ensure_open()?;
        if !self.claimed.remove(&interface) {
            return Ok(());
        }
        let address = self.shared.address();
        self.engine.request(|reply| Command::ReleaseInterface {
            address,
            interface,
            reply,
        })
    }

    /// Looks up an endpoint descriptor across all interfaces.
    pub fn endpoint(&self, address: EndpointAddress) -> Option<&EndpointDescriptor> {
        self.interfaces
            .iter()
            .find_map(|interface| interface.endpoint(address))
    }

    /// The endpoint's descriptor, provided its interface is claimed.
    pub(crate) fn require_endpoint(&self, address: EndpointAddress) -> Result<EndpointDescriptor> {
        for interface in &self.interfaces {
            if let Some(endpoint) = interface.endpoint(address) {
                if !self.claimed.contains(&interface.number) {
                    return Err(UsbError::InvalidEndpoint);
                }
                return Ok(*endpoint);
            }
        }
        Err(UsbError::InvalidEndpoint)
    }

    /// One-shot blocking read of up to `length` bytes from an IN endpoint.
    /// The result is truncated to the bytes actually transferred; a short
    /// read is not an error.
    pub fn transfer_in(
        &self,
        endpoint: EndpointAddress,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if endpoint.direction() != Direction::In {
            return Err(UsbError::InvalidEndpoint);
        }
        let mut transfer = Transfer::new(self, endpoint)?;
        let outcome = transfer.submit_wait(vec![0u8; length], timeout)?;
        let mut data = outcome.data;
        data.truncate(outcome.length);
        Ok(data)
    }

    /// One-shot blocking write of `data` to an OUT endpoint. Returns the
    /// number of bytes the device accepted.
    pub fn transfer_out(
        &self,
        endpoint: EndpointAddress,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        if endpoint.direction() != Direction::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        let mut transfer = Transfer::new(self, endpoint)?;
        let outcome = transfer.submit_wait(data.to_vec(), timeout)?;
        Ok(outcome.length)
    }

    /// Blocking IN control request reading up to `length` bytes.
    pub fn control_in(
        &self,
        request: ControlRequest,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if request.direction() != Direction::In {
            return Err(UsbError::InvalidEndpoint);
        }
        let mut transfer = Transfer::control(self, request.setup());
        let outcome = transfer.submit_wait(vec![0u8; length], timeout)?;
        let mut data = outcome.data;
        data.truncate(outcome.length);
        Ok(data)
    }

    /// Blocking OUT control request carrying `data`. Returns the number of
    /// bytes the device accepted.
    pub fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_open()?;
        if request.direction() != Direction::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        let mut transfer = Transfer::control(self, request.setup());
        let outcome = transfer.submit_wait(data.to_vec(), timeout)?;
        Ok(outcome.length)
    }

    /// The raw 18-byte device descriptor.
    pub fn device_descriptor_raw(&self) -> Result<Vec<u8>> {
        let request = ControlRequest::get_descriptor(control::DESCRIPTOR_DEVICE, 0, 0);
        self.control_in(request, 18, self.default_timeout())
    }

    /// Reads and decodes a string descriptor, en-US language.
    pub fn string_descriptor(&self, index: u8) -> Result<String> {
        let request =
            ControlRequest::get_descriptor(control::DESCRIPTOR_STRING, index, control::LANGUAGE_EN_US);
        let data = self.control_in(request, 255, self.default_timeout())?;
        control::decode_string_descriptor(&data)
    }

    /// Opens a continuous stream on an IN endpoint (interrupt, bulk, or
    /// isochronous). The endpoint's interface must be claimed.
    pub fn open_stream(&self, endpoint: EndpointAddress, config: StreamConfig) -> Result<Stream> {
        self.ensure_open()?;
        let descriptor = self.require_endpoint(endpoint)?;
        if descriptor.address.direction() != Direction::In
            || descriptor.kind == TransferKind::Control
        {
            return Err(UsbError::InvalidEndpoint);
        }
        let address = self.shared.address();
        let reply = self.engine.request(|reply| Command::OpenStream {
            address,
            endpoint: descriptor,
            config,
            reply,
        })?;
        Ok(Stream::new(reply.id, self.engine.clone(), reply.shared))
    }

    /// Closes the device: every outstanding transfer is cancelled and every
    /// stream stopped, waiting for the transport to confirm, before the
    /// handle is released. Fails with [`UsbError::TeardownIncomplete`] when
    /// quiescence is not reached within the configured teardown timeout;
    /// reclamation then continues in the background.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let address = self.shared.address();
        let deadline = Instant::now() + self.engine.config.teardown_timeout();
        self.engine.request(|reply| Command::CloseDevice {
            address,
            deadline,
            reply,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_open() {
            Ok(())
        } else {
            Err(UsbError::DeviceDisconnected)
        }
    }

    pub(crate) fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub(crate) fn shared(&self) -> Arc<DeviceShared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.closed {
            debug!(address = %self.shared.address(), "device dropped without close, closing in background");
            let deadline = Instant::now() + self.engine.config.teardown_timeout();
            let (reply, _discard) = tokio::sync::oneshot::channel();
            let _ = self.engine.send(Command::CloseDevice {
                address: self.shared.address(),
                deadline,
                reply,
            });
        }
    }
}
