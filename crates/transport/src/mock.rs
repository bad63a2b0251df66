//! Scripted in-process transport for tests and demos
//!
//! [`MockTransport`] implements [`HostTransport`] against a table of
//! scripted devices. The paired [`MockController`] stays on the test side
//! after the transport moves into the engine thread and can plug/unplug
//! devices, queue endpoint replies, and inspect what the engine did.
//!
//! Completions are produced when the engine polls: each pending IN transfer
//! consumes the next reply queued for its endpoint, OUT transfers are
//! recorded and acknowledged, and control transfers are served from the
//! standard-descriptor synthesizer or the scripted control queue. A reply
//! marked [`held`](MockReply::held) settles but is not reported until the
//! controller releases it, which is how tests script out-of-order
//! completion delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{SubmitError, TransportError};
use crate::transfer::{Completion, CompletionStatus, ControlSetup, Submission, TransferHandle};
use crate::transport::{HostTransport, HotplugEvent};
use crate::types::{
    BusAddress, DeviceInfo, Direction, EndpointAddress, EndpointDescriptor, InterfaceDescriptor,
    Speed, TransferKind,
};

/// GET_DESCRIPTOR request code
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// Descriptor type: device
const DESCRIPTOR_DEVICE: u8 = 0x01;
/// Descriptor type: string
const DESCRIPTOR_STRING: u8 = 0x03;

/// String descriptor indices the synthesizer wires to `DeviceInfo` fields.
const STRING_MANUFACTURER: u8 = 1;
const STRING_PRODUCT: u8 = 2;
const STRING_SERIAL: u8 = 3;

/// A scripted device visible to the mock transport.
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    pub info: DeviceInfo,
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Extra string descriptors beyond the identity strings, by index
    pub strings: HashMap<u8, String>,
    /// When false, `open` fails with `AccessDenied`
    pub accessible: bool,
    /// Interfaces held by a phantom other owner; `claim` fails with `Busy`
    pub busy_interfaces: HashSet<u8>,
}

impl MockDeviceSpec {
    pub fn new(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> Self {
        Self {
            info: DeviceInfo {
                address: BusAddress::new(bus, address),
                vendor_id,
                product_id,
                class: 0,
                subclass: 0,
                protocol: 0,
                device_release: 0x0100,
                speed: Speed::High,
                manufacturer: Some("Mock Manufacturer".to_string()),
                product: Some("Mock Product".to_string()),
                serial_number: Some(format!("MOCK{bus:02}{address:03}")),
                num_configurations: 1,
            },
            interfaces: Vec::new(),
            strings: HashMap::new(),
            accessible: true,
            busy_interfaces: HashSet::new(),
        }
    }

    pub fn with_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.info.class = class;
        self.info.subclass = subclass;
        self.info.protocol = protocol;
        self
    }

    pub fn with_interface(mut self, interface: InterfaceDescriptor) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Adds an interface with a single endpoint, the common test topology.
    pub fn with_endpoint(
        mut self,
        interface: u8,
        class: u8,
        endpoint: EndpointDescriptor,
    ) -> Self {
        if let Some(existing) = self.interfaces.iter_mut().find(|i| i.number == interface) {
            existing.endpoints.push(endpoint);
        } else {
            self.interfaces.push(InterfaceDescriptor {
                number: interface,
                class,
                subclass: 0,
                protocol: 0,
                endpoints: vec![endpoint],
            });
        }
        self
    }

    pub fn with_string(mut self, index: u8, value: &str) -> Self {
        self.strings.insert(index, value.to_string());
        self
    }

    pub fn inaccessible(mut self) -> Self {
        self.accessible = false;
        self
    }

    pub fn with_busy_interface(mut self, interface: u8) -> Self {
        self.busy_interfaces.insert(interface);
        self
    }

    pub fn address(&self) -> BusAddress {
        self.info.address
    }
}

/// A scripted reply for one IN or control transfer.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: ReplyOutcome,
    hold: bool,
}

#[derive(Debug, Clone)]
enum ReplyOutcome {
    Data(Vec<u8>),
    Ack,
    Stall,
    Timeout,
    Error(String),
}

impl MockReply {
    /// Completes the transfer with `bytes` as the payload.
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            outcome: ReplyOutcome::Data(bytes.into()),
            hold: false,
        }
    }

    /// Completes the transfer successfully with zero bytes.
    pub fn empty() -> Self {
        Self {
            outcome: ReplyOutcome::Ack,
            hold: false,
        }
    }

    pub fn stall() -> Self {
        Self {
            outcome: ReplyOutcome::Stall,
            hold: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            outcome: ReplyOutcome::Timeout,
            hold: false,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            outcome: ReplyOutcome::Error(message.to_string()),
            hold: false,
        }
    }

    /// Settle the transfer but withhold the completion until the controller
    /// releases it. Lets tests deliver completions out of submission order.
    pub fn held(mut self) -> Self {
        self.hold = true;
        self
    }
}

#[derive(Debug)]
struct MockDevice {
    spec: MockDeviceSpec,
    present: bool,
    open: bool,
    claimed: HashSet<u8>,
    in_replies: HashMap<u8, VecDeque<MockReply>>,
    control_replies: VecDeque<MockReply>,
    out_written: HashMap<u8, Vec<Vec<u8>>>,
    control_log: Vec<(ControlSetup, Vec<u8>)>,
}

impl MockDevice {
    fn new(spec: MockDeviceSpec) -> Self {
        Self {
            spec,
            present: true,
            open: false,
            claimed: HashSet::new(),
            in_replies: HashMap::new(),
            control_replies: VecDeque::new(),
            out_written: HashMap::new(),
            control_log: Vec::new(),
        }
    }

    fn endpoint(&self, address: EndpointAddress) -> Option<(&InterfaceDescriptor, &EndpointDescriptor)> {
        for interface in &self.spec.interfaces {
            if let Some(ep) = interface.endpoint(address) {
                return Some((interface, ep));
            }
        }
        None
    }
}

#[derive(Debug)]
struct PendingTransfer {
    handle: TransferHandle,
    address: BusAddress,
    submission: Submission,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<BusAddress, MockDevice>,
    pending: Vec<PendingTransfer>,
    ready: VecDeque<Completion>,
    held: Vec<Completion>,
    hotplug: VecDeque<HotplugEvent>,
    cancel_requested: HashSet<TransferHandle>,
    next_handle: u64,
}

#[derive(Debug, Default)]
struct MockShared {
    state: Mutex<MockState>,
    wake: Condvar,
}

/// The transport half; moves into the engine thread.
pub struct MockTransport {
    shared: Arc<MockShared>,
}

/// The test half; stays with the test and scripts the bus.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<MockShared>,
}

impl MockTransport {
    /// Creates an empty bus.
    pub fn new() -> (Self, MockController) {
        Self::with_devices(Vec::new())
    }

    /// Creates a bus with `devices` already plugged in. No hotplug events
    /// are generated for them.
    pub fn with_devices(devices: Vec<MockDeviceSpec>) -> (Self, MockController) {
        let mut state = MockState::default();
        for spec in devices {
            state.devices.insert(spec.address(), MockDevice::new(spec));
        }
        let shared = Arc::new(MockShared {
            state: Mutex::new(state),
            wake: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockController { shared },
        )
    }
}

/// Settles as many pending transfers as currently can be settled.
fn settle(state: &mut MockState) {
    let now = Instant::now();
    let pending = std::mem::take(&mut state.pending);
    for transfer in pending {
        if state.cancel_requested.remove(&transfer.handle) {
            finish(
                state,
                transfer,
                CompletionStatus::Cancelled,
                0,
                None,
                false,
            );
            continue;
        }
        let device_gone = state
            .devices
            .get(&transfer.address)
            .map(|d| !d.present)
            .unwrap_or(true);
        if device_gone {
            finish(
                state,
                transfer,
                CompletionStatus::Disconnected,
                0,
                None,
                false,
            );
            continue;
        }
        match take_reply(state, &transfer) {
            Some(reply) => {
                apply_reply(state, transfer, reply);
            }
            None => {
                if transfer.deadline.is_some_and(|d| d <= now) {
                    finish(state, transfer, CompletionStatus::Timeout, 0, None, false);
                } else {
                    state.pending.push(transfer);
                }
            }
        }
    }
}

/// Picks the reply for a pending transfer, or synthesizes one for standard
/// control requests. `None` leaves the transfer pending.
fn take_reply(state: &mut MockState, transfer: &PendingTransfer) -> Option<MockReply> {
    let device = state.devices.get_mut(&transfer.address)?;
    let submission = &transfer.submission;
    match submission.kind {
        TransferKind::Control => {
            let Some(setup) = submission.setup else {
                return Some(MockReply::stall());
            };
            device.control_log.push((setup, submission.data.clone()));
            if setup.request_type & 0x60 == 0 && setup.request_type & 0x1f == 0 {
                // Standard device-recipient request
                if setup.request_type & 0x80 != 0 && setup.request == REQUEST_GET_DESCRIPTOR {
                    // A short read of a longer descriptor is normal, so the
                    // synthesized bytes are clipped to the request's capacity.
                    return Some(match synthesize_descriptor(&device.spec, setup) {
                        Some(mut bytes) => {
                            bytes.truncate(submission.data.len());
                            MockReply::data(bytes)
                        }
                        None => MockReply::stall(),
                    });
                }
                // SET_CONFIGURATION, CLEAR_FEATURE and friends: plain ack
                return Some(MockReply::empty());
            }
            // Class/vendor requests, and standard requests aimed at an
            // interface or endpoint (HID report descriptors live there),
            // come from the script. Only IN requests consume it: an OUT
            // request (SET_CUR, SET_REPORT) carries no data stage back, so
            // it must not swallow a reply scripted for a later read.
            if setup.request_type & 0x80 != 0 {
                match device.control_replies.pop_front() {
                    Some(reply) => Some(reply),
                    None => Some(MockReply::stall()),
                }
            } else {
                Some(MockReply::empty())
            }
        }
        _ => match submission.endpoint.direction() {
            Direction::In => device
                .in_replies
                .get_mut(&submission.endpoint.0)
                .and_then(|q| q.pop_front()),
            Direction::Out => {
                device
                    .out_written
                    .entry(submission.endpoint.0)
                    .or_default()
                    .push(submission.data.clone());
                Some(MockReply::empty())
            }
        },
    }
}

fn apply_reply(state: &mut MockState, transfer: PendingTransfer, reply: MockReply) {
    let hold = reply.hold;
    match reply.outcome {
        ReplyOutcome::Data(bytes) => {
            let capacity = transfer.submission.data.len();
            if bytes.len() > capacity {
                finish(state, transfer, CompletionStatus::Overflow, bytes.len(), None, hold);
            } else {
                let length = bytes.len();
                finish(state, transfer, CompletionStatus::Success, length, Some(bytes), hold);
            }
        }
        ReplyOutcome::Ack => {
            let length = match transfer.submission.endpoint.direction() {
                Direction::Out => transfer.submission.data.len(),
                Direction::In => 0,
            };
            finish(state, transfer, CompletionStatus::Success, length, None, hold);
        }
        ReplyOutcome::Stall => finish(state, transfer, CompletionStatus::Stall, 0, None, hold),
        ReplyOutcome::Timeout => finish(state, transfer, CompletionStatus::Timeout, 0, None, hold),
        ReplyOutcome::Error(message) => finish(
            state,
            transfer,
            CompletionStatus::Io(message),
            0,
            None,
            hold,
        ),
    }
}

fn finish(
    state: &mut MockState,
    transfer: PendingTransfer,
    status: CompletionStatus,
    length: usize,
    payload: Option<Vec<u8>>,
    hold: bool,
) {
    let mut data = transfer.submission.data;
    if let Some(payload) = payload {
        data[..payload.len()].copy_from_slice(&payload);
    }
    let completion = Completion {
        handle: transfer.handle,
        status,
        data,
        length,
    };
    if hold {
        state.held.push(completion);
    } else {
        state.ready.push_back(completion);
    }
}

/// Builds the standard descriptor responses GET_DESCRIPTOR can ask for.
fn synthesize_descriptor(spec: &MockDeviceSpec, setup: ControlSetup) -> Option<Vec<u8>> {
    let descriptor_type = (setup.value >> 8) as u8;
    let index = (setup.value & 0xff) as u8;
    match descriptor_type {
        DESCRIPTOR_DEVICE => {
            let info = &spec.info;
            let mut d = Vec::with_capacity(18);
            d.push(18);
            d.push(DESCRIPTOR_DEVICE);
            d.extend_from_slice(&0x0200u16.to_le_bytes());
            d.push(info.class);
            d.push(info.subclass);
            d.push(info.protocol);
            d.push(64);
            d.extend_from_slice(&info.vendor_id.to_le_bytes());
            d.extend_from_slice(&info.product_id.to_le_bytes());
            d.extend_from_slice(&info.device_release.to_le_bytes());
            d.push(if info.manufacturer.is_some() { STRING_MANUFACTURER } else { 0 });
            d.push(if info.product.is_some() { STRING_PRODUCT } else { 0 });
            d.push(if info.serial_number.is_some() { STRING_SERIAL } else { 0 });
            d.push(info.num_configurations);
            Some(d)
        }
        DESCRIPTOR_STRING => {
            if index == 0 {
                // Language table: en-US only
                return Some(vec![4, DESCRIPTOR_STRING, 0x09, 0x04]);
            }
            let value = match index {
                STRING_MANUFACTURER => spec.info.manufacturer.clone(),
                STRING_PRODUCT => spec.info.product.clone(),
                STRING_SERIAL => spec.info.serial_number.clone(),
                other => spec.strings.get(&other).cloned(),
            }?;
            let units: Vec<u16> = value.encode_utf16().collect();
            let mut d = Vec::with_capacity(2 + units.len() * 2);
            d.push((2 + units.len() * 2) as u8);
            d.push(DESCRIPTOR_STRING);
            for unit in units {
                d.extend_from_slice(&unit.to_le_bytes());
            }
            Some(d)
        }
        _ => None,
    }
}

impl HostTransport for MockTransport {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, TransportError> {
        let state = self.shared.state.lock().unwrap();
        Ok(state
            .devices
            .values()
            .filter(|d| d.present)
            .map(|d| d.spec.info.clone())
            .collect())
    }

    fn open(&mut self, address: BusAddress) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        let device = state
            .devices
            .get_mut(&address)
            .filter(|d| d.present)
            .ok_or(TransportError::NotFound)?;
        if !device.spec.accessible {
            return Err(TransportError::AccessDenied);
        }
        if device.open {
            return Err(TransportError::Busy);
        }
        device.open = true;
        Ok(())
    }

    fn close(&mut self, address: BusAddress) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(&address) {
            device.open = false;
            device.claimed.clear();
        }
        Ok(())
    }

    fn interfaces(&mut self, address: BusAddress) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        let state = self.shared.state.lock().unwrap();
        let device = state
            .devices
            .get(&address)
            .filter(|d| d.present)
            .ok_or(TransportError::NotFound)?;
        Ok(device.spec.interfaces.clone())
    }

    fn claim_interface(&mut self, address: BusAddress, interface: u8) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        let device = state.devices.get_mut(&address).ok_or(TransportError::NotFound)?;
        if !device.present {
            return Err(TransportError::Disconnected);
        }
        if !device.spec.interfaces.iter().any(|i| i.number == interface) {
            return Err(TransportError::NoSuchInterface(interface));
        }
        if device.spec.busy_interfaces.contains(&interface) {
            return Err(TransportError::Busy);
        }
        device.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(
        &mut self,
        address: BusAddress,
        interface: u8,
    ) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        let device = state.devices.get_mut(&address).ok_or(TransportError::NotFound)?;
        device.claimed.remove(&interface);
        Ok(())
    }

    fn submit(
        &mut self,
        address: BusAddress,
        submission: Submission,
    ) -> Result<TransferHandle, SubmitError> {
        let mut state = self.shared.state.lock().unwrap();
        let device = match state.devices.get(&address) {
            Some(d) if d.present => d,
            Some(_) => return Err(SubmitError::new(submission, TransportError::Disconnected)),
            None => return Err(SubmitError::new(submission, TransportError::NotFound)),
        };
        match submission.kind {
            TransferKind::Control => {
                if submission.setup.is_none() {
                    return Err(SubmitError::new(
                        submission,
                        TransportError::InvalidSubmission("control transfer without setup".into()),
                    ));
                }
                if submission.endpoint.number() != 0 {
                    return Err(SubmitError::new(
                        submission,
                        TransportError::InvalidSubmission(
                            "control transfer on non-zero endpoint".into(),
                        ),
                    ));
                }
            }
            _ => {
                if submission.setup.is_some() {
                    return Err(SubmitError::new(
                        submission,
                        TransportError::InvalidSubmission("setup on non-control transfer".into()),
                    ));
                }
                match device.endpoint(submission.endpoint) {
                    None => {
                        let error = TransportError::InvalidSubmission(format!(
                            "no endpoint {} on device {address}",
                            submission.endpoint
                        ));
                        return Err(SubmitError::new(submission, error));
                    }
                    Some((interface, _)) if !device.claimed.contains(&interface.number) => {
                        return Err(SubmitError::new(
                            submission,
                            TransportError::InvalidSubmission(format!(
                                "interface {} not claimed",
                                interface.number
                            )),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
        state.next_handle += 1;
        let handle = TransferHandle(state.next_handle);
        let deadline = (submission.timeout > Duration::ZERO)
            .then(|| Instant::now() + submission.timeout);
        state.pending.push(PendingTransfer {
            handle,
            address,
            submission,
            deadline,
        });
        self.shared.wake.notify_all();
        Ok(handle)
    }

    fn cancel(&mut self, handle: TransferHandle) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.pending.iter().any(|p| p.handle == handle) {
            state.cancel_requested.insert(handle);
            self.shared.wake.notify_all();
        }
        Ok(())
    }

    fn poll_completions(&mut self, wait: Duration) -> Result<Vec<Completion>, TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        settle(&mut state);
        if state.ready.is_empty() && wait > Duration::ZERO {
            let (guard, _timeout) = self
                .shared
                .wake
                .wait_timeout(state, wait)
                .map_err(|_| TransportError::Io("mock state poisoned".into()))?;
            state = guard;
            settle(&mut state);
        }
        Ok(state.ready.drain(..).collect())
    }

    fn poll_hotplug(&mut self) -> Vec<HotplugEvent> {
        let mut state = self.shared.state.lock().unwrap();
        state.hotplug.drain(..).collect()
    }
}

impl MockController {
    /// Plugs in a device and emits an `Arrived` event. Re-plugging an
    /// address replaces the previous device's script entirely.
    pub fn plug(&self, spec: MockDeviceSpec) {
        let mut state = self.shared.state.lock().unwrap();
        let info = spec.info.clone();
        state.devices.insert(spec.address(), MockDevice::new(spec));
        state.hotplug.push_back(HotplugEvent::Arrived(info));
        self.shared.wake.notify_all();
    }

    /// Unplugs a device. In-flight transfers settle with `Disconnected` at
    /// the next poll and a `Left` event is emitted.
    pub fn unplug(&self, address: BusAddress) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(&address) {
            device.present = false;
            device.open = false;
            state.hotplug.push_back(HotplugEvent::Left(address));
            self.shared.wake.notify_all();
        }
    }

    /// Queues a reply for the next pending (or future) IN transfer on an
    /// endpoint. Replies are consumed in submission order.
    pub fn queue_in(&self, address: BusAddress, endpoint: EndpointAddress, reply: MockReply) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(&address) {
            device.in_replies.entry(endpoint.0).or_default().push_back(reply);
            self.shared.wake.notify_all();
        }
    }

    /// Queues a reply for the next IN-direction class/vendor control
    /// transfer. OUT requests are acked without consuming the queue.
    pub fn queue_control(&self, address: BusAddress, reply: MockReply) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(&address) {
            device.control_replies.push_back(reply);
            self.shared.wake.notify_all();
        }
    }

    /// Number of completions currently withheld by `held()` replies.
    pub fn held_count(&self) -> usize {
        self.shared.state.lock().unwrap().held.len()
    }

    /// Releases the withheld completion at `index` (settle order).
    pub fn release_held_at(&self, index: usize) {
        let mut state = self.shared.state.lock().unwrap();
        if index < state.held.len() {
            let completion = state.held.remove(index);
            state.ready.push_back(completion);
            self.shared.wake.notify_all();
        }
    }

    /// Releases all withheld completions in settle order.
    pub fn release_held(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let held = std::mem::take(&mut state.held);
        state.ready.extend(held);
        self.shared.wake.notify_all();
    }

    /// Buffers currently inside the transport: pending, withheld, or
    /// settled but not yet polled. Zero once the engine has quiesced.
    pub fn outstanding(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.pending.len() + state.held.len() + state.ready.len()
    }

    /// Payloads the engine wrote to an OUT endpoint, in order.
    pub fn written(&self, address: BusAddress, endpoint: EndpointAddress) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock().unwrap();
        state
            .devices
            .get(&address)
            .and_then(|d| d.out_written.get(&endpoint.0))
            .cloned()
            .unwrap_or_default()
    }

    /// Control requests the engine issued to a device, setup plus payload.
    pub fn control_log(&self, address: BusAddress) -> Vec<(ControlSetup, Vec<u8>)> {
        let state = self.shared.state.lock().unwrap();
        state
            .devices
            .get(&address)
            .map(|d| d.control_log.clone())
            .unwrap_or_default()
    }

    /// Interfaces currently claimed on a device.
    pub fn claimed(&self, address: BusAddress) -> Vec<u8> {
        let state = self.shared.state.lock().unwrap();
        let mut claimed: Vec<u8> = state
            .devices
            .get(&address)
            .map(|d| d.claimed.iter().copied().collect())
            .unwrap_or_default();
        claimed.sort_unstable();
        claimed
    }

    pub fn is_open(&self, address: BusAddress) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.devices.get(&address).is_some_and(|d| d.open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_device() -> MockDeviceSpec {
        MockDeviceSpec::new(1, 2, 0x1234, 0x5678).with_endpoint(
            0,
            0xff,
            EndpointDescriptor {
                address: EndpointAddress::input(1),
                kind: TransferKind::Bulk,
                max_packet_size: 512,
                interval: 0,
            },
        )
    }

    fn open_and_claim(transport: &mut MockTransport, address: BusAddress) {
        transport.open(address).unwrap();
        transport.claim_interface(address, 0).unwrap();
    }

    #[test]
    fn submit_requires_claimed_interface() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, _ctl) = MockTransport::with_devices(vec![spec]);
        transport.open(address).unwrap();

        let submission = Submission::input(
            EndpointAddress::input(1),
            TransferKind::Bulk,
            64,
            Duration::ZERO,
        );
        let err = transport.submit(address, submission).unwrap_err();
        assert!(matches!(err.error, TransportError::InvalidSubmission(_)));
        assert_eq!(err.submission.data.len(), 64);
    }

    #[test]
    fn submit_to_a_missing_endpoint_returns_the_buffer() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        let submission = Submission::input(
            EndpointAddress::input(3),
            TransferKind::Bulk,
            32,
            Duration::ZERO,
        );
        let err = transport.submit(address, submission).unwrap_err();
        assert!(matches!(err.error, TransportError::InvalidSubmission(_)));
        assert_eq!(err.submission.data.len(), 32);
        assert_eq!(ctl.outstanding(), 0);
    }

    #[test]
    fn out_control_requests_do_not_consume_scripted_replies() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        ctl.queue_control(address, MockReply::data(vec![0xaa; 4]));

        // A class OUT (SET_CUR style) is acked without touching the script
        let set = ControlSetup {
            request_type: 0x21,
            request: 0x01,
            value: 0x0100,
            index: 0,
        };
        let out = transport
            .submit(address, Submission::control(set, vec![1, 2, 3], Duration::ZERO))
            .unwrap();
        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].handle, out);
        assert_eq!(completions[0].status, CompletionStatus::Success);
        assert_eq!(completions[0].length, 3);

        // The IN that follows still sees the scripted data
        let get = ControlSetup {
            request_type: 0xa1,
            request: 0x81,
            value: 0x0100,
            index: 0,
        };
        let input = transport
            .submit(address, Submission::control(get, vec![0u8; 8], Duration::ZERO))
            .unwrap();
        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].handle, input);
        assert_eq!(completions[0].status, CompletionStatus::Success);
        assert_eq!(completions[0].length, 4);
        assert_eq!(&completions[0].data[..4], &[0xaa; 4]);
        assert_eq!(ctl.outstanding(), 0);
    }

    #[test]
    fn scripted_reply_completes_in_transfer() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        ctl.queue_in(address, EndpointAddress::input(1), MockReply::data(vec![7u8; 9]));
        let handle = transport
            .submit(
                address,
                Submission::input(EndpointAddress::input(1), TransferKind::Bulk, 64, Duration::ZERO),
            )
            .unwrap();

        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions.len(), 1);
        let c = &completions[0];
        assert_eq!(c.handle, handle);
        assert_eq!(c.status, CompletionStatus::Success);
        assert_eq!(c.length, 9);
        assert_eq!(&c.data[..9], &[7u8; 9]);
        assert_eq!(c.data.len(), 64);
        assert_eq!(ctl.outstanding(), 0);
    }

    #[test]
    fn oversized_reply_reports_overflow_with_attempted_length() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        ctl.queue_in(address, EndpointAddress::input(1), MockReply::data(vec![0u8; 128]));
        transport
            .submit(
                address,
                Submission::input(EndpointAddress::input(1), TransferKind::Bulk, 64, Duration::ZERO),
            )
            .unwrap();

        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions[0].status, CompletionStatus::Overflow);
        assert_eq!(completions[0].length, 128);
        assert_eq!(completions[0].data.len(), 64);
    }

    #[test]
    fn device_descriptor_is_synthesized() {
        let spec = MockDeviceSpec::new(1, 2, 0xabcd, 0x0042);
        let address = spec.address();
        let (mut transport, _ctl) = MockTransport::with_devices(vec![spec]);
        transport.open(address).unwrap();

        let setup = ControlSetup {
            request_type: 0x80,
            request: REQUEST_GET_DESCRIPTOR,
            value: (DESCRIPTOR_DEVICE as u16) << 8,
            index: 0,
        };
        transport
            .submit(address, Submission::control(setup, vec![0u8; 18], Duration::ZERO))
            .unwrap();
        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        let c = &completions[0];
        assert_eq!(c.status, CompletionStatus::Success);
        assert_eq!(c.length, 18);
        assert_eq!(c.data[0], 18);
        assert_eq!(u16::from_le_bytes([c.data[8], c.data[9]]), 0xabcd);
        assert_eq!(u16::from_le_bytes([c.data[10], c.data[11]]), 0x0042);
    }

    #[test]
    fn unplug_disconnects_pending_transfers_and_emits_left() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        transport
            .submit(
                address,
                Submission::input(EndpointAddress::input(1), TransferKind::Bulk, 64, Duration::ZERO),
            )
            .unwrap();
        ctl.unplug(address);

        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions[0].status, CompletionStatus::Disconnected);
        assert!(matches!(
            transport.poll_hotplug().as_slice(),
            [HotplugEvent::Left(a)] if *a == address
        ));
        assert_eq!(ctl.outstanding(), 0);
    }

    #[test]
    fn held_replies_reorder_completion_delivery() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        let ep = EndpointAddress::input(1);
        ctl.queue_in(address, ep, MockReply::data(vec![1]).held());
        ctl.queue_in(address, ep, MockReply::data(vec![2]));
        let first = transport
            .submit(address, Submission::input(ep, TransferKind::Bulk, 8, Duration::ZERO))
            .unwrap();
        let second = transport
            .submit(address, Submission::input(ep, TransferKind::Bulk, 8, Duration::ZERO))
            .unwrap();

        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].handle, second);
        assert_eq!(ctl.held_count(), 1);

        ctl.release_held();
        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions[0].handle, first);
    }

    #[test]
    fn timeout_settles_after_deadline() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, _ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        transport
            .submit(
                address,
                Submission::input(
                    EndpointAddress::input(1),
                    TransferKind::Bulk,
                    64,
                    Duration::from_millis(5),
                ),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions[0].status, CompletionStatus::Timeout);
    }

    #[test]
    fn cancel_settles_as_cancelled_and_is_idempotent() {
        let spec = bulk_device();
        let address = spec.address();
        let (mut transport, ctl) = MockTransport::with_devices(vec![spec]);
        open_and_claim(&mut transport, address);

        let handle = transport
            .submit(
                address,
                Submission::input(EndpointAddress::input(1), TransferKind::Bulk, 64, Duration::ZERO),
            )
            .unwrap();
        transport.cancel(handle).unwrap();
        transport.cancel(handle).unwrap();

        let completions = transport.poll_completions(Duration::from_millis(10)).unwrap();
        assert_eq!(completions[0].status, CompletionStatus::Cancelled);
        transport.cancel(handle).unwrap();
        assert_eq!(ctl.outstanding(), 0);
    }
}
