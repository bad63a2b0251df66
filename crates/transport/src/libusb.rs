//! Real transport over the libusb asynchronous API
//!
//! Uses `rusb` for device/interface lifecycle and drives the raw libusb
//! transfer machinery directly for submissions, because the safe `rusb`
//! surface only exposes blocking transfers. Each in-flight transfer is an
//! `Arc<Mutex<LiveTransfer>>`: one reference travels through libusb's
//! `user_data`, one stays in the transport's table so `cancel` can reach
//! the raw transfer while it is still active. The libusb transfer struct is
//! freed when the last reference drops.
//!
//! Isochronous submissions are mapped to single-packet transfers; the
//! engine's slot pool provides the queue depth libusb would otherwise get
//! from multi-packet URBs.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::constants::*;
use rusb::ffi::*;
use rusb::UsbContext;
use tracing::{debug, trace, warn};

use crate::error::{SubmitError, TransportError};
use crate::transfer::{Completion, CompletionStatus, Submission, TransferHandle};
use crate::transport::{HostTransport, HotplugEvent};
use crate::types::{
    BusAddress, DeviceInfo, Direction, EndpointAddress, EndpointDescriptor, InterfaceDescriptor,
    Speed, TransferKind,
};

const SETUP_LEN: usize = 8;

fn map_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Access => TransportError::AccessDenied,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::InvalidParam => {
            TransportError::InvalidSubmission("rejected by libusb".to_string())
        }
        other => TransportError::Io(other.to_string()),
    }
}

fn map_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

fn map_transfer_status(status: i32) -> CompletionStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => CompletionStatus::Success,
        LIBUSB_TRANSFER_TIMED_OUT => CompletionStatus::Timeout,
        LIBUSB_TRANSFER_STALL => CompletionStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => CompletionStatus::Disconnected,
        LIBUSB_TRANSFER_CANCELLED => CompletionStatus::Cancelled,
        LIBUSB_TRANSFER_OVERFLOW => CompletionStatus::Overflow,
        other => CompletionStatus::Io(format!("libusb transfer status {other}")),
    }
}

struct RawTransfer(NonNull<libusb_transfer>);

// SAFETY: the pointer is only dereferenced while holding the owning mutex.
unsafe impl Send for RawTransfer {}

/// Shared state of one in-flight transfer. The mutex serializes the libusb
/// callback against `cancel`, so the raw pointer is never used after free.
struct LiveTransfer {
    raw: Option<RawTransfer>,
    handle: TransferHandle,
    /// The engine's buffer, handed back through the completion
    data: Option<Vec<u8>>,
    /// Control transfers stage through a setup-prefixed buffer
    staging: Option<Vec<u8>>,
    control_in: bool,
    isochronous: bool,
    finished: bool,
    sink: Arc<CompletionSink>,
}

impl Drop for LiveTransfer {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: the callback has run (or the transfer was never
            // submitted), so libusb no longer touches this struct.
            unsafe { libusb_free_transfer(raw.0.as_ptr()) };
        }
    }
}

#[derive(Default)]
struct CompletionSink {
    completions: Mutex<Vec<Completion>>,
}

impl CompletionSink {
    fn push(&self, completion: Completion) {
        self.completions.lock().unwrap().push(completion);
    }

    fn drain(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completions.lock().unwrap())
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut libusb_transfer) {
    if transfer_ptr.is_null() {
        return;
    }
    // SAFETY: libusb hands back the pointer we submitted.
    let transfer: &mut libusb_transfer = unsafe { &mut *transfer_ptr };
    let user_data = transfer.user_data;
    if user_data.is_null() {
        return;
    }
    // SAFETY: user_data is always an `Arc<Mutex<LiveTransfer>>` we leaked at
    // submit time; this reclaims that reference.
    let live = unsafe { Arc::from_raw(user_data as *const Mutex<LiveTransfer>) };
    let mut live = live.lock().unwrap();
    live.finished = true;

    let status = map_transfer_status(transfer.status);
    let actual = if live.isochronous {
        // SAFETY: the transfer was allocated with one iso packet.
        let desc = unsafe { &*transfer.iso_packet_desc.as_ptr() };
        desc.actual_length as usize
    } else {
        transfer.actual_length as usize
    };

    let mut data = live.data.take().unwrap_or_default();
    if live.control_in {
        if let Some(staging) = live.staging.take() {
            let copy = actual.min(data.len());
            data[..copy].copy_from_slice(&staging[SETUP_LEN..SETUP_LEN + copy]);
        }
    }
    let length = match status {
        // Overflow reports at least one byte beyond the buffer
        CompletionStatus::Overflow => data.len() + 1,
        _ => actual,
    };
    let handle = live.handle;
    live.sink.push(Completion {
        handle,
        status,
        data,
        length,
    });
}

/// Queue shared with the rusb hotplug callback.
#[derive(Default)]
struct HotplugQueue {
    events: Mutex<Vec<HotplugEvent>>,
}

struct HotplugSink {
    queue: Arc<HotplugQueue>,
}

impl rusb::Hotplug<rusb::Context> for HotplugSink {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        match device_info(&device, None) {
            Ok(info) => {
                debug!(address = %info.address, id = %info.id_string(), "device arrived");
                self.queue
                    .events
                    .lock()
                    .unwrap()
                    .push(HotplugEvent::Arrived(info));
            }
            Err(err) => warn!("ignoring arrived device with unreadable descriptor: {err}"),
        }
    }

    fn device_left(&mut self, device: rusb::Device<rusb::Context>) {
        let address = BusAddress::new(device.bus_number(), device.address());
        debug!(%address, "device left");
        self.queue
            .events
            .lock()
            .unwrap()
            .push(HotplugEvent::Left(address));
    }
}

fn device_info(
    device: &rusb::Device<rusb::Context>,
    handle: Option<&rusb::DeviceHandle<rusb::Context>>,
) -> Result<DeviceInfo, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let (manufacturer, product, serial_number) = match handle {
        Some(handle) => (
            handle.read_manufacturer_string_ascii(&descriptor).ok(),
            handle.read_product_string_ascii(&descriptor).ok(),
            handle.read_serial_number_string_ascii(&descriptor).ok(),
        ),
        None => (None, None, None),
    };
    let release = descriptor.device_version();
    let device_release = ((release.major() as u16) << 8)
        | ((release.minor() as u16) << 4)
        | release.sub_minor() as u16;
    Ok(DeviceInfo {
        address: BusAddress::new(device.bus_number(), device.address()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        device_release,
        speed: map_speed(device.speed()),
        manufacturer,
        product,
        serial_number,
        num_configurations: descriptor.num_configurations(),
    })
}

fn map_interfaces(config: &rusb::ConfigDescriptor) -> Vec<InterfaceDescriptor> {
    let mut interfaces = Vec::new();
    for interface in config.interfaces() {
        // Alternate setting 0 is what a freshly claimed interface exposes
        let Some(descriptor) = interface.descriptors().next() else {
            continue;
        };
        let endpoints = descriptor
            .endpoint_descriptors()
            .map(|ep| EndpointDescriptor {
                address: EndpointAddress(ep.address()),
                kind: match ep.transfer_type() {
                    rusb::TransferType::Control => TransferKind::Control,
                    rusb::TransferType::Interrupt => TransferKind::Interrupt,
                    rusb::TransferType::Bulk => TransferKind::Bulk,
                    rusb::TransferType::Isochronous => TransferKind::Isochronous,
                },
                max_packet_size: ep.max_packet_size(),
                interval: ep.interval(),
            })
            .collect();
        interfaces.push(InterfaceDescriptor {
            number: descriptor.interface_number(),
            class: descriptor.class_code(),
            subclass: descriptor.sub_class_code(),
            protocol: descriptor.protocol_code(),
            endpoints,
        });
    }
    interfaces
}

/// [`HostTransport`] backed by libusb.
pub struct LibusbTransport {
    context: rusb::Context,
    handles: HashMap<BusAddress, rusb::DeviceHandle<rusb::Context>>,
    live: HashMap<TransferHandle, Arc<Mutex<LiveTransfer>>>,
    sink: Arc<CompletionSink>,
    hotplug: Arc<HotplugQueue>,
    _registration: Option<rusb::Registration<rusb::Context>>,
    next_handle: u64,
}

impl LibusbTransport {
    pub fn new() -> Result<Self, TransportError> {
        let context = rusb::Context::new().map_err(map_error)?;
        let hotplug = Arc::new(HotplugQueue::default());
        let registration = if rusb::has_hotplug() {
            rusb::HotplugBuilder::new()
                .enumerate(false)
                .register(
                    &context,
                    Box::new(HotplugSink {
                        queue: Arc::clone(&hotplug),
                    }),
                )
                .map(Some)
                .unwrap_or_else(|err| {
                    warn!("hotplug registration failed, events disabled: {err}");
                    None
                })
        } else {
            warn!("platform lacks hotplug support, events disabled");
            None
        };
        Ok(Self {
            context,
            handles: HashMap::new(),
            live: HashMap::new(),
            sink: Arc::new(CompletionSink::default()),
            hotplug,
            _registration: registration,
            next_handle: 0,
        })
    }

    fn find_device(
        &self,
        address: BusAddress,
    ) -> Result<rusb::Device<rusb::Context>, TransportError> {
        let devices = self.context.devices().map_err(map_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == address.bus && d.address() == address.address)
            .ok_or(TransportError::NotFound)
    }

    fn handle(
        &self,
        address: BusAddress,
    ) -> Result<&rusb::DeviceHandle<rusb::Context>, TransportError> {
        self.handles.get(&address).ok_or(TransportError::NotFound)
    }

    fn submit_raw(
        &mut self,
        address: BusAddress,
        submission: Submission,
    ) -> Result<TransferHandle, (Submission, TransportError)> {
        let Submission {
            endpoint,
            kind,
            setup,
            mut data,
            timeout,
        } = submission;
        let rebuild = |data: Vec<u8>| Submission {
            endpoint,
            kind,
            setup,
            data,
            timeout,
        };

        let device_handle = match self.handles.get(&address) {
            Some(h) => h.as_raw(),
            None => return Err((rebuild(data), TransportError::NotFound)),
        };

        let control_in = kind == TransferKind::Control && endpoint.direction() == Direction::In;
        let mut staging = None;
        if kind == TransferKind::Control {
            let setup = match setup {
                Some(setup) => setup,
                None => {
                    return Err((
                        rebuild(data),
                        TransportError::InvalidSubmission("control transfer without setup".into()),
                    ));
                }
            };
            let mut buf = vec![0u8; SETUP_LEN + data.len()];
            // SAFETY: buf is at least 8 bytes.
            unsafe {
                libusb_fill_control_setup(
                    buf.as_mut_ptr(),
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data.len() as u16,
                );
            }
            if !control_in {
                buf[SETUP_LEN..].copy_from_slice(&data);
            }
            staging = Some(buf);
        }

        let iso_packets = i32::from(kind == TransferKind::Isochronous);
        // SAFETY: plain allocation; checked for NULL below.
        let raw = unsafe { libusb_alloc_transfer(iso_packets) };
        let Some(raw) = NonNull::new(raw) else {
            return Err((rebuild(data), TransportError::Io("libusb_alloc_transfer".into())));
        };

        self.next_handle += 1;
        let handle = TransferHandle(self.next_handle);
        let timeout_ms = timeout.as_millis() as u32;

        let live = Arc::new(Mutex::new(LiveTransfer {
            raw: Some(RawTransfer(raw)),
            handle,
            data: None,
            staging: None,
            control_in,
            isochronous: kind == TransferKind::Isochronous,
            finished: false,
            sink: Arc::clone(&self.sink),
        }));
        let user_data = Arc::into_raw(Arc::clone(&live)) as *mut c_void;

        {
            let mut guard = live.lock().unwrap();
            let transfer_ptr = raw.as_ptr();
            // SAFETY: transfer_ptr is valid, the buffers are owned by the
            // LiveTransfer which outlives the submission, and the callback
            // matches libusb's expected signature.
            unsafe {
                match kind {
                    TransferKind::Control => {
                        let buf = guard.staging.insert(staging.take().unwrap_or_default());
                        libusb_fill_control_transfer(
                            transfer_ptr,
                            device_handle,
                            buf.as_mut_ptr(),
                            transfer_finished,
                            user_data,
                            timeout_ms,
                        );
                    }
                    TransferKind::Bulk => {
                        let len = data.len() as i32;
                        let buf = guard.data.insert(std::mem::take(&mut data));
                        libusb_fill_bulk_transfer(
                            transfer_ptr,
                            device_handle,
                            endpoint.0,
                            buf.as_mut_ptr(),
                            len,
                            transfer_finished,
                            user_data,
                            timeout_ms,
                        );
                    }
                    TransferKind::Interrupt => {
                        let len = data.len() as i32;
                        let buf = guard.data.insert(std::mem::take(&mut data));
                        libusb_fill_interrupt_transfer(
                            transfer_ptr,
                            device_handle,
                            endpoint.0,
                            buf.as_mut_ptr(),
                            len,
                            transfer_finished,
                            user_data,
                            timeout_ms,
                        );
                    }
                    TransferKind::Isochronous => {
                        let len = data.len() as i32;
                        let buf = guard.data.insert(std::mem::take(&mut data));
                        libusb_fill_iso_transfer(
                            transfer_ptr,
                            device_handle,
                            endpoint.0,
                            buf.as_mut_ptr(),
                            len,
                            1,
                            transfer_finished,
                            user_data,
                            timeout_ms,
                        );
                        libusb_set_iso_packet_lengths(transfer_ptr, len as u32);
                    }
                }
            }
            if kind == TransferKind::Control {
                // The engine's buffer rides alongside for the copy-back
                guard.data = Some(std::mem::take(&mut data));
            }

            // SAFETY: the transfer is fully filled in.
            let rc = unsafe { libusb_submit_transfer(transfer_ptr) };
            if rc < 0 {
                guard.finished = true;
                let returned = guard.data.take().unwrap_or_default();
                guard.staging = None;
                drop(guard);
                // SAFETY: reclaim the callback's reference, it will never run.
                unsafe { drop(Arc::from_raw(user_data as *const Mutex<LiveTransfer>)) };
                let error = match rc {
                    LIBUSB_ERROR_NO_DEVICE => TransportError::Disconnected,
                    LIBUSB_ERROR_BUSY => TransportError::Busy,
                    LIBUSB_ERROR_INVALID_PARAM => {
                        TransportError::InvalidSubmission("rejected by libusb".into())
                    }
                    other => TransportError::Io(format!("libusb_submit_transfer: {other}")),
                };
                return Err((rebuild(returned), error));
            }
        }

        trace!(%address, %endpoint, handle = handle.0, "submitted");
        self.live.insert(handle, live);
        Ok(handle)
    }
}

impl HostTransport for LibusbTransport {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>, TransportError> {
        let devices = self.context.devices().map_err(map_error)?;
        let mut infos = Vec::new();
        for device in devices.iter() {
            let address = BusAddress::new(device.bus_number(), device.address());
            // Use the open handle when we have one; otherwise a short-lived
            // open just for the identity strings, tolerating failure.
            let result = match self.handles.get(&address) {
                Some(handle) => device_info(&device, Some(handle)),
                None => match device.open() {
                    Ok(handle) => device_info(&device, Some(&handle)),
                    Err(_) => device_info(&device, None),
                },
            };
            match result {
                Ok(info) => infos.push(info),
                Err(err) => debug!(%address, "skipping unreadable device: {err}"),
            }
        }
        Ok(infos)
    }

    fn open(&mut self, address: BusAddress) -> Result<(), TransportError> {
        if self.handles.contains_key(&address) {
            return Err(TransportError::Busy);
        }
        let device = self.find_device(address)?;
        let handle = device.open().map_err(map_error)?;
        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            debug!(%address, "auto-detach not available: {err}");
        }
        self.handles.insert(address, handle);
        Ok(())
    }

    fn close(&mut self, address: BusAddress) -> Result<(), TransportError> {
        self.handles.remove(&address);
        Ok(())
    }

    fn interfaces(&mut self, address: BusAddress) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        let device = self.find_device(address)?;
        let config = device.active_config_descriptor().map_err(map_error)?;
        Ok(map_interfaces(&config))
    }

    fn claim_interface(&mut self, address: BusAddress, interface: u8) -> Result<(), TransportError> {
        self.handle(address)?
            .claim_interface(interface)
            .map_err(|err| match err {
                rusb::Error::NotFound => TransportError::NoSuchInterface(interface),
                other => map_error(other),
            })
    }

    fn release_interface(
        &mut self,
        address: BusAddress,
        interface: u8,
    ) -> Result<(), TransportError> {
        self.handle(address)?
            .release_interface(interface)
            .map_err(map_error)
    }

    fn submit(
        &mut self,
        address: BusAddress,
        submission: Submission,
    ) -> Result<TransferHandle, SubmitError> {
        self.submit_raw(address, submission)
            .map_err(|(submission, error)| SubmitError::new(submission, error))
    }

    fn cancel(&mut self, handle: TransferHandle) -> Result<(), TransportError> {
        if let Some(live) = self.live.get(&handle) {
            let mut live = live.lock().unwrap();
            if !live.finished
                && let Some(raw) = &live.raw
            {
                // SAFETY: not finished means libusb still owns the transfer,
                // and the mutex keeps the callback from freeing it under us.
                unsafe { libusb_cancel_transfer(raw.0.as_ptr()) };
            }
        }
        Ok(())
    }

    fn poll_completions(&mut self, wait: Duration) -> Result<Vec<Completion>, TransportError> {
        self.context
            .handle_events(Some(wait))
            .map_err(map_error)?;
        let completions = self.sink.drain();
        for completion in &completions {
            self.live.remove(&completion.handle);
        }
        Ok(completions)
    }

    fn poll_hotplug(&mut self) -> Vec<HotplugEvent> {
        std::mem::take(&mut *self.hotplug.events.lock().unwrap())
    }
}
