//! HID class driver
//!
//! Claims the device's HID interface, fetches the report descriptor, and
//! exposes GET_REPORT/SET_REPORT plus a continuous input-report stream on
//! the interrupt IN endpoint.

use std::time::Duration;

use host::{
    ClassDriver, ControlRequest, Device, DeviceFilter, DriverRegistry, Recipient, Stream,
    StreamConfig, UsbError,
};
use tracing::debug;
use transport::{Direction, EndpointAddress, TransferKind};

use crate::{DriverError, Result};

/// HID interface class code
pub const CLASS_HID: u8 = 0x03;

/// Descriptor type: HID report descriptor (interface recipient)
pub const DESCRIPTOR_HID_REPORT: u8 = 0x22;

/// Class request: GET_REPORT
pub const REQUEST_GET_REPORT: u8 = 0x01;
/// Class request: SET_REPORT
pub const REQUEST_SET_REPORT: u8 = 0x09;

/// Largest report descriptor the driver will read
const MAX_REPORT_DESCRIPTOR: usize = 4096;

/// Report type selector for GET_REPORT/SET_REPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Input = 1,
    Output = 2,
    Feature = 3,
}

impl ReportKind {
    /// wValue encoding: report type in the high byte, report id low.
    fn value(self, report_id: u8) -> u16 {
        ((self as u16) << 8) | u16::from(report_id)
    }
}

/// An opened HID device with its interface claimed.
#[derive(Debug)]
pub struct HidDevice {
    device: Device,
    interface: u8,
    interrupt_in: EndpointAddress,
}

impl HidDevice {
    /// Claims the first HID interface and locates its interrupt IN
    /// endpoint.
    pub fn open(mut device: Device) -> Result<Self> {
        let Some((interface, interrupt_in)) = device.interfaces().iter().find_map(|i| {
            if i.class != CLASS_HID {
                return None;
            }
            let endpoint = i.endpoints.iter().find(|e| {
                e.kind == TransferKind::Interrupt && e.address.direction() == Direction::In
            })?;
            Some((i.number, endpoint.address))
        }) else {
            return Err(DriverError::Protocol(format!(
                "no HID interface with an interrupt IN endpoint on {}",
                device.address()
            )));
        };
        device.claim_interface(interface)?;
        debug!(address = %device.address(), interface, "HID interface claimed");
        Ok(Self {
            device,
            interface,
            interrupt_in,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Fetches the interface's report descriptor.
    pub fn report_descriptor(&self) -> Result<Vec<u8>> {
        let request = ControlRequest::standard_in(
            Recipient::Interface,
            host::control::REQUEST_GET_DESCRIPTOR,
            u16::from(DESCRIPTOR_HID_REPORT) << 8,
            u16::from(self.interface),
        );
        let data = self
            .device
            .control_in(request, MAX_REPORT_DESCRIPTOR, self.timeout())?;
        if data.is_empty() {
            return Err(DriverError::Protocol("empty report descriptor".to_string()));
        }
        Ok(data)
    }

    /// GET_REPORT: reads the current report of `kind`, up to `length` bytes.
    pub fn get_report(&self, kind: ReportKind, report_id: u8, length: usize) -> Result<Vec<u8>> {
        let request = ControlRequest::class_in(
            Recipient::Interface,
            REQUEST_GET_REPORT,
            kind.value(report_id),
            u16::from(self.interface),
        );
        Ok(self.device.control_in(request, length, self.timeout())?)
    }

    /// SET_REPORT: writes a report of `kind`.
    pub fn set_report(&self, kind: ReportKind, report_id: u8, data: &[u8]) -> Result<()> {
        let request = ControlRequest::class_out(
            Recipient::Interface,
            REQUEST_SET_REPORT,
            kind.value(report_id),
            u16::from(self.interface),
        );
        self.device.control_out(request, data, self.timeout())?;
        Ok(())
    }

    /// Continuous input reports from the interrupt IN endpoint. Each
    /// delivered payload is one report.
    pub fn input_reports(&self, config: StreamConfig) -> Result<Stream> {
        Ok(self.device.open_stream(self.interrupt_in, config)?)
    }

    fn timeout(&self) -> Duration {
        self.device.default_timeout()
    }
}

impl ClassDriver for HidDevice {
    fn name(&self) -> &str {
        "hid"
    }
}

/// Registers the HID driver for all HID-class devices.
pub fn register(registry: &mut DriverRegistry) {
    registry.register(DeviceFilter::class(CLASS_HID), |device| {
        let hid = HidDevice::open(device).map_err(UsbError::from)?;
        Ok(Box::new(hid) as Box<dyn ClassDriver>)
    });
}
