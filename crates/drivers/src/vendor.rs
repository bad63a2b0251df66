//! Vendor-specific instrument driver
//!
//! Command/response framing over a bulk OUT/IN endpoint pair, as
//! laboratory-instrument style devices do it:
//!
//! ```text
//! command:  [opcode: u8][length: u16 LE][payload]
//! response: [status: u8][length: u16 LE][payload]
//! ```
//!
//! Status 0 is success; anything else fails the command. A one-shot
//! [`acquire`](Instrument::acquire) triggers a measurement through a vendor
//! control request and reads the result off the bulk IN endpoint.

use byteorder::{ByteOrder, LittleEndian};
use host::{
    ClassDriver, ControlRequest, Device, DeviceFilter, DriverRegistry, Recipient, UsbError,
};
use tracing::{debug, trace};
use transport::{Direction, EndpointAddress, TransferKind};

use crate::{DriverError, Result};

/// Vendor-specific interface class code
pub const CLASS_VENDOR: u8 = 0xff;

/// Vendor control request: trigger an acquisition
pub const REQUEST_TRIGGER: u8 = 0x01;

/// Response status byte for success
pub const STATUS_OK: u8 = 0x00;

/// Largest command or response payload
pub const MAX_PAYLOAD: usize = 4096;

/// Bytes of framing around a payload (opcode/status + LE length)
const FRAME_HEADER: usize = 3;

/// An opened instrument with its vendor interface claimed.
pub struct Instrument {
    device: Device,
    bulk_out: EndpointAddress,
    bulk_in: EndpointAddress,
}

impl Instrument {
    /// Claims the first vendor-class interface carrying a bulk OUT/IN pair.
    pub fn open(mut device: Device) -> Result<Self> {
        let Some((interface, bulk_out, bulk_in)) = device.interfaces().iter().find_map(|i| {
            if i.class != CLASS_VENDOR {
                return None;
            }
            let out = i.endpoints.iter().find(|e| {
                e.kind == TransferKind::Bulk && e.address.direction() == Direction::Out
            })?;
            let input = i.endpoints.iter().find(|e| {
                e.kind == TransferKind::Bulk && e.address.direction() == Direction::In
            })?;
            Some((i.number, out.address, input.address))
        }) else {
            return Err(DriverError::Protocol(format!(
                "no vendor interface with a bulk OUT/IN pair on {}",
                device.address()
            )));
        };
        device.claim_interface(interface)?;
        debug!(address = %device.address(), interface, "vendor interface claimed");
        Ok(Self {
            device,
            bulk_out,
            bulk_in,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Executes one command and returns the response payload.
    pub fn command(&self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(DriverError::Protocol(format!(
                "command payload too large: {} bytes",
                payload.len()
            )));
        }
        let timeout = self.device.default_timeout();

        let mut frame = vec![0u8; FRAME_HEADER + payload.len()];
        frame[0] = opcode;
        LittleEndian::write_u16(&mut frame[1..3], payload.len() as u16);
        frame[FRAME_HEADER..].copy_from_slice(payload);
        self.device.transfer_out(self.bulk_out, &frame, timeout)?;
        trace!(opcode, len = payload.len(), "command sent");

        let response = self
            .device
            .transfer_in(self.bulk_in, FRAME_HEADER + MAX_PAYLOAD, timeout)?;
        Self::parse_response(&response)
    }

    /// Triggers an acquisition and reads the raw result.
    pub fn acquire(&self) -> Result<Vec<u8>> {
        let timeout = self.device.default_timeout();
        let trigger = ControlRequest::vendor_out(Recipient::Device, REQUEST_TRIGGER, 0, 0);
        self.device.control_out(trigger, &[], timeout)?;

        let data = self.device.transfer_in(self.bulk_in, MAX_PAYLOAD, timeout)?;
        if data.is_empty() {
            return Err(DriverError::Protocol("empty acquisition".to_string()));
        }
        Ok(data)
    }

    fn parse_response(response: &[u8]) -> Result<Vec<u8>> {
        if response.len() < FRAME_HEADER {
            return Err(DriverError::Protocol(format!(
                "response too short: {} bytes",
                response.len()
            )));
        }
        let status = response[0];
        if status != STATUS_OK {
            return Err(DriverError::CommandFailed(status));
        }
        let length = usize::from(LittleEndian::read_u16(&response[1..3]));
        if response.len() < FRAME_HEADER + length {
            return Err(DriverError::Protocol(format!(
                "response truncated: header says {length} bytes, {} present",
                response.len() - FRAME_HEADER
            )));
        }
        Ok(response[FRAME_HEADER..FRAME_HEADER + length].to_vec())
    }
}

impl ClassDriver for Instrument {
    fn name(&self) -> &str {
        "instrument"
    }
}

/// Registers the instrument driver for one specific device model.
pub fn register(registry: &mut DriverRegistry, vendor_id: u16, product_id: u16) {
    registry.register(DeviceFilter::product(vendor_id, product_id), |device| {
        let instrument = Instrument::open(device).map_err(UsbError::from)?;
        Ok(Box::new(instrument) as Box<dyn ClassDriver>)
    });
}
