//! Control-endpoint request building
//!
//! A [`ControlRequest`] names the SETUP fields of one request on the default
//! control endpoint. `Device::control_in`/`control_out` execute it as a
//! single blocking transfer; no state survives the call.

use transport::{ControlSetup, Direction};

use crate::error::{Result, UsbError};

/// Standard request code: GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Descriptor type: device
pub const DESCRIPTOR_DEVICE: u8 = 0x01;
/// Descriptor type: configuration
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
/// Descriptor type: string
pub const DESCRIPTOR_STRING: u8 = 0x03;

/// en-US language id, the default for string descriptor reads
pub const LANGUAGE_EN_US: u16 = 0x0409;

/// Request class bits of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Standard,
    Class,
    Vendor,
}

/// Recipient bits of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// SETUP fields of a control request.
///
/// Constructors compose the bmRequestType byte from direction, class, and
/// recipient so callers never hand-assemble bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
}

impl ControlRequest {
    pub fn new(
        direction: Direction,
        class: RequestClass,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
    ) -> Self {
        let mut request_type = match recipient {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
            Recipient::Other => 0x03,
        };
        request_type |= match class {
            RequestClass::Standard => 0x00,
            RequestClass::Class => 0x20,
            RequestClass::Vendor => 0x40,
        };
        if direction == Direction::In {
            request_type |= 0x80;
        }
        Self {
            request_type,
            request,
            value,
            index,
        }
    }

    pub fn standard_in(recipient: Recipient, request: u8, value: u16, index: u16) -> Self {
        Self::new(Direction::In, RequestClass::Standard, recipient, request, value, index)
    }

    pub fn standard_out(recipient: Recipient, request: u8, value: u16, index: u16) -> Self {
        Self::new(Direction::Out, RequestClass::Standard, recipient, request, value, index)
    }

    pub fn class_in(recipient: Recipient, request: u8, value: u16, index: u16) -> Self {
        Self::new(Direction::In, RequestClass::Class, recipient, request, value, index)
    }

    pub fn class_out(recipient: Recipient, request: u8, value: u16, index: u16) -> Self {
        Self::new(Direction::Out, RequestClass::Class, recipient, request, value, index)
    }

    pub fn vendor_in(recipient: Recipient, request: u8, value: u16, index: u16) -> Self {
        Self::new(Direction::In, RequestClass::Vendor, recipient, request, value, index)
    }

    pub fn vendor_out(recipient: Recipient, request: u8, value: u16, index: u16) -> Self {
        Self::new(Direction::Out, RequestClass::Vendor, recipient, request, value, index)
    }

    /// GET_DESCRIPTOR for `descriptor_type` at `index`. `language` is the
    /// string-descriptor language id; pass 0 for non-string descriptors.
    pub fn get_descriptor(descriptor_type: u8, index: u8, language: u16) -> Self {
        Self::standard_in(
            Recipient::Device,
            REQUEST_GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            language,
        )
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub(crate) fn setup(&self) -> ControlSetup {
        ControlSetup {
            request_type: self.request_type,
            request: self.request,
            value: self.value,
            index: self.index,
        }
    }
}

/// Decodes a STRING descriptor payload: 2-byte header then UTF-16LE units.
pub fn decode_string_descriptor(data: &[u8]) -> Result<String> {
    if data.len() < 2 || data[1] != DESCRIPTOR_STRING {
        return Err(UsbError::Transport("malformed string descriptor".to_string()));
    }
    let length = usize::from(data[0]).min(data.len());
    let units: Vec<u16> = data[2..length]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}
