//! USB device and endpoint type definitions
//!
//! These types describe what a transport reports about the bus: device
//! identity, speed, and the interface/endpoint topology the host engine
//! uses to validate submissions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Physical location of a device: bus number plus device address.
///
/// This is the stable key for a device while it stays plugged in. A
/// re-plugged device usually comes back with a different address, so a
/// `BusAddress` must never be cached across a `Left` hotplug event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusAddress {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl BusAddress {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.address)
    }
}

impl FromStr for BusAddress {
    type Err = String;

    /// Parses the `bus-address` form used on the command line, e.g. `1-4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, address) = s
            .split_once('-')
            .ok_or_else(|| format!("expected BUS-ADDRESS, got '{s}'"))?;
        let bus = bus
            .parse::<u8>()
            .map_err(|_| format!("invalid bus number '{bus}'"))?;
        let address = address
            .parse::<u8>()
            .map_err(|_| format!("invalid device address '{address}'"))?;
        Ok(Self { bus, address })
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
    /// Speed not reported by the transport
    Unknown,
}

/// Device information returned by enumeration
///
/// Carries the device-descriptor identity fields plus the cached string
/// descriptors, so callers can select devices without issuing control
/// transfers of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Bus location, unique while the device stays connected
    pub address: BusAddress,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Device release number (bcdDevice)
    pub device_release: u16,
    /// Device speed
    pub speed: Speed,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
    /// Number of configurations
    pub num_configurations: u8,
}

impl DeviceInfo {
    /// `VID:PID` form used in log messages and device listings.
    pub fn id_string(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint address byte, direction bit included
///
/// Bit 7 set means IN (device to host), bits 3..0 carry the endpoint
/// number. Address `0x00`/`0x80` is the default control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub u8);

const DIRECTION_IN: u8 = 0x80;

impl EndpointAddress {
    /// IN endpoint with the given number.
    pub fn input(number: u8) -> Self {
        Self(DIRECTION_IN | (number & 0x0f))
    }

    /// OUT endpoint with the given number.
    pub fn output(number: u8) -> Self {
        Self(number & 0x0f)
    }

    /// The default control endpoint (number 0).
    pub const CONTROL: EndpointAddress = EndpointAddress(0);

    pub fn direction(self) -> Direction {
        if self.0 & DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn number(self) -> u8 {
        self.0 & 0x0f
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// USB transfer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfer (endpoint 0)
    Control,
    /// Interrupt transfer
    Interrupt,
    /// Bulk transfer
    Bulk,
    /// Isochronous transfer
    Isochronous,
}

/// Endpoint descriptor subset the host engine needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint address, direction bit included
    pub address: EndpointAddress,
    /// Transfer kind serviced by this endpoint
    pub kind: TransferKind,
    /// Maximum packet size in bytes
    pub max_packet_size: u16,
    /// Polling interval (interrupt/isochronous), in frames
    pub interval: u8,
}

/// Interface descriptor with its endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Interface number (bInterfaceNumber)
    pub number: u8,
    /// Interface class
    pub class: u8,
    /// Interface subclass
    pub subclass: u8,
    /// Interface protocol
    pub protocol: u8,
    /// Endpoints of the active alternate setting
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    /// Looks up an endpoint of this interface by address.
    pub fn endpoint(&self, address: EndpointAddress) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.address == address)
    }
}
