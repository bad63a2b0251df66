//! Class-driver registration and matching
//!
//! Drivers compose over [`Device`] rather than subclassing anything: a
//! registered factory receives the opened device and wraps it in whatever
//! protocol-aware type the class needs. The registry matches devices to
//! factories by filter, most specific first.

use transport::DeviceInfo;

use crate::device::Device;
use crate::error::Result;

/// A device-class driver layered over an open [`Device`].
pub trait ClassDriver: Send {
    /// Short driver name for logs and listings.
    fn name(&self) -> &str;

    /// Called before the underlying device is closed.
    fn detach(&mut self) {}
}

/// Which devices a driver factory applies to. `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub class: Option<u8>,
}

impl DeviceFilter {
    /// Matches every device.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches one vendor's devices.
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            ..Self::default()
        }
    }

    /// Matches one specific device model.
    pub fn product(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            class: None,
        }
    }

    /// Matches a device class.
    pub fn class(class: u8) -> Self {
        Self {
            class: Some(class),
            ..Self::default()
        }
    }

    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vendor_id.is_none_or(|v| v == info.vendor_id)
            && self.product_id.is_none_or(|p| p == info.product_id)
            && self.class.is_none_or(|c| c == info.class)
    }

    /// Match precedence: specific device > vendor > class > wildcard.
    fn specificity(&self) -> u8 {
        match (self.vendor_id, self.product_id, self.class) {
            (Some(_), Some(_), _) => 3,
            (Some(_), None, _) => 2,
            (None, _, Some(_)) => 1,
            _ => 0,
        }
    }
}

/// Builds a driver from an opened device. Factories claim the interfaces
/// they need and may fail (for instance when the expected interface is
/// missing or busy).
pub type DriverFactory = Box<dyn Fn(Device) -> Result<Box<dyn ClassDriver>> + Send + Sync>;

/// Registered driver factories, matched against enumerated devices.
#[derive(Default)]
pub struct DriverRegistry {
    entries: Vec<(DeviceFilter, DriverFactory)>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for devices matching `filter`. Among equally
    /// specific filters, the later registration wins.
    pub fn register(
        &mut self,
        filter: DeviceFilter,
        factory: impl Fn(Device) -> Result<Box<dyn ClassDriver>> + Send + Sync + 'static,
    ) {
        self.entries.push((filter, Box::new(factory)));
    }

    /// The most specific matching factory for a device, if any.
    pub fn match_for(&self, info: &DeviceInfo) -> Option<&DriverFactory> {
        self.entries
            .iter()
            .filter(|(filter, _)| filter.matches(info))
            .max_by_key(|(filter, _)| filter.specificity())
            .map(|(_, factory)| factory)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
