//! Device-class drivers built on the `host` engine
//!
//! Each driver composes over an open [`Device`](host::Device): it claims the
//! interfaces its class needs in its constructor and speaks the class
//! protocol through the device's control and transfer entry points. Nothing
//! here touches the transport directly.

pub mod hid;
pub mod uvc;
pub mod vendor;

use host::UsbError;
use thiserror::Error;

/// Errors surfaced by class drivers: either a transport-level failure from
/// the engine, or a class-protocol violation by the device.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Usb(#[from] UsbError),

    /// The device is not what the driver expects (missing interface or
    /// endpoint, malformed class data)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A vendor command was executed but the device reported failure
    #[error("device rejected command: status {0:#04x}")]
    CommandFailed(u8),
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl From<DriverError> for UsbError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Usb(usb) => usb,
            other => UsbError::Transport(other.to_string()),
        }
    }
}

pub use hid::HidDevice;
pub use uvc::{FrameReader, StreamingParams, UvcCamera};
pub use vendor::Instrument;
