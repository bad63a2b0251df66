//! Host-side USB device abstraction engine
//!
//! Sits between application code and an asynchronous USB host-controller
//! transport (the `transport` crate). Applications enumerate devices through
//! a [`DeviceManager`], open them into [`Device`] handles, and issue
//! one-shot [`Transfer`]s, blocking control requests, or continuous
//! [`Stream`]s — without ever touching the transport's submission protocol.
//!
//! A single engine thread owns the transport: it drains completions,
//! resolves per-transfer signals, keeps stream pools saturated, and reacts
//! to hotplug. Application-facing calls block on those signals rather than
//! polling, and teardown (close, stop, shutdown) always waits for the
//! transport to confirm quiescence, bounded by a configurable deadline.
//!
//! # Example
//!
//! ```
//! use host::{DeviceManager, HostConfig};
//! use transport::mock::{MockDeviceSpec, MockTransport};
//!
//! let spec = MockDeviceSpec::new(1, 2, 0x046d, 0xc077);
//! let (transport, _ctl) = MockTransport::with_devices(vec![spec]);
//! let manager = DeviceManager::new(Box::new(transport), HostConfig::default()).unwrap();
//!
//! let devices = manager.devices().unwrap();
//! let device = manager.open(devices[0].address).unwrap();
//! let descriptor = device.device_descriptor_raw().unwrap();
//! assert_eq!(descriptor.len(), 18);
//!
//! device.close().unwrap();
//! manager.shutdown().unwrap();
//! ```

mod command;
pub mod config;
pub mod control;
pub mod device;
pub mod driver;
pub mod error;
pub mod logging;
pub mod manager;
mod signal;
pub mod stream;
pub mod transfer;
mod worker;

pub use command::HostEvent;
pub use config::{HostConfig, HostSettings, StreamSettings, TransferSettings};
pub use control::{ControlRequest, Recipient, RequestClass};
pub use device::Device;
pub use driver::{ClassDriver, DeviceFilter, DriverFactory, DriverRegistry};
pub use error::{Result, UsbError};
pub use manager::DeviceManager;
pub use stream::{
    OverflowPolicy, Payload, Stream, StreamConfig, StreamId, StreamState, StreamStats,
};
pub use transfer::{SubmitMode, Transfer, TransferOutcome, TransferStatus};
