//! Transport boundary for rust-usb-host
//!
//! This crate defines the black-box interface the host engine drives: a
//! [`HostTransport`] can enumerate devices, open and claim them, accept
//! transfer submissions, cancel them, and report completions and hotplug
//! events when polled. Everything above this boundary (transfer lifecycle,
//! streaming, device management) lives in the `host` crate; everything below
//! it (bus scheduling, packetization, URB bookkeeping) is the transport's
//! problem.
//!
//! Two implementations ship here:
//!
//! - [`mock::MockTransport`] — a fully scripted in-process transport used by
//!   the test suites and the demo binary.
//! - `libusb::LibusbTransport` — a real backend over the libusb asynchronous
//!   API, behind the `libusb` feature.
//!
//! # Example
//!
//! ```
//! use transport::mock::{MockDeviceSpec, MockTransport};
//! use transport::{BusAddress, HostTransport};
//!
//! let spec = MockDeviceSpec::new(1, 2, 0x046d, 0xc077);
//! let (mut transport, _ctl) = MockTransport::with_devices(vec![spec]);
//!
//! let devices = transport.enumerate().unwrap();
//! assert_eq!(devices[0].address, BusAddress::new(1, 2));
//! ```

pub mod error;
pub mod mock;
pub mod transfer;
pub mod transport;
pub mod types;

#[cfg(feature = "libusb")]
pub mod libusb;

pub use error::{SubmitError, TransportError};
pub use transfer::{
    Completion, CompletionStatus, ControlSetup, Submission, TransferHandle,
};
pub use transport::{HostTransport, HotplugEvent};
pub use types::{
    BusAddress, DeviceInfo, Direction, EndpointAddress, EndpointDescriptor,
    InterfaceDescriptor, Speed, TransferKind,
};
