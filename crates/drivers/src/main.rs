//! usb-demo
//!
//! Demonstrates the host engine and the class drivers against a scripted
//! mock bus: enumeration, HID input-report streaming, and camera frame
//! assembly, all without real hardware.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivers::uvc::{self, StreamingParams};
use drivers::{HidDevice, UvcCamera};
use host::logging::setup_logging;
use host::{DeviceManager, HostConfig, StreamConfig};
use tracing::info;
use transport::mock::{MockController, MockDeviceSpec, MockReply, MockTransport};
use transport::{
    BusAddress, EndpointAddress, EndpointDescriptor, InterfaceDescriptor, TransferKind,
};

#[derive(Parser, Debug)]
#[command(name = "usb-demo")]
#[command(
    author,
    version,
    about = "USB host engine demo against a scripted mock bus"
)]
#[command(long_about = "
Runs the host engine and class drivers against an in-process scripted bus.

EXAMPLES:
    # List the scripted devices
    usb-demo enumerate

    # Stream 16 simulated HID input reports
    usb-demo hid --reports 16

    # Negotiate and assemble 4 simulated camera frames
    usb-demo camera --frames 4

    # Run with debug logging
    usb-demo --log-level debug enumerate
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Demo,
}

#[derive(Subcommand, Debug)]
enum Demo {
    /// List the scripted devices on the mock bus
    Enumerate,
    /// Stream simulated HID input reports
    Hid {
        /// Number of reports to stream
        #[arg(short, long, default_value_t = 8)]
        reports: usize,
    },
    /// Negotiate streaming parameters and assemble simulated frames
    Camera {
        /// Number of frames to assemble
        #[arg(short, long, default_value_t = 4)]
        frames: usize,
    },
}

const HID_ADDRESS: BusAddress = BusAddress { bus: 1, address: 2 };
const CAMERA_ADDRESS: BusAddress = BusAddress { bus: 1, address: 3 };
const INTERRUPT_IN: EndpointAddress = EndpointAddress(0x81);
const ISO_IN: EndpointAddress = EndpointAddress(0x82);

fn hid_mouse() -> MockDeviceSpec {
    MockDeviceSpec::new(HID_ADDRESS.bus, HID_ADDRESS.address, 0x046d, 0xc077)
        .with_class(0x03, 0x01, 0x02)
        .with_endpoint(
            0,
            0x03,
            EndpointDescriptor {
                address: INTERRUPT_IN,
                kind: TransferKind::Interrupt,
                max_packet_size: 8,
                interval: 10,
            },
        )
}

fn camera() -> MockDeviceSpec {
    MockDeviceSpec::new(CAMERA_ADDRESS.bus, CAMERA_ADDRESS.address, 0x046d, 0x082d)
        .with_class(uvc::CLASS_VIDEO, 0, 0)
        .with_interface(InterfaceDescriptor {
            number: 1,
            class: uvc::CLASS_VIDEO,
            subclass: uvc::SUBCLASS_STREAMING,
            protocol: 0,
            endpoints: vec![EndpointDescriptor {
                address: ISO_IN,
                kind: TransferKind::Isochronous,
                max_packet_size: 3072,
                interval: 1,
            }],
        })
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HostConfig::load(Some(path.clone())).context("loading configuration")?,
        None => HostConfig::load_or_default(),
    };
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.host.log_level);
    setup_logging(level)?;

    let (transport, ctl) = MockTransport::with_devices(vec![hid_mouse(), camera()]);
    let manager = DeviceManager::new(Box::new(transport), config)?;

    match args.command {
        Demo::Enumerate => enumerate(&manager)?,
        Demo::Hid { reports } => stream_reports(&manager, &ctl, reports)?,
        Demo::Camera { frames } => assemble_frames(&manager, &ctl, frames)?,
    }

    manager.shutdown()?;
    Ok(())
}

fn enumerate(manager: &DeviceManager) -> Result<()> {
    let devices = manager.devices()?;
    println!("{} device(s) on the bus:", devices.len());
    for info in devices {
        println!(
            "  {}  {:04x}:{:04x}  class {:02x}  {}",
            info.address,
            info.vendor_id,
            info.product_id,
            info.class,
            info.product.as_deref().unwrap_or("(unnamed)"),
        );
    }
    Ok(())
}

fn stream_reports(manager: &DeviceManager, ctl: &MockController, reports: usize) -> Result<()> {
    // Script boot-mouse style 4-byte reports: buttons, dx, dy, wheel
    for i in 0..reports {
        let dx = (i % 5) as u8;
        ctl.queue_in(
            HID_ADDRESS,
            INTERRUPT_IN,
            MockReply::data(vec![0x00, dx, 0x01, 0x00]),
        );
    }

    let hid = HidDevice::open(manager.open(HID_ADDRESS)?)?;
    info!(address = %HID_ADDRESS, "HID device opened");

    // Deep enough that the scripted burst cannot overrun the consumer
    let stream = hid.input_reports(StreamConfig {
        queue_depth: reports.max(8),
        ..StreamConfig::default()
    })?;
    for _ in 0..reports {
        let report = stream.next_payload(Duration::from_secs(2))?;
        println!("report {:3}: {:02x?}", report.sequence(), report.bytes());
    }
    let stats = stream.stats();
    println!("delivered {} report(s), {} dropped", stats.delivered, stats.dropped);
    Ok(())
}

fn assemble_frames(manager: &DeviceManager, ctl: &MockController, frames: usize) -> Result<()> {
    // Script the probe negotiation reply, then the framed payloads: each
    // frame is two payloads with a 12-byte header, EOF on the second, FID
    // toggling per frame.
    let negotiated = StreamingParams {
        format_index: 1,
        frame_index: 1,
        frame_interval: 333_333,
        max_video_frame_size: 128,
        max_payload_transfer_size: 3072,
        ..StreamingParams::default()
    };
    ctl.queue_control(CAMERA_ADDRESS, MockReply::data(negotiated.encode().to_vec()));

    for frame in 0..frames {
        let fid = (frame % 2) as u8;
        for (part, eof) in [(0u8, 0u8), (1, 0x02)] {
            let mut payload = vec![0u8; 12];
            payload[0] = 12;
            payload[1] = fid | eof;
            payload.extend(std::iter::repeat_n(frame as u8 ^ part, 64));
            ctl.queue_in(CAMERA_ADDRESS, ISO_IN, MockReply::data(payload));
        }
    }

    let camera = UvcCamera::open(manager.open(CAMERA_ADDRESS)?)?;
    let committed = camera.negotiate(negotiated)?;
    info!(?committed, "negotiation complete");

    let mut reader = camera.frames(StreamConfig {
        queue_depth: (frames * 2).max(8),
        ..StreamConfig::default()
    })?;
    for i in 0..frames {
        let frame = reader.next_frame(Duration::from_secs(2))?;
        println!("frame {i:3}: {} bytes", frame.len());
    }
    reader.stop(Duration::from_secs(2))?;
    Ok(())
}
