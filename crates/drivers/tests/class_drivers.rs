//! Class drivers exercised end to end against the scripted mock bus.

use std::time::Duration;

use drivers::hid::{self, HidDevice, ReportKind};
use drivers::uvc::{self, StreamingParams, UvcCamera};
use drivers::vendor::{self, Instrument};
use drivers::DriverError;
use host::{DeviceManager, DriverRegistry, HostConfig, StreamConfig};
use transport::mock::{MockController, MockDeviceSpec, MockReply, MockTransport};
use transport::{
    BusAddress, EndpointAddress, EndpointDescriptor, InterfaceDescriptor, TransferKind,
};

const HID_ADDRESS: BusAddress = BusAddress { bus: 1, address: 2 };
const CAMERA_ADDRESS: BusAddress = BusAddress { bus: 1, address: 3 };
const INSTRUMENT_ADDRESS: BusAddress = BusAddress { bus: 1, address: 4 };

// Endpoint numbers are per device: 0x81 is the HID device's interrupt IN
// and, separately, the instrument's bulk IN.
const INTERRUPT_IN: EndpointAddress = EndpointAddress(0x81);
const ISO_IN: EndpointAddress = EndpointAddress(0x82);
const BULK_OUT: EndpointAddress = EndpointAddress(0x01);
const BULK_IN: EndpointAddress = EndpointAddress(0x81);

fn hid_device() -> MockDeviceSpec {
    MockDeviceSpec::new(1, 2, 0x046d, 0xc077)
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

fn camera_device() -> MockDeviceSpec {
    MockDeviceSpec::new(1, 3, 0x046d, 0x082d)
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

fn instrument_device() -> MockDeviceSpec {
    MockDeviceSpec::new(1, 4, 0x1a2b, 0x0001)
        .with_class(0xff, 0, 0)
        .with_endpoint(
            0,
            0xff,
            EndpointDescriptor {
                address: BULK_OUT,
                kind: TransferKind::Bulk,
                max_packet_size: 512,
                interval: 0,
            },
        )
        .with_endpoint(
            0,
            0xff,
            EndpointDescriptor {
                address: BULK_IN,
                kind: TransferKind::Bulk,
                max_packet_size: 512,
                interval: 0,
            },
        )
}

fn bus() -> (DeviceManager, MockController) {
    let (transport, ctl) = MockTransport::with_devices(vec![
        hid_device(),
        camera_device(),
        instrument_device(),
    ]);
    let manager = DeviceManager::new(Box::new(transport), HostConfig::default()).unwrap();
    (manager, ctl)
}

#[test]
fn hid_fetches_report_descriptor_and_reports() {
    let (manager, ctl) = bus();
    // A minimal mouse report descriptor, then a GET_REPORT reply
    let descriptor = vec![0x05, 0x01, 0x09, 0x02, 0xa1, 0x01, 0xc0];
    ctl.queue_control(HID_ADDRESS, MockReply::data(descriptor.clone()));
    ctl.queue_control(HID_ADDRESS, MockReply::data(vec![0x00, 0x02, 0x01, 0x00]));

    let hid = HidDevice::open(manager.open(HID_ADDRESS).unwrap()).unwrap();
    assert_eq!(hid.report_descriptor().unwrap(), descriptor);
    assert_eq!(
        hid.get_report(ReportKind::Input, 0, 8).unwrap(),
        vec![0x00, 0x02, 0x01, 0x00]
    );

    hid.set_report(ReportKind::Output, 1, &[0x01]).unwrap();
    let log = ctl.control_log(HID_ADDRESS);
    let (setup, payload) = log.last().unwrap();
    assert_eq!(setup.request_type, 0x21);
    assert_eq!(setup.request, hid::REQUEST_SET_REPORT);
    // Output report type in the high byte, report id 1 low
    assert_eq!(setup.value, 0x0201);
    assert_eq!(setup.index, 0);
    assert_eq!(payload, &vec![0x01]);
}

#[test]
fn hid_streams_input_reports_in_order() {
    let (manager, ctl) = bus();
    for i in 0..6u8 {
        ctl.queue_in(HID_ADDRESS, INTERRUPT_IN, MockReply::data(vec![0, i, 0, 0]));
    }

    let hid = HidDevice::open(manager.open(HID_ADDRESS).unwrap()).unwrap();
    let stream = hid.input_reports(StreamConfig::default()).unwrap();
    for i in 0..6u8 {
        let report = stream.next_payload(Duration::from_secs(2)).unwrap();
        assert_eq!(report.bytes(), &[0, i, 0, 0]);
        assert_eq!(report.sequence(), u64::from(i));
    }
}

#[test]
fn hid_open_requires_a_hid_interface() {
    let (manager, _ctl) = bus();
    let err = HidDevice::open(manager.open(CAMERA_ADDRESS).unwrap()).unwrap_err();
    assert!(matches!(err, DriverError::Protocol(_)));
}

#[test]
fn uvc_probe_commit_negotiation() {
    let (manager, ctl) = bus();
    let offered = StreamingParams {
        hint: 0x0001,
        format_index: 1,
        frame_index: 2,
        frame_interval: 666_666,
        max_video_frame_size: 614_400,
        max_payload_transfer_size: 3072,
    };
    // The device answers the probe with a smaller frame size
    let counter = StreamingParams {
        max_video_frame_size: 307_200,
        ..offered
    };
    ctl.queue_control(CAMERA_ADDRESS, MockReply::data(counter.encode().to_vec()));

    let camera = UvcCamera::open(manager.open(CAMERA_ADDRESS).unwrap()).unwrap();
    let committed = camera.negotiate(offered).unwrap();
    assert_eq!(committed, counter);

    let log = ctl.control_log(CAMERA_ADDRESS);
    assert_eq!(log.len(), 3);
    // SET_CUR probe carries the offer
    assert_eq!(log[0].0.request, uvc::SET_CUR);
    assert_eq!(log[0].0.value, uvc::VS_PROBE_CONTROL);
    assert_eq!(log[0].0.index, 1);
    assert_eq!(log[0].1, offered.encode().to_vec());
    // GET_CUR probe reads the counter-offer
    assert_eq!(log[1].0.request, uvc::GET_CUR);
    assert_eq!(log[1].0.value, uvc::VS_PROBE_CONTROL);
    // SET_CUR commit locks in what the device answered
    assert_eq!(log[2].0.request, uvc::SET_CUR);
    assert_eq!(log[2].0.value, uvc::VS_COMMIT_CONTROL);
    assert_eq!(log[2].1, counter.encode().to_vec());
}

/// A framed payload: 12-byte header (length + info bits) then data.
fn framed(fid: u8, eof: bool, err: bool, data: &[u8]) -> MockReply {
    let mut payload = vec![0u8; 12];
    payload[0] = 12;
    payload[1] = fid | if eof { 0x02 } else { 0 } | if err { 0x40 } else { 0 };
    payload.extend_from_slice(data);
    MockReply::data(payload)
}

#[test]
fn uvc_assembles_frames_and_discards_corrupt_ones() {
    let (manager, ctl) = bus();
    // Frame 1 (fid 0): two payloads, clean
    ctl.queue_in(CAMERA_ADDRESS, ISO_IN, framed(0, false, false, &[1u8; 32]));
    ctl.queue_in(CAMERA_ADDRESS, ISO_IN, framed(0, true, false, &[2u8; 16]));
    // Frame 2 (fid 1): ERR bit set mid-frame, must be dropped
    ctl.queue_in(CAMERA_ADDRESS, ISO_IN, framed(1, false, true, &[3u8; 32]));
    ctl.queue_in(CAMERA_ADDRESS, ISO_IN, framed(1, true, false, &[4u8; 32]));
    // Frame 3 (fid 0): single payload
    ctl.queue_in(CAMERA_ADDRESS, ISO_IN, framed(0, true, false, &[5u8; 24]));

    let camera = UvcCamera::open(manager.open(CAMERA_ADDRESS).unwrap()).unwrap();
    let mut reader = camera.frames(StreamConfig::default()).unwrap();

    let first = reader.next_frame(Duration::from_secs(2)).unwrap();
    let mut expected = vec![1u8; 32];
    expected.extend_from_slice(&[2u8; 16]);
    assert_eq!(first, expected);

    // The ERR frame vanishes; the next delivered frame is frame 3
    let second = reader.next_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(second, vec![5u8; 24]);

    reader.stop(Duration::from_secs(2)).unwrap();
}

#[test]
fn instrument_command_round_trip() {
    let (manager, ctl) = bus();
    let mut response = vec![vendor::STATUS_OK, 4, 0];
    response.extend_from_slice(b"pong");
    ctl.queue_in(INSTRUMENT_ADDRESS, BULK_IN, MockReply::data(response));

    let instrument = Instrument::open(manager.open(INSTRUMENT_ADDRESS).unwrap()).unwrap();
    let reply = instrument.command(0x10, b"ping").unwrap();
    assert_eq!(reply, b"pong");

    let written = ctl.written(INSTRUMENT_ADDRESS, BULK_OUT);
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], vec![0x10, 4, 0, b'p', b'i', b'n', b'g']);
}

#[test]
fn instrument_surfaces_device_reported_failure() {
    let (manager, ctl) = bus();
    ctl.queue_in(INSTRUMENT_ADDRESS, BULK_IN, MockReply::data(vec![0x05, 0, 0]));

    let instrument = Instrument::open(manager.open(INSTRUMENT_ADDRESS).unwrap()).unwrap();
    assert!(matches!(
        instrument.command(0x10, &[]),
        Err(DriverError::CommandFailed(0x05))
    ));
}

#[test]
fn instrument_acquire_triggers_then_reads() {
    let (manager, ctl) = bus();
    ctl.queue_in(INSTRUMENT_ADDRESS, BULK_IN, MockReply::data(vec![0xaa; 64]));

    let instrument = Instrument::open(manager.open(INSTRUMENT_ADDRESS).unwrap()).unwrap();
    let data = instrument.acquire().unwrap();
    assert_eq!(data, vec![0xaa; 64]);

    let log = ctl.control_log(INSTRUMENT_ADDRESS);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0.request_type, 0x40);
    assert_eq!(log[0].0.request, vendor::REQUEST_TRIGGER);
}

#[test]
fn registry_routes_each_device_to_its_driver() {
    let (manager, _ctl) = bus();
    let mut registry = DriverRegistry::new();
    hid::register(&mut registry);
    uvc::register(&mut registry);
    vendor::register(&mut registry, 0x1a2b, 0x0001);

    let hid = manager.open_with(&registry, HID_ADDRESS).unwrap();
    assert_eq!(hid.name(), "hid");
    let camera = manager.open_with(&registry, CAMERA_ADDRESS).unwrap();
    assert_eq!(camera.name(), "uvc");
    let instrument = manager.open_with(&registry, INSTRUMENT_ADDRESS).unwrap();
    assert_eq!(instrument.name(), "instrument");
}
