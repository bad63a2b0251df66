//! Cancellation, close, and shutdown quiescence.
//!
//! Every test finishes by asserting the mock transport holds zero buffers:
//! teardown is only done when the transport has given everything back.

use std::time::{Duration, Instant};

use host::{
    Device, DeviceManager, HostConfig, StreamConfig, SubmitMode, Transfer, TransferStatus,
    UsbError,
};
use transport::mock::{MockController, MockDeviceSpec, MockReply, MockTransport};
use transport::{BusAddress, EndpointAddress, EndpointDescriptor, TransferKind};

const ADDRESS: BusAddress = BusAddress { bus: 1, address: 2 };
const BULK_IN: EndpointAddress = EndpointAddress(0x81);

fn bulk_device() -> MockDeviceSpec {
    MockDeviceSpec::new(1, 2, 0x1234, 0x5678).with_endpoint(
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

fn short_teardown_config(millis: u64) -> HostConfig {
    let mut config = HostConfig::default();
    config.transfers.teardown_timeout_ms = millis;
    config
}

fn open_claimed(config: HostConfig) -> (DeviceManager, MockController, Device) {
    let (transport, ctl) = MockTransport::with_devices(vec![bulk_device()]);
    let manager = DeviceManager::new(Box::new(transport), config).unwrap();
    let mut device = manager.open(ADDRESS).unwrap();
    device.claim_interface(0).unwrap();
    (manager, ctl, device)
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn cancel_is_idempotent_and_returns_the_buffer_once() {
    let (_manager, ctl, device) = open_claimed(HostConfig::default());

    // No reply is queued, so the transfer stays pending until cancelled
    let mut transfer = Transfer::new(&device, BULK_IN).unwrap();
    let status = transfer
        .submit(vec![0u8; 64], Duration::ZERO, SubmitMode::Background)
        .unwrap();
    assert_eq!(status, TransferStatus::Pending);

    transfer.cancel().unwrap();
    transfer.cancel().unwrap();
    assert_eq!(
        transfer.wait(Some(Duration::from_secs(2))).unwrap(),
        TransferStatus::Cancelled
    );
    // Cancelling a terminal transfer is a no-op
    transfer.cancel().unwrap();

    let buffer = transfer.take_buffer().unwrap();
    assert_eq!(buffer.len(), 64);
    assert!(transfer.take_buffer().is_none());
    assert_eq!(ctl.outstanding(), 0);
}

#[test]
fn submit_while_pending_is_rejected_without_losing_the_buffer() {
    let (_manager, ctl, device) = open_claimed(HostConfig::default());

    let mut transfer = Transfer::new(&device, BULK_IN).unwrap();
    transfer
        .submit(vec![0u8; 32], Duration::ZERO, SubmitMode::Background)
        .unwrap();
    assert!(matches!(
        transfer.submit(vec![0u8; 32], Duration::ZERO, SubmitMode::Background),
        Err(UsbError::AlreadyPending)
    ));

    ctl.queue_in(ADDRESS, BULK_IN, MockReply::data(vec![5u8; 8]));
    assert_eq!(
        transfer.wait(Some(Duration::from_secs(2))).unwrap(),
        TransferStatus::Completed(8)
    );
    let buffer = transfer.take_buffer().unwrap();
    assert_eq!(&buffer[..8], &[5u8; 8]);
}

#[test]
fn close_cancels_outstanding_transfers_and_stops_streams() {
    let (_manager, ctl, device) = open_claimed(HostConfig::default());

    let mut transfers: Vec<Transfer> = (0..3)
        .map(|_| {
            let mut t = Transfer::new(&device, BULK_IN).unwrap();
            t.submit(vec![0u8; 64], Duration::ZERO, SubmitMode::Background)
                .unwrap();
            t
        })
        .collect();
    let stream = device
        .open_stream(BULK_IN, StreamConfig { pool_size: 2, ..StreamConfig::default() })
        .unwrap();

    device.close().unwrap();

    for transfer in &mut transfers {
        assert_eq!(
            transfer.wait(Some(Duration::from_secs(2))).unwrap(),
            TransferStatus::Cancelled
        );
        assert!(transfer.take_buffer().is_some());
    }
    assert_eq!(stream.state(), host::StreamState::Stopped);
    assert_eq!(ctl.outstanding(), 0);
    assert!(!ctl.is_open(ADDRESS));
    assert!(ctl.claimed(ADDRESS).is_empty());
}

#[test]
fn stream_stop_waits_for_all_pooled_transfers() {
    let (_manager, ctl, device) = open_claimed(HostConfig::default());

    let mut stream = device
        .open_stream(BULK_IN, StreamConfig { pool_size: 4, ..StreamConfig::default() })
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || ctl.outstanding() == 4));

    stream.stop(Duration::from_secs(2)).unwrap();
    assert_eq!(stream.state(), host::StreamState::Stopped);
    assert_eq!(ctl.outstanding(), 0);

    // The device itself is still usable afterwards
    ctl.queue_in(ADDRESS, BULK_IN, MockReply::data(vec![1u8; 4]));
    let data = device
        .transfer_in(BULK_IN, 64, Duration::from_secs(2))
        .unwrap();
    assert_eq!(data, vec![1u8; 4]);
}

#[test]
fn close_reports_incomplete_teardown_but_reclaims_in_background() {
    let (_manager, ctl, device) = open_claimed(short_teardown_config(100));

    // The reply settles but is withheld, so the engine cannot observe the
    // completion until the controller releases it.
    ctl.queue_in(ADDRESS, BULK_IN, MockReply::data(vec![3u8; 16]).held());
    let mut transfer = Transfer::new(&device, BULK_IN).unwrap();
    transfer
        .submit(vec![0u8; 64], Duration::ZERO, SubmitMode::Background)
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || ctl.held_count() == 1));

    let err = device.close().unwrap_err();
    assert_eq!(err, UsbError::TeardownIncomplete);
    assert_eq!(ctl.outstanding(), 1);

    // Releasing the completion lets the background teardown finish
    ctl.release_held();
    assert!(wait_for(Duration::from_secs(2), || ctl.outstanding() == 0));
    assert!(wait_for(Duration::from_secs(2), || !ctl.is_open(ADDRESS)));
}

#[test]
fn dropping_a_device_closes_it_in_the_background() {
    let (_manager, ctl, device) = open_claimed(HostConfig::default());

    drop(device);
    assert!(wait_for(Duration::from_secs(2), || !ctl.is_open(ADDRESS)));
}

#[test]
fn manager_shutdown_force_closes_open_devices() {
    let (manager, ctl, device) = open_claimed(HostConfig::default());

    let mut transfer = Transfer::new(&device, BULK_IN).unwrap();
    transfer
        .submit(vec![0u8; 64], Duration::ZERO, SubmitMode::Background)
        .unwrap();

    manager.shutdown().unwrap();
    assert_eq!(ctl.outstanding(), 0);
    assert!(!ctl.is_open(ADDRESS));
    assert_eq!(
        transfer.wait(Some(Duration::from_secs(2))).unwrap(),
        TransferStatus::Cancelled
    );
}
