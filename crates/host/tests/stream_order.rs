//! Stream ordering, backpressure, and retry behavior against the mock
//! transport.

use std::time::{Duration, Instant};

use host::{Device, DeviceManager, HostConfig, OverflowPolicy, StreamConfig, UsbError};
use transport::mock::{MockController, MockDeviceSpec, MockReply, MockTransport};
use transport::{BusAddress, EndpointAddress, EndpointDescriptor, TransferKind};

const ADDRESS: BusAddress = BusAddress { bus: 1, address: 2 };
const ISO_IN: EndpointAddress = EndpointAddress(0x81);

fn iso_device() -> MockDeviceSpec {
    MockDeviceSpec::new(1, 2, 0x046d, 0x082d).with_endpoint(
        0,
        0x0e,
        EndpointDescriptor {
            address: ISO_IN,
            kind: TransferKind::Isochronous,
            max_packet_size: 1024,
            interval: 1,
        },
    )
}

fn open_claimed(spec: MockDeviceSpec) -> (DeviceManager, MockController, Device) {
    let (transport, ctl) = MockTransport::with_devices(vec![spec]);
    let manager = DeviceManager::new(Box::new(transport), HostConfig::default()).unwrap();
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
fn payloads_deliver_in_submission_order_despite_reordered_completions() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    // Slots 0, 1, 3 complete as empty microframes; slot 2's 188-byte
    // payload is withheld so it arrives after slot 3's completion.
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::empty());
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::empty());
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![0x47u8; 188]).held());
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::empty());

    let stream = device
        .open_stream(ISO_IN, StreamConfig { pool_size: 4, ..StreamConfig::default() })
        .unwrap();

    let first = stream.next_payload(Duration::from_secs(2)).unwrap();
    let second = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(first.sequence(), 0);
    assert!(first.is_empty());
    assert_eq!(second.sequence(), 1);

    // Sequence 2 has not completed yet; sequence 3 must wait for it
    assert!(matches!(
        stream.next_payload(Duration::from_millis(50)),
        Err(UsbError::Timeout)
    ));

    ctl.release_held();
    let third = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(third.sequence(), 2);
    assert_eq!(third.bytes(), &[0x47u8; 188]);
    let fourth = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(fourth.sequence(), 3);
    assert!(fourth.is_empty());
}

#[test]
fn completion_length_never_exceeds_buffer_capacity() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    for (capacity, reply_len) in [(64usize, 0usize), (64, 1), (64, 63), (64, 64), (256, 100)] {
        ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![9u8; reply_len]));
        let data = device
            .transfer_in(ISO_IN, capacity, Duration::from_secs(2))
            .unwrap();
        assert_eq!(data.len(), reply_len);
        assert!(data.len() <= capacity);
    }

    // More data than the buffer holds is an overflow, never a silent clip
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![9u8; 128]));
    let err = device
        .transfer_in(ISO_IN, 64, Duration::from_secs(2))
        .unwrap_err();
    assert_eq!(err, UsbError::Overflow { attempted: 128 });
}

#[test]
fn full_queue_keeps_most_recent_payloads() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    let depth = 4u64;
    let stream = device
        .open_stream(
            ISO_IN,
            StreamConfig {
                pool_size: 1,
                queue_depth: depth as usize,
                overflow: OverflowPolicy::Overwrite,
                ..StreamConfig::default()
            },
        )
        .unwrap();

    // Produce depth + 5 payloads without consuming any
    for i in 0..depth + 5 {
        ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![i as u8; 8]));
    }
    assert!(wait_for(Duration::from_secs(2), || stream.stats().dropped == 5));

    // Exactly the most recent `depth` payloads remain, in order
    for expected in 5..depth + 5 {
        let payload = stream.next_payload(Duration::from_secs(2)).unwrap();
        assert_eq!(payload.sequence(), expected);
        assert_eq!(payload.bytes(), &[expected as u8; 8]);
        assert_eq!(payload.lost_before(), 0);
    }
    assert!(matches!(
        stream.next_payload(Duration::from_millis(50)),
        Err(UsbError::Timeout)
    ));
}

#[test]
fn notify_policy_surfaces_drop_count_on_next_payload() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    let stream = device
        .open_stream(
            ISO_IN,
            StreamConfig {
                pool_size: 1,
                queue_depth: 4,
                overflow: OverflowPolicy::Notify,
                ..StreamConfig::default()
            },
        )
        .unwrap();

    for i in 0..9u8 {
        ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![i; 8]));
    }
    assert!(wait_for(Duration::from_secs(2), || stream.stats().dropped == 5));

    let payload = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(payload.sequence(), 5);
    assert_eq!(payload.lost_before(), 5);
    let next = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(next.lost_before(), 0);
}

#[test]
fn transient_errors_retry_then_escalate_to_loss() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    // max_retries = 1: the first stall is retried, the second is escalated
    let stream = device
        .open_stream(
            ISO_IN,
            StreamConfig {
                pool_size: 1,
                max_retries: 1,
                overflow: OverflowPolicy::Notify,
                ..StreamConfig::default()
            },
        )
        .unwrap();

    ctl.queue_in(ADDRESS, ISO_IN, MockReply::stall());
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::stall());
    ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![1u8; 16]));

    let payload = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(payload.sequence(), 2);
    assert_eq!(payload.bytes(), &[1u8; 16]);
    assert_eq!(payload.lost_before(), 1);

    let stats = stream.stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.lost, 1);
    assert_eq!(stats.delivered, 1);
}

#[test]
fn disconnect_faults_stream_but_drains_delivered_payloads() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    let stream = device
        .open_stream(ISO_IN, StreamConfig { pool_size: 2, ..StreamConfig::default() })
        .unwrap();

    ctl.queue_in(ADDRESS, ISO_IN, MockReply::data(vec![7u8; 4]));
    let payload = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert_eq!(payload.bytes(), &[7u8; 4]);
    drop(payload);

    ctl.unplug(ADDRESS);
    let err = stream.next_payload(Duration::from_secs(2)).unwrap_err();
    assert_eq!(err, UsbError::DeviceDisconnected);
    assert_eq!(stream.state(), host::StreamState::Faulted);

    // stop() is still valid after a fault
    let mut stream = stream;
    assert!(stream.stop(Duration::from_secs(2)).is_ok());
}

#[test]
fn zero_length_completions_are_delivered_as_payloads() {
    let (_manager, ctl, device) = open_claimed(iso_device());

    let stream = device
        .open_stream(ISO_IN, StreamConfig { pool_size: 2, ..StreamConfig::default() })
        .unwrap();

    ctl.queue_in(ADDRESS, ISO_IN, MockReply::empty());
    let payload = stream.next_payload(Duration::from_secs(2)).unwrap();
    assert!(payload.is_empty());
    assert_eq!(payload.len(), 0);
}
