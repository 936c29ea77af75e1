//! Host Event Channel Integration Tests
//!
//! Tests for the event bridge between host callbacks and the async runtime,
//! driven through the scripted mock host.
//!
//! Run with: `cargo test -p common --test host_event_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockHost, MockTransfer, create_mock_identity, create_mock_snapshot,
    with_timeout,
};
use common::{HostEvent, HostPlatform, TransferSignal, create_event_bridge};
use descriptor::{EndpointDescriptor, TransferType};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Channel Tests
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (sender, receiver) = create_event_bridge();

    let handle = thread::spawn(move || {
        for id in 1..=3 {
            let device = create_mock_snapshot(id, 0x1234, 0x5678);
            sender.emit(HostEvent::DeviceAttached { device }).unwrap();
        }
        sender.emit(HostEvent::Shutdown).unwrap();
    });

    let mut seen = Vec::new();
    loop {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, receiver.recv())
            .await
            .expect("Timed out waiting for event")
            .expect("Channel closed");
        match event {
            HostEvent::DeviceAttached { device } => seen.push(device.identity.device_id.0),
            HostEvent::Shutdown => break,
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    assert_eq!(seen, vec![1, 2, 3]);
    handle.join().unwrap();
}

#[test]
fn test_try_recv_on_empty_channel() {
    let (_sender, receiver) = create_event_bridge();
    assert!(receiver.is_empty());
    assert!(receiver.try_recv().is_none());
}

#[tokio::test]
async fn test_async_producer_blocking_consumer() {
    let (sender, receiver) = create_event_bridge();

    let consumer = thread::spawn(move || receiver.recv_blocking());

    let device = create_mock_identity(4, 0xabcd, 0x0001);
    sender
        .send(HostEvent::DeviceDetached {
            device: device.clone(),
        })
        .await
        .unwrap();

    match consumer.join().unwrap().unwrap() {
        HostEvent::DeviceDetached { device: got } => assert_eq!(got, device),
        other => panic!("Unexpected event: {:?}", other),
    }
}

// ============================================================================
// Mock Host Tests
// ============================================================================

#[tokio::test]
async fn test_mock_permission_decision_published() {
    let (sender, receiver) = create_event_bridge();
    let snapshot = create_mock_snapshot(1, 0x1234, 0x5678);
    let device = snapshot.identity.clone();

    let host = MockHost::new().with_device(snapshot);
    host.set_event_sender(sender);
    host.answer_permission_requests(false);

    host.request_permission(&device).unwrap();

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        HostEvent::PermissionResult { granted: false, .. }
    ));
    assert_eq!(host.permission_requests(), vec![device]);
}

#[test]
fn test_mock_unanswered_request_publishes_nothing() {
    let (sender, receiver) = create_event_bridge();
    let device = create_mock_identity(1, 0x1234, 0x5678);

    let host = MockHost::new();
    host.set_event_sender(sender);
    host.request_permission(&device).unwrap();

    assert!(receiver.try_recv().is_none());
    assert_eq!(host.permission_requests().len(), 1);
}

#[test]
fn test_mock_open_unknown_device() {
    let host = MockHost::new();
    let device = create_mock_identity(9, 0x1234, 0x5678);
    assert!(host.open_connection(&device).is_err());
    assert_eq!(host.open_calls(), 1);
}

#[test]
fn test_mock_scripted_signal() {
    let snapshot = create_mock_snapshot(1, 0x1234, 0x5678);
    let device = snapshot.identity.clone();
    let host = MockHost::new().with_device(snapshot);
    host.script_transfer(&device, MockTransfer::Signal(TransferSignal::Stall));

    let connection = host.open_connection(&device).unwrap();
    let endpoint = EndpointDescriptor::new(0x01, TransferType::Bulk, 512);
    let mut payload = vec![1, 2, 3];

    let first = host.bulk_transfer(connection, &endpoint, &mut payload, Duration::from_millis(5));
    assert_eq!(first, Err(TransferSignal::Stall));
    assert!(host.sent().is_empty());

    let second = host.bulk_transfer(connection, &endpoint, &mut payload, Duration::from_millis(5));
    assert_eq!(second, Ok(3));
    assert_eq!(host.bulk_calls(), 2);
}

#[test]
fn test_mock_gate_holds_transfer() {
    let snapshot = create_mock_snapshot(1, 0x1234, 0x5678);
    let device = snapshot.identity.clone();
    let host = Arc::new(MockHost::new().with_device(snapshot));
    host.queue_inbound(&device, b"pong".to_vec());
    let gate = host.gate(&device);

    let connection = host.open_connection(&device).unwrap();
    let worker_host = host.clone();
    let handle = thread::spawn(move || {
        let endpoint = EndpointDescriptor::new(0x81, TransferType::Bulk, 512);
        let mut buffer = vec![0u8; 16];
        let n = worker_host
            .bulk_transfer(connection, &endpoint, &mut buffer, Duration::from_millis(5))
            .unwrap();
        buffer.truncate(n);
        buffer
    });

    assert!(gate.wait_entered(1, DEFAULT_TEST_TIMEOUT));
    gate.release();
    assert_eq!(handle.join().unwrap(), b"pong");
}
