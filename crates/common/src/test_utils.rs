//! Test utilities for usb-link
//!
//! Provides a scriptable [`MockHost`] and helpers for building identities,
//! interface trees and raw descriptor bytes.
//!
//! # Example
//!
//! ```
//! use common::HostPlatform;
//! use common::test_utils::{MockHost, create_mock_snapshot};
//!
//! let host = MockHost::new().with_device(create_mock_snapshot(1, 0x1234, 0x5678));
//! let devices = host.enumerate_devices().unwrap();
//! assert_eq!(devices[0].identity.vendor_id, 0x1234);
//! ```

use crate::channel::{EventSender, HostEvent};
use crate::host::{ConnectionId, HostPlatform, TransferSignal};
use crate::usb_types::{DeviceId, DeviceIdentity, DeviceSnapshot};
use crate::{Error, Result};
use descriptor::{
    DescriptorKind, Direction, EndpointDescriptor, InterfaceDescriptor, TransferType,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a DeviceIdentity named like a Linux/Android device node
///
/// ```
/// use common::test_utils::create_mock_identity;
///
/// let device = create_mock_identity(2, 0x1234, 0x5678);
/// assert_eq!(device.display_name, "/dev/bus/usb/001/002");
/// ```
pub fn create_mock_identity(id: u32, vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity::new(
        DeviceId(id),
        vendor_id,
        product_id,
        format!("/dev/bus/usb/001/{:03}", id),
    )
}

/// Vendor-specific interface with a bulk IN and a bulk OUT endpoint
pub fn bulk_interface(number: u8, in_address: u8, out_address: u8) -> InterfaceDescriptor {
    InterfaceDescriptor::new(
        number,
        vec![
            EndpointDescriptor::new(in_address, TransferType::Bulk, 512),
            EndpointDescriptor::new(out_address, TransferType::Bulk, 512),
        ],
    )
}

/// Snapshot of a device with a single bulk interface (0x81 IN, 0x01 OUT)
pub fn create_mock_snapshot(id: u32, vendor_id: u16, product_id: u16) -> DeviceSnapshot {
    DeviceSnapshot::new(
        create_mock_identity(id, vendor_id, product_id),
        vec![bulk_interface(0, 0x81, 0x01)],
    )
}

/// Raw 18-byte device descriptor (USB 2.0, one configuration)
pub fn device_descriptor_bytes(vendor_id: u16, product_id: u16) -> Vec<u8> {
    let mut raw = vec![18, 1, 0x00, 0x02, 0, 0, 0, 64];
    raw.extend_from_slice(&vendor_id.to_le_bytes());
    raw.extend_from_slice(&product_id.to_le_bytes());
    raw.extend_from_slice(&[0x00, 0x01, 1, 2, 3, 1]);
    raw
}

/// Raw configuration descriptor with a correct wTotalLength for `interfaces`
pub fn configuration_descriptor_bytes(interfaces: &[InterfaceDescriptor]) -> Vec<u8> {
    let mut body = Vec::new();
    for interface in interfaces {
        body.extend_from_slice(&[
            9,
            4,
            interface.interface_number,
            interface.alternate_setting,
            interface.endpoints.len() as u8,
            interface.class,
            interface.subclass,
            interface.protocol,
            interface.string_index,
        ]);
        for endpoint in &interface.endpoints {
            let attributes = match endpoint.transfer_type {
                TransferType::Control => 0,
                TransferType::Isochronous => 1,
                TransferType::Bulk => 2,
                TransferType::Interrupt => 3,
            };
            body.extend_from_slice(&[7, 5, endpoint.address, attributes]);
            body.extend_from_slice(&endpoint.max_packet_size.to_le_bytes());
            body.push(endpoint.interval);
        }
    }

    let total = (9 + body.len()) as u16;
    let mut raw = vec![9, 2];
    raw.extend_from_slice(&total.to_le_bytes());
    raw.extend_from_slice(&[interfaces.len() as u8, 1, 0, 0x80, 50]);
    raw.extend_from_slice(&body);
    raw
}

/// Scripted outcome for the next bulk transfer on a device
#[derive(Debug, Clone)]
pub enum MockTransfer {
    /// Report this many bytes moved
    Complete(usize),
    /// Fill the IN buffer with these bytes
    Data(Vec<u8>),
    /// Fail with a negative signal
    Signal(TransferSignal),
}

/// A bulk OUT transfer the mock accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub device: DeviceIdentity,
    pub endpoint: u8,
    pub data: Vec<u8>,
}

/// Holds bulk transfers inside the host call until released
///
/// Lets tests observe an operation while it is in flight.
#[derive(Default)]
pub struct TransferGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    entered: usize,
    open: bool,
}

impl TransferGate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entered += 1;
        self.changed.notify_all();
        while !state.open {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait until at least `count` transfers are held at the gate
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.entered < count)
            .unwrap_or_else(PoisonError::into_inner);
        state.entered >= count
    }

    /// Let every held and future transfer through
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open = true;
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceSnapshot>,
    trusted: HashSet<DeviceIdentity>,
    decision: Option<bool>,
    permission_requests: Vec<DeviceIdentity>,
    refused: HashSet<DeviceIdentity>,
    next_connection: u64,
    connections: HashMap<ConnectionId, DeviceIdentity>,
    closed: Vec<ConnectionId>,
    scripted: HashMap<DeviceIdentity, VecDeque<MockTransfer>>,
    inbound: HashMap<DeviceIdentity, VecDeque<Vec<u8>>>,
    sent: Vec<SentPacket>,
    descriptors: HashMap<(DeviceIdentity, DescriptorKind), Vec<u8>>,
}

/// In-memory host platform
///
/// OUT transfers are recorded and succeed; IN transfers return queued
/// inbound data or time out. Scripted outcomes take precedence.
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockState>,
    gates: Mutex<HashMap<DeviceIdentity, Arc<TransferGate>>>,
    events: Mutex<Option<EventSender>>,
    bulk_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device: DeviceSnapshot) -> Self {
        self.add_device(device);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, device: DeviceSnapshot) {
        self.state().devices.push(device);
    }

    pub fn remove_device(&self, device: &DeviceIdentity) {
        self.state().devices.retain(|d| &d.identity != device);
    }

    /// Where permission decisions are published
    pub fn set_event_sender(&self, sender: EventSender) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Make `has_permission` report true for this device
    pub fn trust(&self, device: &DeviceIdentity) {
        self.state().trusted.insert(device.clone());
    }

    /// Answer every future permission request immediately
    pub fn answer_permission_requests(&self, granted: bool) {
        self.state().decision = Some(granted);
    }

    pub fn refuse_open(&self, device: &DeviceIdentity) {
        self.state().refused.insert(device.clone());
    }

    pub fn script_transfer(&self, device: &DeviceIdentity, outcome: MockTransfer) {
        self.state()
            .scripted
            .entry(device.clone())
            .or_default()
            .push_back(outcome);
    }

    pub fn queue_inbound(&self, device: &DeviceIdentity, data: impl Into<Vec<u8>>) {
        self.state()
            .inbound
            .entry(device.clone())
            .or_default()
            .push_back(data.into());
    }

    pub fn set_descriptor(&self, device: &DeviceIdentity, kind: DescriptorKind, raw: Vec<u8>) {
        self.state().descriptors.insert((device.clone(), kind), raw);
    }

    /// Gate every bulk transfer on this device until the gate is released
    pub fn gate(&self, device: &DeviceIdentity) -> Arc<TransferGate> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.clone())
            .or_default()
            .clone()
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.state().sent.clone()
    }

    pub fn permission_requests(&self) -> Vec<DeviceIdentity> {
        self.state().permission_requests.clone()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn closed_connections(&self) -> usize {
        self.state().closed.len()
    }

    fn connection_device(&self, connection: ConnectionId) -> Option<DeviceIdentity> {
        self.state().connections.get(&connection).cloned()
    }
}

impl HostPlatform for MockHost {
    fn enumerate_devices(&self) -> Result<Vec<DeviceSnapshot>> {
        Ok(self.state().devices.clone())
    }

    fn has_permission(&self, device: &DeviceIdentity) -> bool {
        self.state().trusted.contains(device)
    }

    fn request_permission(&self, device: &DeviceIdentity) -> Result<()> {
        let decision = {
            let mut state = self.state();
            state.permission_requests.push(device.clone());
            state.decision
        };

        if let Some(granted) = decision {
            let sender = self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(sender) = sender {
                sender.emit(HostEvent::PermissionResult {
                    device: device.clone(),
                    granted,
                })?;
            }
        }
        Ok(())
    }

    fn open_connection(&self, device: &DeviceIdentity) -> Result<ConnectionId> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if state.refused.contains(device) {
            return Err(Error::Host("open refused by mock".to_string()));
        }
        if !state.devices.iter().any(|d| &d.identity == device) {
            return Err(Error::DeviceNotFound {
                query: device.display_name.clone(),
            });
        }

        state.next_connection += 1;
        let connection = ConnectionId(state.next_connection);
        state.connections.insert(connection, device.clone());
        Ok(connection)
    }

    fn close_connection(&self, connection: ConnectionId) {
        let mut state = self.state();
        if state.connections.remove(&connection).is_some() {
            state.closed.push(connection);
        }
    }

    fn bulk_transfer(
        &self,
        connection: ConnectionId,
        endpoint: &EndpointDescriptor,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransferSignal> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let device = self
            .connection_device(connection)
            .ok_or(TransferSignal::NoDevice)?;

        let gate = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .cloned();
        if let Some(gate) = gate {
            gate.pass();
        }

        let mut state = self.state();
        let scripted = state
            .scripted
            .get_mut(&device)
            .and_then(|queue| queue.pop_front());

        let moved = match scripted {
            Some(MockTransfer::Signal(signal)) => return Err(signal),
            Some(MockTransfer::Complete(count)) => count.min(buffer.len()),
            Some(MockTransfer::Data(data)) => copy_into(buffer, &data),
            None => match endpoint.direction {
                Direction::Out => buffer.len(),
                Direction::In => {
                    let data = state
                        .inbound
                        .get_mut(&device)
                        .and_then(|queue| queue.pop_front())
                        .ok_or(TransferSignal::Timeout)?;
                    copy_into(buffer, &data)
                }
            },
        };

        if endpoint.direction == Direction::Out {
            state.sent.push(SentPacket {
                device,
                endpoint: endpoint.address,
                data: buffer[..moved].to_vec(),
            });
        }
        Ok(moved)
    }

    fn fetch_raw_descriptor(
        &self,
        connection: ConnectionId,
        kind: DescriptorKind,
    ) -> Result<Vec<u8>> {
        let device = self
            .connection_device(connection)
            .ok_or_else(|| Error::Host("unknown connection".to_string()))?;
        self.state()
            .descriptors
            .get(&(device, kind))
            .cloned()
            .ok_or_else(|| Error::Host(format!("descriptor {:?} not available", kind)))
    }
}

fn copy_into(buffer: &mut [u8], data: &[u8]) -> usize {
    let len = data.len().min(buffer.len());
    buffer[..len].copy_from_slice(&data[..len]);
    len
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(
    duration: Duration,
    future: F,
) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
