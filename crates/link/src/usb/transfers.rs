//! USB transfer execution
//!
//! One bulk transfer per call, no internal retries. Preconditions (handle
//! open, device not detached, permission granted, endpoint usable for the
//! direction) are checked before the host is called; a detach that lands
//! while the call is in flight turns its outcome into
//! `DeviceDetachedMidOperation`.

use crate::usb::connection::ConnectionHandle;
use crate::usb::permission::PermissionCoordinator;
use common::{Error, HostPlatform, Result, TransferSignal};
use descriptor::{
    ConfigurationDescriptor, DescriptorKind, DeviceDescriptor, Direction, EndpointDescriptor,
    TransferType,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout used when neither the caller nor the configuration sets one
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Decoded device and active configuration descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescription {
    pub device: DeviceDescriptor,
    pub configuration: ConfigurationDescriptor,
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.device, self.configuration)
    }
}

pub struct TransferEngine {
    host: Arc<dyn HostPlatform>,
    permissions: Arc<PermissionCoordinator>,
    default_timeout: Duration,
}

impl TransferEngine {
    pub fn new(host: Arc<dyn HostPlatform>, permissions: Arc<PermissionCoordinator>) -> Self {
        Self {
            host,
            permissions,
            default_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `payload` on a bulk OUT endpoint; returns bytes sent
    pub fn send(
        &self,
        handle: &ConnectionHandle,
        endpoint: &EndpointDescriptor,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.check_preconditions(handle, endpoint, Direction::Out)?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        debug!(
            "Bulk OUT: endpoint={:#04x}, len={}, timeout={}ms",
            endpoint.address,
            payload.len(),
            timeout.as_millis()
        );

        let mut buffer = payload.to_vec();
        let outcome =
            self.host
                .bulk_transfer(handle.connection_id(), endpoint, &mut buffer, timeout);

        let sent = self.classify(handle, endpoint, payload.len(), timeout, outcome)?;
        if sent == 0 && !payload.is_empty() {
            return Err(self.timed_out(endpoint, payload.len(), timeout));
        }

        debug!("Bulk OUT on {:#04x} sent {} bytes", endpoint.address, sent);
        Ok(sent)
    }

    /// Receive up to `max_bytes` from a bulk IN endpoint
    pub fn receive(
        &self,
        handle: &ConnectionHandle,
        endpoint: &EndpointDescriptor,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.check_preconditions(handle, endpoint, Direction::In)?;
        if max_bytes == 0 {
            return Ok(Vec::new());
        }
        let timeout = timeout.unwrap_or(self.default_timeout);

        debug!(
            "Bulk IN: endpoint={:#04x}, max={}, timeout={}ms",
            endpoint.address,
            max_bytes,
            timeout.as_millis()
        );

        let mut buffer = vec![0u8; max_bytes];
        let outcome =
            self.host
                .bulk_transfer(handle.connection_id(), endpoint, &mut buffer, timeout);

        let received = self.classify(handle, endpoint, max_bytes, timeout, outcome)?;
        if received == 0 {
            return Err(self.timed_out(endpoint, max_bytes, timeout));
        }

        buffer.truncate(received);
        debug!("Bulk IN on {:#04x} received {} bytes", endpoint.address, received);
        Ok(buffer)
    }

    /// Fetch and decode the device descriptor and the first configuration
    pub fn describe(&self, handle: &ConnectionHandle) -> Result<DeviceDescription> {
        self.check_handle(handle)?;

        let raw = self
            .host
            .fetch_raw_descriptor(handle.connection_id(), DescriptorKind::Device)?;
        let device = descriptor::decode_device(&raw)?;

        let raw = self
            .host
            .fetch_raw_descriptor(handle.connection_id(), DescriptorKind::Configuration(0))?;
        let configuration = descriptor::decode_configuration(&raw)?;

        self.check_detached(handle)?;
        Ok(DeviceDescription {
            device,
            configuration,
        })
    }

    fn check_detached(&self, handle: &ConnectionHandle) -> Result<()> {
        if handle.is_detached() {
            return Err(Error::DeviceDetachedMidOperation {
                device: handle.device().clone(),
            });
        }
        Ok(())
    }

    fn check_handle(&self, handle: &ConnectionHandle) -> Result<()> {
        self.check_detached(handle)?;
        if !handle.is_open() {
            return Err(Error::ConnectionOpenFailed {
                device: handle.device().clone(),
                reason: "connection is closed".to_string(),
            });
        }
        self.permissions.check(handle.device())
    }

    fn check_preconditions(
        &self,
        handle: &ConnectionHandle,
        endpoint: &EndpointDescriptor,
        direction: Direction,
    ) -> Result<()> {
        self.check_handle(handle)?;

        if endpoint.transfer_type != TransferType::Bulk {
            return Err(Error::EndpointNotFound {
                transfer_type: TransferType::Bulk,
                direction,
            });
        }
        if endpoint.direction != direction {
            return Err(Error::DirectionMismatch {
                endpoint: endpoint.address,
                expected: direction,
                actual: endpoint.direction,
            });
        }
        Ok(())
    }

    /// Map the primitive's outcome, letting a detach take precedence
    fn classify(
        &self,
        handle: &ConnectionHandle,
        endpoint: &EndpointDescriptor,
        attempted: usize,
        timeout: Duration,
        outcome: std::result::Result<usize, TransferSignal>,
    ) -> Result<usize> {
        self.check_detached(handle)?;

        outcome.map_err(|signal| {
            warn!(
                "Bulk transfer on {:#04x} failed: {}",
                endpoint.address, signal
            );
            match signal {
                TransferSignal::Timeout => self.timed_out(endpoint, attempted, timeout),
                TransferSignal::Stall => Error::TransferStalled {
                    endpoint: endpoint.address,
                    attempted,
                },
                TransferSignal::NoDevice => Error::DeviceDetachedMidOperation {
                    device: handle.device().clone(),
                },
                TransferSignal::Other(message) => Error::Host(message),
            }
        })
    }

    fn timed_out(
        &self,
        endpoint: &EndpointDescriptor,
        attempted: usize,
        timeout: Duration,
    ) -> Error {
        Error::TransferTimeout {
            endpoint: endpoint.address,
            attempted,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::connection::ConnectionManager;
    use common::DeviceIdentity;
    use common::test_utils::{MockHost, MockTransfer, create_mock_snapshot};

    struct Fixture {
        host: Arc<MockHost>,
        manager: ConnectionManager,
        engine: TransferEngine,
        device: DeviceIdentity,
    }

    fn fixture() -> Fixture {
        let snapshot = create_mock_snapshot(1, 0x1234, 0x5678);
        let device = snapshot.identity.clone();
        let host = Arc::new(MockHost::new().with_device(snapshot));
        let permissions = Arc::new(PermissionCoordinator::new());
        permissions.mark_granted(&device);
        let manager = ConnectionManager::new(host.clone(), permissions.clone());
        let engine = TransferEngine::new(host.clone(), permissions);
        Fixture {
            host,
            manager,
            engine,
            device,
        }
    }

    fn bulk_out() -> EndpointDescriptor {
        EndpointDescriptor::new(0x01, TransferType::Bulk, 512)
    }

    fn bulk_in() -> EndpointDescriptor {
        EndpointDescriptor::new(0x81, TransferType::Bulk, 512)
    }

    #[test]
    fn test_send_returns_bytes_sent() {
        let f = fixture();
        let handle = f.manager.open(&f.device).unwrap();
        let sent = f.engine.send(&handle, &bulk_out(), b"hello", None).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(f.host.sent()[0].data, b"hello");
    }

    #[test]
    fn test_timeout_and_stall_are_distinct() {
        let f = fixture();
        f.host
            .script_transfer(&f.device, MockTransfer::Signal(TransferSignal::Timeout));
        f.host
            .script_transfer(&f.device, MockTransfer::Signal(TransferSignal::Stall));
        let handle = f.manager.open(&f.device).unwrap();

        match f.engine.send(&handle, &bulk_out(), b"abc", Some(Duration::from_millis(250))) {
            Err(Error::TransferTimeout {
                endpoint,
                attempted,
                timeout_ms,
            }) => {
                assert_eq!(endpoint, 0x01);
                assert_eq!(attempted, 3);
                assert_eq!(timeout_ms, 250);
            }
            other => panic!("Expected timeout, got {:?}", other),
        }

        assert!(matches!(
            f.engine.send(&handle, &bulk_out(), b"abc", None),
            Err(Error::TransferStalled { endpoint: 0x01, attempted: 3 })
        ));
        // Exactly one primitive call per engine call
        assert_eq!(f.host.bulk_calls(), 2);
    }

    #[test]
    fn test_zero_bytes_moved_is_timeout() {
        let f = fixture();
        f.host.script_transfer(&f.device, MockTransfer::Complete(0));
        let handle = f.manager.open(&f.device).unwrap();

        let err = f.engine.send(&handle, &bulk_out(), b"abc", None).unwrap_err();
        assert!(matches!(err, Error::TransferTimeout { timeout_ms: 1000, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_receive_truncates_to_received() {
        let f = fixture();
        f.host.queue_inbound(&f.device, b"pong".to_vec());
        let handle = f.manager.open(&f.device).unwrap();

        let data = f.engine.receive(&handle, &bulk_in(), 1024, None).unwrap();
        assert_eq!(data, b"pong");
    }

    #[test]
    fn test_direction_mismatch_checked_before_call() {
        let f = fixture();
        let handle = f.manager.open(&f.device).unwrap();

        assert!(matches!(
            f.engine.send(&handle, &bulk_in(), b"x", None),
            Err(Error::DirectionMismatch { endpoint: 0x81, .. })
        ));
        assert_eq!(f.host.bulk_calls(), 0);
    }

    #[test]
    fn test_closed_handle_fails_before_call() {
        let f = fixture();
        let mut handle = f.manager.open(&f.device).unwrap();
        handle.close();

        assert!(matches!(
            f.engine.send(&handle, &bulk_out(), b"x", None),
            Err(Error::ConnectionOpenFailed { .. })
        ));
        assert_eq!(f.host.bulk_calls(), 0);
    }

    #[test]
    fn test_detached_handle_fails_fast() {
        let f = fixture();
        let handle = f.manager.open(&f.device).unwrap();
        f.manager.invalidate(&f.device);

        let err = f.engine.receive(&handle, &bulk_in(), 64, None).unwrap_err();
        assert!(matches!(err, Error::DeviceDetachedMidOperation { .. }));
        assert!(!err.is_retryable());
        assert_eq!(f.host.bulk_calls(), 0);
    }

    #[test]
    fn test_no_device_signal_maps_to_detach() {
        let f = fixture();
        f.host
            .script_transfer(&f.device, MockTransfer::Signal(TransferSignal::NoDevice));
        let handle = f.manager.open(&f.device).unwrap();

        assert!(matches!(
            f.engine.receive(&handle, &bulk_in(), 64, None),
            Err(Error::DeviceDetachedMidOperation { .. })
        ));
    }
}
