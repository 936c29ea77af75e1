//! Host platform boundary
//!
//! The link core never talks to a USB stack directly. Device enumeration,
//! permission prompts, connection lifetime and raw transfers are supplied by
//! a [`HostPlatform`] implementation: libusb through rusb in production, a
//! scripted mock in tests.

use crate::Result;
use crate::usb_types::{DeviceIdentity, DeviceSnapshot};
use descriptor::{DescriptorKind, EndpointDescriptor};
use std::time::Duration;
use thiserror::Error;

/// Opaque connection token issued by [`HostPlatform::open_connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Why a bulk transfer moved no data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferSignal {
    /// The timeout elapsed before any data moved
    #[error("timed out")]
    Timeout,
    /// The device rejected the transfer (STALL handshake)
    #[error("endpoint stalled")]
    Stall,
    /// The device is gone
    #[error("no device")]
    NoDevice,
    #[error("{0}")]
    Other(String),
}

/// Services the host platform provides to the link core
///
/// Implementations are shared across worker threads.
pub trait HostPlatform: Send + Sync + 'static {
    /// Currently attached devices with their interface trees
    fn enumerate_devices(&self) -> Result<Vec<DeviceSnapshot>>;

    /// Whether the host already trusts this device, so no prompt is needed
    fn has_permission(&self, device: &DeviceIdentity) -> bool;

    /// Start an access request
    ///
    /// Returns once the request is issued. The decision is delivered later as
    /// a `HostEvent::PermissionResult` on the event channel.
    fn request_permission(&self, device: &DeviceIdentity) -> Result<()>;

    fn open_connection(&self, device: &DeviceIdentity) -> Result<ConnectionId>;

    fn close_connection(&self, connection: ConnectionId);

    /// One blocking bulk transfer
    ///
    /// The endpoint's direction decides whether `buffer` is sent (OUT) or
    /// filled (IN). Returns the number of bytes moved.
    fn bulk_transfer(
        &self,
        connection: ConnectionId,
        endpoint: &EndpointDescriptor,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferSignal>;

    /// Raw descriptor bytes via a GET_DESCRIPTOR control read
    fn fetch_raw_descriptor(&self, connection: ConnectionId, kind: DescriptorKind)
    -> Result<Vec<u8>>;
}
