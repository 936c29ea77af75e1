//! Common error types
//!
//! Every failure the link core can surface. Variants carry the device,
//! endpoint and byte counts involved so callers can render a message or
//! apply their own retry policy without re-deriving context.

use crate::usb_types::DeviceIdentity;
use descriptor::{Direction, MalformedDescriptor, TransferType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Permission denied for USB device {device}")]
    PermissionDenied { device: DeviceIdentity },

    #[error("USB device not found: {query}")]
    DeviceNotFound { query: String },

    #[error("Failed to open connection to {device}: {reason}")]
    ConnectionOpenFailed {
        device: DeviceIdentity,
        reason: String,
    },

    #[error("No {transfer_type} {direction} endpoint found")]
    EndpointNotFound {
        transfer_type: TransferType,
        direction: Direction,
    },

    #[error("Endpoint {endpoint:#04x} is {actual}, transfer needs {expected}")]
    DirectionMismatch {
        endpoint: u8,
        expected: Direction,
        actual: Direction,
    },

    #[error(
        "Transfer on endpoint {endpoint:#04x} timed out after {timeout_ms}ms ({attempted} bytes attempted)"
    )]
    TransferTimeout {
        endpoint: u8,
        attempted: usize,
        timeout_ms: u64,
    },

    #[error("Transfer on endpoint {endpoint:#04x} stalled ({attempted} bytes attempted)")]
    TransferStalled { endpoint: u8, attempted: usize },

    #[error(transparent)]
    MalformedDescriptor(#[from] MalformedDescriptor),

    #[error("USB device {device} detached during operation")]
    DeviceDetachedMidOperation { device: DeviceIdentity },

    #[error("Host error: {0}")]
    Host(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether repeating the same operation may succeed.
    ///
    /// Timeouts and stalls are per-call conditions. A detach is terminal for
    /// the operation, and structural errors will fail identically again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransferTimeout { .. } | Error::TransferStalled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
