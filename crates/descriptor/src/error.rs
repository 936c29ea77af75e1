//! Descriptor decoding errors

use thiserror::Error;

/// A descriptor buffer that could not be decoded
///
/// `offset` is the byte position within the supplied buffer where the
/// problem was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed descriptor at offset {offset}: {reason}")]
pub struct MalformedDescriptor {
    pub offset: usize,
    pub reason: MalformedReason,
}

impl MalformedDescriptor {
    pub fn new(offset: usize, reason: MalformedReason) -> Self {
        Self { offset, reason }
    }
}

/// Why a descriptor was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    /// Fewer bytes than the fixed layout requires
    #[error("buffer too short: needed {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },

    /// bLength does not match the fixed layout
    #[error("declared length {declared}, expected {expected}")]
    BadLength { declared: u8, expected: u8 },

    /// bDescriptorType does not match the requested descriptor
    #[error("descriptor type {found:#04x}, expected {expected:#04x}")]
    BadType { found: u8, expected: u8 },

    /// A single trailing byte where a [length][type] prefix should start
    #[error("truncated sub-descriptor header: {remaining} byte(s) left")]
    TruncatedHeader { remaining: usize },

    /// Sub-descriptor length below the 2-byte prefix
    #[error("sub-descriptor length {length} is below the 2-byte minimum")]
    SubDescriptorTooShort { length: u8 },

    /// Sub-descriptor length runs past the end of the buffer
    #[error("sub-descriptor length {length} exceeds the {remaining} bytes remaining")]
    SubDescriptorOverrun { length: u8, remaining: usize },

    /// Bytes consumed by the sub-descriptors disagree with wTotalLength
    #[error("declared total length {declared} does not match {consumed} bytes of descriptors")]
    TotalLengthMismatch { declared: u16, consumed: usize },

    /// Endpoint descriptor before any interface descriptor
    #[error("endpoint descriptor outside of any interface")]
    OrphanEndpoint,
}

/// Type alias for decoding results
pub type Result<T> = std::result::Result<T, MalformedDescriptor>;
