//! USB descriptor library for usb-link
//!
//! This crate defines the structured view of the standard USB descriptors a
//! device exposes (device, configuration, interface, endpoint) and decodes
//! them from the raw little-endian byte layout returned by GET_DESCRIPTOR.
//!
//! Decoding never reads past the end of the supplied buffer: every length
//! prefix is checked against the bytes actually present, and any mismatch is
//! reported as a [`MalformedDescriptor`] carrying the byte offset where it was
//! detected.
//!
//! # Example
//!
//! ```
//! use descriptor::decode_device;
//!
//! let raw = [
//!     18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0, 1, 0, 0, 0, 1,
//! ];
//! let device = decode_device(&raw).unwrap();
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.product_id, 0x5678);
//! assert_eq!(device.num_configurations, 1);
//! ```
//!
//! # Configuration trees
//!
//! ```
//! use descriptor::{Direction, TransferType, decode_configuration};
//!
//! let raw = [
//!     // configuration header, wTotalLength = 25
//!     9, 2, 25, 0, 1, 1, 0, 0x80, 50,
//!     // interface 0 with one endpoint
//!     9, 4, 0, 0, 1, 0xff, 0, 0, 0,
//!     // bulk IN endpoint 0x81, 512 byte packets
//!     7, 5, 0x81, 0x02, 0x00, 0x02, 0,
//! ];
//! let config = decode_configuration(&raw).unwrap();
//! let endpoint = &config.interfaces[0].endpoints[0];
//! assert_eq!(endpoint.direction, Direction::In);
//! assert_eq!(endpoint.transfer_type, TransferType::Bulk);
//! assert_eq!(endpoint.max_packet_size, 512);
//! ```

pub mod decode;
pub mod display;
pub mod error;
pub mod types;

pub use decode::{decode_configuration, decode_device};
pub use display::{class_name, format_bcd};
pub use error::{MalformedDescriptor, MalformedReason, Result};
pub use types::{
    CONFIGURATION_DESCRIPTOR_TYPE, CONFIGURATION_HEADER_LEN, ConfigurationDescriptor,
    DEVICE_DESCRIPTOR_LEN, DEVICE_DESCRIPTOR_TYPE, DescriptorKind, DeviceDescriptor, Direction,
    ENDPOINT_DESCRIPTOR_LEN, ENDPOINT_DESCRIPTOR_TYPE, EndpointDescriptor,
    INTERFACE_DESCRIPTOR_LEN, INTERFACE_DESCRIPTOR_TYPE, InterfaceDescriptor, TransferType,
};
