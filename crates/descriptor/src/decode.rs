//! Raw descriptor decoding
//!
//! Decodes the standard little-endian descriptor layout:
//!
//! ```text
//! Device (18 bytes):
//! [bLength=18][bDescriptorType=1][bcdUSB:2][bDeviceClass][bDeviceSubClass]
//! [bDeviceProtocol][bMaxPacketSize0][idVendor:2][idProduct:2][bcdDevice:2]
//! [iManufacturer][iProduct][iSerialNumber][bNumConfigurations]
//!
//! Configuration (9-byte header, then wTotalLength - 9 bytes of sub-descriptors):
//! [bLength=9][bDescriptorType=2][wTotalLength:2][bNumInterfaces]
//! [bConfigurationValue][iConfiguration][bmAttributes][bMaxPower]
//! ([bLength][bDescriptorType][...])*
//! ```
//!
//! Sub-descriptors with an unknown type tag (class-specific, vendor-specific,
//! interface association, ...) are skipped by their declared length.

use crate::error::{MalformedDescriptor, MalformedReason, Result};
use crate::types::{
    CONFIGURATION_DESCRIPTOR_TYPE, CONFIGURATION_HEADER_LEN, ConfigurationDescriptor,
    DEVICE_DESCRIPTOR_LEN, DEVICE_DESCRIPTOR_TYPE, DeviceDescriptor, Direction,
    ENDPOINT_DESCRIPTOR_LEN, ENDPOINT_DESCRIPTOR_TYPE, EndpointDescriptor,
    INTERFACE_DESCRIPTOR_LEN, INTERFACE_DESCRIPTOR_TYPE, InterfaceDescriptor, TransferType,
};
use byteorder::{ByteOrder, LittleEndian};

/// Mask for the packet size bits of wMaxPacketSize
const MAX_PACKET_SIZE_MASK: u16 = 0x07ff;

/// Decode a device descriptor
///
/// The buffer must hold at least 18 bytes, declare bLength = 18 and carry the
/// device descriptor type tag. Trailing bytes (for example configuration
/// descriptors concatenated by the host) are ignored.
pub fn decode_device(buf: &[u8]) -> Result<DeviceDescriptor> {
    if buf.len() < DEVICE_DESCRIPTOR_LEN {
        return Err(MalformedDescriptor::new(
            0,
            MalformedReason::TooShort {
                needed: DEVICE_DESCRIPTOR_LEN,
                available: buf.len(),
            },
        ));
    }

    check_header(buf, DEVICE_DESCRIPTOR_LEN as u8, DEVICE_DESCRIPTOR_TYPE)?;

    Ok(DeviceDescriptor {
        usb_version: LittleEndian::read_u16(&buf[2..4]),
        class: buf[4],
        subclass: buf[5],
        protocol: buf[6],
        max_packet_size0: buf[7],
        vendor_id: LittleEndian::read_u16(&buf[8..10]),
        product_id: LittleEndian::read_u16(&buf[10..12]),
        device_version: LittleEndian::read_u16(&buf[12..14]),
        manufacturer_index: buf[14],
        product_index: buf[15],
        serial_number_index: buf[16],
        num_configurations: buf[17],
    })
}

/// Decode a configuration descriptor and its nested interfaces and endpoints
///
/// Every sub-descriptor must declare a length of at least 2 that fits in the
/// remaining buffer, and the bytes consumed must add up to exactly
/// wTotalLength. Endpoints attach to the most recent interface.
pub fn decode_configuration(buf: &[u8]) -> Result<ConfigurationDescriptor> {
    if buf.len() < CONFIGURATION_HEADER_LEN {
        return Err(MalformedDescriptor::new(
            0,
            MalformedReason::TooShort {
                needed: CONFIGURATION_HEADER_LEN,
                available: buf.len(),
            },
        ));
    }

    check_header(
        buf,
        CONFIGURATION_HEADER_LEN as u8,
        CONFIGURATION_DESCRIPTOR_TYPE,
    )?;

    let total_length = LittleEndian::read_u16(&buf[2..4]);
    let declared = usize::from(total_length);
    if declared < CONFIGURATION_HEADER_LEN {
        return Err(MalformedDescriptor::new(
            2,
            MalformedReason::TotalLengthMismatch {
                declared: total_length,
                consumed: CONFIGURATION_HEADER_LEN,
            },
        ));
    }

    let mut config = ConfigurationDescriptor {
        total_length,
        num_interfaces: buf[4],
        configuration_value: buf[5],
        string_index: buf[6],
        attributes: buf[7],
        max_power: buf[8],
        interfaces: Vec::new(),
    };

    let mut offset = CONFIGURATION_HEADER_LEN;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        if remaining < 2 {
            return Err(MalformedDescriptor::new(
                offset,
                MalformedReason::TruncatedHeader { remaining },
            ));
        }

        let length = buf[offset];
        let kind = buf[offset + 1];

        if length < 2 {
            return Err(MalformedDescriptor::new(
                offset,
                MalformedReason::SubDescriptorTooShort { length },
            ));
        }
        if usize::from(length) > remaining {
            return Err(MalformedDescriptor::new(
                offset,
                MalformedReason::SubDescriptorOverrun { length, remaining },
            ));
        }

        let end = offset + usize::from(length);
        if end > declared {
            return Err(MalformedDescriptor::new(
                offset,
                MalformedReason::TotalLengthMismatch {
                    declared: total_length,
                    consumed: end,
                },
            ));
        }

        let body = &buf[offset..end];
        match kind {
            INTERFACE_DESCRIPTOR_TYPE => {
                config.interfaces.push(decode_interface(body, offset)?);
            }
            ENDPOINT_DESCRIPTOR_TYPE => {
                let endpoint = decode_endpoint(body, offset)?;
                match config.interfaces.last_mut() {
                    Some(interface) => interface.endpoints.push(endpoint),
                    None => {
                        return Err(MalformedDescriptor::new(
                            offset,
                            MalformedReason::OrphanEndpoint,
                        ));
                    }
                }
            }
            _ => {}
        }

        offset = end;
    }

    if offset != declared {
        return Err(MalformedDescriptor::new(
            offset,
            MalformedReason::TotalLengthMismatch {
                declared: total_length,
                consumed: offset,
            },
        ));
    }

    Ok(config)
}

/// Check bLength and bDescriptorType of a fixed-size descriptor at the start of `buf`
fn check_header(buf: &[u8], expected_len: u8, expected_type: u8) -> Result<()> {
    if buf[0] != expected_len {
        return Err(MalformedDescriptor::new(
            0,
            MalformedReason::BadLength {
                declared: buf[0],
                expected: expected_len,
            },
        ));
    }
    if buf[1] != expected_type {
        return Err(MalformedDescriptor::new(
            1,
            MalformedReason::BadType {
                found: buf[1],
                expected: expected_type,
            },
        ));
    }
    Ok(())
}

/// `body` is exactly the sub-descriptor's declared length; `offset` locates it for errors.
fn decode_interface(body: &[u8], offset: usize) -> Result<InterfaceDescriptor> {
    if body.len() < INTERFACE_DESCRIPTOR_LEN {
        return Err(MalformedDescriptor::new(
            offset,
            MalformedReason::TooShort {
                needed: INTERFACE_DESCRIPTOR_LEN,
                available: body.len(),
            },
        ));
    }

    Ok(InterfaceDescriptor {
        interface_number: body[2],
        alternate_setting: body[3],
        class: body[5],
        subclass: body[6],
        protocol: body[7],
        string_index: body[8],
        endpoints: Vec::with_capacity(usize::from(body[4])),
    })
}

fn decode_endpoint(body: &[u8], offset: usize) -> Result<EndpointDescriptor> {
    if body.len() < ENDPOINT_DESCRIPTOR_LEN {
        return Err(MalformedDescriptor::new(
            offset,
            MalformedReason::TooShort {
                needed: ENDPOINT_DESCRIPTOR_LEN,
                available: body.len(),
            },
        ));
    }

    let address = body[2];
    Ok(EndpointDescriptor {
        address,
        direction: Direction::from_address(address),
        transfer_type: TransferType::from_attributes(body[3]),
        max_packet_size: LittleEndian::read_u16(&body[4..6]) & MAX_PACKET_SIZE_MASK,
        interval: body[6],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0, 1, 0, 0, 0, 1,
    ];

    #[test]
    fn test_decode_device_fields() {
        let device = decode_device(&DEVICE).unwrap();
        assert_eq!(device.usb_version, 0x0200);
        assert_eq!(device.max_packet_size0, 64);
        assert_eq!(device.vendor_id, 0x1234);
        assert_eq!(device.product_id, 0x5678);
        assert_eq!(device.device_version, 0x0100);
        assert_eq!(device.num_configurations, 1);
    }

    #[test]
    fn test_decode_device_ignores_trailing_bytes() {
        let mut raw = DEVICE.to_vec();
        raw.extend_from_slice(&[9, 2, 9, 0, 0, 1, 0, 0x80, 50]);
        assert!(decode_device(&raw).is_ok());
    }

    #[test]
    fn test_decode_device_too_short() {
        let err = decode_device(&DEVICE[..17]).unwrap_err();
        assert_eq!(err.offset, 0);
        assert_eq!(
            err.reason,
            MalformedReason::TooShort {
                needed: 18,
                available: 17
            }
        );
    }

    #[test]
    fn test_decode_device_wrong_length_byte() {
        let mut raw = DEVICE;
        raw[0] = 12;
        let err = decode_device(&raw).unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(matches!(err.reason, MalformedReason::BadLength { .. }));
    }

    #[test]
    fn test_decode_device_wrong_type() {
        let mut raw = DEVICE;
        raw[1] = CONFIGURATION_DESCRIPTOR_TYPE;
        let err = decode_device(&raw).unwrap_err();
        assert_eq!(err.offset, 1);
        assert!(matches!(err.reason, MalformedReason::BadType { .. }));
    }

    #[test]
    fn test_decode_configuration_header_only() {
        let config = decode_configuration(&[9, 2, 9, 0, 0, 1, 0, 0x80, 50]).unwrap();
        assert_eq!(config.total_length, 9);
        assert_eq!(config.max_power_ma(), 100);
        assert!(config.interfaces.is_empty());
    }

    #[test]
    fn test_decode_configuration_skips_unknown_descriptor() {
        let raw = [
            9, 2, 30, 0, 1, 1, 0, 0x80, 50, // header
            9, 4, 0, 0, 1, 3, 0, 0, 0, // HID interface
            5, 0x21, 0x11, 0x01, 0x00, // class-specific HID descriptor (truncated form)
            7, 5, 0x81, 0x03, 8, 0, 10, // interrupt IN
        ];
        let config = decode_configuration(&raw).unwrap();
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].endpoints.len(), 1);
        assert_eq!(
            config.interfaces[0].endpoints[0].transfer_type,
            TransferType::Interrupt
        );
    }

    #[test]
    fn test_decode_configuration_zero_length_sub_descriptor() {
        let raw = [9, 2, 11, 0, 1, 1, 0, 0x80, 50, 0, 4];
        let err = decode_configuration(&raw).unwrap_err();
        assert_eq!(err.offset, 9);
        assert_eq!(
            err.reason,
            MalformedReason::SubDescriptorTooShort { length: 0 }
        );
    }

    #[test]
    fn test_decode_configuration_sub_descriptor_overrun() {
        let raw = [9, 2, 18, 0, 1, 1, 0, 0x80, 50, 9, 4, 0, 0];
        let err = decode_configuration(&raw).unwrap_err();
        assert_eq!(err.offset, 9);
        assert_eq!(
            err.reason,
            MalformedReason::SubDescriptorOverrun {
                length: 9,
                remaining: 4
            }
        );
    }

    #[test]
    fn test_decode_configuration_orphan_endpoint() {
        let raw = [9, 2, 16, 0, 1, 1, 0, 0x80, 50, 7, 5, 0x81, 2, 64, 0, 0];
        let err = decode_configuration(&raw).unwrap_err();
        assert_eq!(err.offset, 9);
        assert_eq!(err.reason, MalformedReason::OrphanEndpoint);
    }

    #[test]
    fn test_decode_configuration_short_interface_body() {
        // bLength 4 with interface tag: fits the buffer but not the layout
        let raw = [9, 2, 13, 0, 1, 1, 0, 0x80, 50, 4, 4, 0, 0];
        let err = decode_configuration(&raw).unwrap_err();
        assert_eq!(err.offset, 9);
        assert_eq!(
            err.reason,
            MalformedReason::TooShort {
                needed: 9,
                available: 4
            }
        );
    }

    #[test]
    fn test_decode_configuration_total_below_header() {
        let err = decode_configuration(&[9, 2, 4, 0, 0, 1, 0, 0x80, 50]).unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn test_max_packet_size_masks_multiplier_bits() {
        let raw = [
            9, 2, 25, 0, 1, 1, 0, 0x80, 50, // header
            9, 4, 0, 0, 1, 0xff, 0, 0, 0, // interface
            7, 5, 0x81, 0x01, 0x00, 0x14, 1, // iso IN, 0x1400 = 2 extra transactions + 1024
        ];
        let config = decode_configuration(&raw).unwrap();
        assert_eq!(config.interfaces[0].endpoints[0].max_packet_size, 1024);
    }
}
