//! USB descriptor type definitions
//!
//! Structured records for the four standard descriptor kinds plus the
//! endpoint attribute enums shared by the decoder and the endpoint resolver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// bDescriptorType of a device descriptor
pub const DEVICE_DESCRIPTOR_TYPE: u8 = 0x01;
/// bDescriptorType of a configuration descriptor
pub const CONFIGURATION_DESCRIPTOR_TYPE: u8 = 0x02;
/// bDescriptorType of an interface descriptor
pub const INTERFACE_DESCRIPTOR_TYPE: u8 = 0x04;
/// bDescriptorType of an endpoint descriptor
pub const ENDPOINT_DESCRIPTOR_TYPE: u8 = 0x05;

/// Fixed size of a device descriptor
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
/// Fixed size of the configuration descriptor header
pub const CONFIGURATION_HEADER_LEN: usize = 9;
/// Minimum size of an interface descriptor
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
/// Minimum size of an endpoint descriptor
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// Endpoint direction, taken from bit 7 of the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// Endpoint transfer type, taken from bits 0..1 of bmAttributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferType::Control => "control",
            TransferType::Isochronous => "isochronous",
            TransferType::Bulk => "bulk",
            TransferType::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// A unidirectional data channel on an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    /// wMaxPacketSize with the high-bandwidth multiplier bits masked off
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Build an endpoint from its address; direction is derived from bit 7.
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            address,
            direction: Direction::from_address(address),
            transfer_type,
            max_packet_size,
            interval: 0,
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// One interface (alternate setting) and its endpoints, in descriptor order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber
    pub interface_number: u8,
    /// bAlternateSetting
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// iInterface string index (0 = none)
    pub string_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(interface_number: u8, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            interface_number,
            alternate_setting: 0,
            class: 0xff,
            subclass: 0,
            protocol: 0,
            string_index: 0,
            endpoints,
        }
    }
}

/// Standard 18-byte device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// bMaxPacketSize0, the control endpoint's max packet size
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

/// Configuration descriptor header plus its nested interfaces and endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// wTotalLength: header plus every nested descriptor
    pub total_length: u16,
    /// bNumInterfaces as declared by the device
    pub num_interfaces: u8,
    pub configuration_value: u8,
    /// iConfiguration string index (0 = none)
    pub string_index: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower in 2 mA units
    pub max_power: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigurationDescriptor {
    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }

    pub fn max_power_ma(&self) -> u16 {
        u16::from(self.max_power) * 2
    }
}

/// Which raw descriptor to fetch from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Device,
    /// Configuration descriptor by index (not bConfigurationValue)
    Configuration(u8),
}

impl DescriptorKind {
    pub fn descriptor_type(&self) -> u8 {
        match self {
            DescriptorKind::Device => DEVICE_DESCRIPTOR_TYPE,
            DescriptorKind::Configuration(_) => CONFIGURATION_DESCRIPTOR_TYPE,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            DescriptorKind::Device => 0,
            DescriptorKind::Configuration(index) => *index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x01), Direction::Out);
        assert_eq!(Direction::from_address(0x00), Direction::Out);
    }

    #[test]
    fn test_transfer_type_ignores_sync_bits() {
        assert_eq!(TransferType::from_attributes(0x02), TransferType::Bulk);
        // Isochronous sync/usage bits live above bit 1
        assert_eq!(TransferType::from_attributes(0x0d), TransferType::Isochronous);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
        assert_eq!(TransferType::from_attributes(0x00), TransferType::Control);
    }

    #[test]
    fn test_endpoint_number() {
        let ep = EndpointDescriptor::new(0x83, TransferType::Bulk, 64);
        assert_eq!(ep.number(), 3);
        assert_eq!(ep.direction, Direction::In);
    }

    #[test]
    fn test_configuration_power_attributes() {
        let config = ConfigurationDescriptor {
            total_length: 9,
            num_interfaces: 0,
            configuration_value: 1,
            string_index: 0,
            attributes: 0xe0,
            max_power: 250,
            interfaces: Vec::new(),
        };
        assert!(config.self_powered());
        assert!(config.remote_wakeup());
        assert_eq!(config.max_power_ma(), 500);
    }

    #[test]
    fn test_descriptor_kind() {
        assert_eq!(DescriptorKind::Device.descriptor_type(), 0x01);
        assert_eq!(DescriptorKind::Configuration(2).descriptor_type(), 0x02);
        assert_eq!(DescriptorKind::Configuration(2).index(), 2);
    }
}
