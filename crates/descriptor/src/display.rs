//! Human-readable rendering of decoded descriptors

use crate::types::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
use std::fmt;

/// Name of a standard USB class code
pub fn class_name(code: u8) -> &'static str {
    match code {
        0x00 => "Defined per interface",
        0x01 => "Audio",
        0x02 => "Communications (CDC)",
        0x03 => "HID",
        0x05 => "Physical",
        0x06 => "Image",
        0x07 => "Printer",
        0x08 => "Mass Storage",
        0x09 => "Hub",
        0x0a => "CDC Data",
        0x0b => "Smart Card",
        0x0d => "Content Security",
        0x0e => "Video",
        0x0f => "Personal Healthcare",
        0x10 => "Audio/Video",
        0x11 => "Billboard",
        0xdc => "Diagnostic",
        0xe0 => "Wireless Controller",
        0xef => "Miscellaneous",
        0xfe => "Application Specific",
        0xff => "Vendor Specific",
        _ => "Unknown",
    }
}

/// Format a BCD version field (bcdUSB, bcdDevice) as `major.minor`
///
/// ```
/// assert_eq!(descriptor::format_bcd(0x0200), "2.00");
/// assert_eq!(descriptor::format_bcd(0x0110), "1.10");
/// ```
pub fn format_bcd(bcd: u16) -> String {
    let major = (bcd >> 12) * 10 + ((bcd >> 8) & 0x0f);
    format!("{}.{}{}", major, (bcd >> 4) & 0x0f, bcd & 0x0f)
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device Descriptor:")?;
        writeln!(f, "  USB Version: {}", format_bcd(self.usb_version))?;
        writeln!(
            f,
            "  Class: {:#04x} ({}), Subclass: {:#04x}, Protocol: {:#04x}",
            self.class,
            class_name(self.class),
            self.subclass,
            self.protocol
        )?;
        writeln!(f, "  Max Packet Size (EP0): {}", self.max_packet_size0)?;
        writeln!(f, "  Vendor ID: {:#06x}", self.vendor_id)?;
        writeln!(f, "  Product ID: {:#06x}", self.product_id)?;
        writeln!(f, "  Device Version: {}", format_bcd(self.device_version))?;
        writeln!(
            f,
            "  String Indices: manufacturer={}, product={}, serial={}",
            self.manufacturer_index, self.product_index, self.serial_number_index
        )?;
        write!(f, "  Configurations: {}", self.num_configurations)
    }
}

impl fmt::Display for ConfigurationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration Descriptor:")?;
        writeln!(f, "  Total Length: {}", self.total_length)?;
        writeln!(f, "  Value: {}", self.configuration_value)?;
        writeln!(
            f,
            "  Attributes: {:#04x}{}{}",
            self.attributes,
            if self.self_powered() {
                " self-powered"
            } else {
                " bus-powered"
            },
            if self.remote_wakeup() {
                ", remote-wakeup"
            } else {
                ""
            }
        )?;
        writeln!(f, "  Max Power: {} mA", self.max_power_ma())?;
        write!(f, "  Interfaces: {}", self.num_interfaces)?;
        for interface in &self.interfaces {
            write!(f, "\n{}", interface)?;
        }
        Ok(())
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  Interface {} (alt {}): class {:#04x} ({}), subclass {:#04x}, protocol {:#04x}",
            self.interface_number,
            self.alternate_setting,
            self.class,
            class_name(self.class),
            self.subclass,
            self.protocol
        )?;
        for endpoint in &self.endpoints {
            write!(f, "\n    {}", endpoint)?;
        }
        Ok(())
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Endpoint {:#04x}: {} {}, max packet {}",
            self.address, self.transfer_type, self.direction, self.max_packet_size
        )?;
        if self.interval != 0 {
            write!(f, ", interval {}", self.interval)?;
        }
        Ok(())
    }
}
