//! USB device identity types

use descriptor::InterfaceDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-assigned device identifier
///
/// Hosts that address devices by bus and address pack both into the id
/// with [`DeviceId::from_bus_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn from_bus_address(bus: u8, address: u8) -> Self {
        DeviceId((u32::from(bus) << 8) | u32::from(address))
    }

    pub fn bus_number(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn address(&self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable snapshot of a device taken at enumeration time
///
/// Two identities are equal only when every field matches, so a device that
/// re-enumerates under a new id or name is a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub display_name: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: DeviceId,
        vendor_id: u16,
        product_id: u16,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            vendor_id,
            product_id,
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {:04x}:{:04x})",
            self.display_name, self.device_id, self.vendor_id, self.product_id
        )
    }
}

/// A device identity together with the interface tree the host reported
///
/// `interfaces` may be empty when the host cannot supply topology; callers
/// then decode it from the configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceSnapshot {
    pub fn new(identity: DeviceIdentity, interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            identity,
            interfaces,
        }
    }
}
