//! libusb-backed host platform
//!
//! libusb has no interactive permission prompt: access is decided by the
//! operating system (udev rules, group membership). A permission request is
//! therefore answered by trying to open the device and publishing the result
//! as a `PermissionResult` event.

use common::{
    ConnectionId, DeviceId, DeviceIdentity, DeviceSnapshot, Error, EventSender, HostEvent,
    HostPlatform, Result, TransferSignal,
};
use descriptor::{
    DescriptorKind, Direction, EndpointDescriptor, InterfaceDescriptor, TransferType,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// bmRequestType for a standard device-to-host request
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct RusbHost {
    context: Context,
    events: EventSender,
    skip_root_hubs: bool,
    next_connection: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, Arc<DeviceHandle<Context>>>>,
}

impl RusbHost {
    pub fn new(events: EventSender, skip_root_hubs: bool) -> Result<Self> {
        let context = Context::new().map_err(|e| Error::Host(format!("libusb init: {}", e)))?;
        Ok(Self {
            context,
            events,
            skip_root_hubs,
            next_connection: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn snapshot(&self, device: &Device<Context>) -> Option<DeviceSnapshot> {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!(
                    "Skipping device at bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return None;
            }
        };

        // Root hubs are VID 0x1d6b (Linux Foundation) with device class 9 (Hub)
        if self.skip_root_hubs && desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
            return None;
        }

        let identity = identity_of(device, desc.vendor_id(), desc.product_id());
        let interfaces = match device.active_config_descriptor() {
            Ok(config) => convert_interfaces(&config),
            Err(e) => {
                debug!("No active configuration for {}: {}", identity, e);
                Vec::new()
            }
        };

        Some(DeviceSnapshot::new(identity, interfaces))
    }

    fn find_device(&self, identity: &DeviceIdentity) -> Result<Device<Context>> {
        let devices = self.context.devices().map_err(host_error)?;
        devices
            .iter()
            .find(|device| {
                DeviceId::from_bus_address(device.bus_number(), device.address())
                    == identity.device_id
                    && device
                        .device_descriptor()
                        .map(|d| {
                            d.vendor_id() == identity.vendor_id
                                && d.product_id() == identity.product_id
                        })
                        .unwrap_or(false)
            })
            .ok_or_else(|| Error::DeviceNotFound {
                query: identity.to_string(),
            })
    }

    fn handle(&self, connection: ConnectionId) -> Option<Arc<DeviceHandle<Context>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection)
            .cloned()
    }
}

impl HostPlatform for RusbHost {
    fn enumerate_devices(&self) -> Result<Vec<DeviceSnapshot>> {
        let devices = self.context.devices().map_err(host_error)?;
        Ok(devices.iter().filter_map(|d| self.snapshot(&d)).collect())
    }

    fn has_permission(&self, device: &DeviceIdentity) -> bool {
        self.find_device(device)
            .map(|d| d.open().is_ok())
            .unwrap_or(false)
    }

    fn request_permission(&self, device: &DeviceIdentity) -> Result<()> {
        let granted = match self.find_device(device)?.open() {
            Ok(_) => true,
            Err(rusb::Error::Access) => {
                info!("Access to {} denied by the operating system", device);
                false
            }
            Err(e) => {
                warn!("Failed to open {} for permission probe: {}", device, e);
                false
            }
        };

        self.events.emit(HostEvent::PermissionResult {
            device: device.clone(),
            granted,
        })
    }

    fn open_connection(&self, device: &DeviceIdentity) -> Result<ConnectionId> {
        let usb_device = self.find_device(device)?;
        let mut handle = usb_device.open().map_err(|e| match e {
            rusb::Error::Access => Error::PermissionDenied {
                device: device.clone(),
            },
            rusb::Error::NotFound | rusb::Error::NoDevice => Error::DeviceNotFound {
                query: device.to_string(),
            },
            other => host_error(other),
        })?;

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Automatic kernel driver detach unavailable: {}", e);
        }

        let config = usb_device.active_config_descriptor().map_err(host_error)?;
        for interface in config.interfaces() {
            let number = interface.number();
            handle.claim_interface(number).map_err(|e| {
                Error::Host(format!("Failed to claim interface {}: {}", number, e))
            })?;
            debug!("Claimed interface {} on {}", number, device);
        }

        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection, Arc::new(handle));
        Ok(connection)
    }

    fn close_connection(&self, connection: ConnectionId) {
        // Claimed interfaces are released when the last reference drops
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection);
    }

    fn bulk_transfer(
        &self,
        connection: ConnectionId,
        endpoint: &EndpointDescriptor,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferSignal> {
        let handle = self.handle(connection).ok_or(TransferSignal::NoDevice)?;
        let result = match endpoint.direction {
            Direction::In => handle.read_bulk(endpoint.address, buffer, timeout),
            Direction::Out => handle.write_bulk(endpoint.address, buffer, timeout),
        };
        result.map_err(map_rusb_signal)
    }

    fn fetch_raw_descriptor(
        &self,
        connection: ConnectionId,
        kind: DescriptorKind,
    ) -> Result<Vec<u8>> {
        let handle = self
            .handle(connection)
            .ok_or_else(|| Error::Host(format!("unknown connection {:?}", connection)))?;

        let read = |len: usize| -> Result<Vec<u8>> {
            let mut buf = vec![0u8; len];
            let value = (u16::from(kind.descriptor_type()) << 8) | u16::from(kind.index());
            let n = handle
                .read_control(
                    REQUEST_TYPE_STANDARD_IN,
                    REQUEST_GET_DESCRIPTOR,
                    value,
                    0,
                    &mut buf,
                    CONTROL_TIMEOUT,
                )
                .map_err(host_error)?;
            buf.truncate(n);
            Ok(buf)
        };

        match kind {
            DescriptorKind::Device => read(descriptor::DEVICE_DESCRIPTOR_LEN),
            DescriptorKind::Configuration(_) => {
                // Header first for wTotalLength, then the whole tree
                let header = read(descriptor::CONFIGURATION_HEADER_LEN)?;
                if header.len() < 4 {
                    return Ok(header);
                }
                let total = u16::from_le_bytes([header[2], header[3]]);
                read(usize::from(total))
            }
        }
    }
}

fn identity_of(device: &Device<Context>, vendor_id: u16, product_id: u16) -> DeviceIdentity {
    let (bus, address) = (device.bus_number(), device.address());
    DeviceIdentity::new(
        DeviceId::from_bus_address(bus, address),
        vendor_id,
        product_id,
        format!("/dev/bus/usb/{:03}/{:03}", bus, address),
    )
}

fn convert_interfaces(config: &rusb::ConfigDescriptor) -> Vec<InterfaceDescriptor> {
    let mut descriptors = Vec::new();
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            let endpoints = alt
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    direction: Direction::from_address(ep.address()),
                    transfer_type: map_transfer_type(ep.transfer_type()),
                    max_packet_size: packet_size(ep.max_packet_size()),
                    interval: ep.interval(),
                })
                .collect();

            descriptors.push(InterfaceDescriptor {
                interface_number: alt.interface_number(),
                alternate_setting: alt.setting_number(),
                class: alt.class_code(),
                subclass: alt.sub_class_code(),
                protocol: alt.protocol_code(),
                string_index: alt.description_string_index().unwrap_or(0),
                endpoints,
            });
        }
    }
    default_settings(descriptors)
}

/// Keep alternate setting 0 of each interface
///
/// Interfaces are claimed without selecting an alternate setting, so only
/// the default one's endpoints are usable.
fn default_settings(descriptors: Vec<InterfaceDescriptor>) -> Vec<InterfaceDescriptor> {
    descriptors
        .into_iter()
        .filter(|d| d.alternate_setting == 0)
        .collect()
}

/// wMaxPacketSize bits 0..10; bits 11..12 carry high-bandwidth multipliers
fn packet_size(raw: u16) -> u16 {
    raw & 0x07ff
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> TransferType {
    match transfer_type {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}

/// Map rusb::Error to the transfer signals the engine classifies
pub fn map_rusb_signal(err: rusb::Error) -> TransferSignal {
    match err {
        rusb::Error::Timeout => TransferSignal::Timeout,
        rusb::Error::Pipe => TransferSignal::Stall,
        rusb::Error::NoDevice => TransferSignal::NoDevice,
        other => TransferSignal::Other(other.to_string()),
    }
}

fn host_error(err: rusb::Error) -> Error {
    Error::Host(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_signal() {
        assert_eq!(map_rusb_signal(rusb::Error::Timeout), TransferSignal::Timeout);
        assert_eq!(map_rusb_signal(rusb::Error::Pipe), TransferSignal::Stall);
        assert_eq!(map_rusb_signal(rusb::Error::NoDevice), TransferSignal::NoDevice);
        assert!(matches!(
            map_rusb_signal(rusb::Error::Busy),
            TransferSignal::Other(_)
        ));
    }

    #[test]
    fn test_packet_size_drops_multiplier_bits() {
        assert_eq!(packet_size(0x0200), 512);
        assert_eq!(packet_size(0x1400), 1024);
    }

    #[test]
    fn test_default_settings_drop_alternates() {
        let mut alternate = InterfaceDescriptor::new(
            0,
            vec![EndpointDescriptor::new(0x02, TransferType::Bulk, 512)],
        );
        alternate.alternate_setting = 1;
        let interfaces = vec![
            alternate,
            InterfaceDescriptor::new(
                0,
                vec![EndpointDescriptor::new(0x01, TransferType::Bulk, 64)],
            ),
            InterfaceDescriptor::new(1, vec![]),
        ];

        let kept = default_settings(interfaces);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|i| i.alternate_setting == 0));
        assert_eq!(kept[0].endpoints[0].address, 0x01);
    }

    #[test]
    fn test_map_transfer_type() {
        assert_eq!(map_transfer_type(rusb::TransferType::Bulk), TransferType::Bulk);
        assert_eq!(
            map_transfer_type(rusb::TransferType::Interrupt),
            TransferType::Interrupt
        );
    }
}
