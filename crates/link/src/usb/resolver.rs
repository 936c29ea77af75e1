//! Endpoint resolution
//!
//! First-match policy: interfaces are scanned in the order given, endpoints
//! within an interface likewise, and the first endpoint whose transfer type
//! and direction both match wins. Nothing falls back to another type or
//! direction.

use common::{Error, Result};
use descriptor::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferType};

/// An endpoint together with where it was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// Position of the interface in the scanned sequence
    pub interface_index: usize,
    /// Position of the endpoint within that interface
    pub endpoint_index: usize,
    /// bInterfaceNumber of the owning interface
    pub interface_number: u8,
    pub endpoint: EndpointDescriptor,
}

pub fn resolve(
    interfaces: &[InterfaceDescriptor],
    transfer_type: TransferType,
    direction: Direction,
) -> Result<ResolvedEndpoint> {
    interfaces
        .iter()
        .enumerate()
        .find_map(|(interface_index, interface)| {
            interface
                .endpoints
                .iter()
                .position(|e| e.transfer_type == transfer_type && e.direction == direction)
                .map(|endpoint_index| ResolvedEndpoint {
                    interface_index,
                    endpoint_index,
                    interface_number: interface.interface_number,
                    endpoint: interface.endpoints[endpoint_index],
                })
        })
        .ok_or(Error::EndpointNotFound {
            transfer_type,
            direction,
        })
}
