//! Connection lifetime
//!
//! Opens host connections behind the permission gate, allows at most one open
//! connection per device identity and binds each connection to the device's
//! detach flag.

use crate::usb::permission::PermissionCoordinator;
use common::{ConnectionId, DeviceIdentity, Error, HostPlatform, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type OpenSet = Arc<Mutex<HashSet<DeviceIdentity>>>;

/// An open connection to one device
///
/// Closed on [`ConnectionHandle::close`] or when dropped, whichever comes
/// first.
pub struct ConnectionHandle {
    device: DeviceIdentity,
    connection: ConnectionId,
    host: Arc<dyn HostPlatform>,
    detached: Arc<AtomicBool>,
    open_set: OpenSet,
    open: bool,
}

impl ConnectionHandle {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Open and the device has not detached
    pub fn is_open(&self) -> bool {
        self.open && !self.is_detached()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.host.close_connection(self.connection);
        self.open_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device);
        debug!("Closed connection {:?} to {}", self.connection, self.device);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("device", &self.device)
            .field("connection", &self.connection)
            .field("open", &self.open)
            .field("detached", &self.is_detached())
            .finish()
    }
}

pub struct ConnectionManager {
    host: Arc<dyn HostPlatform>,
    permissions: Arc<PermissionCoordinator>,
    open_set: OpenSet,
    /// Detach flags, one per device that has been opened since it attached
    detach_flags: Mutex<HashMap<DeviceIdentity, Arc<AtomicBool>>>,
}

impl ConnectionManager {
    pub fn new(host: Arc<dyn HostPlatform>, permissions: Arc<PermissionCoordinator>) -> Self {
        Self {
            host,
            permissions,
            open_set: Arc::new(Mutex::new(HashSet::new())),
            detach_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Open a connection to a granted device
    pub fn open(&self, device: &DeviceIdentity) -> Result<ConnectionHandle> {
        self.permissions.check(device)?;

        {
            let mut open = self.open_set.lock().unwrap_or_else(PoisonError::into_inner);
            if !open.insert(device.clone()) {
                return Err(Error::ConnectionOpenFailed {
                    device: device.clone(),
                    reason: "a connection to this device is already open".to_string(),
                });
            }
        }

        let connection = match self.host.open_connection(device) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to open {}: {}", device, e);
                self.release(device);
                return Err(Error::ConnectionOpenFailed {
                    device: device.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let detached = self
            .detach_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.clone())
            .or_default()
            .clone();

        debug!("Opened connection {:?} to {}", connection, device);
        Ok(ConnectionHandle {
            device: device.clone(),
            connection,
            host: self.host.clone(),
            detached,
            open_set: self.open_set.clone(),
            open: true,
        })
    }

    fn release(&self, device: &DeviceIdentity) {
        self.open_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);
    }

    /// Mark every handle bound to this device as detached
    ///
    /// The next transfer on such a handle fails with
    /// `DeviceDetachedMidOperation`. A later open after re-attach gets a
    /// fresh flag.
    pub fn invalidate(&self, device: &DeviceIdentity) {
        let flag = self
            .detach_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);

        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
            info!("Invalidated connections to {}", device);
        }
    }

    pub fn is_open(&self, device: &DeviceIdentity) -> bool {
        self.open_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockHost, create_mock_snapshot};

    fn setup() -> (Arc<MockHost>, Arc<PermissionCoordinator>, ConnectionManager, DeviceIdentity) {
        let snapshot = create_mock_snapshot(1, 0x1234, 0x5678);
        let device = snapshot.identity.clone();
        let host = Arc::new(MockHost::new().with_device(snapshot));
        let permissions = Arc::new(PermissionCoordinator::new());
        let manager = ConnectionManager::new(host.clone(), permissions.clone());
        (host, permissions, manager, device)
    }

    #[test]
    fn test_open_requires_permission() {
        let (host, _permissions, manager, device) = setup();
        assert!(matches!(
            manager.open(&device),
            Err(Error::PermissionDenied { .. })
        ));
        assert_eq!(host.open_calls(), 0);
    }

    #[test]
    fn test_single_open_handle_per_device() {
        let (host, permissions, manager, device) = setup();
        permissions.mark_granted(&device);

        let handle = manager.open(&device).unwrap();
        assert!(matches!(
            manager.open(&device),
            Err(Error::ConnectionOpenFailed { .. })
        ));
        drop(handle);

        assert!(!manager.is_open(&device));
        assert!(manager.open(&device).is_ok());
        assert_eq!(host.open_calls(), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (host, permissions, manager, device) = setup();
        permissions.mark_granted(&device);

        let mut handle = manager.open(&device).unwrap();
        handle.close();
        handle.close();
        drop(handle);

        assert!(!manager.is_open(&device));
        assert_eq!(host.closed_connections(), 1);
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let (host, permissions, manager, device) = setup();
        permissions.mark_granted(&device);
        host.refuse_open(&device);

        assert!(matches!(
            manager.open(&device),
            Err(Error::ConnectionOpenFailed { .. })
        ));
        assert!(!manager.is_open(&device));
    }

    #[test]
    fn test_invalidate_marks_handle_detached() {
        let (_host, permissions, manager, device) = setup();
        permissions.mark_granted(&device);

        let handle = manager.open(&device).unwrap();
        assert!(handle.is_open());

        manager.invalidate(&device);
        assert!(handle.is_detached());
        assert!(!handle.is_open());
    }
}
