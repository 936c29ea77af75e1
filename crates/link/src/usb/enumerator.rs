//! Device enumeration
//!
//! Lists the devices the host reports, applies the configured VID:PID
//! filters and detects attach/detach deltas between two listings.

use common::{
    DeviceIdentity, DeviceSnapshot, Error, EventSender, HostEvent, HostPlatform, Result,
};
use descriptor::InterfaceDescriptor;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Devices that appeared or vanished between two listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDelta {
    pub attached: BTreeSet<DeviceIdentity>,
    pub detached: BTreeSet<DeviceIdentity>,
}

impl DeviceDelta {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Result of one polling round against the previously seen device set
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub attached: Vec<DeviceSnapshot>,
    pub detached: Vec<DeviceIdentity>,
}

/// Device enumerator
///
/// Keeps the last seen snapshot of every visible device so callers can look
/// up a device's interface tree without another host round-trip.
pub struct DeviceEnumerator {
    host: Arc<dyn HostPlatform>,
    /// Device filters (VID:PID patterns)
    filters: Vec<String>,
    known: Mutex<BTreeMap<DeviceIdentity, DeviceSnapshot>>,
}

impl DeviceEnumerator {
    pub fn new(host: Arc<dyn HostPlatform>, filters: Vec<String>) -> Self {
        Self {
            host,
            filters,
            known: Mutex::new(BTreeMap::new()),
        }
    }

    fn known(&self) -> MutexGuard<'_, BTreeMap<DeviceIdentity, DeviceSnapshot>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently attached devices that pass the filters
    pub fn snapshots(&self) -> Result<Vec<DeviceSnapshot>> {
        let devices = self.host.enumerate_devices()?;
        let total = devices.len();
        let visible: Vec<DeviceSnapshot> = devices
            .into_iter()
            .filter(|d| self.is_allowed(&d.identity))
            .collect();

        debug!("Enumerated {} devices ({} after filters)", total, visible.len());
        Ok(visible)
    }

    /// Identities of the currently attached devices
    pub fn list(&self) -> Result<BTreeSet<DeviceIdentity>> {
        Ok(self
            .snapshots()?
            .into_iter()
            .map(|d| d.identity)
            .collect())
    }

    /// Compare two listings by identity equality
    pub fn diff(
        previous: &BTreeSet<DeviceIdentity>,
        current: &BTreeSet<DeviceIdentity>,
    ) -> DeviceDelta {
        DeviceDelta {
            attached: current.difference(previous).cloned().collect(),
            detached: previous.difference(current).cloned().collect(),
        }
    }

    /// List devices and return what changed since the last poll
    pub fn poll(&self) -> Result<PollOutcome> {
        let current = self.snapshots()?;
        let current_ids: BTreeSet<DeviceIdentity> =
            current.iter().map(|d| d.identity.clone()).collect();

        let mut known = self.known();
        let previous_ids: BTreeSet<DeviceIdentity> = known.keys().cloned().collect();
        let delta = Self::diff(&previous_ids, &current_ids);

        for identity in &delta.detached {
            known.remove(identity);
        }

        let attached: Vec<DeviceSnapshot> = current
            .into_iter()
            .filter(|d| delta.attached.contains(&d.identity))
            .collect();
        for snapshot in &attached {
            known.insert(snapshot.identity.clone(), snapshot.clone());
        }

        Ok(PollOutcome {
            attached,
            detached: delta.detached.into_iter().collect(),
        })
    }

    /// Record a device reported by an attach event
    pub fn register(&self, snapshot: DeviceSnapshot) {
        self.known().insert(snapshot.identity.clone(), snapshot);
    }

    /// Drop a device reported by a detach event
    pub fn forget(&self, identity: &DeviceIdentity) {
        self.known().remove(identity);
    }

    /// Cached snapshot of a device, listing the host again on a miss
    ///
    /// A device the host still reports is registered so later lookups hit
    /// the cache.
    pub fn snapshot_of(&self, identity: &DeviceIdentity) -> Result<DeviceSnapshot> {
        if let Some(snapshot) = self.known().get(identity) {
            return Ok(snapshot.clone());
        }

        let snapshot = self
            .snapshots()?
            .into_iter()
            .find(|d| &d.identity == identity)
            .ok_or_else(|| Error::DeviceNotFound {
                query: identity.to_string(),
            })?;

        debug!("Registered {} from a fresh listing", identity);
        self.register(snapshot.clone());
        Ok(snapshot)
    }

    /// Interface tree captured at enumeration time
    pub fn topology(&self, identity: &DeviceIdentity) -> Option<Vec<InterfaceDescriptor>> {
        self.known().get(identity).map(|d| d.interfaces.clone())
    }

    /// Find the first attached device with this vendor and product id
    pub fn find(&self, vendor_id: u16, product_id: u16) -> Result<DeviceSnapshot> {
        let snapshot = self
            .snapshots()?
            .into_iter()
            .find(|d| d.identity.vendor_id == vendor_id && d.identity.product_id == product_id)
            .ok_or_else(|| Error::DeviceNotFound {
                query: format!("{:04x}:{:04x}", vendor_id, product_id),
            })?;

        self.register(snapshot.clone());
        Ok(snapshot)
    }

    fn is_allowed(&self, identity: &DeviceIdentity) -> bool {
        let allowed = Self::check_filter(identity.vendor_id, identity.product_id, &self.filters);
        if !allowed {
            debug!("Device ignored by filter: {}", identity);
        }
        allowed
    }

    /// Check if a VID/PID pair is allowed by the filters
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            Self::matches_id(filter_vid, vid) && Self::matches_id(filter_pid, pid)
        })
    }

    fn matches_id(pattern: &str, id: u16) -> bool {
        if pattern == "*" {
            return true;
        }
        let hex = pattern.trim_start_matches("0x").trim_start_matches("0X");
        u16::from_str_radix(hex, 16)
            .map(|v| v == id)
            .unwrap_or(false)
    }
}

/// Poll the enumerator and publish attach/detach events until `stop` is set
pub fn spawn_watcher(
    enumerator: Arc<DeviceEnumerator>,
    events: EventSender,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("usb-link-watcher".to_string())
        .spawn(move || {
            info!("Enumeration watcher started ({:?} interval)", interval);

            while !stop.load(Ordering::SeqCst) {
                match enumerator.poll() {
                    Ok(outcome) => {
                        for device in outcome.attached {
                            if events.emit(HostEvent::DeviceAttached { device }).is_err() {
                                return;
                            }
                        }
                        for device in outcome.detached {
                            if events.emit(HostEvent::DeviceDetached { device }).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Device enumeration failed: {}", e),
                }

                thread::sleep(interval);
            }

            info!("Enumeration watcher stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockHost, create_mock_identity, create_mock_snapshot};

    fn ids(items: &[DeviceIdentity]) -> BTreeSet<DeviceIdentity> {
        items.iter().cloned().collect()
    }

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(DeviceEnumerator::check_filter(0x1234, 0x5678, &filters));
        assert!(DeviceEnumerator::check_filter(0xABCD, 0x1111, &filters));

        assert!(!DeviceEnumerator::check_filter(0x1234, 0x9999, &filters));
        assert!(!DeviceEnumerator::check_filter(0x9999, 0x5678, &filters));

        assert!(DeviceEnumerator::check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_diff_uses_identity_equality() {
        let a = create_mock_identity(1, 0x1234, 0x5678);
        let b = create_mock_identity(2, 0x1234, 0x5678);
        let mut renamed = a.clone();
        renamed.display_name = "renamed".to_string();

        let delta =
            DeviceEnumerator::diff(&ids(&[a.clone(), b.clone()]), &ids(&[b, renamed.clone()]));
        assert_eq!(delta.attached, ids(&[renamed]));
        assert_eq!(delta.detached, ids(&[a]));
    }

    #[test]
    fn test_diff_identical_sets_is_empty() {
        let a = create_mock_identity(1, 0x1234, 0x5678);
        assert!(DeviceEnumerator::diff(&ids(&[a.clone()]), &ids(&[a])).is_empty());
    }

    #[test]
    fn test_poll_reports_changes_once() {
        let host = Arc::new(MockHost::new().with_device(create_mock_snapshot(1, 0x1234, 0x5678)));
        let enumerator = DeviceEnumerator::new(host.clone(), vec![]);

        let first = enumerator.poll().unwrap();
        assert_eq!(first.attached.len(), 1);
        assert!(enumerator.poll().unwrap().attached.is_empty());

        let gone = first.attached[0].identity.clone();
        host.remove_device(&gone);
        let second = enumerator.poll().unwrap();
        assert_eq!(second.detached, vec![gone.clone()]);
        assert!(enumerator.topology(&gone).is_none());
    }

    #[test]
    fn test_list_applies_filters() {
        let host = Arc::new(
            MockHost::new()
                .with_device(create_mock_snapshot(1, 0x1234, 0x5678))
                .with_device(create_mock_snapshot(2, 0x04f9, 0x0042)),
        );
        let enumerator = DeviceEnumerator::new(host, vec!["0x04f9:*".to_string()]);

        let listed = enumerator.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed.iter().next().unwrap().vendor_id, 0x04f9);
    }

    #[test]
    fn test_find_missing_device() {
        let host = Arc::new(MockHost::new());
        let enumerator = DeviceEnumerator::new(host, vec![]);
        assert!(matches!(
            enumerator.find(0x1234, 0x5678),
            Err(Error::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_snapshot_of_lists_host_on_cache_miss() {
        let snapshot = create_mock_snapshot(3, 0x1234, 0x5678);
        let device = snapshot.identity.clone();
        let host = Arc::new(MockHost::new().with_device(snapshot.clone()));
        let enumerator = DeviceEnumerator::new(host.clone(), vec![]);

        assert!(enumerator.topology(&device).is_none());
        assert_eq!(enumerator.snapshot_of(&device).unwrap(), snapshot);
        assert_eq!(enumerator.topology(&device), Some(snapshot.interfaces));

        let missing = create_mock_identity(9, 0x1234, 0x5678);
        assert!(matches!(
            enumerator.snapshot_of(&missing),
            Err(Error::DeviceNotFound { .. })
        ));
    }
}
