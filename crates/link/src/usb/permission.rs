//! Permission handshake
//!
//! Tracks the request/grant/deny state machine for every device identity.
//! Each identity has its own lock, so decisions for unrelated devices never
//! contend; the outer map lock is only held to look a slot up.
//!
//! ```text
//! Unrequested --request()--> Requested --grant()--> Granted
//!                            Requested --deny()---> Denied --request()--> Requested
//! ```

use common::{DeviceIdentity, Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionState {
    #[default]
    Unrequested,
    Requested,
    Granted,
    Denied,
}

/// What a call to [`PermissionCoordinator::request`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request was started; the host should prompt
    Issued,
    /// A request is already outstanding
    AlreadyPending,
    AlreadyGranted,
}

#[derive(Default)]
struct Slot {
    state: Mutex<PermissionState>,
    changed: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, PermissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct PermissionCoordinator {
    slots: Mutex<HashMap<DeviceIdentity, Arc<Slot>>>,
}

impl PermissionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, device: &DeviceIdentity) -> Arc<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, device: &DeviceIdentity) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
    }

    /// Start a request unless one is pending or access is already granted
    pub fn request(&self, device: &DeviceIdentity) -> RequestOutcome {
        let slot = self.slot(device);
        let mut state = slot.lock();
        match *state {
            PermissionState::Requested => RequestOutcome::AlreadyPending,
            PermissionState::Granted => RequestOutcome::AlreadyGranted,
            PermissionState::Unrequested | PermissionState::Denied => {
                *state = PermissionState::Requested;
                debug!("Permission requested for {}", device);
                RequestOutcome::Issued
            }
        }
    }

    /// Apply a grant; ignored unless a request is outstanding
    pub fn grant(&self, device: &DeviceIdentity) -> bool {
        self.decide(device, PermissionState::Granted)
    }

    /// Apply a denial; ignored unless a request is outstanding
    pub fn deny(&self, device: &DeviceIdentity) -> bool {
        self.decide(device, PermissionState::Denied)
    }

    fn decide(&self, device: &DeviceIdentity, decision: PermissionState) -> bool {
        let Some(slot) = self.existing_slot(device) else {
            debug!("Ignoring {:?} for unknown device {}", decision, device);
            return false;
        };

        let mut state = slot.lock();
        if *state != PermissionState::Requested {
            debug!(
                "Ignoring stale {:?} for {} (state {:?})",
                decision, device, *state
            );
            return false;
        }

        *state = decision;
        slot.changed.notify_all();
        debug!("Permission {:?} for {}", decision, device);
        true
    }

    /// Record access the host already holds, without a prompt
    pub fn mark_granted(&self, device: &DeviceIdentity) {
        let slot = self.slot(device);
        let mut state = slot.lock();
        *state = PermissionState::Granted;
        slot.changed.notify_all();
    }

    pub fn is_granted(&self, device: &DeviceIdentity) -> bool {
        self.state(device) == PermissionState::Granted
    }

    pub fn state(&self, device: &DeviceIdentity) -> PermissionState {
        self.existing_slot(device)
            .map(|slot| *slot.lock())
            .unwrap_or_default()
    }

    /// `PermissionDenied` unless the device is granted
    pub fn check(&self, device: &DeviceIdentity) -> Result<()> {
        if self.is_granted(device) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                device: device.clone(),
            })
        }
    }

    /// Drop the device's state after it detaches
    ///
    /// Anyone waiting on an outstanding request wakes up and sees
    /// `Unrequested`.
    pub fn forget(&self, device: &DeviceIdentity) {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);

        if let Some(slot) = slot {
            *slot.lock() = PermissionState::Unrequested;
            slot.changed.notify_all();
        }
    }

    /// Block until the outstanding request is decided or `timeout` elapses
    ///
    /// Returns the state at wake-up; `Requested` means no decision arrived.
    pub fn wait_for_decision(&self, device: &DeviceIdentity, timeout: Duration) -> PermissionState {
        let Some(slot) = self.existing_slot(device) else {
            return PermissionState::Unrequested;
        };

        let state = slot.lock();
        let (state, _) = slot
            .changed
            .wait_timeout_while(state, timeout, |s| *s == PermissionState::Requested)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }
}
