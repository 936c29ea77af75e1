//! Link service
//!
//! Wires the host platform, enumerator, permission coordinator, connection
//! manager and transfer scheduler together, and applies host events to them.
//!
//! The public operations block the calling thread; run them on a worker
//! thread or `spawn_blocking` from async code. The event loop must run on
//! its own thread for permission decisions to arrive.

use crate::config::LinkConfig;
use crate::usb::connection::ConnectionManager;
use crate::usb::enumerator::{DeviceEnumerator, spawn_watcher};
use crate::usb::permission::{PermissionCoordinator, PermissionState, RequestOutcome};
use crate::usb::transfers::{DeviceDescription, TransferEngine};
use crate::usb::worker::{JobOutput, JobResult, TransferJob, TransferScheduler};
use common::{
    DeviceIdentity, DeviceSnapshot, Error, EventReceiver, EventSender, HostEvent, HostPlatform,
    Result,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub struct LinkService {
    host: Arc<dyn HostPlatform>,
    enumerator: Arc<DeviceEnumerator>,
    permissions: Arc<PermissionCoordinator>,
    scheduler: TransferScheduler,
    events: EventSender,
    auto_request_permission: bool,
    permission_timeout: Duration,
    poll_interval: Duration,
    receive_buffer_size: usize,
}

impl LinkService {
    pub fn new(host: Arc<dyn HostPlatform>, config: &LinkConfig, events: EventSender) -> Self {
        let enumerator = Arc::new(DeviceEnumerator::new(
            host.clone(),
            config.usb.filters.clone(),
        ));
        let permissions = Arc::new(PermissionCoordinator::new());
        let connections = Arc::new(ConnectionManager::new(host.clone(), permissions.clone()));
        let engine = TransferEngine::new(host.clone(), permissions.clone())
            .with_default_timeout(config.transfer.transfer_timeout());
        let scheduler =
            TransferScheduler::new(host.clone(), connections, enumerator.clone(), engine);

        Self {
            host,
            enumerator,
            permissions,
            scheduler,
            events,
            auto_request_permission: config.usb.auto_request_permission,
            permission_timeout: config.transfer.permission_timeout(),
            poll_interval: config.usb.poll_interval(),
            receive_buffer_size: config.transfer.receive_buffer_size,
        }
    }

    pub fn permissions(&self) -> &PermissionCoordinator {
        &self.permissions
    }

    pub fn enumerator(&self) -> &DeviceEnumerator {
        &self.enumerator
    }

    /// Apply one host event; returns false on `Shutdown`
    pub fn handle_event(&self, event: HostEvent) -> bool {
        match event {
            HostEvent::DeviceAttached { device } => {
                let identity = device.identity.clone();
                info!("Device attached: {}", identity);
                self.enumerator.register(device);

                if self.auto_request_permission
                    && let Err(e) = self.request_access(&identity)
                {
                    warn!("Permission request for {} failed: {}", identity, e);
                }
            }
            HostEvent::DeviceDetached { device } => {
                info!("Device detached: {}", device);
                self.scheduler.invalidate(&device);
                self.permissions.forget(&device);
                self.enumerator.forget(&device);
            }
            HostEvent::PermissionResult { device, granted } => {
                let applied = if granted {
                    self.permissions.grant(&device)
                } else {
                    self.permissions.deny(&device)
                };
                if applied {
                    info!(
                        "Permission {} for {}",
                        if granted { "granted" } else { "denied" },
                        device
                    );
                }
            }
            HostEvent::Shutdown => {
                debug!("Event loop received shutdown");
                return false;
            }
        }
        true
    }

    /// Apply events until `Shutdown` or the channel closes
    pub fn run_event_loop(&self, receiver: EventReceiver) {
        info!("Event loop started");
        while let Ok(event) = receiver.recv_blocking() {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("Event loop stopped");
    }

    pub fn spawn_event_loop(
        self: &Arc<Self>,
        receiver: EventReceiver,
    ) -> std::io::Result<JoinHandle<()>> {
        let service = self.clone();
        thread::Builder::new()
            .name("usb-link-events".to_string())
            .spawn(move || service.run_event_loop(receiver))
    }

    /// Start polling for attach/detach until `stop` is set
    pub fn spawn_watcher(&self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        spawn_watcher(
            self.enumerator.clone(),
            self.events.clone(),
            self.poll_interval,
            stop,
        )
    }

    /// Start a permission request if one is needed
    ///
    /// Devices the host already trusts are granted without a prompt. The host
    /// is only asked when the state machine issues a new request.
    pub fn request_access(&self, device: &DeviceIdentity) -> Result<RequestOutcome> {
        if self.host.has_permission(device) {
            self.permissions.mark_granted(device);
            return Ok(RequestOutcome::AlreadyGranted);
        }

        let outcome = self.permissions.request(device);
        if outcome == RequestOutcome::Issued
            && let Err(e) = self.host.request_permission(device)
        {
            self.permissions.deny(device);
            return Err(e);
        }
        Ok(outcome)
    }

    /// Make sure the device is granted, waiting for the host's decision
    pub fn ensure_permission(&self, device: &DeviceIdentity) -> Result<()> {
        if self.permissions.is_granted(device) {
            return Ok(());
        }

        self.request_access(device)?;

        match self.permissions.wait_for_decision(device, self.permission_timeout) {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => Err(Error::PermissionDenied {
                device: device.clone(),
            }),
            PermissionState::Requested => {
                warn!(
                    "No permission decision for {} within {:?}",
                    device, self.permission_timeout
                );
                Err(Error::PermissionDenied {
                    device: device.clone(),
                })
            }
            PermissionState::Unrequested => Err(Error::DeviceDetachedMidOperation {
                device: device.clone(),
            }),
        }
    }

    /// Queue a job once permission is settled
    pub fn submit(
        &self,
        device: &DeviceIdentity,
        job: TransferJob,
    ) -> Result<oneshot::Receiver<JobResult>> {
        self.ensure_permission(device)?;
        self.scheduler.submit(device, job)
    }

    pub fn send(&self, device: &DeviceIdentity, payload: &[u8]) -> Result<usize> {
        let rx = self.submit(
            device,
            TransferJob::Send {
                payload: payload.to_vec(),
            },
        )?;
        match wait(rx)? {
            JobOutput::Sent(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    /// Receive up to `max_bytes`, or the configured buffer size
    pub fn receive(&self, device: &DeviceIdentity, max_bytes: Option<usize>) -> Result<Vec<u8>> {
        let max_bytes = max_bytes.unwrap_or(self.receive_buffer_size);
        let rx = self.submit(device, TransferJob::Receive { max_bytes })?;
        match wait(rx)? {
            JobOutput::Received(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Send then receive as one job in the device's queue
    ///
    /// A failed send is reported as is and nothing is read from the device.
    pub fn exchange(
        &self,
        device: &DeviceIdentity,
        payload: &[u8],
        max_bytes: Option<usize>,
    ) -> Result<Vec<u8>> {
        let rx = self.submit(
            device,
            TransferJob::Exchange {
                payload: payload.to_vec(),
                max_bytes: max_bytes.unwrap_or(self.receive_buffer_size),
            },
        )?;
        match wait(rx)? {
            JobOutput::Received(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch and decode the device and configuration descriptors
    pub fn describe(&self, device: &DeviceIdentity) -> Result<DeviceDescription> {
        let rx = self.submit(device, TransferJob::Describe)?;
        match wait(rx)? {
            JobOutput::Described(description) => Ok(description),
            other => Err(unexpected(other)),
        }
    }

    /// Currently attached devices with their topology
    pub fn list(&self) -> Result<Vec<DeviceSnapshot>> {
        self.enumerator.snapshots()
    }

    pub fn find_device(&self, vendor_id: u16, product_id: u16) -> Result<DeviceIdentity> {
        Ok(self.enumerator.find(vendor_id, product_id)?.identity)
    }

    /// Drain the transfer queues and stop the event loop
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Err(e) = self.events.emit(HostEvent::Shutdown) {
            error!("Failed to stop event loop: {}", e);
        }
    }
}

fn wait(rx: oneshot::Receiver<JobResult>) -> JobResult {
    rx.blocking_recv()
        .map_err(|_| Error::Channel("transfer worker dropped the job".to_string()))?
}

fn unexpected(output: JobOutput) -> Error {
    Error::Channel(format!("unexpected job output: {:?}", output))
}
