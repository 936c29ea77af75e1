//! Per-device transfer workers
//!
//! Every device gets its own FIFO queue drained by a dedicated blocking
//! thread, so two jobs never interleave on the same device while devices
//! proceed independently of each other. Results come back through a oneshot
//! channel that can be awaited from async code or waited on synchronously.

use crate::usb::connection::{ConnectionHandle, ConnectionManager};
use crate::usb::enumerator::DeviceEnumerator;
use crate::usb::resolver::{ResolvedEndpoint, resolve};
use crate::usb::transfers::{DeviceDescription, TransferEngine};
use common::{DeviceIdentity, Error, HostPlatform, Result};
use descriptor::{DescriptorKind, Direction, InterfaceDescriptor, TransferType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Work item for a device queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferJob {
    Send { payload: Vec<u8> },
    Receive { max_bytes: usize },
    /// Send, then receive the reply; the receive is skipped if the send fails
    Exchange { payload: Vec<u8>, max_bytes: usize },
    Describe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Sent(usize),
    Received(Vec<u8>),
    Described(DeviceDescription),
}

pub type JobResult = Result<JobOutput>;

struct QueuedJob {
    job: TransferJob,
    response: oneshot::Sender<JobResult>,
}

struct DeviceQueue {
    tx: async_channel::Sender<QueuedJob>,
    detached: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Everything a worker needs to run a job
struct JobRunner {
    host: Arc<dyn HostPlatform>,
    connections: Arc<ConnectionManager>,
    enumerator: Arc<DeviceEnumerator>,
    engine: TransferEngine,
}

impl JobRunner {
    fn run(&self, device: &DeviceIdentity, job: TransferJob) -> JobResult {
        let mut handle = self.connections.open(device)?;

        let result = match job {
            TransferJob::Send { payload } => {
                let target = self.endpoint(&handle, Direction::Out)?;
                self.engine
                    .send(&handle, &target.endpoint, &payload, None)
                    .map(JobOutput::Sent)
            }
            TransferJob::Receive { max_bytes } => {
                let target = self.endpoint(&handle, Direction::In)?;
                self.engine
                    .receive(&handle, &target.endpoint, max_bytes, None)
                    .map(JobOutput::Received)
            }
            TransferJob::Exchange { payload, max_bytes } => {
                self.exchange(&handle, &payload, max_bytes)
            }
            TransferJob::Describe => self.engine.describe(&handle).map(JobOutput::Described),
        };

        handle.close();
        result
    }

    fn exchange(&self, handle: &ConnectionHandle, payload: &[u8], max_bytes: usize) -> JobResult {
        let out = self.endpoint(handle, Direction::Out)?;
        let input = self.endpoint(handle, Direction::In)?;
        self.engine.send(handle, &out.endpoint, payload, None)?;
        self.engine
            .receive(handle, &input.endpoint, max_bytes, None)
            .map(JobOutput::Received)
    }

    /// First bulk endpoint of `direction` in the device's topology
    fn endpoint(
        &self,
        handle: &ConnectionHandle,
        direction: Direction,
    ) -> Result<ResolvedEndpoint> {
        let interfaces = self.topology(handle)?;
        let resolved = resolve(&interfaces, TransferType::Bulk, direction)?;
        debug!(
            "Resolved bulk {} endpoint {:#04x} at interface {} (#{}), endpoint {}",
            direction,
            resolved.endpoint.address,
            resolved.interface_index,
            resolved.interface_number,
            resolved.endpoint_index
        );
        Ok(resolved)
    }

    /// Host-reported topology, or the decoded configuration descriptor when
    /// the host has none
    fn topology(&self, handle: &ConnectionHandle) -> Result<Vec<InterfaceDescriptor>> {
        let snapshot = self.enumerator.snapshot_of(handle.device())?;
        if !snapshot.interfaces.is_empty() {
            return Ok(snapshot.interfaces);
        }

        debug!("No topology reported for {}, decoding descriptors", handle.device());
        let raw = self
            .host
            .fetch_raw_descriptor(handle.connection_id(), DescriptorKind::Configuration(0))?;
        Ok(descriptor::decode_configuration(&raw)?.interfaces)
    }
}

/// Per-device FIFO scheduler
pub struct TransferScheduler {
    runner: Arc<JobRunner>,
    queues: Mutex<HashMap<DeviceIdentity, DeviceQueue>>,
}

impl TransferScheduler {
    pub fn new(
        host: Arc<dyn HostPlatform>,
        connections: Arc<ConnectionManager>,
        enumerator: Arc<DeviceEnumerator>,
        engine: TransferEngine,
    ) -> Self {
        Self {
            runner: Arc::new(JobRunner {
                host,
                connections,
                enumerator,
                engine,
            }),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, DeviceQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job behind any earlier jobs for the same device
    pub fn submit(
        &self,
        device: &DeviceIdentity,
        job: TransferJob,
    ) -> Result<oneshot::Receiver<JobResult>> {
        let (response, result) = oneshot::channel();
        let mut queues = self.queues();

        if !queues.contains_key(device) {
            let queue = self.spawn_queue(device)?;
            queues.insert(device.clone(), queue);
        }

        let queue = queues
            .get(device)
            .ok_or_else(|| Error::Channel(format!("no queue for {}", device)))?;

        debug!("Queueing {:?} for {}", job, device);
        queue
            .tx
            .try_send(QueuedJob { job, response })
            .map_err(|e| Error::Channel(e.to_string()))?;

        Ok(result)
    }

    fn spawn_queue(&self, device: &DeviceIdentity) -> Result<DeviceQueue> {
        let (tx, rx) = async_channel::unbounded::<QueuedJob>();
        let detached = Arc::new(AtomicBool::new(false));

        let runner = self.runner.clone();
        let worker_device = device.clone();
        let worker_detached = detached.clone();

        let thread = thread::Builder::new()
            .name(format!("usb-link-{}", device.device_id))
            .spawn(move || {
                debug!("Transfer worker started for {}", worker_device);

                while let Ok(queued) = rx.recv_blocking() {
                    let result = if worker_detached.load(Ordering::SeqCst) {
                        Err(Error::DeviceDetachedMidOperation {
                            device: worker_device.clone(),
                        })
                    } else {
                        run_guarded(&runner, &worker_device, queued.job)
                    };

                    let result = match result {
                        Ok(_) if worker_detached.load(Ordering::SeqCst) => {
                            Err(Error::DeviceDetachedMidOperation {
                                device: worker_device.clone(),
                            })
                        }
                        other => other,
                    };

                    if queued.response.send(result).is_err() {
                        debug!("Caller for {} went away before the result", worker_device);
                    }
                }

                debug!("Transfer worker stopped for {}", worker_device);
            })?;

        Ok(DeviceQueue {
            tx,
            detached,
            thread,
        })
    }

    /// Fail every queued and in-flight job for a detached device
    ///
    /// Other devices' queues are untouched.
    pub fn invalidate(&self, device: &DeviceIdentity) {
        self.runner.connections.invalidate(device);

        if let Some(queue) = self.queues().remove(device) {
            queue.detached.store(true, Ordering::SeqCst);
            queue.tx.close();
            info!("Transfer queue for {} closed after detach", device);
        }
    }

    /// Number of devices with a live queue
    pub fn active_queues(&self) -> usize {
        self.queues().len()
    }

    /// Stop accepting jobs and wait for every worker to drain its queue
    pub fn shutdown(&self) {
        let queues: Vec<DeviceQueue> = self.queues().drain().map(|(_, q)| q).collect();
        for queue in &queues {
            queue.tx.close();
        }
        for queue in queues {
            if let Err(e) = queue.thread.join() {
                error!("Transfer worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        for queue in self.queues().values() {
            queue.tx.close();
        }
    }
}

/// Run one job, turning a panic into an error so the worker keeps serving
fn run_guarded(runner: &JobRunner, device: &DeviceIdentity, job: TransferJob) -> JobResult {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runner.run(device, job)))
        .unwrap_or_else(|e| {
            warn!("Panic while running job for {}: {:?}", device, e);
            Err(Error::Host(format!("transfer worker panicked for {}", device)))
        })
}
