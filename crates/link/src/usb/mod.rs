//! USB subsystem
//!
//! Enumeration, the permission handshake, endpoint resolution, connection
//! lifetime and bulk transfers, layered over a [`common::HostPlatform`].
//!
//! Host operations block, so transfers run on one dedicated worker thread
//! per device and never on the caller's thread.

pub mod connection;
pub mod enumerator;
pub mod permission;
pub mod resolver;
pub mod rusb_host;
pub mod service;
pub mod transfers;
pub mod worker;

pub use connection::{ConnectionHandle, ConnectionManager};
pub use enumerator::{DeviceDelta, DeviceEnumerator, PollOutcome, spawn_watcher};
pub use permission::{PermissionCoordinator, PermissionState, RequestOutcome};
pub use resolver::{ResolvedEndpoint, resolve};
pub use rusb_host::RusbHost;
pub use service::LinkService;
pub use transfers::{DEFAULT_TRANSFER_TIMEOUT, DeviceDescription, TransferEngine};
pub use worker::{JobOutput, JobResult, TransferJob, TransferScheduler};
