//! Common utilities for usb-link
//!
//! This crate provides the vocabulary shared by the link runtime and its
//! tests: device identities, the error taxonomy, the host platform boundary,
//! the host event channel, and logging setup.

pub mod channel;
pub mod error;
pub mod host;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{EventReceiver, EventSender, HostEvent, create_event_bridge};
pub use error::{Error, Result};
pub use host::{ConnectionId, HostPlatform, TransferSignal};
pub use logging::setup_logging;
pub use usb_types::{DeviceId, DeviceIdentity, DeviceSnapshot};
