//! usb-link
//!
//! Negotiates access to USB peripherals, resolves their bulk endpoints,
//! decodes their descriptors and exchanges data with them.

pub mod config;
pub mod usb;

pub use config::LinkConfig;
pub use usb::LinkService;
