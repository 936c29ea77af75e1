//! Host event channel
//!
//! The host platform and the enumeration watcher publish typed events
//! (attach, detach, permission decisions) into a channel consumed by the
//! link service's event loop. Producers may live on any thread, blocking or
//! async.

use crate::usb_types::{DeviceIdentity, DeviceSnapshot};
use async_channel::{Receiver, Sender, unbounded};
use tracing::{trace, warn};

/// Events from the host platform
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Device became visible
    DeviceAttached {
        /// Identity and interface tree
        device: DeviceSnapshot,
    },

    /// Device is gone; any handle bound to it is invalid
    DeviceDetached {
        /// Identity captured when it attached
        device: DeviceIdentity,
    },

    /// Asynchronous answer to a permission request
    PermissionResult {
        device: DeviceIdentity,
        granted: bool,
    },

    /// Stop the event loop
    Shutdown,
}

/// Producer side, cloneable across threads
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<HostEvent>,
}

impl EventSender {
    /// Publish an event from a blocking context
    pub fn emit(&self, event: HostEvent) -> crate::Result<()> {
        trace!("Publishing {:?}", event);
        self.tx.send_blocking(event).map_err(|e| {
            warn!("Event loop gone, dropping {:?}", e.0);
            crate::Error::Channel(e.to_string())
        })
    }

    /// Publish an event from async code
    pub async fn send(&self, event: HostEvent) -> crate::Result<()> {
        trace!("Publishing {:?}", event);
        self.tx.send(event).await.map_err(|e| {
            warn!("Event loop gone, dropping {:?}", e.0);
            crate::Error::Channel(e.to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side
#[derive(Clone)]
pub struct EventReceiver {
    rx: Receiver<HostEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<HostEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<HostEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<HostEvent> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the host event channel
///
/// Unbounded: the event loop itself may trigger host calls that publish
/// events (a permission prompt on attach), so producers must never block on
/// the consumer.
pub fn create_event_bridge() -> (EventSender, EventReceiver) {
    let (tx, rx) = unbounded();
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_types::DeviceId;

    #[tokio::test]
    async fn test_event_bridge() {
        let (sender, receiver) = create_event_bridge();

        // Producer on a plain thread, like a host callback
        let handle = std::thread::spawn(move || {
            let device = DeviceIdentity::new(DeviceId(1), 0x1234, 0x5678, "dev");
            sender
                .emit(HostEvent::PermissionResult {
                    device,
                    granted: true,
                })
                .unwrap();
        });

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event,
            HostEvent::PermissionResult { granted: true, .. }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_channel_reports_error() {
        let (sender, receiver) = create_event_bridge();
        drop(receiver);
        assert!(sender.is_closed());
        assert!(sender.emit(HostEvent::Shutdown).is_err());
    }
}
