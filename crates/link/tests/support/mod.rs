//! Shared fixtures for link integration tests

#![allow(dead_code)]

use common::test_utils::MockHost;
use common::{EventSender, create_event_bridge};
use link::LinkConfig;
use link::usb::LinkService;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct Harness {
    pub host: Arc<MockHost>,
    pub service: Arc<LinkService>,
    pub events: EventSender,
    event_loop: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(host: MockHost) -> Self {
        Self::with_config(host, test_config())
    }

    pub fn with_config(host: MockHost, config: LinkConfig) -> Self {
        let host = Arc::new(host);
        let (events, receiver) = create_event_bridge();
        host.set_event_sender(events.clone());

        let service = Arc::new(LinkService::new(host.clone(), &config, events.clone()));
        let event_loop = service.spawn_event_loop(receiver).unwrap();

        Self {
            host,
            service,
            events,
            event_loop: Some(event_loop),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.service.shutdown();
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
    }
}

/// Defaults with short timeouts so failing paths finish quickly
pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.transfer.permission_timeout_ms = 2_000;
    config.transfer.default_timeout_ms = 200;
    config
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
