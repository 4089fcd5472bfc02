//! Async channel bridge between the USB hotplug thread and the Tokio runtime
//!
//! The bridge is unbounded: the hotplug callback must never block inside
//! libusb, and the daemon drains events strictly in arrival order.

use crate::error::LoopError;
use crate::usb_types::HotplugEvent;
use async_channel::{Receiver, Sender, unbounded};

/// Handle for Tokio runtime (async)
#[derive(Debug, Clone)]
pub struct EventBridge {
    event_rx: Receiver<HotplugEvent>,
}

impl EventBridge {
    /// Wait for the next hotplug event
    ///
    /// Fails once every feed is gone and the queue is drained.
    pub async fn recv_event(&self) -> Result<HotplugEvent, LoopError> {
        self.event_rx
            .recv()
            .await
            .map_err(|_| LoopError::EventStreamClosed)
    }

    /// Events queued but not yet consumed
    pub fn pending(&self) -> usize {
        self.event_rx.len()
    }
}

/// Handle for the USB thread (blocking)
#[derive(Debug, Clone)]
pub struct EventFeed {
    event_tx: Sender<HotplugEvent>,
}

impl EventFeed {
    /// Queue an event for the daemon; `false` when the daemon side is gone
    pub fn send_event(&self, event: HotplugEvent) -> bool {
        self.event_tx.send_blocking(event).is_ok()
    }

    /// Whether the daemon side has dropped its bridge
    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Create the channel bridge between Tokio and the USB thread
///
/// Returns (EventBridge for Tokio, EventFeed for the USB thread)
pub fn create_event_bridge() -> (EventBridge, EventFeed) {
    let (event_tx, event_rx) = unbounded();
    (EventBridge { event_rx }, EventFeed { event_tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, feed) = create_event_bridge();

        // Spawn a thread to simulate the USB thread
        let handle = std::thread::spawn(move || {
            feed.send_event(HotplugEvent::add("1-1.2")) && feed.send_event(HotplugEvent::remove("1-1.2"))
        });
        assert!(handle.join().unwrap());

        assert_eq!(bridge.recv_event().await.unwrap(), HotplugEvent::add("1-1.2"));
        assert_eq!(bridge.recv_event().await.unwrap(), HotplugEvent::remove("1-1.2"));
        // Feed dropped with the thread, queue drained
        assert!(matches!(
            bridge.recv_event().await,
            Err(LoopError::EventStreamClosed)
        ));
    }

    #[test]
    fn test_feed_sees_closed_bridge() {
        let (bridge, feed) = create_event_bridge();
        assert!(!feed.is_closed());
        drop(bridge);
        assert!(feed.is_closed());
        assert!(!feed.send_event(HotplugEvent::add("1-1")));
    }
}
