//! USB hotplug event source
//!
//! A dedicated `usb-hotplug` thread owns the libusb context and the hotplug
//! registration, pumps `libusb_handle_events()` and forwards each notification
//! over the [`EventFeed`] to the Tokio side. The thread stops when the daemon
//! drops its end of the bridge or [`HotplugSource::stop`] is called. If libusb
//! keeps failing, the thread exits on its own; the daemon then sees the event
//! stream close and fails.

use common::usb_types::topology_port_id;
use common::{EventFeed, HotplugAction, HotplugEvent, StartupError};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block before the stop flag is rechecked
const EVENT_PUMP_TIMEOUT: Duration = Duration::from_millis(250);

/// Consecutive `handle_events` failures after which the event stream is closed
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Pause between two failed `handle_events` calls
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Running hotplug subscription
pub struct HotplugSource {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HotplugSource {
    /// Subscribe to USB hotplug notifications
    ///
    /// Fails when libusb lacks hotplug support or the context/registration
    /// cannot be created; that is a missing system capability, not something
    /// worth retrying.
    pub fn start(feed: EventFeed) -> Result<Self, StartupError> {
        if !rusb::has_hotplug() {
            return Err(StartupError::EventSourceUnavailable(
                "libusb on this host does not support hotplug notifications".to_string(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run_event_pump(feed, thread_stop, ready_tx))
            .map_err(|e| {
                StartupError::EventSourceUnavailable(format!("cannot spawn USB thread: {}", e))
            })?;

        // The thread reports whether the subscription exists before pumping.
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(StartupError::EventSourceUnavailable(e.to_string()))
            }
            Err(_) => {
                let _ = handle.join();
                Err(StartupError::EventSourceUnavailable(
                    "USB thread exited during startup".to_string(),
                ))
            }
        }
    }

    /// Stop the USB thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("USB hotplug thread panicked");
        }
    }
}

impl Drop for HotplugSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Body of the `usb-hotplug` thread
fn run_event_pump(
    feed: EventFeed,
    stop: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<(), rusb::Error>>,
) {
    let context = match Context::new() {
        Ok(context) => context,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let callback = HotplugCallback { feed: feed.clone() };
    // Only future arrivals matter; devices already present must not fire.
    let registration = HotplugBuilder::new()
        .enumerate(false)
        .register::<Context, _>(&context, Box::new(callback));
    let _registration = match registration {
        Ok(registration) => registration,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!("USB hotplug thread started");

    match pump_events(feed, &stop, || context.handle_events(Some(EVENT_PUMP_TIMEOUT))) {
        Ok(()) => info!("USB hotplug thread stopped"),
        Err(e) => error!("USB event handling failed, closing event stream: {}", e),
    }
}

/// Run `step` until stopped, the daemon side closes, or it keeps failing
///
/// `Interrupted` is benign. Any other error is tolerated at most
/// [`MAX_CONSECUTIVE_ERRORS`] times in a row; then the pump gives up and drops
/// `feed`, which closes the event stream once the callback's clone is gone too.
fn pump_events<F>(feed: EventFeed, stop: &AtomicBool, mut step: F) -> rusb::Result<()>
where
    F: FnMut() -> rusb::Result<()>,
{
    let mut consecutive_errors = 0;

    while !stop.load(Ordering::Relaxed) && !feed.is_closed() {
        match step() {
            Ok(()) => consecutive_errors = 0,
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(e);
                }
                warn!(
                    "Error handling USB events ({}/{}): {}",
                    consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                );
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    Ok(())
}

/// Kernel topology name of a device, if its port chain is readable
fn port_id_of<T: UsbContext>(device: &Device<T>) -> Option<String> {
    match device.port_numbers() {
        Ok(ports) => Some(topology_port_id(device.bus_number(), &ports)),
        Err(e) => {
            debug!(
                "Cannot read port chain (bus={}, addr={}): {}",
                device.bus_number(),
                device.address(),
                e
            );
            None
        }
    }
}

/// Hot-plug callback handler
///
/// Translates libusb arrival/departure callbacks into [`HotplugEvent`]s.
struct HotplugCallback {
    feed: EventFeed,
}

impl HotplugCallback {
    fn forward(&self, event: HotplugEvent) {
        debug!("Hot-plug callback: {:?}", event);
        if !self.feed.send_event(event) {
            debug!("Daemon side of the event bridge is gone, dropping event");
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward(HotplugEvent {
            action: HotplugAction::Add,
            port_id: port_id_of(&device),
        });
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward(HotplugEvent {
            action: HotplugAction::Other("remove".to_string()),
            port_id: port_id_of(&device),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{LoopError, create_event_bridge};

    #[test]
    fn test_hotplug_source_start_and_stop() {
        let (_bridge, feed) = create_event_bridge();

        // May fail without USB access or hotplug support; only check it does not hang.
        match HotplugSource::start(feed) {
            Ok(source) => source.stop(),
            Err(e) => {
                eprintln!("Hotplug source unavailable (expected without USB access): {}", e);
            }
        }
    }

    #[test]
    fn test_callback_forwards_until_bridge_closes() {
        let (bridge, feed) = create_event_bridge();
        let callback = HotplugCallback { feed };

        callback.forward(HotplugEvent::add("1-1.2"));
        assert_eq!(bridge.pending(), 1);

        drop(bridge);
        // Must not block or panic once the daemon side is gone.
        callback.forward(HotplugEvent::add("1-1.3"));
    }

    #[tokio::test]
    async fn test_persistent_pump_errors_close_the_stream() {
        let (bridge, feed) = create_event_bridge();
        let stop = AtomicBool::new(false);
        let mut calls = 0;

        let result = pump_events(feed, &stop, || {
            calls += 1;
            Err(rusb::Error::Io)
        });

        assert_eq!(result, Err(rusb::Error::Io));
        assert_eq!(calls, MAX_CONSECUTIVE_ERRORS);
        assert!(matches!(
            bridge.recv_event().await,
            Err(LoopError::EventStreamClosed)
        ));
    }

    #[test]
    fn test_pump_tolerates_interrupts_and_isolated_errors() {
        let (bridge, feed) = create_event_bridge();
        let stop = AtomicBool::new(false);
        let mut script = vec![
            Err(rusb::Error::Io),
            Err(rusb::Error::Io),
            Ok(()),
            Err(rusb::Error::Interrupted),
            Err(rusb::Error::Io),
            Ok(()),
        ]
        .into_iter();

        let result = pump_events(feed, &stop, || match script.next() {
            Some(step) => step,
            None => {
                stop.store(true, Ordering::Relaxed);
                Ok(())
            }
        });

        assert_eq!(result, Ok(()));
        drop(bridge);
    }

    #[test]
    fn test_pump_exits_when_daemon_side_closes() {
        let (bridge, feed) = create_event_bridge();
        let stop = AtomicBool::new(false);
        drop(bridge);

        assert_eq!(pump_events(feed, &stop, || Err(rusb::Error::Io)), Ok(()));
    }
}
