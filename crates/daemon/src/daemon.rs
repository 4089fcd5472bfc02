//! The power-button daemon loop
//!
//! Lifecycle: `STARTING -> LISTENING -> (per event: MATCHING -> ACTING) -> LISTENING`,
//! ending in `STOPPED` on an interrupt or `FAILED` when the event stream dies
//! or a handler panics.
//!
//! - [`Daemon::new`] is STARTING: it takes the mapping (loaded strictly by the
//!   caller after the event subscription exists) and logs the startup summary.
//! - [`Daemon::run`] is LISTENING: it waits on the next hotplug event or the
//!   shutdown signal, whichever comes first. That wait is the only suspension point.
//! - [`Daemon::handle_event`] is MATCHING and ACTING for one event. It runs to
//!   completion before the next event is read, so events are handled strictly
//!   in order and no two starts for the same VM can overlap.

use common::resolver::resolve;
use common::{
    DaemonLog, EventBridge, HotplugAction, HotplugEvent, LoopError, MappingEntry,
    PortSnapshotProvider, TriggerCounts, VmControl, VmId, VmRunState,
};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Result of acting on one matched VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Started,
    StartFailed,
    AlreadyRunning,
    StatusUnknown,
}

/// What became of one hotplug event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Not an `add`, or no readable port id
    Discarded,
    /// Actionable, but no mapping entry matched
    NoMatch,
    /// One outcome per matched VM, in match order
    Acted(Vec<(VmId, ActionOutcome)>),
}

/// Hotplug-driven VM starter
///
/// Generic over its collaborators so tests can swap in in-memory doubles.
pub struct Daemon<P, C, L> {
    mapping: Vec<MappingEntry>,
    ports: P,
    control: C,
    log: L,
}

impl<P, C, L> Daemon<P, C, L>
where
    P: PortSnapshotProvider,
    C: VmControl,
    L: DaemonLog,
{
    /// Build the daemon around a mapping read once at startup
    ///
    /// An empty mapping is logged as a warning, not rejected.
    pub fn new(mapping: Vec<MappingEntry>, ports: P, control: C, log: L) -> Self {
        let daemon = Self {
            mapping,
            ports,
            control,
            log,
        };
        daemon.log_startup_summary();
        daemon
    }

    fn log_startup_summary(&self) {
        let counts = TriggerCounts::of(&self.mapping);
        if counts.total == 0 {
            self.log
                .warn("No VM mappings found in config. Daemon will run but do nothing");
            return;
        }

        self.log.info(&format!(
            "Loaded {} VM mapping(s): {} port-only, {} device-only, {} port+device",
            counts.total, counts.port_only, counts.device_only, counts.port_and_device
        ));
        if counts.inert > 0 {
            self.log.warn(&format!(
                "{} mapping(s) have neither a USB port nor a device id and will never fire",
                counts.inert
            ));
        }
    }

    pub fn mapping(&self) -> &[MappingEntry] {
        &self.mapping
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Listen until `shutdown` resolves (STOPPED) or the loop fails (FAILED)
    ///
    /// The shutdown signal is only observed between events; an event already
    /// being handled always runs to completion first.
    pub async fn run<F>(&self, events: &EventBridge, shutdown: F) -> Result<(), LoopError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.log.info("Listening for USB 'add' events...");

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    self.log.info("vUSBPB daemon interrupted, shutting down");
                    return Ok(());
                }

                event = events.recv_event() => {
                    let event = event?;
                    self.handle_event_guarded(&event)?;
                }
            }
        }
    }

    /// Handle one event, turning a panic into a loop failure
    fn handle_event_guarded(&self, event: &HotplugEvent) -> Result<EventOutcome, LoopError> {
        catch_unwind(AssertUnwindSafe(|| self.handle_event(event))).map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            LoopError::HandlerPanicked(message)
        })
    }

    /// MATCHING and ACTING for one event
    pub fn handle_event(&self, event: &HotplugEvent) -> EventOutcome {
        if event.action != HotplugAction::Add {
            return EventOutcome::Discarded;
        }
        let Some(port_id) = event.port_id.as_deref().filter(|p| !p.is_empty()) else {
            return EventOutcome::Discarded;
        };

        let device_id = self.ports.device_on_port(port_id);
        let device_str = device_id.map_or_else(|| "unknown".to_string(), |d| d.to_string());

        let vm_ids = resolve(port_id, device_id, &self.mapping);
        if vm_ids.is_empty() {
            self.log.info(&format!(
                "USB 'add' event on {} (device {}), no mapped VMs",
                port_id, device_str
            ));
            return EventOutcome::NoMatch;
        }

        let listed: Vec<String> = vm_ids.iter().map(|id| id.to_string()).collect();
        self.log.info(&format!(
            "USB 'add' event on {} (device {}), mapped VMs: [{}]",
            port_id,
            device_str,
            listed.join(", ")
        ));

        // One VM's failure never stops the rest.
        let outcomes = vm_ids
            .into_iter()
            .map(|vm_id| (vm_id, self.act_on(vm_id)))
            .collect();
        EventOutcome::Acted(outcomes)
    }

    /// Start `vm_id` if, and only if, it is known to be stopped
    fn act_on(&self, vm_id: VmId) -> ActionOutcome {
        match self.control.status(vm_id) {
            VmRunState::Stopped => {
                self.log
                    .info(&format!("VM {} is stopped, attempting to start...", vm_id));
                if self.control.start(vm_id) {
                    self.log.info(&format!("Successfully started VM {}", vm_id));
                    ActionOutcome::Started
                } else {
                    self.log.error(&format!("Failed to start VM {}", vm_id));
                    ActionOutcome::StartFailed
                }
            }
            VmRunState::Running => {
                self.log
                    .info(&format!("VM {} is already running; nothing to do", vm_id));
                ActionOutcome::AlreadyRunning
            }
            VmRunState::Unknown => {
                self.log
                    .warn(&format!("Unknown status for VM {}; skipping start", vm_id));
                ActionOutcome::StatusUnknown
            }
        }
    }
}
