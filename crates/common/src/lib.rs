//! Common building blocks for vusbpb
//!
//! This crate holds everything the `vusbpb` binary shares between its daemon
//! and its CLI commands: the persisted VM mapping, the hotplug-to-VM resolver,
//! the hypervisor control client, USB port snapshots, the event channel bridge
//! to the USB thread, logging and the error taxonomy.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod resolver;
pub mod sysfs;
pub mod test_utils;
pub mod types;
pub mod usb_types;
pub mod vm;

pub use channel::{EventBridge, EventFeed, create_event_bridge};
pub use config::{Config, ConfigStore, MappingEntry, Trigger, TriggerCounts};
pub use error::{ActionError, ConfigError, LoopError, StartupError};
pub use logging::{DaemonLog, Severity, TracingLog, setup_logging};
pub use resolver::resolve;
pub use sysfs::SysfsPorts;
pub use types::{UsbDeviceId, VmId, VmRunState};
pub use usb_types::{HotplugAction, HotplugEvent, PortSnapshotProvider, UsbPortSnapshot};
pub use vm::{QmClient, VmControl, VmSummary};
