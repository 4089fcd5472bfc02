//! Test utilities for vusbpb
//!
//! Provides in-memory stand-ins for the daemon's collaborators so the loop can
//! be driven without a USB subsystem or a hypervisor.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{CapturingLog, ScriptedVmControl};
//! use common::{DaemonLog, VmControl, VmId, VmRunState};
//!
//! let control = ScriptedVmControl::new().with_vm(101, VmRunState::Stopped, true);
//! assert!(control.start(VmId(101)));
//! assert_eq!(control.start_calls(), vec![VmId(101)]);
//!
//! let log = CapturingLog::default();
//! log.warn("careful");
//! assert_eq!(log.warnings(), vec!["careful".to_string()]);
//! ```

use crate::logging::{DaemonLog, Severity};
use crate::types::{UsbDeviceId, VmId, VmRunState};
use crate::usb_types::{PortSnapshotProvider, UsbPortSnapshot};
use crate::vm::VmControl;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Decision log that keeps every record in memory
#[derive(Debug, Default)]
pub struct CapturingLog {
    records: Mutex<Vec<(Severity, String)>>,
}

impl CapturingLog {
    fn push(&self, severity: Severity, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((severity, message.to_string()));
        }
    }

    /// All records in emission order
    pub fn records(&self) -> Vec<(Severity, String)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn messages(&self, severity: Severity) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn infos(&self) -> Vec<String> {
        self.messages(Severity::Info)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages(Severity::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(Severity::Error)
    }

    /// Whether any record contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.records().iter().any(|(_, m)| m.contains(needle))
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl DaemonLog for CapturingLog {
    fn info(&self, message: &str) {
        self.push(Severity::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Severity::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(Severity::Error, message);
    }
}

/// Fixed set of port snapshots
#[derive(Debug, Default, Clone)]
pub struct StaticPorts {
    ports: Vec<UsbPortSnapshot>,
    fail: bool,
}

impl StaticPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port with `device` attached
    pub fn with_device(mut self, port_id: &str, device: UsbDeviceId) -> Self {
        self.ports.push(UsbPortSnapshot {
            port_id: port_id.to_string(),
            device_id: Some(device),
            description: format!("Test device {}", device),
        });
        self
    }

    /// Add a port with nothing attached
    pub fn with_empty_port(mut self, port_id: &str) -> Self {
        self.ports.push(UsbPortSnapshot {
            port_id: port_id.to_string(),
            device_id: None,
            description: String::new(),
        });
        self
    }

    /// Make every scan fail, as if sysfs were unreadable
    pub fn failing() -> Self {
        Self {
            ports: Vec::new(),
            fail: true,
        }
    }
}

impl PortSnapshotProvider for StaticPorts {
    fn scan_ports(&self) -> io::Result<Vec<UsbPortSnapshot>> {
        if self.fail {
            return Err(io::Error::other("scan disabled for test"));
        }
        Ok(self.ports.clone())
    }
}

#[derive(Debug, Clone, Copy)]
struct ScriptedVm {
    state: VmRunState,
    start_ok: bool,
}

/// Control plane with scripted answers that records every call
///
/// VMs not scripted report [`VmRunState::Unknown`] and refuse to start.
#[derive(Debug, Default)]
pub struct ScriptedVmControl {
    vms: HashMap<VmId, ScriptedVm>,
    status_calls: Mutex<Vec<VmId>>,
    start_calls: Mutex<Vec<VmId>>,
}

impl ScriptedVmControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the state `vm_id` reports and whether starting it succeeds
    pub fn with_vm(mut self, vm_id: u32, state: VmRunState, start_ok: bool) -> Self {
        self.vms.insert(VmId(vm_id), ScriptedVm { state, start_ok });
        self
    }

    pub fn status_calls(&self) -> Vec<VmId> {
        self.status_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn start_calls(&self) -> Vec<VmId> {
        self.start_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Total number of control-plane calls of either kind
    pub fn call_count(&self) -> usize {
        self.status_calls().len() + self.start_calls().len()
    }
}

impl VmControl for ScriptedVmControl {
    fn status(&self, vm_id: VmId) -> VmRunState {
        if let Ok(mut calls) = self.status_calls.lock() {
            calls.push(vm_id);
        }
        self.vms
            .get(&vm_id)
            .map(|vm| vm.state)
            .unwrap_or(VmRunState::Unknown)
    }

    fn start(&self, vm_id: VmId) -> bool {
        if let Ok(mut calls) = self.start_calls.lock() {
            calls.push(vm_id);
        }
        self.vms.get(&vm_id).is_some_and(|vm| vm.start_ok)
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_ports_lookup() {
        let dev = UsbDeviceId::new(0x1234, 0xabcd);
        let ports = StaticPorts::new()
            .with_device("2-1", dev)
            .with_empty_port("2-2");
        assert_eq!(ports.device_on_port("2-1"), Some(dev));
        assert_eq!(ports.device_on_port("2-2"), None);
        assert_eq!(ports.device_on_port("3-1"), None);
        assert_eq!(StaticPorts::failing().device_on_port("2-1"), None);
    }

    #[test]
    fn test_unscripted_vm_is_unknown() {
        let control = ScriptedVmControl::new();
        assert_eq!(control.status(VmId(7)), VmRunState::Unknown);
        assert!(!control.start(VmId(7)));
        assert_eq!(control.call_count(), 2);
    }
}
