//! USB hotplug events and port snapshots

use crate::types::UsbDeviceId;

/// What happened to the device behind a hotplug notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugAction {
    /// Device attached; the only actionable kind
    Add,
    /// Anything else (`remove`, `bind`, `change`, ...)
    Other(String),
}

impl HotplugAction {
    /// Classify a kernel uevent action string
    pub fn from_kernel(action: &str) -> Self {
        if action == "add" {
            Self::Add
        } else {
            Self::Other(action.to_string())
        }
    }
}

/// One notification from the device event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    /// Kernel topology name (`1-1.2`), `None` when it could not be read
    pub port_id: Option<String>,
}

impl HotplugEvent {
    pub fn add(port_id: impl Into<String>) -> Self {
        Self {
            action: HotplugAction::Add,
            port_id: Some(port_id.into()),
        }
    }

    pub fn remove(port_id: impl Into<String>) -> Self {
        Self {
            action: HotplugAction::Other("remove".to_string()),
            port_id: Some(port_id.into()),
        }
    }
}

/// Build the sysfs name of a device from its bus and port chain
///
/// Root hubs have an empty chain and are named `usb<bus>`; everything else is
/// `<bus>-<port>.<port>...`.
pub fn topology_port_id(bus: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return format!("usb{}", bus);
    }
    let chain: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    format!("{}-{}", bus, chain.join("."))
}

/// State of one entry under the USB device tree at the time of a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPortSnapshot {
    pub port_id: String,
    /// Device currently on the port, `None` when nothing is connected
    pub device_id: Option<UsbDeviceId>,
    pub description: String,
}

impl UsbPortSnapshot {
    pub fn connected(&self) -> bool {
        self.device_id.is_some()
    }

    /// Bus number prefix of the port id (`1` for `1-1.2`, `3` for `usb3`)
    pub fn bus(&self) -> Option<u8> {
        let id = self.port_id.strip_prefix("usb").unwrap_or(&self.port_id);
        let bus = id.split(['-', ':']).next()?;
        bus.parse().ok()
    }
}

/// Source of fresh port snapshots
pub trait PortSnapshotProvider {
    /// Read every port currently known to the host
    fn scan_ports(&self) -> std::io::Result<Vec<UsbPortSnapshot>>;

    /// Best-effort lookup of the device occupying `port_id`
    ///
    /// Scan failures and empty ports both yield `None`.
    fn device_on_port(&self, port_id: &str) -> Option<UsbDeviceId> {
        match self.scan_ports() {
            Ok(ports) => ports
                .into_iter()
                .find(|p| p.port_id == port_id)
                .and_then(|p| p.device_id),
            Err(e) => {
                tracing::debug!("Port scan failed while resolving {}: {}", port_id, e);
                None
            }
        }
    }
}
