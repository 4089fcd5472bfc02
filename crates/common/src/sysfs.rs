//! USB port snapshots read from sysfs
//!
//! Every directory under `/sys/bus/usb/devices` is treated as a port. Entries
//! with readable `idVendor`/`idProduct` files have a device attached; the rest
//! (interfaces, empty hub ports) are reported as disconnected.

use crate::types::UsbDeviceId;
use crate::usb_types::{PortSnapshotProvider, UsbPortSnapshot};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the kernel's USB device tree
pub const SYS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Port snapshot provider backed by a sysfs directory
#[derive(Debug, Clone)]
pub struct SysfsPorts {
    root: PathBuf,
}

impl Default for SysfsPorts {
    fn default() -> Self {
        Self::new(SYS_USB_DEVICES)
    }
}

impl SysfsPorts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_attr(dir: &Path, name: &str) -> Option<String> {
        let value = fs::read_to_string(dir.join(name)).ok()?;
        Some(value.trim().to_string())
    }

    fn snapshot(dir: &Path, port_id: String) -> UsbPortSnapshot {
        let device_id = match (
            Self::read_attr(dir, "idVendor"),
            Self::read_attr(dir, "idProduct"),
        ) {
            (Some(vendor), Some(product)) => format!("{}:{}", vendor, product).parse().ok(),
            _ => None,
        };

        let description = if device_id.is_some() {
            let parts: Vec<String> = ["manufacturer", "product"]
                .iter()
                .filter_map(|attr| Self::read_attr(dir, attr))
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                "Unknown device".to_string()
            } else {
                parts.join(" ")
            }
        } else {
            String::new()
        };

        UsbPortSnapshot {
            port_id,
            device_id,
            description,
        }
    }
}

impl PortSnapshotProvider for SysfsPorts {
    fn scan_ports(&self) -> io::Result<Vec<UsbPortSnapshot>> {
        let mut entries: Vec<(String, PathBuf)> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(entries
            .into_iter()
            .map(|(port_id, dir)| Self::snapshot(&dir, port_id))
            .collect())
    }

    fn device_on_port(&self, port_id: &str) -> Option<UsbDeviceId> {
        // Port ids never contain path separators; refuse anything that would escape the root.
        if port_id.is_empty() || port_id.contains('/') || port_id.starts_with('.') {
            return None;
        }
        let dir = self.root.join(port_id);
        if !dir.is_dir() {
            return None;
        }
        Self::snapshot(&dir, port_id.to_string()).device_id
    }
}
