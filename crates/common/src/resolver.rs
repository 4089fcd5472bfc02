//! Hotplug event to VM resolution
//!
//! Pure function of (port, device on that port, mapping). No I/O happens here;
//! the caller performs the one best-effort device lookup beforehand.

use crate::config::{MappingEntry, Trigger};
use crate::types::{UsbDeviceId, VmId};

/// Does `entry` fire for a device appearing on `port_id`?
///
/// - port-only rules match on the port alone, whatever is plugged in
/// - device-only rules match a known device on any port
/// - port+device rules need both; a port coincidence with another device does not fire
/// - inert rules never match
pub fn entry_matches(entry: &MappingEntry, port_id: &str, device_id: Option<UsbDeviceId>) -> bool {
    match entry.trigger() {
        Some(Trigger::Port(port)) => port == port_id,
        Some(Trigger::Device(device)) => device_id == Some(device),
        Some(Trigger::PortAndDevice(port, device)) => port == port_id && device_id == Some(device),
        None => false,
    }
}

/// VM ids of every matching entry, in mapping order
///
/// Duplicates are kept if the same VM is named by several satisfied entries.
pub fn resolve(port_id: &str, device_id: Option<UsbDeviceId>, entries: &[MappingEntry]) -> Vec<VmId> {
    entries
        .iter()
        .filter(|entry| entry_matches(entry, port_id, device_id))
        .map(|entry| entry.vm_id)
        .collect()
}
