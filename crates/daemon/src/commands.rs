//! One-shot CLI commands: listings and mapping edits
//!
//! Every command formats into strings first and prints last, so the formatting
//! can be tested without a terminal, sysfs or a hypervisor.

use crate::tree::{TreeNode, render_tree};
use anyhow::{Context, Result};
use common::{
    ConfigStore, MappingEntry, PortSnapshotProvider, QmClient, Trigger, UsbDeviceId,
    UsbPortSnapshot, VmControl, VmId, VmSummary,
};
use crossterm::style::Stylize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Short human description of what fires a mapping
pub fn describe_trigger(entry: &MappingEntry) -> String {
    match entry.trigger() {
        Some(Trigger::Port(port)) => format!("port {}", port),
        Some(Trigger::Device(device)) => format!("device {}", device),
        Some(Trigger::PortAndDevice(port, device)) => format!("port {} + device {}", port, device),
        None => "-".to_string(),
    }
}

fn port_line(port: &UsbPortSnapshot) -> String {
    let connected = if port.connected() { "yes" } else { "no" };
    let device = port
        .device_id
        .map_or_else(|| "none".to_string(), |d| d.to_string());
    let mut line = format!(
        "port={}  Connected={}  Device ID={}",
        port.port_id, connected, device
    );
    if !port.description.is_empty() {
        line.push_str(&format!("  Comment=\"{}\"", port.description));
    }
    line
}

/// Group ports by bus; connected ports absent from `history` are highlighted
pub fn port_tree(ports: &[UsbPortSnapshot], history: &HashSet<String>, color: bool) -> Vec<TreeNode> {
    let mut buses: BTreeMap<Option<u8>, Vec<TreeNode>> = BTreeMap::new();
    for port in ports {
        let line = port_line(port);
        let is_new = port.connected() && !history.contains(&port.port_id);
        let label = if is_new && color {
            line.green().to_string()
        } else if is_new {
            format!("{} (new)", line)
        } else {
            line
        };
        buses.entry(port.bus()).or_default().push(TreeNode::leaf(label));
    }

    buses
        .into_iter()
        .map(|(bus, children)| {
            let label = bus.map_or_else(|| "Other".to_string(), |b| format!("Bus {}", b));
            TreeNode::with_children(label, children)
        })
        .collect()
}

/// `--show usb`: print the port tree and remember which ports are connected
pub fn show_usb(store: &ConfigStore, ports: &impl PortSnapshotProvider) -> Result<()> {
    let history: HashSet<String> = match store.load() {
        Ok(config) => config.usb.history.into_iter().collect(),
        Err(e) => {
            println!("WARNING: cannot load config: {}", e);
            HashSet::new()
        }
    };

    let snapshot = ports
        .scan_ports()
        .context("Cannot scan USB ports")?;
    println!("{}", render_tree("USB ports", &port_tree(&snapshot, &history, true)));

    let mut connected: Vec<String> = snapshot
        .iter()
        .filter(|p| p.connected())
        .map(|p| p.port_id.clone())
        .collect();
    connected.sort();

    let mut config = store
        .load()
        .context("Cannot update USB history in config")?;
    config.usb.history = connected;
    store
        .save(&config)
        .context("Cannot update USB history in config")?;
    Ok(())
}

/// Inventory table: every hypervisor VM and its configured trigger
pub fn vm_table(vms: &[VmSummary], mappings: &[MappingEntry]) -> String {
    let triggers: HashMap<VmId, String> = mappings
        .iter()
        .map(|m| (m.vm_id, describe_trigger(m)))
        .collect();

    let mut out = String::from("VMID   Name             Status     USB trigger\n");
    out.push_str("--------------------------------------------------------\n");
    for vm in vms {
        let trigger = triggers.get(&vm.vm_id).map_or("-", String::as_str);
        out.push_str(&format!(
            "{:<6} {:<16} {:<10} {}\n",
            vm.vm_id, vm.name, vm.status, trigger
        ));
    }
    out
}

/// Mapping table; `status` is queried per VM unless `None`
pub fn mapping_table(
    mappings: &[MappingEntry],
    status: Option<&dyn Fn(VmId) -> String>,
) -> String {
    let mut out = String::from("VMID   Status     USB trigger\n");
    out.push_str("----------------------------------------\n");
    for mapping in mappings {
        let state = status.map_or_else(|| "-".to_string(), |query| query(mapping.vm_id));
        out.push_str(&format!(
            "{:<6} {:<10} {}\n",
            mapping.vm_id,
            state,
            describe_trigger(mapping)
        ));
    }
    out
}

/// `--show vm`: hypervisor inventory, or only the configured VMs with `no_status`
pub fn show_vm(store: &ConfigStore, client: &QmClient, no_status: bool) -> Result<()> {
    let config = store.load().context("Cannot load config")?;

    if no_status {
        print!("{}", mapping_table(&config.vms, None));
        return Ok(());
    }

    let vms = match client.list_vms() {
        Ok(vms) => vms,
        Err(e) => {
            warn!("Cannot list VMs: {}", e);
            Vec::new()
        }
    };
    print!("{}", vm_table(&vms, &config.vms));
    Ok(())
}

/// `--list`: configured mappings with the current state of each VM
pub fn list_mappings(store: &ConfigStore, control: &impl VmControl) -> Result<()> {
    let config = store.load().context("Cannot load config")?;
    let query = |vm_id: VmId| control.status(vm_id).to_string();
    print!("{}", mapping_table(&config.vms, Some(&query)));
    Ok(())
}

/// `--add`: append a mapping and save atomically
pub fn add_mapping(
    store: &ConfigStore,
    vm_id: VmId,
    usb_port_id: Option<String>,
    usb_device_id: Option<UsbDeviceId>,
) -> Result<MappingEntry> {
    let mut config = store.load().context("Cannot load config")?;
    let entry = MappingEntry {
        vm_id,
        usb_port_id,
        usb_device_id,
    };
    config.add_mapping(entry.clone())?;
    store.save(&config).context("Cannot save config")?;
    Ok(entry)
}

/// `--delete`: remove every mapping of `vm_id`; returns how many were removed
pub fn delete_mapping(store: &ConfigStore, vm_id: VmId) -> Result<usize> {
    let mut config = store.load().context("Cannot load config")?;
    let removed = config.remove_mapping(vm_id);
    if removed > 0 {
        store.save(&config).context("Cannot save config")?;
    }
    Ok(removed)
}
