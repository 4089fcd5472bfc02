//! Persisted configuration and the VM mapping store
//!
//! The store owns one TOML file. Reads come in two flavours: [`ConfigStore::load`]
//! tolerates a missing file, [`ConfigStore::load_strict`] does not. Writes are
//! atomic: a temporary file in the same directory is flushed and renamed over
//! the target, so a crash mid-write never leaves a torn config behind.

use crate::error::ConfigError;
use crate::sysfs::SYS_USB_DEVICES;
use crate::types::{UsbDeviceId, VmId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config location for the system daemon
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vusbpb/vusbpb.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Trigger rules, in declaration order
    #[serde(default)]
    pub vms: Vec<MappingEntry>,
}

/// Settings the daemon reads once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Hypervisor control-plane CLI
    #[serde(default = "DaemonSettings::default_qm_path")]
    pub qm_path: PathBuf,
    /// Where USB port snapshots are read from
    #[serde(default = "DaemonSettings::default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Fixed pause before exiting after a loop failure
    #[serde(default = "DaemonSettings::default_failure_pause_secs")]
    pub failure_pause_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            qm_path: Self::default_qm_path(),
            sysfs_root: Self::default_sysfs_root(),
            failure_pause_secs: Self::default_failure_pause_secs(),
        }
    }
}

impl DaemonSettings {
    fn default_qm_path() -> PathBuf {
        PathBuf::from("qm")
    }

    fn default_sysfs_root() -> PathBuf {
        PathBuf::from(SYS_USB_DEVICES)
    }

    fn default_failure_pause_secs() -> u64 {
        2
    }

    pub fn failure_pause(&self) -> Duration {
        Duration::from_secs(self.failure_pause_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Ports that had a device attached at the last `--show usb`
    #[serde(default)]
    pub history: Vec<String>,
}

/// One trigger rule: power on `vm_id` when a port and/or device shows up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub vm_id: VmId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_device_id: Option<UsbDeviceId>,
}

/// Which trigger fields of an entry are populated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger<'a> {
    Port(&'a str),
    Device(UsbDeviceId),
    PortAndDevice(&'a str, UsbDeviceId),
}

impl MappingEntry {
    pub fn port(vm_id: u32, port_id: &str) -> Self {
        Self {
            vm_id: VmId(vm_id),
            usb_port_id: Some(port_id.to_string()),
            usb_device_id: None,
        }
    }

    pub fn device(vm_id: u32, device_id: UsbDeviceId) -> Self {
        Self {
            vm_id: VmId(vm_id),
            usb_port_id: None,
            usb_device_id: Some(device_id),
        }
    }

    pub fn port_and_device(vm_id: u32, port_id: &str, device_id: UsbDeviceId) -> Self {
        Self {
            vm_id: VmId(vm_id),
            usb_port_id: Some(port_id.to_string()),
            usb_device_id: Some(device_id),
        }
    }

    /// Classify the entry; `None` for an inert entry with no trigger at all
    ///
    /// An empty port string counts as absent.
    pub fn trigger(&self) -> Option<Trigger<'_>> {
        let port = self.usb_port_id.as_deref().filter(|p| !p.is_empty());
        match (port, self.usb_device_id) {
            (Some(port), Some(device)) => Some(Trigger::PortAndDevice(port, device)),
            (Some(port), None) => Some(Trigger::Port(port)),
            (None, Some(device)) => Some(Trigger::Device(device)),
            (None, None) => None,
        }
    }
}

/// Mapping breakdown by populated trigger fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerCounts {
    pub total: usize,
    pub port_only: usize,
    pub device_only: usize,
    pub port_and_device: usize,
    pub inert: usize,
}

impl TriggerCounts {
    pub fn of(entries: &[MappingEntry]) -> Self {
        let mut counts = Self {
            total: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            match entry.trigger() {
                Some(Trigger::Port(_)) => counts.port_only += 1,
                Some(Trigger::Device(_)) => counts.device_only += 1,
                Some(Trigger::PortAndDevice(..)) => counts.port_and_device += 1,
                None => counts.inert += 1,
            }
        }
        counts
    }
}

impl Config {
    /// Add a mapping; one entry per VM, and at least one trigger field
    pub fn add_mapping(&mut self, entry: MappingEntry) -> Result<(), ConfigError> {
        if entry.trigger().is_none() {
            return Err(ConfigError::NoTrigger(entry.vm_id));
        }
        if self.vms.iter().any(|e| e.vm_id == entry.vm_id) {
            return Err(ConfigError::DuplicateVm(entry.vm_id));
        }
        self.vms.push(entry);
        Ok(())
    }

    /// Remove every mapping for `vm_id`, returning how many were removed
    pub fn remove_mapping(&mut self, vm_id: VmId) -> usize {
        let before = self.vms.len();
        self.vms.retain(|e| e.vm_id != vm_id);
        before - self.vms.len()
    }

    pub fn mapping_for(&self, vm_id: VmId) -> Option<&MappingEntry> {
        self.vms.iter().find(|e| e.vm_id == vm_id)
    }

    /// Collapse duplicate VM ids
    ///
    /// For each VM the first entry with a trigger is kept; the first entry is
    /// kept only when none of them has one.
    fn dedup_vms(&mut self, path: &Path) {
        let mut keep: HashMap<VmId, usize> = HashMap::new();
        for (idx, entry) in self.vms.iter().enumerate() {
            match keep.get(&entry.vm_id) {
                None => {
                    keep.insert(entry.vm_id, idx);
                }
                Some(&kept) if self.vms[kept].trigger().is_none() && entry.trigger().is_some() => {
                    keep.insert(entry.vm_id, idx);
                }
                Some(_) => {}
            }
        }

        let mut idx = 0;
        self.vms.retain(|entry| {
            let kept = keep.get(&entry.vm_id) == Some(&idx);
            idx += 1;
            if !kept {
                tracing::warn!(
                    "Ignoring duplicate mapping for VM {} in {}",
                    entry.vm_id,
                    path.display()
                );
            }
            kept
        });
    }
}

/// File-backed config store
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for a user-supplied path; `~` is expanded
    pub fn from_cli_path(path: &str) -> Self {
        Self::new(shellexpand::tilde(path).as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the config; a missing file yields the defaults
    pub fn load(&self) -> Result<Config, ConfigError> {
        self.read(true)
    }

    /// Load the config; a missing file is an error
    pub fn load_strict(&self) -> Result<Config, ConfigError> {
        self.read(false)
    }

    fn read(&self, allow_missing: bool) -> Result<Config, ConfigError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if allow_missing {
                    tracing::debug!("No config at {}, using defaults", self.path.display());
                    return Ok(Config::default());
                }
                return Err(ConfigError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        config.dedup_vms(&self.path);

        tracing::debug!("Loaded configuration from: {}", self.path.display());
        Ok(config)
    }

    /// Atomically replace the config file
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".vusbpb_conf_")
            .tempfile_in(&dir)
            .map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        // On failure the temporary file is removed when the error drops it.
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        tracing::debug!("Saved configuration to: {}", self.path.display());
        Ok(())
    }

    /// Remove the config file if present
    pub fn remove(&self) -> Result<bool, ConfigError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ConfigError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.vms.is_empty());
        assert!(config.usb.history.is_empty());
        assert_eq!(config.daemon.qm_path, PathBuf::from("qm"));
        assert_eq!(config.daemon.failure_pause(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_mixed_entries() {
        let config: Config = toml::from_str(
            r#"
[[vms]]
vm_id = 101
usb_port_id = "1-1.2"

[[vms]]
vm_id = 102
usb_device_id = "0x1234:0xABCD"

[[vms]]
vm_id = 103
usb_port_id = "2-1"
usb_device_id = "046d:c534"

[[vms]]
vm_id = 104
"#,
        )
        .unwrap();

        assert_eq!(config.vms.len(), 4);
        assert_eq!(config.vms[0].trigger(), Some(Trigger::Port("1-1.2")));
        assert_eq!(
            config.vms[1].trigger(),
            Some(Trigger::Device(UsbDeviceId::new(0x1234, 0xabcd)))
        );
        assert!(matches!(
            config.vms[2].trigger(),
            Some(Trigger::PortAndDevice("2-1", _))
        ));
        assert_eq!(config.vms[3].trigger(), None);
    }

    #[test]
    fn test_empty_port_string_is_inert() {
        let entry = MappingEntry {
            vm_id: VmId(1),
            usb_port_id: Some(String::new()),
            usb_device_id: None,
        };
        assert_eq!(entry.trigger(), None);
    }

    #[test]
    fn test_invalid_device_id_rejected_at_parse() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[[vms]]
vm_id = 101
usb_device_id = "not-a-device"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_trigger_counts() {
        let id = UsbDeviceId::new(1, 2);
        let entries = vec![
            MappingEntry::port(1, "1-1"),
            MappingEntry::port(2, "1-2"),
            MappingEntry::device(3, id),
            MappingEntry::port_and_device(4, "1-3", id),
            MappingEntry {
                vm_id: VmId(5),
                usb_port_id: None,
                usb_device_id: None,
            },
        ];
        let counts = TriggerCounts::of(&entries);
        assert_eq!(
            counts,
            TriggerCounts {
                total: 5,
                port_only: 2,
                device_only: 1,
                port_and_device: 1,
                inert: 1,
            }
        );
    }

    #[test]
    fn test_add_and_remove_mapping() {
        let mut config = Config::default();
        config.add_mapping(MappingEntry::port(101, "1-1.2")).unwrap();

        assert!(matches!(
            config.add_mapping(MappingEntry::port(101, "2-1")),
            Err(ConfigError::DuplicateVm(VmId(101)))
        ));
        assert!(matches!(
            config.add_mapping(MappingEntry {
                vm_id: VmId(102),
                usb_port_id: None,
                usb_device_id: None,
            }),
            Err(ConfigError::NoTrigger(VmId(102)))
        ));

        assert_eq!(config.remove_mapping(VmId(102)), 0);
        assert_eq!(config.remove_mapping(VmId(101)), 1);
        assert!(config.vms.is_empty());
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mut config = Config {
            vms: vec![
                MappingEntry::port(101, "1-1"),
                MappingEntry::port(101, "1-2"),
                MappingEntry::port(102, "1-3"),
            ],
            ..Config::default()
        };
        config.dedup_vms(Path::new("test.toml"));
        assert_eq!(config.vms.len(), 2);
        assert_eq!(config.vms[0].usb_port_id.as_deref(), Some("1-1"));
    }

    #[test]
    fn test_dedup_prefers_entry_with_trigger() {
        let inert = MappingEntry {
            vm_id: VmId(101),
            usb_port_id: None,
            usb_device_id: None,
        };
        let mut config = Config {
            vms: vec![
                inert.clone(),
                MappingEntry::port(102, "1-3"),
                MappingEntry::port(101, "1-1"),
                MappingEntry::port(101, "1-2"),
            ],
            ..Config::default()
        };
        config.dedup_vms(Path::new("test.toml"));
        assert_eq!(
            config.vms,
            vec![MappingEntry::port(102, "1-3"), MappingEntry::port(101, "1-1")]
        );

        let mut all_inert = Config {
            vms: vec![inert.clone(), inert.clone()],
            ..Config::default()
        };
        all_inert.dedup_vms(Path::new("test.toml"));
        assert_eq!(all_inert.vms, vec![inert]);
    }

    #[test]
    fn test_serialization_roundtrip_keeps_optional_fields_out() {
        let mut config = Config::default();
        config.add_mapping(MappingEntry::port(101, "1-1.2")).unwrap();
        config.usb.history = vec!["1-1.2".to_string()];

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(!toml_str.contains("usb_device_id"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }
}
