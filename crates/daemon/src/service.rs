//! Systemd service integration
//!
//! Two halves: the sd-notify protocol spoken by the running daemon, and the
//! unit-file management behind `--install` / `--uninstall`.

use anyhow::{Context, Result, bail};
use std::env;
use std::fs;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Name of the unit managed by `--install`
pub const SERVICE_NAME: &str = "vusbpb.service";

/// Where `--install` writes the unit file
pub const SERVICE_PATH: &str = "/etc/systemd/system/vusbpb.service";

fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(false);
    };
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} notification to systemd", message))?;
    Ok(true)
}

/// Notify systemd that the service is ready
///
/// Called once the hotplug subscription exists and the mapping is loaded.
/// Only has effect when running under systemd with Type=notify.
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    }
    Ok(())
}

/// Notify systemd that the service is stopping
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Send a custom status message to systemd
///
/// The status will be visible in `systemctl status` output.
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Check if running under systemd
pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Render the unit file for a daemon binary at `exe`
pub fn unit_file(exe: &Path, config_path: &Path) -> String {
    format!(
        "[Unit]
Description=Virtual USB Power Button daemon (vUSBPB)
After=network.target pve-cluster.service

[Service]
Type=notify
ExecStart={} --daemon --config {}
User=root
Group=root
Restart=on-failure
RestartSec=5s

[Install]
WantedBy=multi-user.target
",
        exe.display(),
        config_path.display()
    )
}

/// `systemctl` wrapper; `true` when the command ran and exited 0
fn systemctl(args: &[&str]) -> bool {
    match Command::new("systemctl").args(args).status() {
        Ok(status) => {
            if !status.success() {
                debug!("systemctl {} exited with {}", args.join(" "), status);
            }
            status.success()
        }
        Err(e) => {
            debug!("Cannot run systemctl {}: {}", args.join(" "), e);
            false
        }
    }
}

/// Unit file location plus the config the unit points at
#[derive(Debug, Clone)]
pub struct ServiceInstaller {
    unit_path: PathBuf,
    config: common::ConfigStore,
}

impl ServiceInstaller {
    pub fn new(unit_path: impl Into<PathBuf>, config: common::ConfigStore) -> Self {
        Self {
            unit_path: unit_path.into(),
            config,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.unit_path.exists()
    }

    /// Write the unit (creating an empty config if none exists) without touching systemd
    pub fn write_unit(&self, exe: &Path) -> Result<()> {
        if self.is_installed() {
            bail!(
                "vUSBPB is already installed ({}). Use --uninstall first",
                self.unit_path.display()
            );
        }

        if !self.config.exists() {
            self.config
                .save(&common::Config::default())
                .context("Cannot create config file")?;
            info!("Created empty config at {}", self.config.path().display());
        }

        fs::write(&self.unit_path, unit_file(exe, self.config.path()))
            .with_context(|| format!("Cannot write unit file {}", self.unit_path.display()))?;
        Ok(())
    }

    /// `--install`: write the unit, reload systemd, enable and start the service
    pub fn install(&self, exe: &Path) -> Result<()> {
        self.write_unit(exe)?;

        if !systemctl(&["daemon-reload"]) {
            warn!("systemctl daemon-reload failed");
        }
        if !systemctl(&["enable", "--now", SERVICE_NAME]) {
            bail!("Cannot enable/start {}", SERVICE_NAME);
        }
        Ok(())
    }

    /// Remove the unit file and the config; returns whether a unit was present
    pub fn remove_files(&self) -> Result<bool> {
        let had_unit = match fs::remove_file(&self.unit_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Cannot remove {}", self.unit_path.display()));
            }
        };
        self.config.remove().context("Cannot remove config file")?;
        Ok(had_unit)
    }

    /// `--uninstall`: stop, disable, remove unit and config
    ///
    /// Failures of the `systemctl` steps are ignored; the service may already be gone.
    pub fn uninstall(&self) -> Result<()> {
        systemctl(&["stop", SERVICE_NAME]);
        systemctl(&["disable", SERVICE_NAME]);
        let had_unit = self.remove_files()?;
        if had_unit {
            systemctl(&["daemon-reload"]);
        }
        Ok(())
    }

    /// Restart the service if installed and active, so a mapping change takes effect
    ///
    /// Returns whether a restart was issued.
    pub fn restart_if_active(&self) -> bool {
        if !self.is_installed() {
            return false;
        }
        if !systemctl(&["is-active", "--quiet", SERVICE_NAME]) {
            return false;
        }
        if !systemctl(&["restart", SERVICE_NAME]) {
            warn!("Cannot restart {}", SERVICE_NAME);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ConfigStore;
    use tempfile::tempdir;

    #[test]
    fn test_is_systemd_without_socket() {
        // When NOTIFY_SOCKET is not set, should return false
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
        assert!(!is_systemd());
    }

    #[test]
    fn test_notify_functions_without_socket() {
        // When NOTIFY_SOCKET is not set, functions should succeed but do nothing
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }

        assert!(notify_ready().is_ok());
        assert!(notify_stopping().is_ok());
        assert!(notify_status("test").is_ok());
    }

    #[test]
    fn test_unit_file_contents() {
        let unit = unit_file(Path::new("/usr/bin/vusbpb"), Path::new("/etc/vusbpb/vusbpb.toml"));
        assert!(unit.contains("ExecStart=/usr/bin/vusbpb --daemon --config /etc/vusbpb/vusbpb.toml"));
        assert!(unit.contains("Type=notify"));
        assert!(unit.contains("Restart=on-failure"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn test_write_unit_creates_config_and_refuses_reinstall() {
        let tmp = tempdir().unwrap();
        let store = ConfigStore::new(tmp.path().join("etc/vusbpb.toml"));
        let installer = ServiceInstaller::new(tmp.path().join("vusbpb.service"), store.clone());

        installer.write_unit(Path::new("/usr/bin/vusbpb")).unwrap();
        assert!(installer.is_installed());
        assert!(store.exists());
        assert!(store.load_strict().unwrap().vms.is_empty());

        assert!(installer.write_unit(Path::new("/usr/bin/vusbpb")).is_err());
    }

    #[test]
    fn test_remove_files() {
        let tmp = tempdir().unwrap();
        let store = ConfigStore::new(tmp.path().join("vusbpb.toml"));
        let installer = ServiceInstaller::new(tmp.path().join("vusbpb.service"), store.clone());

        assert!(!installer.remove_files().unwrap());

        installer.write_unit(Path::new("/usr/bin/vusbpb")).unwrap();
        assert!(installer.remove_files().unwrap());
        assert!(!installer.is_installed());
        assert!(!store.exists());
    }

    #[test]
    fn test_restart_skipped_when_not_installed() {
        let tmp = tempdir().unwrap();
        let installer = ServiceInstaller::new(
            tmp.path().join("missing.service"),
            ConfigStore::new(tmp.path().join("vusbpb.toml")),
        );
        assert!(!installer.restart_if_active());
    }
}
