//! vUSBPB - Virtual USB Power Button
//!
//! Daemon that powers on a Proxmox VM when a mapped USB port or device is
//! plugged in, plus the CLI used to inspect ports and VMs and edit the mapping.

mod commands;
mod daemon;
mod hotplug;
mod service;
mod tree;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, ValueEnum};
use common::{
    ConfigStore, DaemonLog, QmClient, StartupError, SysfsPorts, TracingLog, UsbDeviceId, VmId,
    create_event_bridge, setup_logging,
};
use daemon::Daemon;
use hotplug::HotplugSource;
use service::ServiceInstaller;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ShowTarget {
    /// USB ports grouped by bus
    Usb,
    /// Hypervisor VMs with their configured trigger
    Vm,
}

#[derive(Parser, Debug)]
#[command(name = "vusbpb")]
#[command(
    author,
    version,
    about = "vUSBPB - power on a VM when a USB port or device is plugged in"
)]
#[command(long_about = "
Virtual USB Power Button. Watches USB hotplug events and starts the Proxmox VM
mapped to the port or device that just appeared.

EXAMPLES:
    # Find the port id of the port you want to use
    vusbpb --show usb

    # Start VM 101 when anything is plugged into port 1-1.2
    vusbpb --add 101 --usb 1-1.2

    # Start VM 102 when a specific device is plugged in anywhere
    vusbpb --add 102 --device 046d:c534

    # Install and start the systemd service
    vusbpb --install

    # Run the daemon in the foreground with debug logging
    vusbpb --daemon --log-level debug

CONFIGURATION:
    Mappings are stored in /etc/vusbpb/vusbpb.toml unless --config is given.
    The daemon reads them once at startup; --add and --delete restart the
    service when it is running.
")]
struct Args {
    /// Run the daemon
    #[arg(long)]
    daemon: bool,

    /// List USB ports or VMs and exit
    #[arg(long, value_enum, value_name = "WHAT")]
    show: Option<ShowTarget>,

    /// With --show vm: list configured VMs only, without querying the hypervisor
    #[arg(long, requires = "show")]
    no_status: bool,

    /// List configured mappings with each VM's current status
    #[arg(long)]
    list: bool,

    /// Add a mapping for this VM id
    #[arg(long, value_name = "VMID")]
    add: Option<u32>,

    /// With --add: trigger on this port id (see --show usb)
    #[arg(long, value_name = "PORT", requires = "add")]
    usb: Option<String>,

    /// With --add: trigger on this device id
    #[arg(long, value_name = "VID:PID", requires = "add")]
    device: Option<UsbDeviceId>,

    /// Delete the mapping of this VM id
    #[arg(long, value_name = "VMID")]
    delete: Option<u32>,

    /// Install and start the systemd service
    #[arg(long)]
    install: bool,

    /// Stop the systemd service and remove it together with the config
    #[arg(long)]
    uninstall: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to setup logging")?;

    let store = match args.config.as_deref() {
        Some(path) => ConfigStore::from_cli_path(path),
        None => ConfigStore::default(),
    };
    let installer = ServiceInstaller::new(service::SERVICE_PATH, store.clone());

    if args.daemon {
        require_root("--daemon")?;
        return run_daemon(store).await;
    }

    if let Some(target) = args.show {
        let config = store.load().unwrap_or_default();
        return match target {
            ShowTarget::Usb => {
                commands::show_usb(&store, &SysfsPorts::new(config.daemon.sysfs_root))
            }
            ShowTarget::Vm => commands::show_vm(
                &store,
                &QmClient::new(config.daemon.qm_path),
                args.no_status,
            ),
        };
    }

    if args.list {
        let config = store.load().context("Cannot load config")?;
        return commands::list_mappings(&store, &QmClient::new(config.daemon.qm_path));
    }

    if let Some(vm_id) = args.add {
        require_root("--add")?;
        let entry = commands::add_mapping(&store, VmId(vm_id), args.usb, args.device)?;
        println!("Added mapping: VM {} <- {}", entry.vm_id, commands::describe_trigger(&entry));
        restart_service(&installer);
        return Ok(());
    }

    if let Some(vm_id) = args.delete {
        require_root("--delete")?;
        let removed = commands::delete_mapping(&store, VmId(vm_id))?;
        if removed == 0 {
            bail!("No mapping found for VM {}", vm_id);
        }
        println!("Deleted mapping for VM {}", vm_id);
        restart_service(&installer);
        return Ok(());
    }

    if args.install {
        require_root("--install")?;
        let exe = std::env::current_exe().context("Cannot locate the vusbpb binary")?;
        installer.install(&exe)?;
        println!("Installed and started {}", service::SERVICE_NAME);
        return Ok(());
    }

    if args.uninstall {
        require_root("--uninstall")?;
        installer.uninstall()?;
        println!("Uninstalled {}", service::SERVICE_NAME);
        return Ok(());
    }

    Args::command().print_help()?;
    Ok(())
}

fn require_root(flag: &str) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("{} requires root privileges", flag);
    }
    Ok(())
}

fn restart_service(installer: &ServiceInstaller) {
    if installer.restart_if_active() {
        info!("Restarted {} to apply the new mapping", service::SERVICE_NAME);
    }
}

/// STARTING -> LISTENING -> STOPPED | FAILED
///
/// The hotplug subscription is created before the mapping is read, so a
/// device plugged in while the mapping loads is not missed.
async fn run_daemon(store: ConfigStore) -> Result<()> {
    info!("vUSBPB daemon v{}", env!("CARGO_PKG_VERSION"));
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let (bridge, feed) = create_event_bridge();
    let source = HotplugSource::start(feed)
        .map_err(|e| startup_failure(&TracingLog, "Cannot subscribe to USB hotplug events", e))?;

    let config = store
        .load_strict()
        .map_err(|e| startup_failure(&TracingLog, "Cannot load config", StartupError::from(e)))?;
    let failure_pause = config.daemon.failure_pause();

    let daemon = Daemon::new(
        config.vms,
        SysfsPorts::new(config.daemon.sysfs_root),
        QmClient::new(config.daemon.qm_path),
        TracingLog,
    );

    if let Err(e) = service::notify_ready() {
        warn!("Failed to notify systemd ready: {:#}", e);
    }
    if let Err(e) = service::notify_status(&format!(
        "Watching USB hotplug, {} mapping(s)",
        daemon.mapping().len()
    )) {
        warn!("Failed to notify systemd status: {:#}", e);
    }

    let result = daemon.run(&bridge, shutdown_signal()).await;

    if let Err(e) = service::notify_stopping() {
        warn!("Failed to notify systemd stopping: {:#}", e);
    }
    drop(bridge);
    source.stop();

    match result {
        Ok(()) => {
            info!("vUSBPB daemon stopped");
            Ok(())
        }
        Err(e) => {
            error!("vUSBPB daemon failed: {}", e);
            tokio::time::sleep(failure_pause).await;
            Err(e.into())
        }
    }
}

/// Record a fatal startup error and turn it into the process error
fn startup_failure(log: &impl DaemonLog, what: &str, e: StartupError) -> anyhow::Error {
    log.error(&format!("{}: {}", what, e));
    anyhow::Error::new(e).context(what.to_string())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ConfigError;
    use common::test_utils::CapturingLog;

    #[test]
    fn test_args_parse_add() {
        let args = Args::try_parse_from([
            "vusbpb", "--add", "101", "--usb", "1-1.2", "--device", "046d:c534",
        ])
        .unwrap();
        assert_eq!(args.add, Some(101));
        assert_eq!(args.usb.as_deref(), Some("1-1.2"));
        assert_eq!(args.device, Some(UsbDeviceId::new(0x046d, 0xc534)));
    }

    #[test]
    fn test_args_parse_show() {
        let args = Args::try_parse_from(["vusbpb", "--show", "vm", "--no-status"]).unwrap();
        assert_eq!(args.show, Some(ShowTarget::Vm));
        assert!(args.no_status);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_reject_orphan_options() {
        assert!(Args::try_parse_from(["vusbpb", "--usb", "1-1"]).is_err());
        assert!(Args::try_parse_from(["vusbpb", "--no-status"]).is_err());
        assert!(Args::try_parse_from(["vusbpb", "--add", "101", "--device", "xyz"]).is_err());
    }

    #[test]
    fn test_startup_failure_is_logged_as_error() {
        let log = CapturingLog::default();
        let err = startup_failure(
            &log,
            "Cannot load config",
            StartupError::Config(ConfigError::Missing {
                path: "/etc/vusbpb/vusbpb.toml".into(),
            }),
        );

        assert_eq!(
            log.errors(),
            vec![
                "Cannot load config: cannot load mapping: config file /etc/vusbpb/vusbpb.toml does not exist"
                    .to_string()
            ]
        );
        assert_eq!(err.to_string(), "Cannot load config");
        assert!(err.downcast_ref::<StartupError>().is_some());
    }

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }
}
