//! Hypervisor control plane
//!
//! The daemon only ever asks two things of the hypervisor: what state a VM is
//! in, and to start it. [`VmControl`] is that contract; [`QmClient`] fulfils it
//! with the Proxmox `qm` CLI. Both operations block until the subprocess exits.

use crate::error::ActionError;
use crate::types::{VmId, VmRunState};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::debug;

/// Status query and start command against the control plane
///
/// Neither method fails: query failures collapse to [`VmRunState::Unknown`],
/// start failures to `false`.
pub trait VmControl {
    fn status(&self, vm_id: VmId) -> VmRunState;
    fn start(&self, vm_id: VmId) -> bool;
}

/// One row of the hypervisor's VM inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub vm_id: VmId,
    pub name: String,
    pub status: String,
}

/// [`VmControl`] over the `qm` command-line tool
#[derive(Debug, Clone)]
pub struct QmClient {
    program: PathBuf,
}

impl Default for QmClient {
    fn default() -> Self {
        Self::new("qm")
    }
}

impl QmClient {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[OsString]) -> Result<Output, ActionError> {
        let command = self.describe(args);
        debug!("Running `{}`", command);
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| ActionError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ActionError::Exit {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn describe(&self, args: &[OsString]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    /// `qm status <id>`, with failures reported
    pub fn try_status(&self, vm_id: VmId) -> Result<VmRunState, ActionError> {
        let output = self.run(&["status".into(), vm_id.to_string().into()])?;
        parse_status_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// `qm start <id>`, with failures reported
    pub fn try_start(&self, vm_id: VmId) -> Result<(), ActionError> {
        self.run(&["start".into(), vm_id.to_string().into()])?;
        Ok(())
    }

    /// `qm list`, parsed into inventory rows
    pub fn list_vms(&self) -> Result<Vec<VmSummary>, ActionError> {
        let output = self.run(&["list".into()])?;
        Ok(parse_list_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl VmControl for QmClient {
    fn status(&self, vm_id: VmId) -> VmRunState {
        match self.try_status(vm_id) {
            Ok(state) => state,
            Err(e) => {
                debug!("Status query for VM {} failed: {}", vm_id, e);
                VmRunState::Unknown
            }
        }
    }

    fn start(&self, vm_id: VmId) -> bool {
        match self.try_start(vm_id) {
            Ok(()) => true,
            Err(e) => {
                debug!("Start of VM {} failed: {}", vm_id, e);
                false
            }
        }
    }
}

/// Find the `status: <word>` line in `qm status` output
///
/// A known word maps to its state; any other word is an
/// [`ActionError::UnrecognizedStatus`].
pub fn parse_status_output(stdout: &str) -> Result<VmRunState, ActionError> {
    for line in stdout.lines() {
        let line = line.trim().to_ascii_lowercase();
        if let Some(value) = line.strip_prefix("status:") {
            let value = value.trim();
            return match VmRunState::from_status_word(value) {
                VmRunState::Unknown => Err(ActionError::UnrecognizedStatus(value.to_string())),
                state => Ok(state),
            };
        }
    }
    Err(ActionError::MissingStatus)
}

/// Parse the human-readable `qm list` table
///
/// Only lines starting with a digit are VM rows (`VMID NAME STATUS ...`);
/// headers and warnings are skipped, as are rows with fewer than three columns.
pub fn parse_list_output(stdout: &str) -> Vec<VmSummary> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let vm_id = cols.next()?.parse().ok()?;
            let name = cols.next()?.to_string();
            let status = cols.next()?.to_string();
            Some(VmSummary {
                vm_id: VmId(vm_id),
                name,
                status,
            })
        })
        .collect()
}
