//! Identifier and state types shared by the daemon and the CLI

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Hypervisor VM identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// USB vendor:product pair, e.g. `046d:c534`
///
/// Parsing accepts an optional `0x` prefix on either half and any hex case,
/// so `0x046D:0xC534` and `046d:c534` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbDeviceId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbDeviceId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }

    fn parse_half(half: &str) -> Option<u16> {
        let half = half.trim();
        let hex = half
            .strip_prefix("0x")
            .or_else(|| half.strip_prefix("0X"))
            .unwrap_or(half);
        if hex.is_empty() || hex.len() > 4 {
            return None;
        }
        u16::from_str_radix(hex, 16).ok()
    }
}

impl FromStr for UsbDeviceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidDeviceId(s.to_string());
        let (vendor, product) = s.split_once(':').ok_or_else(invalid)?;
        let vendor = Self::parse_half(vendor).ok_or_else(invalid)?;
        let product = Self::parse_half(product).ok_or_else(invalid)?;
        Ok(Self { vendor, product })
    }
}

impl TryFrom<String> for UsbDeviceId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbDeviceId> for String {
    fn from(id: UsbDeviceId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Run state of a VM as seen by the control plane
///
/// `Unknown` covers both a failed query and a status string we do not
/// recognize; callers treat the two identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmRunState {
    Running,
    Stopped,
    Unknown,
}

impl VmRunState {
    /// Map a control-plane status word (`running`, `stopped`, ...) to a state
    pub fn from_status_word(word: &str) -> Self {
        match word.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for VmRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
