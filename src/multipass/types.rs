//! Types parsed from, or passed to, the `multipass` CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use serde::Deserialize;

/// Lifecycle state reported by `multipass info`.
///
/// States outside the handled set (`Deleted`, `Suspending`, `Restarting`,
/// `Delayed Shutdown`, ...) collapse into [`InstanceState::Unknown`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
pub enum InstanceState {
    /// Booting.
    Starting,
    /// Up.
    Running,
    /// Powered off.
    Stopped,
    /// Memory saved to disk.
    Suspended,
    /// Any other hypervisor state.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Suspended => "Suspended",
            Self::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// One instance's entry from `multipass info`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceInfo {
    /// Instance name.
    pub name: String,
    /// Current state.
    pub state: InstanceState,
    /// Reported IPv4 addresses, in hypervisor order.
    pub ipv4: Vec<Ipv4Addr>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InfoPayload {
    pub(super) info: BTreeMap<String, InfoEntry>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InfoEntry {
    #[serde(default)]
    pub(super) ipv4: Vec<Ipv4Addr>,
    pub(super) state: InstanceState,
}

/// Parameters for `multipass launch`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Instance name.
    pub name: String,
    /// Image alias or URL; Multipass' default when absent.
    pub image: Option<String>,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in GiB.
    pub memory_gib: u32,
    /// Disk in GiB.
    pub disk_gib: u32,
    /// Attach to the bridged network.
    pub bridged: bool,
    /// Rendered cloud-init document.
    pub cloud_init: Utf8PathBuf,
}

/// Resources applied by `multipass set` while an instance is stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resources {
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in GiB.
    pub memory_gib: u32,
    /// Disk in GiB.
    pub disk_gib: u32,
}
