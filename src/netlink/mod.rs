//! Kernel network-device control.
//!
//! [`NetlinkManager`] is the narrow set of link operations the VF and bridge
//! managers are allowed to perform. Every method maps to exactly one kernel
//! action and reports the kernel's answer unchanged; nothing here retries.

use std::io;
use std::os::unix::io::RawFd;

use macaddr::MacAddr6;
use thiserror::Error;

pub mod iproute;

pub use iproute::IpRoute;

/// Snapshot of a network device as seen at lookup time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    /// Kernel interface index
    pub index: u32,
    /// Interface name
    pub name: String,
    /// Device hardware address, if it has an Ethernet one
    pub hardware_addr: Option<MacAddr6>,
    /// Name of the bridge (or other master) this device is enslaved to
    pub master: Option<String>,
    /// Administrative state
    pub up: bool,
    /// VF table, only populated for SR-IOV physical functions
    pub vfs: Vec<VfInfo>,
}

/// One row of a PF's VF table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfInfo {
    /// VF index on the PF
    pub id: u32,
    /// Administrative MAC bound to the VF by the PF
    pub mac: Option<MacAddr6>,
}

impl Link {
    /// Finds the VF with the given index in this link's VF table.
    pub fn vf(&self, id: u32) -> Option<&VfInfo> {
        self.vfs.iter().find(|vf| vf.id == id)
    }
}

/// Flags of a bridge VLAN membership entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeVlanFlags {
    /// The VLAN is the port's native VLAN
    pub pvid: bool,
    /// Frames egress the port without a tag
    pub untagged: bool,
    /// Apply to the device itself
    pub self_: bool,
    /// Apply to the bridge master's view of the port
    pub master: bool,
}

/// Errors returned by a device-control call.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The named device does not exist in the current namespace.
    #[error("link {0} not found")]
    NotFound(String),

    /// The helper binary could not be started.
    #[error("failed to execute '{command}': {error}")]
    Exec {
        command: String,
        error: io::Error,
    },

    /// The kernel (or driver) rejected the request.
    #[error("'{command}' failed (exit code {code}): {stderr}")]
    Rejected {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The device dump could not be decoded.
    #[error("failed to decode output of '{command}': {error}")]
    Decode {
        command: String,
        error: serde_json::Error,
    },
}

/// Atomic network-device operations.
///
/// Devices are addressed by the [`Link`] snapshot returned from
/// [`NetlinkManager::link_by_name`]. A successful rename updates the
/// snapshot's name so later calls keep addressing the same device.
pub trait NetlinkManager {
    fn link_by_name(&self, name: &str) -> Result<Link, LinkError>;
    fn link_set_up(&self, link: &Link) -> Result<(), LinkError>;
    fn link_set_down(&self, link: &Link) -> Result<(), LinkError>;
    fn link_set_name(&self, link: &mut Link, name: &str) -> Result<(), LinkError>;
    fn link_set_hardware_addr(&self, link: &Link, hwaddr: MacAddr6) -> Result<(), LinkError>;
    /// Moves the device into the namespace referred to by `fd`.
    fn link_set_ns_fd(&self, link: &Link, fd: RawFd) -> Result<(), LinkError>;
    /// Sets the administrative MAC of VF `vf`, from the PF's side.
    fn link_set_vf_hardware_addr(
        &self,
        pf: &Link,
        vf: u32,
        hwaddr: MacAddr6,
    ) -> Result<(), LinkError>;
    fn link_set_master(&self, link: &Link, master: &Link) -> Result<(), LinkError>;
    fn link_set_no_master(&self, link: &Link) -> Result<(), LinkError>;
    fn bridge_vlan_add(&self, link: &Link, vid: u16, flags: BridgeVlanFlags)
        -> Result<(), LinkError>;
    fn bridge_vlan_del(&self, link: &Link, vid: u16, flags: BridgeVlanFlags)
        -> Result<(), LinkError>;
}

/// Formats a MAC address the way the kernel tools print it (lowercase, colon separated).
pub fn format_mac(mac: &MacAddr6) -> String {
    mac.as_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses a MAC address in any notation accepted by `macaddr`.
pub fn parse_mac(s: &str) -> Result<MacAddr6, macaddr::ParseError> {
    s.trim().parse()
}
