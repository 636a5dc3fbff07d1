//! [`NetlinkManager`] backed by the iproute2 tools.
//!
//! Each port call runs exactly one `ip` or `bridge` invocation. The child
//! process inherits the calling thread's network namespace, so calls made
//! while a namespace guard is held act inside that namespace.

use std::os::unix::io::RawFd;
use std::process::Command;

use macaddr::MacAddr6;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{format_mac, parse_mac, BridgeVlanFlags, Link, LinkError, NetlinkManager, VfInfo};

/// The `ip` binary, resolved through `PATH`.
pub const IP_CMD: &str = "ip";

/// The `bridge` binary, resolved through `PATH`.
pub const BRIDGE_CMD: &str = "bridge";

/// Production device-control adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpRoute;

impl IpRoute {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String, LinkError> {
        let command = render(program, args);
        debug!(command = %command, "Executing");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|error| LinkError::Exec {
                command: command.clone(),
                error,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %command, stderr = %stderr, "Command failed");
            return Err(LinkError::Rejected {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn ip(&self, args: Vec<String>) -> Result<(), LinkError> {
        self.run(IP_CMD, &args).map(|_| ())
    }
}

impl NetlinkManager for IpRoute {
    fn link_by_name(&self, name: &str) -> Result<Link, LinkError> {
        let args = show_link_args(name);
        let stdout = match self.run(IP_CMD, &args) {
            Ok(stdout) => stdout,
            Err(LinkError::Rejected { stderr, .. }) if stderr.contains("does not exist") => {
                return Err(LinkError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e),
        };

        parse_link_dump(&render(IP_CMD, &args), &stdout)?
            .ok_or_else(|| LinkError::NotFound(name.to_string()))
    }

    fn link_set_up(&self, link: &Link) -> Result<(), LinkError> {
        self.ip(set_state_args(&link.name, true))
    }

    fn link_set_down(&self, link: &Link) -> Result<(), LinkError> {
        self.ip(set_state_args(&link.name, false))
    }

    fn link_set_name(&self, link: &mut Link, name: &str) -> Result<(), LinkError> {
        self.ip(set_link_args(&link.name, &["name", name]))?;
        link.name = name.to_string();
        Ok(())
    }

    fn link_set_hardware_addr(&self, link: &Link, hwaddr: MacAddr6) -> Result<(), LinkError> {
        self.ip(set_link_args(&link.name, &["address", &format_mac(&hwaddr)]))
    }

    fn link_set_ns_fd(&self, link: &Link, fd: RawFd) -> Result<(), LinkError> {
        self.ip(set_link_args(&link.name, &["netns", &fd_path(fd)]))
    }

    fn link_set_vf_hardware_addr(
        &self,
        pf: &Link,
        vf: u32,
        hwaddr: MacAddr6,
    ) -> Result<(), LinkError> {
        self.ip(set_link_args(
            &pf.name,
            &["vf", &vf.to_string(), "mac", &format_mac(&hwaddr)],
        ))
    }

    fn link_set_master(&self, link: &Link, master: &Link) -> Result<(), LinkError> {
        self.ip(set_link_args(&link.name, &["master", &master.name]))
    }

    fn link_set_no_master(&self, link: &Link) -> Result<(), LinkError> {
        self.ip(set_link_args(&link.name, &["nomaster"]))
    }

    fn bridge_vlan_add(
        &self,
        link: &Link,
        vid: u16,
        flags: BridgeVlanFlags,
    ) -> Result<(), LinkError> {
        self.run(BRIDGE_CMD, &bridge_vlan_args("add", &link.name, vid, flags))
            .map(|_| ())
    }

    fn bridge_vlan_del(
        &self,
        link: &Link,
        vid: u16,
        flags: BridgeVlanFlags,
    ) -> Result<(), LinkError> {
        self.run(BRIDGE_CMD, &bridge_vlan_args("del", &link.name, vid, flags))
            .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    vfinfo_list: Vec<IpVfJson>,
}

#[derive(Debug, Deserialize)]
struct IpVfJson {
    vf: u32,
    // older iproute2 releases print the VF address as "mac"
    #[serde(default, alias = "mac")]
    address: Option<String>,
}

impl From<IpLinkJson> for Link {
    fn from(raw: IpLinkJson) -> Self {
        Link {
            index: raw.ifindex,
            up: raw.flags.iter().any(|f| f == "UP"),
            hardware_addr: raw.address.as_deref().and_then(|a| parse_mac(a).ok()),
            master: raw.master,
            vfs: raw
                .vfinfo_list
                .into_iter()
                .map(|vf| VfInfo {
                    id: vf.vf,
                    mac: vf.address.as_deref().and_then(|a| parse_mac(a).ok()),
                })
                .collect(),
            name: raw.ifname,
        }
    }
}

/// Decodes the output of `ip -j link show dev NAME`.
fn parse_link_dump(command: &str, stdout: &str) -> Result<Option<Link>, LinkError> {
    let links: Vec<IpLinkJson> =
        serde_json::from_str(stdout).map_err(|error| LinkError::Decode {
            command: command.to_string(),
            error,
        })?;
    Ok(links.into_iter().next().map(Link::from))
}

fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Path through which another process can open one of our descriptors.
fn fd_path(fd: RawFd) -> String {
    format!("/proc/{}/fd/{}", std::process::id(), fd)
}

fn show_link_args(name: &str) -> Vec<String> {
    ["-j", "link", "show", "dev", name]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn set_link_args(name: &str, rest: &[&str]) -> Vec<String> {
    ["link", "set", "dev", name]
        .iter()
        .chain(rest.iter())
        .map(|s| s.to_string())
        .collect()
}

fn set_state_args(name: &str, up: bool) -> Vec<String> {
    set_link_args(name, &[if up { "up" } else { "down" }])
}

fn bridge_vlan_args(action: &str, name: &str, vid: u16, flags: BridgeVlanFlags) -> Vec<String> {
    let mut args: Vec<String> = ["vlan", action, "dev", name, "vid"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(vid.to_string());
    for (set, word) in [
        (flags.pvid, "pvid"),
        (flags.untagged, "untagged"),
        (flags.self_, "self"),
        (flags.master, "master"),
    ] {
        if set {
            args.push(word.to_string());
        }
    }
    args
}
