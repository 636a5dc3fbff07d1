//! VF lifecycle management.
//!
//! [`Manager`] sequences device-control calls to move a VF between the host
//! and a container namespace and to apply or restore its identity. Each step
//! either succeeds or aborts the whole operation with an error naming the
//! step and the device. Earlier steps are not undone here; the plugin layer
//! decides what to roll back.
//!
//! The [`NetConf`] passed in is owned by the caller and only borrowed for the
//! duration of a call.

mod bridge;
mod error;
#[cfg(test)]
pub(crate) mod fake;

use tracing::info;

use crate::config::NetConf;
use crate::netlink::{format_mac, parse_mac, IpRoute, NetlinkManager};
use crate::netns::NetNamespace;
use crate::sriov::{Sysfs, VfMetadata};

pub use error::{Error, Result};

/// Prefix of the transient name a VF carries while it changes namespace.
pub const TEMP_NAME_PREFIX: &str = "temp_";

/// Orchestrates VF and representor configuration through the two ports.
#[derive(Debug, Clone)]
pub struct Manager<N = IpRoute, S = Sysfs> {
    nlink: N,
    sriov: S,
}

impl Manager {
    /// Manager wired to iproute2 and the host's sysfs
    pub fn new() -> Self {
        Self::with_ports(IpRoute::new(), Sysfs::new())
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NetlinkManager, S: VfMetadata> Manager<N, S> {
    pub fn with_ports(nlink: N, sriov: S) -> Self {
        Self { nlink, sriov }
    }

    pub fn netlink(&self) -> &N {
        &self.nlink
    }

    pub fn metadata(&self) -> &S {
        &self.sriov
    }

    /// Moves the VF into `netns` as `pod_if_name` and brings it up.
    ///
    /// Returns the MAC the container will see: the requested one if
    /// `conf.mac` is set, otherwise the device's current address.
    pub fn setup_vf<NS: NetNamespace>(
        &self,
        conf: &mut NetConf,
        pod_if_name: &str,
        container_id: &str,
        netns: &NS,
    ) -> Result<String> {
        let link_name = conf.orig_vf_state.host_if_name.clone();
        let mut link = self
            .nlink
            .link_by_name(&link_name)
            .map_err(Error::lookup("vf", &link_name))?;

        // unique host-wide, so it can't clash on either side of the move
        let temp_name = format!("{}{}", TEMP_NAME_PREFIX, link.index);

        self.nlink
            .link_set_down(&link)
            .map_err(Error::link_op("set down vf device", &link_name))?;

        self.nlink
            .link_set_name(&mut link, &temp_name)
            .map_err(Error::link_op("set temporary name on", &link_name))?;

        let mut mac_address = link
            .hardware_addr
            .as_ref()
            .map(format_mac)
            .unwrap_or_default();

        if !conf.mac.is_empty() {
            let hwaddr = parse_mac(&conf.mac).map_err(Error::invalid_mac(&conf.mac))?;

            conf.orig_vf_state.effective_mac = mac_address;

            self.nlink
                .link_set_hardware_addr(&link, hwaddr)
                .map_err(Error::link_op("set MAC address on", &temp_name))?;
            mac_address = conf.mac.clone();
        }

        self.nlink
            .link_set_ns_fd(&link, netns.fd())
            .map_err(Error::link_op("move to container netns", &temp_name))?;

        netns
            .exec(|| -> Result<()> {
                self.nlink
                    .link_set_name(&mut link, pod_if_name)
                    .map_err(Error::link_op("set container interface name on", &temp_name))?;

                self.nlink
                    .link_set_up(&link)
                    .map_err(Error::link_op("bring up container interface", pod_if_name))
            })
            .map_err(|e| Error::ContainerSetup(Box::new(e)))?;

        conf.cont_if_names = pod_if_name.to_string();

        info!(
            container_id,
            vf = %link_name,
            ifname = pod_if_name,
            netns = %netns.path().display(),
            "Moved VF into container namespace"
        );

        Ok(mac_address)
    }

    /// Returns the VF from `netns` to the host under its original name and MAC.
    pub fn release_vf<NS: NetNamespace>(
        &self,
        conf: &NetConf,
        pod_if_name: &str,
        container_id: &str,
        netns: &NS,
    ) -> Result<()> {
        let host_name = &conf.orig_vf_state.host_if_name;
        if conf.cont_if_names.is_empty() || host_name.is_empty() {
            return Err(Error::NameMismatch {
                container: conf.cont_if_names.clone(),
                host: host_name.clone(),
            });
        }

        let init_ns = NS::current()?;

        netns.exec(|| -> Result<()> {
            let mut link = self
                .nlink
                .link_by_name(pod_if_name)
                .map_err(Error::lookup("vf", pod_if_name))?;

            self.nlink
                .link_set_down(&link)
                .map_err(Error::link_op("set down", pod_if_name))?;

            self.nlink
                .link_set_name(&mut link, host_name)
                .map_err(Error::link_op("restore host name on", pod_if_name))?;

            if !conf.mac.is_empty() {
                let effective_mac = &conf.orig_vf_state.effective_mac;
                let hwaddr =
                    parse_mac(effective_mac).map_err(Error::invalid_mac(effective_mac))?;

                self.nlink
                    .link_set_hardware_addr(&link, hwaddr)
                    .map_err(Error::link_op("restore effective MAC address on", host_name))?;
            }

            self.nlink
                .link_set_ns_fd(&link, init_ns.fd())
                .map_err(Error::link_op("move to host netns", host_name))
        })?;

        info!(
            container_id,
            ifname = pod_if_name,
            vf = %host_name,
            "Returned VF to host namespace"
        );

        Ok(())
    }

    /// Records the VF's administrative MAC and applies the requested one at the PF.
    pub fn apply_vf_config(&self, conf: &mut NetConf) -> Result<()> {
        let pf = self
            .nlink
            .link_by_name(&conf.master)
            .map_err(Error::lookup("master", &conf.master))?;

        // the VF table is small, a scan is fine
        let vf = pf.vf(conf.vf_id).ok_or_else(|| Error::VfNotFound {
            pf: conf.master.clone(),
            vf: conf.vf_id,
        })?;

        if conf.orig_vf_state.admin_mac.is_empty() {
            conf.orig_vf_state.admin_mac = vf.mac.as_ref().map(format_mac).unwrap_or_default();
        }

        if !conf.mac.is_empty() {
            let hwaddr = parse_mac(&conf.mac).map_err(Error::invalid_mac(&conf.mac))?;
            self.nlink
                .link_set_vf_hardware_addr(&pf, conf.vf_id, hwaddr)
                .map_err(Error::link_op("set VF MAC address on", &conf.master))?;
        }

        Ok(())
    }

    /// Restores the administrative MAC recorded by [`Manager::apply_vf_config`].
    pub fn reset_vf_config(&self, conf: &NetConf) -> Result<()> {
        let pf = self
            .nlink
            .link_by_name(&conf.master)
            .map_err(Error::lookup("master", &conf.master))?;

        if !conf.mac.is_empty() {
            let admin_mac = &conf.orig_vf_state.admin_mac;
            let hwaddr = parse_mac(admin_mac).map_err(Error::invalid_mac(admin_mac))?;
            self.nlink
                .link_set_vf_hardware_addr(&pf, conf.vf_id, hwaddr)
                .map_err(Error::link_op("restore VF administrative MAC on", &conf.master))?;
        }

        Ok(())
    }
}
