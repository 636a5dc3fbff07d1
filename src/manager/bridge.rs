//! Bridge attachment for the uplink PF and the VF representor.

use tracing::{info, warn};

use super::{Error, Manager, Result};
use crate::config::NetConf;
use crate::netlink::{BridgeVlanFlags, Link, NetlinkManager};
use crate::sriov::VfMetadata;

/// Representor VLAN: native and untagged on egress, on this bridge port only.
pub const REPRESENTOR_VLAN_FLAGS: BridgeVlanFlags = BridgeVlanFlags {
    pvid: true,
    untagged: true,
    self_: false,
    master: true,
};

impl<N: NetlinkManager, S: VfMetadata> Manager<N, S> {
    /// Attaches the PF and the VF's representor to `conf.bridge` and brings the bridge up.
    ///
    /// The PF goes first so the representor joins a forwarding domain that
    /// already contains the uplink. If the representor cannot be fully
    /// configured it is detached again; the PF attachment is left in place.
    pub fn add_to_bridge(&self, conf: &mut NetConf) -> Result<()> {
        let bridge = self
            .nlink
            .link_by_name(&conf.bridge)
            .map_err(Error::lookup("bridge", &conf.bridge))?;

        self.add_pf_to_bridge(&bridge, conf)?;
        self.add_representor_to_bridge(&bridge, conf)?;

        self.nlink
            .link_set_up(&bridge)
            .map_err(Error::link_op("set up bridge", &conf.bridge))
    }

    fn add_pf_to_bridge(&self, bridge: &Link, conf: &NetConf) -> Result<()> {
        let pf = self
            .nlink
            .link_by_name(&conf.master)
            .map_err(Error::lookup("pf", &conf.master))?;

        self.nlink
            .link_set_master(&pf, bridge)
            .map_err(Error::link_op("add to bridge PF", &conf.master))?;

        self.nlink
            .link_set_up(&pf)
            .map_err(Error::link_op("set up PF", &conf.master))
    }

    fn add_representor_to_bridge(&self, bridge: &Link, conf: &mut NetConf) -> Result<()> {
        conf.representor = self
            .sriov
            .vf_representor(&conf.master, conf.vf_id)
            .map_err(|error| Error::Representor {
                pf: conf.master.clone(),
                vf: conf.vf_id,
                error,
            })?;

        let rep = self
            .nlink
            .link_by_name(&conf.representor)
            .map_err(Error::lookup("representor", &conf.representor))?;

        info!("Attaching rep {} to the bridge {}", conf.representor, conf.bridge);

        self.nlink
            .link_set_master(&rep, bridge)
            .map_err(Error::link_op("add to bridge representor", &conf.representor))?;

        if let Err(e) = self.configure_representor(&rep, conf) {
            if let Err(detach) = self.nlink.link_set_no_master(&rep) {
                warn!(
                    representor = %conf.representor,
                    error = %detach,
                    "Failed to detach representor after error"
                );
            }
            return Err(e);
        }

        Ok(())
    }

    /// VLAN before link up, so no untagged frame is forwarded in between.
    fn configure_representor(&self, rep: &Link, conf: &NetConf) -> Result<()> {
        if conf.vlan != 0 {
            self.nlink
                .bridge_vlan_add(rep, conf.vlan, REPRESENTOR_VLAN_FLAGS)
                .map_err(Error::link_op("set VLAN for representor", &conf.representor))?;
        }

        self.nlink
            .link_set_up(rep)
            .map_err(Error::link_op("set up representor", &conf.representor))
    }

    /// Takes the representor down and off the bridge. The PF stays attached.
    pub fn del_from_bridge(&self, conf: &NetConf) -> Result<()> {
        let rep = self
            .nlink
            .link_by_name(&conf.representor)
            .map_err(Error::lookup("representor", &conf.representor))?;

        self.nlink
            .link_set_down(&rep)
            .map_err(Error::link_op("set down representor", &conf.representor))?;

        info!("Detaching rep {} from the bridge {}", conf.representor, conf.bridge);

        self.nlink
            .link_set_no_master(&rep)
            .map_err(Error::link_op("detach from bridge representor", &conf.representor))
    }
}
