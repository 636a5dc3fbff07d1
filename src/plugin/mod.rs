use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{cache_path, clean_cache, NetConf, DEFAULT_CACHE_DIR};
use crate::manager::Manager;
use crate::netlink::{format_mac, parse_mac, IpRoute, Link, NetlinkManager};
use crate::netns::NetNamespace;
use crate::sriov::{Sysfs, VfMetadata};
use crate::types::{CmdArgs, Interface, Result as CniResult};

/// Steps of ADD that have an inverse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    VfConfig,
    Vf,
    Bridge,
}

/// VF bridge plugin implementation
pub struct VfBridgePlugin<N = IpRoute, S = Sysfs> {
    /// VF and bridge manager
    manager: Manager<N, S>,
    /// Directory holding per-attachment state
    cache_dir: PathBuf,
}

impl VfBridgePlugin {
    /// Create a plugin backed by iproute2 and sysfs
    pub fn new() -> Self {
        Self::with_manager(Manager::new(), DEFAULT_CACHE_DIR)
    }
}

impl Default for VfBridgePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NetlinkManager, S: VfMetadata> VfBridgePlugin<N, S> {
    pub fn with_manager(manager: Manager<N, S>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn manager(&self) -> &Manager<N, S> {
        &self.manager
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Attach the VF to the container and its representor to the bridge
    ///
    /// On failure every completed step is undone, newest first, and the
    /// original error is returned.
    pub fn add_network<NS: NetNamespace>(
        &self,
        conf: &mut NetConf,
        args: &CmdArgs,
        netns: &NS,
    ) -> Result<CniResult> {
        let mut done = Vec::new();
        let mac = match self.attach(conf, args, netns, &mut done) {
            Ok(mac) => mac,
            Err(e) => {
                self.rollback(conf, args, netns, &done);
                return Err(e);
            }
        };

        info!(
            "Attached VF {} ({}) as {} on bridge {}",
            conf.device_id, conf.orig_vf_state.host_if_name, args.ifname, conf.bridge
        );

        let mut result = CniResult::new(&conf.cni_version);
        result.add_interface(Interface {
            name: args.ifname.clone(),
            mac: Some(mac),
            sandbox: Some(args.netns.clone()),
        });
        Ok(result)
    }

    fn attach<NS: NetNamespace>(
        &self,
        conf: &mut NetConf,
        args: &CmdArgs,
        netns: &NS,
        done: &mut Vec<Step>,
    ) -> Result<String> {
        self.manager
            .apply_vf_config(conf)
            .context("Failed to configure VF")?;
        done.push(Step::VfConfig);

        let mac = self
            .manager
            .setup_vf(conf, &args.ifname, &args.container_id, netns)
            .context("Failed to set up VF")?;
        done.push(Step::Vf);

        self.manager
            .add_to_bridge(conf)
            .context("Failed to attach representor to bridge")?;
        done.push(Step::Bridge);

        conf.save_to_cache(&self.cache_path(args))?;

        Ok(mac)
    }

    fn rollback<NS: NetNamespace>(
        &self,
        conf: &NetConf,
        args: &CmdArgs,
        netns: &NS,
        done: &[Step],
    ) {
        for step in done.iter().rev() {
            let undone = match step {
                Step::Bridge => self.manager.del_from_bridge(conf),
                Step::Vf => self
                    .manager
                    .release_vf(conf, &args.ifname, &args.container_id, netns),
                Step::VfConfig => self.manager.reset_vf_config(conf),
            };
            if let Err(e) = undone {
                warn!("Rollback of {:?} for {} failed: {}", step, conf.device_id, e);
            }
        }
    }

    /// Undo a previous ADD using the state it cached
    ///
    /// A missing record means there is nothing left to undo. `netns` is
    /// `None` when the container's namespace is already gone, in which case
    /// the kernel has returned the VF to the host on its own.
    pub fn del_network<NS: NetNamespace>(&self, args: &CmdArgs, netns: Option<&NS>) -> Result<()> {
        let path = self.cache_path(args);
        let conf = match NetConf::load_from_cache(&path)? {
            Some(conf) => conf,
            None => {
                info!(
                    "No cached state for {}/{}, nothing to release",
                    args.container_id, args.ifname
                );
                return Ok(());
            }
        };

        self.manager
            .del_from_bridge(&conf)
            .context("Failed to detach representor from bridge")?;

        // a DEL retried after a later step failed finds the VF already back on the host
        match netns.map(|ns| self.manager.release_vf(&conf, &args.ifname, &args.container_id, ns)) {
            Some(Ok(())) => {}
            Some(Err(e)) if e.is_link_not_found() => {
                info!("Interface {} not found in container, VF already released", args.ifname)
            }
            Some(Err(e)) => return Err(e).context("Failed to release VF"),
            None => info!("Network namespace for {} is gone, skipping VF release", args.container_id),
        }

        self.manager
            .reset_vf_config(&conf)
            .context("Failed to reset VF configuration")?;

        clean_cache(&path)?;

        info!("Released VF {} from {}", conf.device_id, args.container_id);
        Ok(())
    }

    /// Verify that a previous ADD is still in effect
    pub fn check_network<NS: NetNamespace>(&self, args: &CmdArgs, netns: &NS) -> Result<()> {
        let path = self.cache_path(args);
        let conf = NetConf::load_from_cache(&path)?.with_context(|| {
            format!("No cached state for {}/{}", args.container_id, args.ifname)
        })?;

        let link = netns.exec(|| -> Result<Link> {
            self.manager
                .netlink()
                .link_by_name(&args.ifname)
                .with_context(|| format!("Interface {} does not exist in container", args.ifname))
        })?;

        if !link.up {
            anyhow::bail!("Interface {} is not UP", args.ifname);
        }

        if !conf.mac.is_empty() {
            let expected = parse_mac(&conf.mac)
                .with_context(|| format!("Invalid MAC address {} in cached state", conf.mac))?;
            if link.hardware_addr != Some(expected) {
                anyhow::bail!(
                    "Interface {} has MAC {}, expected {}",
                    args.ifname,
                    link.hardware_addr.as_ref().map(format_mac).unwrap_or_default(),
                    conf.mac
                );
            }
        }

        let rep = self
            .manager
            .netlink()
            .link_by_name(&conf.representor)
            .with_context(|| format!("Representor {} does not exist", conf.representor))?;

        if rep.master.as_deref() != Some(conf.bridge.as_str()) {
            anyhow::bail!(
                "Representor {} is not attached to bridge {}",
                conf.representor,
                conf.bridge
            );
        }

        Ok(())
    }

    fn cache_path(&self, args: &CmdArgs) -> PathBuf {
        cache_path(&self.cache_dir, &args.container_id, &args.ifname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrigVfState;
    use crate::manager::fake::*;
    use crate::netlink::VfInfo;
    use crate::sriov::MockVfMetadata;
    use macaddr::MacAddr6;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const REQUESTED_MAC: &str = "00:11:22:33:44:55";

    fn links() -> Vec<Link> {
        vec![
            Link {
                index: 17,
                name: "eth5".to_string(),
                hardware_addr: Some(MacAddr6::new(0x0c, 0x42, 0xa1, 0x00, 0x00, 0x05)),
                ..Default::default()
            },
            Link {
                index: 4,
                name: "pf0".to_string(),
                vfs: (0..4)
                    .map(|id| VfInfo {
                        id,
                        mac: Some(MacAddr6::new(0x02, 0, 0, 0, 0, id as u8)),
                    })
                    .collect(),
                ..Default::default()
            },
            Link {
                index: 2,
                name: "br-sriov".to_string(),
                ..Default::default()
            },
            Link {
                index: 30,
                name: "pf0vf3".to_string(),
                ..Default::default()
            },
        ]
    }

    fn plugin(log: &CallLog) -> (TempDir, VfBridgePlugin<FakeNetlink, MockVfMetadata>) {
        let nlink = links()
            .into_iter()
            .fold(FakeNetlink::new(log.clone()), FakeNetlink::with_link);
        let mut sriov = MockVfMetadata::new();
        sriov
            .expect_vf_representor()
            .returning(|_, _| Ok("pf0vf3".to_string()));
        let dir = tempfile::tempdir().unwrap();
        let plugin = VfBridgePlugin::with_manager(Manager::with_ports(nlink, sriov), dir.path());
        (dir, plugin)
    }

    fn conf(mac: &str) -> NetConf {
        let mut conf = NetConf::new_default("sriov", "0000:03:00.5", "br-sriov", 100);
        conf.mac = mac.to_string();
        conf.master = "pf0".to_string();
        conf.vf_id = 3;
        conf.orig_vf_state = OrigVfState::for_host_interface("eth5");
        conf
    }

    fn args() -> CmdArgs {
        CmdArgs {
            container_id: "cid".to_string(),
            netns: CONTAINER_NS_PATH.to_string(),
            ifname: "net1".to_string(),
            args: HashMap::new(),
            path: "/opt/cni/bin".to_string(),
            stdin_data: Vec::new(),
        }
    }

    #[test]
    fn test_add_network_result_and_cache() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        let mut conf = conf(REQUESTED_MAC);

        let result = plugin.add_network(&mut conf, &args(), &netns).unwrap();

        assert_eq!(
            result.interfaces,
            Some(vec![Interface {
                name: "net1".to_string(),
                mac: Some(REQUESTED_MAC.to_string()),
                sandbox: Some(CONTAINER_NS_PATH.to_string()),
            }])
        );

        let cached = NetConf::load_from_cache(&plugin.cache_path(&args()))
            .unwrap()
            .expect("cache record written");
        assert_eq!(cached, conf);
        assert_eq!(cached.representor, "pf0vf3");
        assert_eq!(cached.cont_if_names, "net1");
        assert_eq!(cached.orig_vf_state.admin_mac, "02:00:00:00:00:03");
        assert_eq!(cached.orig_vf_state.effective_mac, "0c:42:a1:00:00:05");
    }

    #[test]
    fn test_add_network_rolls_back_in_reverse_order() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        plugin
            .manager()
            .netlink()
            .fail_on(|c| matches!(c, Call::SetMaster { link, .. } if link == "pf0vf3"));
        let netns = FakeNs::container(log.clone());
        let mut conf = conf(REQUESTED_MAC);

        let err = plugin.add_network(&mut conf, &args(), &netns).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to attach representor to bridge"));

        let released = position(&log, |c| *c == Call::SetName { from: "net1".into(), to: "eth5".into() });
        let reset = position(&log, |c| {
            *c == Call::SetVfHardwareAddr { pf: "pf0".into(), vf: 3, mac: "02:00:00:00:00:03".into() }
        });
        assert!(released < reset, "VF must be released before its config is reset");

        let vf = plugin.manager().netlink().link("eth5").expect("VF back on host");
        assert_eq!(vf.hardware_addr, Some(MacAddr6::new(0x0c, 0x42, 0xa1, 0x00, 0x00, 0x05)));
        assert!(plugin.manager().netlink().link("net1").is_none());
        assert!(!plugin.cache_path(&args()).exists());
    }

    #[test]
    fn test_add_network_setup_failure_only_resets_config() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        plugin
            .manager()
            .netlink()
            .fail_on(|c| matches!(c, Call::SetNsFd { .. }));
        let netns = FakeNs::container(log.clone());

        assert!(plugin.add_network(&mut conf(REQUESTED_MAC), &args(), &netns).is_err());

        assert_eq!(count(&log, |c| matches!(c, Call::EnterNs(_))), 0);
        assert_eq!(count(&log, |c| matches!(c, Call::SetVfHardwareAddr { .. })), 2);
        assert_eq!(count(&log, |c| matches!(c, Call::SetNoMaster(_))), 0);
    }

    #[test]
    fn test_add_network_apply_failure_has_nothing_to_undo() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        let mut conf = conf(REQUESTED_MAC);
        conf.vf_id = 7;

        assert!(plugin.add_network(&mut conf, &args(), &netns).is_err());
        assert_eq!(*log.borrow(), vec![Call::LinkByName("pf0".into())]);
    }

    #[test]
    fn test_del_network_undoes_add() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        plugin.add_network(&mut conf(REQUESTED_MAC), &args(), &netns).unwrap();
        log.borrow_mut().clear();

        plugin.del_network(&args(), Some(&netns)).unwrap();

        let detach = position(&log, |c| *c == Call::SetNoMaster("pf0vf3".into()));
        let enter = position(&log, |c| matches!(c, Call::EnterNs(_)));
        let reset = position(&log, |c| matches!(c, Call::SetVfHardwareAddr { .. }));
        assert!(detach < enter && enter < reset);

        let nlink = plugin.manager().netlink();
        assert!(nlink.link("eth5").is_some());
        assert!(nlink.link("pf0vf3").unwrap().master.is_none());
        assert_eq!(nlink.link("pf0").unwrap().master.as_deref(), Some("br-sriov"));
        assert!(!plugin.cache_path(&args()).exists());
    }

    #[test]
    fn test_del_network_without_cache_is_noop() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());

        plugin.del_network(&args(), Some(&netns)).unwrap();
        plugin.del_network::<FakeNs>(&args(), None).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_del_network_retry_after_partial_del() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        plugin.add_network(&mut conf(REQUESTED_MAC), &args(), &netns).unwrap();
        plugin
            .manager()
            .netlink()
            .fail_once(|c| matches!(c, Call::SetVfHardwareAddr { .. }));

        let err = plugin.del_network(&args(), Some(&netns)).unwrap_err();
        assert!(err.to_string().contains("Failed to reset VF configuration"));
        assert!(plugin.cache_path(&args()).exists());
        assert!(plugin.manager().netlink().link("eth5").is_some());

        plugin.del_network(&args(), Some(&netns)).unwrap();

        let pf = plugin.manager().netlink().link("pf0").unwrap();
        assert_eq!(
            pf.vf(3).and_then(|vf| vf.mac),
            Some(MacAddr6::new(0x02, 0, 0, 0, 0, 3))
        );
        assert!(!plugin.cache_path(&args()).exists());
    }

    #[test]
    fn test_del_network_release_failure_is_reported() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        plugin.add_network(&mut conf(REQUESTED_MAC), &args(), &netns).unwrap();
        plugin
            .manager()
            .netlink()
            .fail_on(|c| *c == Call::LinkByName("net1".into()));

        let err = plugin.del_network(&args(), Some(&netns)).unwrap_err();
        assert!(err.to_string().contains("Failed to release VF"));
        assert!(plugin.cache_path(&args()).exists());
    }

    #[test]
    fn test_del_network_with_namespace_gone_skips_release() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        plugin.add_network(&mut conf(REQUESTED_MAC), &args(), &netns).unwrap();
        log.borrow_mut().clear();

        plugin.del_network::<FakeNs>(&args(), None).unwrap();

        assert_eq!(count(&log, |c| matches!(c, Call::EnterNs(_))), 0);
        assert_eq!(count(&log, |c| matches!(c, Call::SetVfHardwareAddr { .. })), 1);
        assert!(!plugin.cache_path(&args()).exists());
    }

    #[test]
    fn test_check_network() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        plugin.add_network(&mut conf(REQUESTED_MAC), &args(), &netns).unwrap();

        plugin.check_network(&args(), &netns).unwrap();

        let rep = plugin.manager().netlink().link("pf0vf3").unwrap();
        plugin.manager().netlink().link_set_no_master(&rep).unwrap();
        let err = plugin.check_network(&args(), &netns).unwrap_err();
        assert!(err.to_string().contains("not attached to bridge br-sriov"));
    }

    #[test]
    fn test_check_network_detects_interface_down() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        plugin.add_network(&mut conf(""), &args(), &netns).unwrap();

        let vf = plugin.manager().netlink().link("net1").unwrap();
        plugin.manager().netlink().link_set_down(&vf).unwrap();

        let err = plugin.check_network(&args(), &netns).unwrap_err();
        assert_eq!(err.to_string(), "Interface net1 is not UP");
    }

    #[test]
    fn test_check_network_without_cache() {
        let log = CallLog::default();
        let (_dir, plugin) = plugin(&log);
        let netns = FakeNs::container(log.clone());
        let err = plugin.check_network(&args(), &netns).unwrap_err();
        assert!(err.to_string().contains("No cached state for cid/net1"));
    }
}
