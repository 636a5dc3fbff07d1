//! Recording doubles for the device-control port and namespace handle.
//!
//! Every call lands in a shared [`CallLog`] so tests can assert on ordering
//! across devices and namespace switches.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use macaddr::MacAddr6;
use nix::errno::Errno;

use crate::netlink::{format_mac, BridgeVlanFlags, Link, LinkError, NetlinkManager, VfInfo};
use crate::netns::{NetNamespace, NsError, THREAD_NETNS_PATH};

pub const HOST_NS_FD: RawFd = 3;
pub const CONTAINER_NS_FD: RawFd = 42;
pub const CONTAINER_NS_PATH: &str = "/var/run/netns/cni-test";

pub type CallLog = Rc<RefCell<Vec<Call>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LinkByName(String),
    SetUp(String),
    SetDown(String),
    SetName { from: String, to: String },
    SetHardwareAddr { link: String, mac: String },
    SetNsFd { link: String, fd: RawFd },
    SetVfHardwareAddr { pf: String, vf: u32, mac: String },
    SetMaster { link: String, master: String },
    SetNoMaster(String),
    BridgeVlanAdd { link: String, vid: u16, flags: BridgeVlanFlags },
    BridgeVlanDel { link: String, vid: u16, flags: BridgeVlanFlags },
    EnterNs(PathBuf),
    LeaveNs(PathBuf),
}

type FailurePredicate = Box<dyn Fn(&Call) -> bool>;

/// In-memory device table that records every call made against it.
pub struct FakeNetlink {
    log: CallLog,
    links: RefCell<HashMap<String, Link>>,
    failures: RefCell<Vec<FailurePredicate>>,
}

impl FakeNetlink {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            links: RefCell::new(HashMap::new()),
            failures: RefCell::new(Vec::new()),
        }
    }

    pub fn with_link(self, link: Link) -> Self {
        self.links.borrow_mut().insert(link.name.clone(), link);
        self
    }

    /// Makes every call matching `pred` fail with a kernel-style error.
    pub fn fail_on(&self, pred: impl Fn(&Call) -> bool + 'static) {
        self.failures.borrow_mut().push(Box::new(pred));
    }

    /// Like [`FakeNetlink::fail_on`], but only the first matching call fails.
    pub fn fail_once(&self, pred: impl Fn(&Call) -> bool + 'static) {
        let fired = Cell::new(false);
        self.fail_on(move |call| {
            if fired.get() || !pred(call) {
                return false;
            }
            fired.set(true);
            true
        });
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.links.borrow().get(name).cloned()
    }

    fn record(&self, call: Call) -> Result<(), LinkError> {
        let failed = self.failures.borrow().iter().any(|pred| pred(&call));
        let command = format!("{:?}", call);
        self.log.borrow_mut().push(call);
        if failed {
            return Err(LinkError::Rejected {
                command,
                code: 2,
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        Ok(())
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Link)) {
        if let Some(link) = self.links.borrow_mut().get_mut(name) {
            f(link);
        }
    }
}

impl NetlinkManager for FakeNetlink {
    fn link_by_name(&self, name: &str) -> Result<Link, LinkError> {
        self.record(Call::LinkByName(name.to_string()))?;
        self.link(name)
            .ok_or_else(|| LinkError::NotFound(name.to_string()))
    }

    fn link_set_up(&self, link: &Link) -> Result<(), LinkError> {
        self.record(Call::SetUp(link.name.clone()))?;
        self.update(&link.name, |l| l.up = true);
        Ok(())
    }

    fn link_set_down(&self, link: &Link) -> Result<(), LinkError> {
        self.record(Call::SetDown(link.name.clone()))?;
        self.update(&link.name, |l| l.up = false);
        Ok(())
    }

    fn link_set_name(&self, link: &mut Link, name: &str) -> Result<(), LinkError> {
        self.record(Call::SetName {
            from: link.name.clone(),
            to: name.to_string(),
        })?;
        let mut links = self.links.borrow_mut();
        if let Some(mut stored) = links.remove(&link.name) {
            stored.name = name.to_string();
            links.insert(name.to_string(), stored);
        }
        link.name = name.to_string();
        Ok(())
    }

    fn link_set_hardware_addr(&self, link: &Link, hwaddr: MacAddr6) -> Result<(), LinkError> {
        self.record(Call::SetHardwareAddr {
            link: link.name.clone(),
            mac: format_mac(&hwaddr),
        })?;
        self.update(&link.name, |l| l.hardware_addr = Some(hwaddr));
        Ok(())
    }

    fn link_set_ns_fd(&self, link: &Link, fd: RawFd) -> Result<(), LinkError> {
        self.record(Call::SetNsFd {
            link: link.name.clone(),
            fd,
        })
    }

    fn link_set_vf_hardware_addr(
        &self,
        pf: &Link,
        vf: u32,
        hwaddr: MacAddr6,
    ) -> Result<(), LinkError> {
        self.record(Call::SetVfHardwareAddr {
            pf: pf.name.clone(),
            vf,
            mac: format_mac(&hwaddr),
        })?;
        self.update(&pf.name, |l| {
            if let Some(entry) = l.vfs.iter_mut().find(|e| e.id == vf) {
                *entry = VfInfo {
                    id: vf,
                    mac: Some(hwaddr),
                };
            }
        });
        Ok(())
    }

    fn link_set_master(&self, link: &Link, master: &Link) -> Result<(), LinkError> {
        self.record(Call::SetMaster {
            link: link.name.clone(),
            master: master.name.clone(),
        })?;
        self.update(&link.name, |l| l.master = Some(master.name.clone()));
        Ok(())
    }

    fn link_set_no_master(&self, link: &Link) -> Result<(), LinkError> {
        self.record(Call::SetNoMaster(link.name.clone()))?;
        self.update(&link.name, |l| l.master = None);
        Ok(())
    }

    fn bridge_vlan_add(
        &self,
        link: &Link,
        vid: u16,
        flags: BridgeVlanFlags,
    ) -> Result<(), LinkError> {
        self.record(Call::BridgeVlanAdd {
            link: link.name.clone(),
            vid,
            flags,
        })
    }

    fn bridge_vlan_del(
        &self,
        link: &Link,
        vid: u16,
        flags: BridgeVlanFlags,
    ) -> Result<(), LinkError> {
        self.record(Call::BridgeVlanDel {
            link: link.name.clone(),
            vid,
            flags,
        })
    }
}

/// Namespace double; entering and leaving show up in the call log.
pub struct FakeNs {
    path: PathBuf,
    fd: RawFd,
    log: CallLog,
    enter_error: Option<Errno>,
}

impl FakeNs {
    pub fn container(log: CallLog) -> Self {
        Self {
            path: PathBuf::from(CONTAINER_NS_PATH),
            fd: CONTAINER_NS_FD,
            log,
            enter_error: None,
        }
    }

    /// A namespace that refuses to be entered.
    pub fn unenterable(log: CallLog, errno: Errno) -> Self {
        Self {
            enter_error: Some(errno),
            ..Self::container(log)
        }
    }
}

impl NetNamespace for FakeNs {
    type Guard = FakeNsGuard;

    fn current() -> Result<Self, NsError> {
        Ok(Self {
            path: PathBuf::from(THREAD_NETNS_PATH),
            fd: HOST_NS_FD,
            log: CallLog::default(),
            enter_error: None,
        })
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> Result<FakeNsGuard, NsError> {
        if let Some(error) = self.enter_error {
            return Err(NsError::Enter {
                path: self.path.clone(),
                error,
            });
        }
        self.log.borrow_mut().push(Call::EnterNs(self.path.clone()));
        Ok(FakeNsGuard {
            path: self.path.clone(),
            log: Rc::clone(&self.log),
        })
    }
}

pub struct FakeNsGuard {
    path: PathBuf,
    log: CallLog,
}

impl Drop for FakeNsGuard {
    fn drop(&mut self) {
        self.log.borrow_mut().push(Call::LeaveNs(self.path.clone()));
    }
}

/// Position of the first call matching `pred`, panicking with the log if absent.
pub fn position(log: &CallLog, pred: impl Fn(&Call) -> bool) -> usize {
    let calls = log.borrow();
    calls
        .iter()
        .position(|c| pred(c))
        .unwrap_or_else(|| panic!("expected call not found in {:#?}", calls))
}

pub fn count(log: &CallLog, pred: impl Fn(&Call) -> bool) -> usize {
    log.borrow().iter().filter(|c| pred(c)).count()
}
