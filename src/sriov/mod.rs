//! SR-IOV topology lookups.
//!
//! [`VfMetadata`] answers questions about a VF's identity on the host: its
//! representor, its PCI address, its netdev names. The [`Sysfs`] adapter reads
//! them from `/sys`; it keeps no state between calls.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Default sysfs mount point.
pub const SYSFS_ROOT: &str = "/sys";

const PHYS_SWITCH_ID: &str = "phys_switch_id";
const PHYS_PORT_NAME: &str = "phys_port_name";
const SRIOV_NUMVFS: &str = "sriov_numvfs";
const VIRTFN_PREFIX: &str = "virtfn";

/// Switchdev representor port names: `pf0vf3`, or `c1pf0vf3` on multi-host adapters.
static VF_PORT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:c\d+)?pf(\d+)vf(\d+)$").expect("Invalid regex pattern"));

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read {path}: {error}")]
    Io {
        path: PathBuf,
        error: io::Error,
    },

    #[error("unexpected content in {path}: {value:?}")]
    Parse { path: PathBuf, value: String },

    #[error("{0}")]
    NotFound(String),
}

/// Host-side VF topology queries.
#[cfg_attr(test, mockall::automock)]
pub trait VfMetadata {
    /// Name of the representor netdev for VF `vf` of uplink `pf`.
    fn vf_representor(&self, pf: &str, vf: u32) -> Result<String, MetadataError>;

    /// Number of VFs currently enabled on `pf`.
    fn sriov_num_vfs(&self, pf: &str) -> Result<u32, MetadataError>;

    /// Netdev names of VF `vf` of `pf`, as seen from the host namespace.
    fn vf_link_names(&self, pf: &str, vf: u32) -> Result<Vec<String>, MetadataError>;

    /// PCI address of VF `vf` of `pf`.
    fn vf_pci_address(&self, pf: &str, vf: u32) -> Result<String, MetadataError>;

    /// Netdev name of the PF owning the VF at `vf_pci`.
    fn pf_name(&self, vf_pci: &str) -> Result<String, MetadataError>;

    /// Index of the VF at `vf_pci` on `pf`.
    fn vf_id(&self, vf_pci: &str, pf: &str) -> Result<u32, MetadataError>;

    /// Netdev names bound to the PCI function at `pci`.
    fn link_names_for_pci(&self, pci: &str) -> Result<Vec<String>, MetadataError>;
}

/// Sysfs-backed [`VfMetadata`].
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Sysfs {
    pub fn new() -> Self {
        Self::with_root(SYSFS_ROOT)
    }

    /// Reads from a sysfs tree mounted (or faked) at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn net_dir(&self, ifname: &str) -> PathBuf {
        self.root.join("class/net").join(ifname)
    }

    fn pci_dir(&self, pci: &str) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci)
    }

    fn virtfn(&self, pf: &str, vf: u32) -> PathBuf {
        self.net_dir(pf)
            .join("device")
            .join(format!("{}{}", VIRTFN_PREFIX, vf))
    }

    /// PCI function number of the device behind `ifname` (the `N` in `dddd:bb:dd.N`).
    fn pci_function(&self, ifname: &str) -> Result<u32, MetadataError> {
        let path = self.net_dir(ifname).join("device");
        let pci = link_basename(&path)?;
        let function = pci.rsplit('.').next().and_then(|f| f.parse().ok());
        function.ok_or(MetadataError::Parse { path, value: pci })
    }
}

impl VfMetadata for Sysfs {
    fn vf_representor(&self, pf: &str, vf: u32) -> Result<String, MetadataError> {
        let switch_id = read_trimmed(&self.net_dir(pf).join(PHYS_SWITCH_ID))
            .ok()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                MetadataError::NotFound(format!("cannot get uplink {} switch id", pf))
            })?;

        // only needed for `pfXvfY` port names; candidates are skipped without it
        let pf_function = self.pci_function(pf).ok();

        let net_dir = self.root.join("class/net");
        for device in list_dir(&net_dir)? {
            let dev_dir = net_dir.join(&device);
            match read_trimmed(&dev_dir.join(PHYS_SWITCH_ID)) {
                Ok(id) if id == switch_id => {}
                _ => continue,
            }
            let Ok(port_name) = read_trimmed(&dev_dir.join(PHYS_PORT_NAME)) else {
                continue;
            };
            let Some((pf_index, vf_index)) = parse_port_name(&port_name) else {
                continue;
            };
            if pf_index.is_some() && pf_index != pf_function {
                continue;
            }
            if vf_index == vf {
                return Ok(device);
            }
        }

        Err(MetadataError::NotFound(format!(
            "failed to find VF {} representor for uplink {}",
            vf, pf
        )))
    }

    fn sriov_num_vfs(&self, pf: &str) -> Result<u32, MetadataError> {
        let path = self.net_dir(pf).join("device").join(SRIOV_NUMVFS);
        let value = read_trimmed(&path)?;
        value
            .parse()
            .map_err(|_| MetadataError::Parse { path, value })
    }

    fn vf_link_names(&self, pf: &str, vf: u32) -> Result<Vec<String>, MetadataError> {
        list_dir(&self.virtfn(pf, vf).join("net"))
    }

    fn vf_pci_address(&self, pf: &str, vf: u32) -> Result<String, MetadataError> {
        link_basename(&self.virtfn(pf, vf))
    }

    fn pf_name(&self, vf_pci: &str) -> Result<String, MetadataError> {
        list_dir(&self.pci_dir(vf_pci).join("physfn/net"))?
            .into_iter()
            .next()
            .ok_or_else(|| MetadataError::NotFound(format!("no PF netdev for VF {}", vf_pci)))
    }

    fn vf_id(&self, vf_pci: &str, pf: &str) -> Result<u32, MetadataError> {
        let device_dir = self.net_dir(pf).join("device");
        for entry in list_dir(&device_dir)? {
            let Some(index) = entry.strip_prefix(VIRTFN_PREFIX) else {
                continue;
            };
            let Ok(index) = index.parse::<u32>() else {
                continue;
            };
            if link_basename(&device_dir.join(&entry))? == vf_pci {
                return Ok(index);
            }
        }
        Err(MetadataError::NotFound(format!(
            "VF {} not found on PF {}",
            vf_pci, pf
        )))
    }

    fn link_names_for_pci(&self, pci: &str) -> Result<Vec<String>, MetadataError> {
        list_dir(&self.pci_dir(pci).join("net"))
    }
}

/// Splits a representor's `phys_port_name` into (PF index, VF index).
///
/// Older kernels report a bare VF index with no PF part.
pub fn parse_port_name(name: &str) -> Option<(Option<u32>, u32)> {
    let name = name.trim();
    if let Ok(vf) = name.parse::<u32>() {
        return Some((None, vf));
    }
    let caps = VF_PORT_NAME_RE.captures(name)?;
    let pf = caps.get(1)?.as_str().parse().ok()?;
    let vf = caps.get(2)?.as_str().parse().ok()?;
    Some((Some(pf), vf))
}

fn read_trimmed(path: &Path) -> Result<String, MetadataError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|error| MetadataError::Io {
            path: path.to_path_buf(),
            error,
        })
}

/// Sorted entry names of a directory.
fn list_dir(path: &Path) -> Result<Vec<String>, MetadataError> {
    let io_err = |error: io::Error| MetadataError::Io {
        path: path.to_path_buf(),
        error,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Last path component of a symlink's target.
fn link_basename(path: &Path) -> Result<String, MetadataError> {
    let target = fs::read_link(path).map_err(|error| MetadataError::Io {
        path: path.to_path_buf(),
        error,
    })?;
    target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MetadataError::Parse {
            path: path.to_path_buf(),
            value: target.display().to_string(),
        })
}
