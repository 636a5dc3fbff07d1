use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::sriov::VfMetadata;

/// Where ADD leaves the per-attachment record that DEL needs.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni/vfbridge";

/// Bridge used when the network configuration names none.
pub const DEFAULT_BRIDGE: &str = "cni0";

/// Highest valid 802.1Q VLAN ID
pub const MAX_VLAN_ID: u16 = 4094;

/// Network configuration and attachment state for one VF
///
/// Loaded from the CNI stdin payload on ADD, mutated by the VF and bridge
/// managers, then cached so DEL can undo exactly what ADD did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// PCI address of the VF
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    /// Requested administrative MAC, empty to keep the current one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    /// VLAN applied to the representor's bridge port, 0 for none
    #[serde(default)]
    pub vlan: u16,
    /// Bridge the PF and representor are attached to
    #[serde(default)]
    pub bridge: String,
    /// Capability arguments passed by the runtime
    #[serde(rename = "runtimeConfig", default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<RuntimeConfig>,
    /// PF netdev owning the VF
    #[serde(default)]
    pub master: String,
    /// VF index on the PF
    #[serde(rename = "vfID", default)]
    pub vf_id: u32,
    /// Representor netdev, resolved when the VF is attached to the bridge
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub representor: String,
    /// Interface name inside the container
    #[serde(rename = "contIFNames", default, skip_serializing_if = "String::is_empty")]
    pub cont_if_names: String,
    /// Host state captured before the VF was touched
    #[serde(rename = "origVfState", default)]
    pub orig_vf_state: OrigVfState,
}

/// Host-side VF state needed to put things back on release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrigVfState {
    /// VF netdev name in the host namespace
    #[serde(rename = "hostIFName", default)]
    pub host_if_name: String,
    /// Administrative MAC from the PF's VF table
    #[serde(rename = "adminMAC", default, skip_serializing_if = "String::is_empty")]
    pub admin_mac: String,
    /// Device MAC before it was overridden
    #[serde(rename = "effectiveMAC", default, skip_serializing_if = "String::is_empty")]
    pub effective_mac: String,
}

impl OrigVfState {
    /// State for a VF currently named `host_if_name` on the host
    pub fn for_host_interface(host_if_name: &str) -> Self {
        Self {
            host_if_name: host_if_name.to_string(),
            ..Default::default()
        }
    }
}

/// Runtime capability arguments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// MAC requested through the `mac` capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut conf: NetConf = serde_json::from_slice(bytes)
            .context("Failed to parse network configuration")?;

        // Validation
        if conf.vlan > MAX_VLAN_ID {
            anyhow::bail!(
                "Invalid VLAN ID {} (must be between 0 and {})",
                conf.vlan,
                MAX_VLAN_ID
            );
        }

        if conf.device_id.is_empty() {
            anyhow::bail!("VF PCI address (deviceID) is required");
        }

        if conf.bridge.is_empty() {
            conf.bridge = DEFAULT_BRIDGE.to_string();
        }

        if let Some(mac) = conf
            .runtime_config
            .as_ref()
            .and_then(|rc| rc.mac.as_ref())
            .filter(|mac| !mac.is_empty())
        {
            conf.mac = mac.clone();
        }

        Ok(conf)
    }

    /// Parse NetConf and resolve the VF's PF, index and host netdev
    pub fn load(bytes: &[u8], sriov: &impl VfMetadata) -> Result<Self> {
        let mut conf = Self::parse(bytes)?;

        conf.master = sriov
            .pf_name(&conf.device_id)
            .with_context(|| format!("Failed to get PF name for VF {}", conf.device_id))?;

        conf.vf_id = sriov
            .vf_id(&conf.device_id, &conf.master)
            .with_context(|| format!("Failed to get VF index for {}", conf.device_id))?;

        let host_if_name = sriov
            .link_names_for_pci(&conf.device_id)
            .with_context(|| format!("Failed to get netdev for VF {}", conf.device_id))?
            .into_iter()
            .next()
            .with_context(|| format!("VF {} has no net device", conf.device_id))?;

        conf.orig_vf_state = OrigVfState::for_host_interface(&host_if_name);

        Ok(conf)
    }

    /// Create a configuration for a VF
    pub fn new_default(name: &str, device_id: &str, bridge: &str, vlan: u16) -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "vfbridge".to_string(),
            device_id: device_id.to_string(),
            bridge: bridge.to_string(),
            vlan,
            ..Default::default()
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Persist the attachment state for a later DEL
    pub fn save_to_cache(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        self.save(path)
    }

    /// Read the record left by ADD, `None` if there is none
    pub fn load_from_cache(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let conf = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse cached state {}", path.display()))?;
        Ok(Some(conf))
    }
}

/// Cache record path for one container attachment
pub fn cache_path(cache_dir: &Path, container_id: &str, ifname: &str) -> PathBuf {
    cache_dir.join(format!("{}-{}", container_id, ifname))
}

/// Remove a cache record; a record that is already gone is not an error
pub fn clean_cache(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
