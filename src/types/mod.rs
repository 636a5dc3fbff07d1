use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CNI versions this plugin can speak
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Generic CNI error code for plugin-specific failures
pub const ERR_INTERNAL: u32 = 100;

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Arguments
    pub args: HashMap<String, String>,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// Error reported to the runtime in place of a result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Reply to the VERSION command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
        }
    }

    /// Add an interface to the result
    pub fn add_interface(&mut self, interface: Interface) {
        self.interfaces.get_or_insert_with(Vec::new).push(interface);
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        println!("{}", json);
        Ok(())
    }
}

impl ErrorResult {
    pub fn new(cni_version: &str, code: u32, err: &anyhow::Error) -> Self {
        // outermost context as the message, the whole chain as details
        Self {
            cni_version: cni_version.to_string(),
            code,
            msg: err.to_string(),
            details: format!("{:#}", err),
        }
    }

    /// Print error as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string(self)?;
        println!("{}", json);
        Ok(())
    }
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl VersionResult {
    /// Print supported versions as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string(self)?;
        println!("{}", json);
        Ok(())
    }
}
