//! SR-IOV VF bridge CNI plugin for Kubernetes
//!
//! This implementation provides a pure Rust CNI plugin that:
//! - Moves an SR-IOV VF into the container namespace under the requested name
//! - Applies and later restores the VF's MAC address
//! - Attaches the uplink PF and the VF's switchdev representor to a Linux bridge
//! - Restores the VF to the host on container deletion

pub mod commands;
pub mod config;
pub mod manager;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod sriov;
pub mod types;

// Re-export commonly used items
pub use config::NetConf;
pub use manager::Manager;
pub use plugin::VfBridgePlugin;
pub use commands::{run_cni, cmd_add, cmd_del, cmd_check};
