use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tracing::info;

use crate::config::NetConf;
use crate::netns::NetNs;
use crate::plugin::VfBridgePlugin;
use crate::types::{CmdArgs, ErrorResult, VersionResult, ERR_INTERNAL};

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    // Get required environment variables
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // DEL may legitimately come without a namespace
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    // Get args (if any)
    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    // Read stdin data
    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// CNI version requested on stdin, for error reporting before a full parse
pub fn requested_version(stdin_data: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct Versioned {
        #[serde(rename = "cniVersion", default)]
        cni_version: String,
    }

    serde_json::from_slice::<Versioned>(stdin_data)
        .map(|v| v.cni_version)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| VersionResult::default().cni_version)
}

/// Execute the add command
pub fn cmd_add(args: &CmdArgs) -> Result<()> {
    let plugin = VfBridgePlugin::new();

    // Parse network configuration and resolve the VF
    let mut conf = NetConf::load(&args.stdin_data, plugin.manager().metadata())?;

    if args.netns.is_empty() {
        anyhow::bail!("CNI_NETNS not found in environment");
    }
    let netns = NetNs::open(&args.netns)?;

    let result = plugin.add_network(&mut conf, args, &netns)?;

    // Output result as JSON
    result.print()?;

    Ok(())
}

/// Execute the delete command
pub fn cmd_del(args: &CmdArgs) -> Result<()> {
    let plugin = VfBridgePlugin::new();

    let netns = match args.netns.as_str() {
        "" => None,
        path => match NetNs::open(path) {
            Ok(netns) => Some(netns),
            Err(e) if e.is_not_found() => {
                info!("Network namespace {} no longer exists", path);
                None
            }
            Err(e) => return Err(e.into()),
        },
    };

    plugin.del_network(args, netns.as_ref())
}

/// Execute the check command
pub fn cmd_check(args: &CmdArgs) -> Result<()> {
    let plugin = VfBridgePlugin::new();
    let netns = NetNs::open(&args.netns)?;
    plugin.check_network(args, &netns)
}

/// Main entry point for the CNI plugin
///
/// Failures are also reported to the runtime as a CNI error object on stdout.
pub fn run_cni() -> Result<()> {
    let mut version = VersionResult::default().cni_version;
    let outcome = dispatch(&mut version);
    if let Err(err) = &outcome {
        ErrorResult::new(&version, ERR_INTERNAL, err).print()?;
    }
    outcome
}

fn dispatch(version: &mut String) -> Result<()> {
    // Get command from environment
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    if cmd == "VERSION" {
        return VersionResult::default().print();
    }

    let args = parse_args()?;
    *version = requested_version(&args.stdin_data);

    // Execute the appropriate command
    match cmd.as_str() {
        "ADD" => cmd_add(&args),
        "DEL" => cmd_del(&args),
        "CHECK" => cmd_check(&args),
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cni_args() {
        let args = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0");
        assert_eq!(args.len(), 3);
        assert_eq!(args.get("K8S_POD_NAME").map(String::as_str), Some("web-0"));
        assert_eq!(args.get("IgnoreUnknown").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_parse_cni_args_skips_malformed_pairs() {
        assert!(parse_cni_args("").is_empty());
        let args = parse_cni_args("novalue;A=b=c");
        assert_eq!(args.len(), 1);
        assert_eq!(args.get("A").map(String::as_str), Some("b=c"));
    }

    #[test]
    fn test_requested_version() {
        assert_eq!(requested_version(br#"{"cniVersion":"0.4.0"}"#), "0.4.0");
        assert_eq!(requested_version(b"garbage"), "1.0.0");
        assert_eq!(requested_version(b"{}"), "1.0.0");
    }
}
