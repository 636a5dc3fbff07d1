use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vfbridge::config::{NetConf, DEFAULT_BRIDGE, DEFAULT_CACHE_DIR, MAX_VLAN_ID};
use vfbridge::sriov::{Sysfs, VfMetadata, SYSFS_ROOT};

/// Inspect SR-IOV VFs and the state left by the vfbridge CNI plugin
#[derive(Parser)]
#[command(name = "vfbridge-ctl", author, version, about)]
struct Cli {
    /// Sysfs mount point
    #[arg(long, default_value = SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the representor netdev of a VF
    Representor {
        /// Uplink (PF) interface
        #[arg(long)]
        pf: String,

        /// VF index on the PF
        #[arg(long)]
        vf: u32,
    },

    /// Show PCI address and netdevs of a VF
    VfInfo {
        /// Uplink (PF) interface
        #[arg(long)]
        pf: String,

        /// VF index on the PF
        #[arg(long)]
        vf: u32,
    },

    /// Generate a network configuration
    Generate {
        /// PCI address of the VF
        #[arg(long)]
        device_id: String,

        /// Bridge to attach the representor to
        #[arg(long, default_value = DEFAULT_BRIDGE)]
        bridge: String,

        /// VLAN ID (0 for none)
        #[arg(long, default_value_t = 0)]
        vlan: u16,

        /// MAC address to assign to the VF
        #[arg(long)]
        mac: Option<String>,

        /// Network name
        #[arg(long, default_value = "sriov-network")]
        name: String,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List attachments recorded by the plugin
    State {
        /// Plugin cache directory
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,
    },
}

/// One cached attachment
struct Attachment {
    record: String,
    conf: NetConf,
}

fn read_state(cache_dir: &Path) -> Result<Vec<Attachment>> {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", cache_dir.display()))
        }
    };

    let mut attachments = Vec::new();
    for entry in entries {
        let path = entry?.path();
        match NetConf::load_from_cache(&path) {
            Ok(Some(conf)) => attachments.push(Attachment {
                record: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                conf,
            }),
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
        }
    }
    attachments.sort_by(|a, b| a.record.cmp(&b.record));
    Ok(attachments)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let sysfs = Sysfs::with_root(&cli.sysfs_root);

    match cli.command {
        Commands::Representor { pf, vf } => {
            let rep = sysfs
                .vf_representor(&pf, vf)
                .with_context(|| format!("Failed to find representor for VF {} of {}", vf, pf))?;
            println!("{}", rep);
        }

        Commands::VfInfo { pf, vf } => {
            let num_vfs = sysfs.sriov_num_vfs(&pf)?;
            let pci = sysfs.vf_pci_address(&pf, vf)?;
            let links = sysfs.vf_link_names(&pf, vf).unwrap_or_default();
            let rep = sysfs.vf_representor(&pf, vf).ok();

            println!("VF {} of {} ({} VFs enabled):", vf, pf, num_vfs);
            println!("  PCI address: {}", pci);
            if links.is_empty() {
                println!("  Netdevs: none in this namespace");
            } else {
                println!("  Netdevs: {}", links.join(", "));
            }
            println!("  Representor: {}", rep.as_deref().unwrap_or("none"));
        }

        Commands::Generate { device_id, bridge, vlan, mac, name, output } => {
            if vlan > MAX_VLAN_ID {
                anyhow::bail!("Invalid VLAN ID {} (must be between 0 and {})", vlan, MAX_VLAN_ID);
            }

            let mut config = NetConf::new_default(&name, &device_id, &bridge, vlan);
            config.mac = mac.unwrap_or_default();

            if let Some(path) = output {
                config.save(&path)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }

        Commands::State { cache_dir } => {
            let attachments = read_state(&cache_dir)?;
            if attachments.is_empty() {
                println!("No attachments recorded in {}", cache_dir.display());
            }
            for Attachment { record, conf } in attachments {
                println!("  {}:", record);
                println!("    VF: {} ({} vf {})", conf.device_id, conf.master, conf.vf_id);
                println!("    Host name: {}", conf.orig_vf_state.host_if_name);
                println!("    Representor: {}", conf.representor);
                println!("    Bridge: {} (vlan {})", conf.bridge, conf.vlan);
                if !conf.mac.is_empty() {
                    println!("    MAC: {}", conf.mac);
                }
            }
        }
    }

    Ok(())
}
