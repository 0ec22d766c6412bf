//! Command-line argument parsing.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};

use virtplane_core::{Sizing, StorageInput, VifInput};

/// virtplane - virtualization control-plane client
#[derive(Parser, Debug)]
#[command(name = "virtplane")]
#[command(about = "virtplane - manage VMs through a virtualization control plane")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Development mode: talk to an in-memory demo control plane
    #[arg(long, global = true)]
    pub dev: bool,

    /// Endpoint URL (e.g. https://vcenter.example/sdk)
    #[arg(long, env = "VIRTPLANE_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    /// Login user name
    #[arg(long, env = "VIRTPLANE_USERNAME", global = true)]
    pub username: Option<String>,

    /// Login password
    #[arg(long, env = "VIRTPLANE_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List hosts known to the endpoint
    Hosts,

    /// Show one host and its storage initiator
    Host { identity: String },

    /// List networks a VM on the host can attach to
    Networks { host: String },

    /// Show the lowest free VNC port
    LeaseVnc,

    /// Create a VM
    Create(CreateArgs),

    PowerOn { name: String },
    PowerOff { name: String },
    Restart { name: String },
    Destroy { name: String },

    /// Show the lifecycle phase of a VM
    State { name: String },

    /// Show where to connect a VNC client
    Console { name: String },

    /// List the bus kinds of a VM's change-tracked disks
    Disks { name: String },

    /// Change sizing and adapters of a VM
    Reconfigure(ReconfigureArgs),

    /// Move a VM to another host
    Migrate {
        name: String,
        #[arg(long)]
        to: String,
    },

    /// Snapshot a VM
    Backup { name: String, label: String },

    /// Revert a VM to a snapshot
    Restore { name: String, label: String },

    /// Manage standard-switch port groups
    #[command(subcommand)]
    PortGroup(PortGroupCommand),
}

#[derive(ClapArgs, Debug)]
pub struct SizingArgs {
    #[arg(long, default_value_t = 1)]
    pub cpus: u32,

    #[arg(long, default_value_t = 1)]
    pub cores: u32,

    #[arg(long, default_value_t = 1024)]
    pub memory_mb: u64,

    /// Network adapter: network[:model[:mac]], repeatable
    #[arg(long = "nic")]
    pub nics: Vec<NicArg>,
}

impl SizingArgs {
    pub fn sizing(&self) -> Sizing {
        Sizing::new(self.cpus, self.cores, self.memory_mb)
    }

    pub fn vifs(&self) -> Vec<VifInput> {
        self.nics.iter().map(NicArg::to_vif).collect()
    }
}

#[derive(ClapArgs, Debug)]
pub struct CreateArgs {
    pub name: String,

    /// Host identity (IP or name)
    #[arg(long)]
    pub host: String,

    #[command(flatten)]
    pub sizing: SizingArgs,

    /// Disk: path[:capacity_kb] creates a flat file, /dev/... attaches a raw device
    #[arg(long = "disk")]
    pub disks: Vec<DiskArg>,

    /// Boot with EFI firmware
    #[arg(long)]
    pub efi: bool,
}

#[derive(ClapArgs, Debug)]
pub struct ReconfigureArgs {
    pub name: String,

    #[command(flatten)]
    pub sizing: SizingArgs,

    /// Lease a new VNC port
    #[arg(long)]
    pub new_vnc_port: bool,
}

#[derive(Subcommand, Debug)]
pub enum PortGroupCommand {
    /// Add a port group to a standard vSwitch
    Add {
        host: String,
        name: String,
        #[arg(long, default_value = "vSwitch0")]
        vswitch: String,
        #[arg(long, default_value_t = 0)]
        vlan: u16,
    },
    /// Remove a port group
    Remove { host: String, name: String },
    /// List the host's standard vSwitches
    Switches { host: String },
}

/// `network[:model[:mac]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicArg {
    pub network: String,
    pub model: String,
    pub mac: Option<String>,
}

impl NicArg {
    fn to_vif(&self) -> VifInput {
        let vif = VifInput::new(&self.network, &self.model);
        match &self.mac {
            Some(mac) => vif.with_mac(mac),
            None => vif,
        }
    }
}

impl FromStr for NicArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // MAC addresses contain ':' too, so only the first two separators split
        let mut parts = s.splitn(3, ':');
        let network = parts.next().unwrap_or_default();
        if network.is_empty() {
            return Err(anyhow!("nic '{}' has no network name", s));
        }
        let model = parts.next().filter(|m| !m.is_empty()).unwrap_or("vmxnet3");
        let mac = parts.next().filter(|m| !m.is_empty()).map(str::to_string);

        Ok(Self {
            network: network.to_string(),
            model: model.to_string(),
            mac,
        })
    }
}

/// `path[:capacity_kb]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskArg(pub StorageInput);

impl FromStr for DiskArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("/dev/") || s.starts_with("/vmfs/devices/") {
            return Ok(Self(StorageInput::Block {
                device_path: s.to_string(),
            }));
        }

        let (file_name, capacity_kb) = match s.rsplit_once(':') {
            Some((path, size)) => {
                let size = size
                    .parse::<u64>()
                    .with_context(|| format!("disk '{}' has an invalid capacity", s))?;
                (path, size)
            }
            None => (s, 0),
        };
        if file_name.is_empty() {
            return Err(anyhow!("disk '{}' has no path", s));
        }

        Ok(Self(StorageInput::Disk {
            file_name: file_name.to_string(),
            capacity_kb,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_with_mac() {
        let nic: NicArg = "VM Network:e1000:00:50:56:aa:bb:cc".parse().unwrap();
        assert_eq!(nic.network, "VM Network");
        assert_eq!(nic.model, "e1000");
        assert_eq!(nic.mac.as_deref(), Some("00:50:56:aa:bb:cc"));
    }

    #[test]
    fn test_nic_defaults_model() {
        let nic: NicArg = "dv-prod".parse().unwrap();
        assert_eq!(nic.model, "vmxnet3");
        assert!(nic.mac.is_none());
        assert!(":e1000".parse::<NicArg>().is_err());
    }

    #[test]
    fn test_disk_args() {
        let disk: DiskArg = "web/disk0.vmdk:10485760".parse().unwrap();
        assert_eq!(
            disk.0,
            StorageInput::Disk {
                file_name: "web/disk0.vmdk".to_string(),
                capacity_kb: 10485760
            }
        );

        let raw: DiskArg = "/vmfs/devices/disks/naa.600a0b80".parse().unwrap();
        assert!(matches!(raw.0, StorageInput::Block { .. }));

        assert!("web/disk0.vmdk:big".parse::<DiskArg>().is_err());
    }

    #[test]
    fn test_parse_create_command() {
        let args = Args::try_parse_from([
            "virtplane",
            "--dev",
            "create",
            "web-02",
            "--host",
            "10.0.0.5",
            "--cpus",
            "4",
            "--nic",
            "VM Network",
            "--disk",
            "web-02/disk0.vmdk:1048576",
            "--efi",
        ])
        .unwrap();

        assert!(args.dev);
        match args.command {
            Command::Create(create) => {
                assert_eq!(create.host, "10.0.0.5");
                assert_eq!(create.sizing.sizing(), Sizing::new(4, 1, 1024));
                assert_eq!(create.sizing.vifs().len(), 1);
                assert_eq!(create.disks.len(), 1);
                assert!(create.efi);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
