//! # virtplane CLI
//!
//! Operator command line for a virtualization control plane: inventory
//! queries, VM lifecycle, snapshots and port groups.
//!
//! ## Usage
//! ```bash
//! virtplane --config /etc/virtplane/client.yaml hosts
//! virtplane --dev create web-02 --host 10.0.0.5 --nic "VM Network" --disk web-02/disk0.vmdk:1048576
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info};

use virtplane_common::LogFormat;
use virtplane_core::{
    ControlPlaneClient, CreateVmRequest, Firmware, MockControlPlane, RestTransport, Transport,
};

mod cli;
mod config;

use cli::{Args, Command, PortGroupCommand};
use config::{Config, TransportKind};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.log_json { LogFormat::Json } else { LogFormat::Pretty };
    virtplane_common::init_logging(&args.log_level, format)?;

    let config = Config::resolve(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.client.endpoint.url,
        transport = ?config.transport,
        "Starting virtplane"
    );

    let transport = build_transport(&config)?;
    let client = ControlPlaneClient::new(config.client, transport).context("Invalid client configuration")?;

    let outcome = run(&client, args.command).await;
    if let Err(e) = client.close().await {
        error!(error = %e, "Logout failed");
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    match config.transport {
        TransportKind::Simulator => Ok(Arc::new(MockControlPlane::demo())),
        TransportKind::Rest => {
            let endpoint = config.client.parsed_endpoint()?;
            let transport = RestTransport::new(
                &endpoint,
                config.client.request_timeout(),
                config.client.endpoint.accept_invalid_certs,
            )?;
            Ok(Arc::new(transport))
        }
    }
}

async fn run(client: &ControlPlaneClient, command: Command) -> Result<Value> {
    let vms = client.vms();

    let output = match command {
        Command::Hosts => json!(client.list_hosts().await?),
        Command::Host { identity } => json!({
            "host": client.host_info(&identity).await?,
            "initiator": client.host_initiator(&identity).await?,
        }),
        Command::Networks { host } => json!(client.host_networks(&host).await?),
        Command::LeaseVnc => json!(client.lease_vnc_port().await?),
        Command::Create(create) => {
            let request = CreateVmRequest {
                name: create.name,
                host: create.host,
                sizing: create.sizing.sizing(),
                vifs: create.sizing.vifs(),
                storage: create.disks.into_iter().map(|d| d.0).collect(),
                firmware: if create.efi { Firmware::Efi } else { Firmware::Bios },
            };
            json!(vms.create(&request).await?)
        }
        Command::PowerOn { name } => json!(vms.power_on(&name).await?),
        Command::PowerOff { name } => json!(vms.power_off(&name).await?),
        Command::Restart { name } => json!(vms.restart(&name).await?),
        Command::Destroy { name } => json!(vms.destroy(&name).await?),
        Command::State { name } => json!(vms.phase(&name).await?),
        Command::Console { name } => json!(client.console(&name).await?),
        Command::Disks { name } => json!(client.vdisk_drivers(&name).await?),
        Command::Reconfigure(reconfigure) => json!(
            vms.reconfigure(
                &reconfigure.name,
                &reconfigure.sizing.sizing(),
                &reconfigure.sizing.vifs(),
                reconfigure.new_vnc_port,
            )
            .await?
        ),
        Command::Migrate { name, to } => json!(vms.migrate(&name, &to).await?),
        Command::Backup { name, label } => json!({"snapshot": vms.backup(&name, &label).await?}),
        Command::Restore { name, label } => json!(vms.restore(&name, &label).await?),
        Command::PortGroup(PortGroupCommand::Add { host, name, vswitch, vlan }) => {
            client.create_port_group(&host, &vswitch, &name, vlan).await?;
            json!({"created": name})
        }
        Command::PortGroup(PortGroupCommand::Remove { host, name }) => {
            client.remove_port_group(&host, &name).await?;
            json!({"removed": name})
        }
        Command::PortGroup(PortGroupCommand::Switches { host }) => json!(client.virtual_switches(&host).await?),
    };

    Ok(output)
}
