//! Network topology normalization.
//!
//! This module provides:
//! - Classification of host-visible networks into standard or distributed
//!   attachments with a decoded VLAN setting
//! - Standard-switch port group management on a host (`portgroup`)

mod portgroup;

pub use portgroup::PortGroupManager;

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{ControlPlaneError, Result};
use crate::session::Session;
use crate::types::{kinds, DistributedPort, ManagedObjectRef, NetworkAttachment, Vlan};
use crate::wire::{self, DvPortgroupConfig, HostPortGroup, NetworkSummary};

/// Turns network references into [`NetworkAttachment`]s.
pub struct NetworkNormalizer {
    session: Arc<Session>,
}

impl NetworkNormalizer {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Classify a network as seen from `host`.
    ///
    /// Distributed portgroups are only attachable through a central manager,
    /// and never when they are uplink portgroups.
    #[instrument(skip(self), fields(host = %host, network = %network))]
    pub async fn classify(
        &self,
        host: &ManagedObjectRef,
        network: &ManagedObjectRef,
        central: bool,
    ) -> Result<NetworkAttachment> {
        let props = self.session.properties(network, &["summary"]).await?;
        let summary: NetworkSummary = wire::required(&props, "summary")?;

        match summary.network.kind.as_str() {
            kinds::NETWORK => self.classify_standard(host, &summary.name).await,
            kinds::DV_PORTGROUP => {
                if !central {
                    return Err(ControlPlaneError::NetworkNotAttachable {
                        network: summary.name,
                        reason: "distributed portgroups require a central manager".to_string(),
                    });
                }
                self.classify_distributed(network).await
            }
            other => Err(ControlPlaneError::NetworkNotAttachable {
                network: summary.name,
                reason: format!("unsupported network type {}", other),
            }),
        }
    }

    async fn classify_standard(&self, host: &ManagedObjectRef, name: &str) -> Result<NetworkAttachment> {
        let port_groups: Vec<HostPortGroup> = match self
            .session
            .property(host, "config.network.portgroup")
            .await?
        {
            Some(value) => wire::decode("config.network.portgroup", &value)?,
            None => Vec::new(),
        };

        let vlan = port_groups
            .iter()
            .find(|pg| pg.spec.name == name)
            .and_then(|pg| pg.spec.vlan_id)
            .map(|id| Vlan::Single { id })
            .unwrap_or(Vlan::None);

        debug!(network = name, vlan = ?vlan, "Classified standard network");
        Ok(NetworkAttachment::standard(name, vlan))
    }

    async fn classify_distributed(&self, portgroup: &ManagedObjectRef) -> Result<NetworkAttachment> {
        let props = self.session.properties(portgroup, &["config"]).await?;
        let config: DvPortgroupConfig = wire::required(&props, "config")?;

        if config.is_uplink() {
            return Err(ControlPlaneError::NetworkNotAttachable {
                network: config.name,
                reason: "uplink portgroup".to_string(),
            });
        }

        let vlan = match &config.default_port_config.vlan {
            Some(value) if !value.is_null() => wire::decode_vlan(value)?,
            _ => Vlan::None,
        };

        let switch_props = self
            .session
            .properties(&config.distributed_virtual_switch, &["config.uuid"])
            .await?;
        let dvs_uuid: String = wire::required(&switch_props, "config.uuid")?;

        debug!(network = %config.name, vlan = ?vlan, "Classified distributed portgroup");
        Ok(NetworkAttachment::distributed(
            config.name,
            vlan,
            DistributedPort {
                dvs_uuid,
                portgroup_key: config.key,
            },
        ))
    }

    async fn network_refs(&self, host: &ManagedObjectRef) -> Result<Vec<ManagedObjectRef>> {
        match self.session.property(host, "network").await? {
            Some(value) => wire::decode("network", &value),
            None => Ok(Vec::new()),
        }
    }

    /// Every attachable network on a host. Networks that cannot carry a VM
    /// adapter are skipped; any other failure aborts.
    pub async fn host_networks(&self, host: &ManagedObjectRef, central: bool) -> Result<Vec<NetworkAttachment>> {
        let networks = self.network_refs(host).await?;

        let mut attachments = Vec::with_capacity(networks.len());
        for network in &networks {
            match self.classify(host, network, central).await {
                Ok(attachment) => attachments.push(attachment),
                Err(ControlPlaneError::NetworkNotAttachable { network, reason }) => {
                    debug!(network = %network, reason = %reason, "Skipping network");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(attachments)
    }

    /// The network called `name` on a host, classified.
    ///
    /// Only the named network is classified, so other networks on the host
    /// cannot fail the lookup.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn find_network(&self, host: &ManagedObjectRef, name: &str, central: bool) -> Result<NetworkAttachment> {
        for network in self.network_refs(host).await? {
            let props = self.session.properties(&network, &["summary"]).await?;
            let summary: NetworkSummary = wire::required(&props, "summary")?;
            if summary.name == name {
                return self.classify(host, &network, central).await;
            }
        }
        Err(ControlPlaneError::not_found("network", name))
    }
}
