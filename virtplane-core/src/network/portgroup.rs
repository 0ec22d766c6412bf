//! Standard-switch port group management.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::{ControlPlaneError, Result};
use crate::session::Session;
use crate::types::ManagedObjectRef;
use crate::wire::{self, HostVirtualSwitch};

/// Adds and removes port groups on a host's standard vSwitches.
pub struct PortGroupManager {
    session: Arc<Session>,
}

impl PortGroupManager {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    async fn network_system(&self, host: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        match self.session.property(host, "configManager.networkSystem").await? {
            Some(value) => wire::decode("configManager.networkSystem", &value),
            None => Err(ControlPlaneError::not_found("network-system", host.id.clone())),
        }
    }

    /// Names of the host's standard vSwitches.
    pub async fn virtual_switches(&self, host: &ManagedObjectRef) -> Result<Vec<String>> {
        let switches: Vec<HostVirtualSwitch> = match self.session.property(host, "config.network.vswitch").await? {
            Some(value) => wire::decode("config.network.vswitch", &value)?,
            None => Vec::new(),
        };
        Ok(switches.into_iter().map(|s| s.name).collect())
    }

    /// Create a port group. A port group that already exists counts as created.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn create_port_group(
        &self,
        host: &ManagedObjectRef,
        vswitch: &str,
        name: &str,
        vlan_id: u16,
    ) -> Result<()> {
        let network_system = self.network_system(host).await?;
        let args = json!({
            "portgrp": {
                "name": name,
                "vlanId": vlan_id,
                "vswitchName": vswitch,
                "policy": {"nicTeaming": {"notifySwitches": true}}
            }
        });

        match self.session.invoke(&network_system, "AddPortGroup", args).await {
            Ok(_) => {
                info!(port_group = name, vswitch, vlan_id, "Created port group");
                Ok(())
            }
            Err(ControlPlaneError::RemoteOperation { code, body, .. })
                if code == 409 || body.contains("AlreadyExists") =>
            {
                warn!(port_group = name, "Port group already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a port group from the host.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn remove_port_group(&self, host: &ManagedObjectRef, name: &str) -> Result<()> {
        let network_system = self.network_system(host).await?;
        self.session
            .invoke(&network_system, "RemovePortGroup", json!({"pgName": name}))
            .await?;
        info!(port_group = name, "Removed port group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlPlane;
    use crate::transport::{Credentials, Endpoint};
    use crate::types::kinds;

    fn manager(mock: &Arc<MockControlPlane>) -> PortGroupManager {
        let session = Session::new(
            Endpoint::parse("https://10.0.0.2/sdk").unwrap(),
            Credentials::new("admin", "secret"),
            mock.clone(),
            100,
        );
        PortGroupManager::new(Arc::new(session))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let mock = Arc::new(MockControlPlane::demo());
        let host = mock.find(kinds::HOST, "10.0.0.6").unwrap();
        let manager = manager(&mock);

        manager.create_port_group(&host, "vSwitch0", "pg-100", 100).await.unwrap();
        manager.create_port_group(&host, "vSwitch0", "pg-100", 100).await.unwrap();

        let groups = mock.property(&host, "config.network.portgroup").unwrap();
        let matching = groups
            .as_array()
            .unwrap()
            .iter()
            .filter(|g| g["spec"]["name"] == "pg-100")
            .count();
        assert_eq!(matching, 1);
        assert_eq!(manager.virtual_switches(&host).await.unwrap(), vec!["vSwitch0"]);
    }

    #[tokio::test]
    async fn test_remove_missing_port_group_fails() {
        let mock = Arc::new(MockControlPlane::demo());
        let host = mock.find(kinds::HOST, "10.0.0.6").unwrap();
        let manager = manager(&mock);

        manager.create_port_group(&host, "vSwitch0", "pg-200", 200).await.unwrap();
        manager.remove_port_group(&host, "pg-200").await.unwrap();

        let err = manager.remove_port_group(&host, "pg-200").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::RemoteOperation { code: 404, .. }));
    }
}
