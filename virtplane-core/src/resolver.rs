//! Resolution of human-facing identities into managed object references.
//!
//! Whether the endpoint is a single host or a central manager changes how
//! every lookup works: a standalone endpoint has exactly one host, which is
//! returned for any identity, while a central manager is searched by name.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::config::ControllerSetting;
use crate::error::{ControlPlaneError, Result};
use crate::session::Session;
use crate::types::{kinds, HostInfo, HostInitiator, ManagedObjectRef, OptionValue, PowerState};
use crate::wire::{self, DatastoreHostMount, HostBusAdapter, ObjectContent};

const API_TYPE: &str = "content.about.apiType";

const HOST_SUMMARY_PATHS: [&str; 4] = [
    "name",
    "summary.hardware.numCpuCores",
    "summary.hardware.memorySize",
    "summary.quickStats.overallMemoryUsage",
];

/// Walks the datacenter / cluster / host / datastore hierarchy.
pub struct Resolver {
    session: Arc<Session>,
    setting: ControllerSetting,
    reserved_prefix: String,
    central: OnceCell<bool>,
}

impl Resolver {
    pub fn new(session: Arc<Session>, setting: ControllerSetting, reserved_prefix: impl Into<String>) -> Self {
        Self {
            session,
            setting,
            reserved_prefix: reserved_prefix.into(),
            central: OnceCell::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether the endpoint is a central manager. Determined once per client.
    pub async fn is_central(&self) -> Result<bool> {
        self.central
            .get_or_try_init(|| async {
                match self.setting {
                    ControllerSetting::Standalone => Ok(false),
                    ControllerSetting::Central => Ok(true),
                    ControllerSetting::Auto => self.detect_controller().await,
                }
            })
            .await
            .copied()
    }

    async fn detect_controller(&self) -> Result<bool> {
        let api_type = self
            .session
            .property(&ManagedObjectRef::service_instance(), API_TYPE)
            .await?;

        let central = match api_type.as_ref().and_then(Value::as_str) {
            Some("VirtualCenter") => true,
            Some("HostAgent") => false,
            other => {
                return Err(ControlPlaneError::MalformedReply(format!(
                    "unknown endpoint api type {:?}",
                    other
                )))
            }
        };
        info!(central, "Detected controller mode");
        Ok(central)
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    /// Resolve a host by IP or name. On a standalone endpoint the identity is
    /// not compared.
    #[instrument(skip(self))]
    pub async fn resolve_host(&self, identity: &str) -> Result<ManagedObjectRef> {
        let central = self.is_central().await?;
        let hosts = self.session.enumerate_all(kinds::HOST, &["name"]).await?;

        let found = if central {
            hosts.into_iter().find(|h| h.string("name") == Some(identity))
        } else {
            hosts.into_iter().next()
        };

        let host = found
            .map(|h| h.obj)
            .ok_or_else(|| ControlPlaneError::not_found("host", identity))?;
        debug!(host = %host, "Resolved host");
        Ok(host)
    }

    /// Summary of the host with the given identity.
    pub async fn host_info(&self, identity: &str) -> Result<HostInfo> {
        let host = self.resolve_host(identity).await?;
        let central = self.is_central().await?;
        let props = self.session.properties(&host, &HOST_SUMMARY_PATHS).await?;

        Self::host_info_from(
            &ObjectContent { obj: host, props },
            central,
        )
    }

    /// Every host known to the endpoint.
    pub async fn list_hosts(&self) -> Result<Vec<HostInfo>> {
        let central = self.is_central().await?;
        self.session
            .enumerate_all(kinds::HOST, &HOST_SUMMARY_PATHS)
            .await?
            .iter()
            .map(|host| Self::host_info_from(host, central))
            .collect()
    }

    fn host_info_from(host: &ObjectContent, central: bool) -> Result<HostInfo> {
        let used_mb: Option<u64> = wire::optional(&host.props, "summary.quickStats.overallMemoryUsage")?;
        Ok(HostInfo {
            host_ref: host.obj.clone(),
            identity: wire::required(&host.props, "name")?,
            managed_by_central_controller: central,
            cpu_cores: wire::optional(&host.props, "summary.hardware.numCpuCores")?.unwrap_or(0),
            memory_total_bytes: wire::optional(&host.props, "summary.hardware.memorySize")?.unwrap_or(0),
            memory_used_bytes: used_mb.map(|mb| mb * 1024 * 1024),
        })
    }

    /// The cluster (or single-host compute resource) a host belongs to.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn resolve_cluster(&self, host: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        let resources = self
            .session
            .enumerate_all(kinds::COMPUTE_RESOURCE, &["host"])
            .await?;

        for resource in resources {
            let members: Vec<ManagedObjectRef> = wire::optional(&resource.props, "host")?.unwrap_or_default();
            if members.contains(host) {
                debug!(cluster = %resource.obj, "Resolved cluster");
                return Ok(resource.obj);
            }
        }
        Err(ControlPlaneError::not_found("cluster", host.id.clone()))
    }

    /// The datacenter whose host folder holds the host, either through a
    /// cluster or directly.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn resolve_datacenter(&self, host: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        let cluster = match self.resolve_cluster(host).await {
            Ok(cluster) => Some(cluster),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let datacenters = self
            .session
            .enumerate_all(kinds::DATACENTER, &["hostFolder"])
            .await?;

        for datacenter in datacenters {
            let Some(folder) = wire::optional::<ManagedObjectRef>(&datacenter.props, "hostFolder")? else {
                continue;
            };
            let children: Vec<ManagedObjectRef> = match self.session.property(&folder, "childEntity").await? {
                Some(value) => wire::decode("childEntity", &value)?,
                None => continue,
            };

            let matched = children.iter().any(|child| {
                (child.is_compute_resource() && cluster.as_ref() == Some(child))
                    || (child.is_kind(kinds::HOST) && child == host)
            });
            if matched {
                debug!(datacenter = %datacenter.obj, "Resolved datacenter");
                return Ok(datacenter.obj);
            }
        }
        Err(ControlPlaneError::not_found("datacenter", host.id.clone()))
    }

    /// Folder new VMs for the host are created in.
    pub async fn resolve_vm_folder(&self, host: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        let datacenter = if self.is_central().await? {
            self.resolve_datacenter(host).await?
        } else {
            self.session
                .enumerate_all(kinds::DATACENTER, &[])
                .await?
                .into_iter()
                .next()
                .map(|dc| dc.obj)
                .ok_or_else(|| ControlPlaneError::not_found("datacenter", host.id.clone()))?
        };

        match self.session.property(&datacenter, "vmFolder").await? {
            Some(value) => wire::decode("vmFolder", &value),
            None => Err(ControlPlaneError::not_found("vm-folder", datacenter.id)),
        }
    }

    /// Root resource pool of a cluster.
    pub async fn resolve_resource_pool(&self, cluster: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        match self.session.property(cluster, "resourcePool").await? {
            Some(value) => wire::decode("resourcePool", &value),
            None => Err(ControlPlaneError::not_found("resource-pool", cluster.id.clone())),
        }
    }

    /// Root resource pool VMs on `host` are placed in: the cluster's for a
    /// clustered host, else the pool of the host's own compute resource.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn resolve_host_pool(&self, host: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        match self.resolve_cluster(host).await {
            Ok(cluster) => return self.resolve_resource_pool(&cluster).await,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let parent: Option<ManagedObjectRef> = match self.session.property(host, "parent").await? {
            Some(value) => Some(wire::decode("parent", &value)?),
            None => None,
        };
        match parent {
            Some(parent) if parent.is_compute_resource() => {
                debug!(compute_resource = %parent, "Host is not clustered");
                self.resolve_resource_pool(&parent).await
            }
            _ => Err(ControlPlaneError::not_found("resource-pool", host.id.clone())),
        }
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Whether a datastore belongs to the control plane's own scratch space.
    pub fn is_reserved_datastore(&self, name: &str) -> bool {
        name.split('_').next() == Some(self.reserved_prefix.as_str())
    }

    /// Name of the first non-reserved datastore mounted on the host with free space.
    #[instrument(skip(self), fields(host = %host))]
    pub async fn resolve_datastore(&self, host: &ManagedObjectRef) -> Result<String> {
        let datastores = self
            .session
            .enumerate_all(kinds::DATASTORE, &["name", "host", "summary.freeSpace"])
            .await?;

        for datastore in &datastores {
            let Some(name) = datastore.string("name") else {
                continue;
            };
            if self.is_reserved_datastore(name) {
                debug!(datastore = name, "Skipping reserved datastore");
                continue;
            }

            let mounts: Vec<DatastoreHostMount> = wire::optional(&datastore.props, "host")?.unwrap_or_default();
            if !mounts.iter().any(|mount| &mount.key == host) {
                continue;
            }

            let free: u64 = wire::optional(&datastore.props, "summary.freeSpace")?.unwrap_or(0);
            if free > 0 {
                info!(datastore = name, free_bytes = free, "Resolved datastore");
                return Ok(name.to_string());
            }
        }

        Err(ControlPlaneError::NoDatastore { host: host.id.clone() })
    }

    /// iSCSI initiator of a host. Hosts without an iSCSI adapter report no IQN.
    pub async fn host_initiator(&self, identity: &str) -> Result<HostInitiator> {
        let host = self.resolve_host(identity).await?;
        let adapters: Vec<HostBusAdapter> = match self
            .session
            .property(&host, "config.storageDevice.hostBusAdapter")
            .await?
        {
            Some(value) => wire::decode("hostBusAdapter", &value)?,
            None => Vec::new(),
        };

        Ok(HostInitiator {
            protocol: "ISCSI".to_string(),
            iqn: adapters
                .into_iter()
                .find(HostBusAdapter::is_iscsi)
                .and_then(|hba| hba.iscsi_name),
        })
    }

    // =========================================================================
    // Virtual Machines
    // =========================================================================

    /// Look a VM up by name, returning `None` when absent.
    pub async fn find_vm(&self, name: &str) -> Result<Option<ManagedObjectRef>> {
        Ok(self
            .session
            .enumerate_all(kinds::VIRTUAL_MACHINE, &["name"])
            .await?
            .into_iter()
            .find(|vm| vm.string("name") == Some(name))
            .map(|vm| vm.obj))
    }

    /// Resolve a VM by name.
    pub async fn resolve_vm(&self, name: &str) -> Result<ManagedObjectRef> {
        self.find_vm(name)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found("vm", name))
    }

    /// VMs registered on a host.
    pub async fn vms_on_host(&self, host: &ManagedObjectRef) -> Result<Vec<ManagedObjectRef>> {
        match self.session.property(host, "vm").await? {
            Some(value) => wire::decode("vm", &value),
            None => Ok(Vec::new()),
        }
    }

    /// Host currently running a VM.
    pub async fn host_of_vm(&self, vm: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        match self.session.property(vm, "runtime.host").await? {
            Some(value) => wire::decode("runtime.host", &value),
            None => Err(ControlPlaneError::not_found("host", vm.id.clone())),
        }
    }

    /// Current power state of a VM.
    pub async fn power_state(&self, vm: &ManagedObjectRef) -> Result<PowerState> {
        let props = self.session.properties(vm, &["runtime.powerState"]).await?;
        wire::required(&props, "runtime.powerState")
    }

    /// Bus kind (`scsi` or `ide`) of every disk with change tracking enabled,
    /// in extra configuration order.
    pub async fn vdisk_drivers(&self, vm: &ManagedObjectRef) -> Result<Vec<String>> {
        let options: Vec<OptionValue> = match self.session.property(vm, "config.extraConfig").await? {
            Some(value) => wire::decode("config.extraConfig", &value)?,
            None => Vec::new(),
        };
        Ok(options
            .iter()
            .filter_map(tracked_disk_bus)
            .map(str::to_string)
            .collect())
    }
}

const DISK_BUSES: [&str; 2] = ["scsi", "ide"];

/// Bus of a `<bus><controller>:<unit>.ctkEnabled` option that is switched on.
fn tracked_disk_bus(option: &OptionValue) -> Option<&'static str> {
    if !option.value.eq_ignore_ascii_case("true") {
        return None;
    }
    let (device, setting) = option.key.split_once('.')?;
    if setting != "ctkEnabled" {
        return None;
    }
    DISK_BUSES.into_iter().find(|bus| {
        device
            .strip_prefix(bus)
            .and_then(|slot| slot.split_once(':'))
            .is_some_and(|(controller, unit)| {
                !controller.is_empty()
                    && !unit.is_empty()
                    && controller.chars().chain(unit.chars()).all(|c| c.is_ascii_digit())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlPlane;
    use crate::transport::{Credentials, Endpoint};

    fn resolver(mock: &Arc<MockControlPlane>, setting: ControllerSetting) -> Resolver {
        let session = Session::new(
            Endpoint::parse("https://10.0.0.2/sdk").unwrap(),
            Credentials::new("admin", "secret"),
            mock.clone(),
            100,
        );
        Resolver::new(Arc::new(session), setting, "Drp")
    }

    #[tokio::test]
    async fn test_controller_mode_detected_once() {
        let mock = Arc::new(MockControlPlane::standalone());
        let resolver = resolver(&mock, ControllerSetting::Auto);

        assert!(!resolver.is_central().await.unwrap());
        assert!(!resolver.is_central().await.unwrap());
        assert_eq!(mock.calls_of("properties").len(), 1);
    }

    #[tokio::test]
    async fn test_pinned_controller_mode_skips_detection() {
        let mock = Arc::new(MockControlPlane::standalone());
        let resolver = resolver(&mock, ControllerSetting::Central);

        assert!(resolver.is_central().await.unwrap());
        assert!(mock.calls_of("properties").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_datacenter_both_layouts() {
        let mock = Arc::new(MockControlPlane::central());
        let dc1 = mock.add_datacenter("dc1");
        let cluster = mock.add_cluster(&dc1, "c1");
        let clustered = mock.add_host(&cluster, "10.0.0.5");
        let dc2 = mock.add_datacenter("dc2");
        let loose = mock.add_standalone_host(&dc2, "10.0.0.9");

        let resolver = resolver(&mock, ControllerSetting::Auto);
        assert_eq!(resolver.resolve_datacenter(&clustered).await.unwrap(), dc1);
        assert_eq!(resolver.resolve_datacenter(&loose).await.unwrap(), dc2);
        assert_eq!(resolver.resolve_cluster(&clustered).await.unwrap(), cluster);
        assert!(resolver.resolve_cluster(&loose).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_datastore_skips_reserved_and_full() {
        let mock = Arc::new(MockControlPlane::demo());
        let resolver = resolver(&mock, ControllerSetting::Auto);
        let host = resolver.resolve_host("10.0.0.5").await.unwrap();

        assert_eq!(resolver.resolve_datastore(&host).await.unwrap(), "ds1");
    }

    #[tokio::test]
    async fn test_resolve_datastore_none_qualify() {
        let mock = Arc::new(MockControlPlane::central());
        let dc = mock.add_datacenter("dc1");
        let cluster = mock.add_cluster(&dc, "c1");
        let host = mock.add_host(&cluster, "10.0.0.5");
        let other = mock.add_host(&cluster, "10.0.0.6");
        mock.add_datastore("Drp", 100, &[&host]);
        mock.add_datastore("full", 0, &[&host]);
        mock.add_datastore("elsewhere", 100, &[&other]);

        let resolver = resolver(&mock, ControllerSetting::Auto);
        let err = resolver.resolve_datastore(&host).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NoDatastore { .. }));
    }

    #[test]
    fn test_reserved_prefix_matches_first_segment() {
        let mock = Arc::new(MockControlPlane::central());
        let resolver = resolver(&mock, ControllerSetting::Auto);
        assert!(resolver.is_reserved_datastore("Drp_scratch"));
        assert!(resolver.is_reserved_datastore("Drp"));
        assert!(!resolver.is_reserved_datastore("Drpool"));
        assert!(!resolver.is_reserved_datastore("ds1"));
    }

    #[tokio::test]
    async fn test_host_info_and_initiator() {
        let mock = Arc::new(MockControlPlane::demo());
        let resolver = resolver(&mock, ControllerSetting::Auto);

        let info = resolver.host_info("10.0.0.5").await.unwrap();
        assert_eq!(info.identity, "10.0.0.5");
        assert!(info.managed_by_central_controller);
        assert_eq!(info.cpu_cores, 16);
        assert_eq!(info.memory_used_bytes, Some(8192 * 1024 * 1024));

        let initiator = resolver.host_initiator("10.0.0.5").await.unwrap();
        assert_eq!(initiator.iqn.as_deref(), Some("iqn.1998-01.com.vmware:esx-05"));
        let initiator = resolver.host_initiator("10.0.0.6").await.unwrap();
        assert_eq!(initiator.protocol, "ISCSI");
        assert!(initiator.iqn.is_none());
    }

    #[tokio::test]
    async fn test_vm_lookups() {
        let mock = Arc::new(MockControlPlane::demo());
        let resolver = resolver(&mock, ControllerSetting::Auto);

        let vm = resolver.resolve_vm("web-01").await.unwrap();
        let host = resolver.host_of_vm(&vm).await.unwrap();
        assert!(resolver.vms_on_host(&host).await.unwrap().contains(&vm));
        assert_eq!(resolver.power_state(&vm).await.unwrap(), PowerState::PoweredOn);
        assert!(resolver.resolve_vm("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_host_pool_for_clustered_and_unclustered_hosts() {
        let mock = Arc::new(MockControlPlane::demo());
        let dc = mock.find(kinds::DATACENTER, "dc1").unwrap();
        let loose = mock.add_standalone_host(&dc, "10.0.0.9");
        let resolver = resolver(&mock, ControllerSetting::Auto);

        let clustered = mock.find(kinds::HOST, "10.0.0.5").unwrap();
        let cluster = resolver.resolve_cluster(&clustered).await.unwrap();
        assert_eq!(
            resolver.resolve_host_pool(&clustered).await.unwrap(),
            resolver.resolve_resource_pool(&cluster).await.unwrap()
        );

        assert!(resolver.resolve_cluster(&loose).await.unwrap_err().is_not_found());
        let pool = resolver.resolve_host_pool(&loose).await.unwrap();
        assert_eq!(pool.kind, kinds::RESOURCE_POOL);
        assert_eq!(resolver.resolve_datacenter(&loose).await.unwrap(), dc);
    }

    #[tokio::test]
    async fn test_host_without_compute_resource_has_no_pool() {
        let mock = Arc::new(MockControlPlane::demo());
        let dc = mock.find(kinds::DATACENTER, "dc1").unwrap();
        let loose = mock.add_standalone_host(&dc, "10.0.0.9");
        mock.set_property(&loose, "parent", Value::Null);
        let resolver = resolver(&mock, ControllerSetting::Auto);

        let err = resolver.resolve_host_pool(&loose).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound { kind, .. } if kind == "resource-pool"));
    }

    #[tokio::test]
    async fn test_vdisk_drivers_from_change_tracking_options() {
        let mock = Arc::new(MockControlPlane::demo());
        let resolver = resolver(&mock, ControllerSetting::Auto);

        let vm = resolver.resolve_vm("web-01").await.unwrap();
        assert_eq!(resolver.vdisk_drivers(&vm).await.unwrap(), vec!["scsi", "ide"]);

        let db = resolver.resolve_vm("db-01").await.unwrap();
        assert!(resolver.vdisk_drivers(&db).await.unwrap().is_empty());
    }

    #[test]
    fn test_tracked_disk_bus() {
        let bus = |key: &str, value: &str| tracked_disk_bus(&OptionValue::new(key, value));
        assert_eq!(bus("scsi0:0.ctkEnabled", "TRUE"), Some("scsi"));
        assert_eq!(bus("scsi1:12.ctkEnabled", "true"), Some("scsi"));
        assert_eq!(bus("ide0:1.ctkEnabled", "TRUE"), Some("ide"));
        assert_eq!(bus("scsi0:0.ctkEnabled", "FALSE"), None);
        assert_eq!(bus("ctkEnabled", "TRUE"), None);
        assert_eq!(bus("scsi0:0.fileName", "TRUE"), None);
        assert_eq!(bus("sata0:0.ctkEnabled", "TRUE"), None);
        assert_eq!(bus("scsi0.ctkEnabled", "TRUE"), None);
    }
}
