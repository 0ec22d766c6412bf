//! Type definitions for managed objects, networks and VM specifications.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControlPlaneError;

// =============================================================================
// MANAGED OBJECTS
// =============================================================================

/// Managed object kinds used by the client.
pub mod kinds {
    pub const SERVICE_INSTANCE: &str = "ServiceInstance";
    pub const HOST: &str = "HostSystem";
    pub const CLUSTER: &str = "ClusterComputeResource";
    pub const COMPUTE_RESOURCE: &str = "ComputeResource";
    pub const DATACENTER: &str = "Datacenter";
    pub const DATASTORE: &str = "Datastore";
    pub const FOLDER: &str = "Folder";
    pub const RESOURCE_POOL: &str = "ResourcePool";
    pub const NETWORK: &str = "Network";
    pub const DV_PORTGROUP: &str = "DistributedVirtualPortgroup";
    pub const DV_SWITCH: &str = "VmwareDistributedVirtualSwitch";
    pub const NETWORK_SYSTEM: &str = "HostNetworkSystem";
    pub const VIRTUAL_MACHINE: &str = "VirtualMachine";
    pub const SNAPSHOT: &str = "VirtualMachineSnapshot";
    pub const TASK: &str = "Task";
}

/// Opaque handle to a remote object.
///
/// Only valid for the session generation it was obtained in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(rename = "value")]
    pub id: String,
}

impl ManagedObjectRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// The root object every endpoint exposes.
    pub fn service_instance() -> Self {
        Self::new(kinds::SERVICE_INSTANCE, "ServiceInstance")
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Clusters are compute resources too.
    pub fn is_compute_resource(&self) -> bool {
        self.kind == kinds::COMPUTE_RESOURCE || self.kind == kinds::CLUSTER
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// =============================================================================
// HOSTS
// =============================================================================

/// Summary of one hypervisor host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_ref: ManagedObjectRef,
    /// IP address or name the host is registered under
    pub identity: String,
    /// False when the endpoint itself is this single host
    pub managed_by_central_controller: bool,
    pub cpu_cores: u32,
    pub memory_total_bytes: u64,
    /// Not reported by every endpoint
    pub memory_used_bytes: Option<u64>,
}

/// Storage initiator identity of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInitiator {
    pub protocol: String,
    pub iqn: Option<String>,
}

/// Where to point a VNC client for a VM console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    pub host: String,
    pub port: u16,
}

// =============================================================================
// NETWORKS
// =============================================================================

/// Switch family a network attachment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkKind {
    Standard,
    Distributed,
}

/// Discriminant of [`Vlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VlanKind {
    None,
    Single,
    TrunkRange,
    Private,
}

/// VLAN configuration of a network attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Vlan {
    None,
    Single { id: u16 },
    TrunkRange { start: u16, end: u16 },
    Private { id: u16 },
}

impl Vlan {
    pub fn kind(&self) -> VlanKind {
        match self {
            Vlan::None => VlanKind::None,
            Vlan::Single { .. } => VlanKind::Single,
            Vlan::TrunkRange { .. } => VlanKind::TrunkRange,
            Vlan::Private { .. } => VlanKind::Private,
        }
    }

    /// Textual VLAN id: `"42"` for single and private VLANs, `"[10,20]"` for trunks.
    pub fn id(&self) -> Option<String> {
        match self {
            Vlan::None => None,
            Vlan::Single { id } | Vlan::Private { id } => Some(id.to_string()),
            Vlan::TrunkRange { start, end } => Some(format!("[{},{}]", start, end)),
        }
    }
}

/// Distributed switch coordinates of a portgroup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedPort {
    pub dvs_uuid: String,
    pub portgroup_key: String,
}

/// A network a VM adapter can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub kind: NetworkKind,
    pub name: String,
    pub vlan: Vlan,
    /// Present exactly when `kind` is `Distributed`
    pub distributed: Option<DistributedPort>,
}

impl NetworkAttachment {
    pub fn standard(name: impl Into<String>, vlan: Vlan) -> Self {
        Self {
            kind: NetworkKind::Standard,
            name: name.into(),
            vlan,
            distributed: None,
        }
    }

    pub fn distributed(name: impl Into<String>, vlan: Vlan, port: DistributedPort) -> Self {
        Self {
            kind: NetworkKind::Distributed,
            name: name.into(),
            vlan,
            distributed: Some(port),
        }
    }

    pub fn vlan_kind(&self) -> VlanKind {
        self.vlan.kind()
    }

    pub fn vlan_id(&self) -> Option<String> {
        self.vlan.id()
    }
}

// =============================================================================
// VM SPECIFICATION INPUTS
// =============================================================================

/// Compute sizing of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub cpus: u32,
    pub cores_per_socket: u32,
    pub memory_mb: u64,
}

impl Default for Sizing {
    fn default() -> Self {
        Self {
            cpus: 1,
            cores_per_socket: 1,
            memory_mb: 1024,
        }
    }
}

impl Sizing {
    pub fn new(cpus: u32, cores_per_socket: u32, memory_mb: u64) -> Self {
        Self {
            cpus,
            cores_per_socket,
            memory_mb,
        }
    }
}

/// Requested network interface, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VifInput {
    /// Network name as seen from the host
    pub network: String,
    /// Adapter model identifier, e.g. `vmxnet3`
    pub model: String,
    pub mac_address: Option<String>,
    /// External port identity, published as `nvp.iface-id.<n>` on reconfigure
    pub iface_id: Option<String>,
}

impl VifInput {
    pub fn new(network: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            model: model.into(),
            mac_address: None,
            iface_id: None,
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }

    pub fn with_iface_id(mut self, iface_id: impl Into<String>) -> Self {
        self.iface_id = Some(iface_id.into());
        self
    }
}

/// Requested storage device, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageInput {
    /// Raw block device mapped through to the VM
    Block { device_path: String },
    /// Virtual disk file, relative to the resolved datastore unless already bracketed
    Disk { file_name: String, capacity_kb: u64 },
}

/// Firmware the VM boots with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Efi,
}

/// Supported virtual network adapter models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterModel {
    E1000,
    E1000e,
    Pcnet32,
    Sriov,
    Vmxnet,
    Vmxnet3,
}

impl AdapterModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterModel::E1000 => "e1000",
            AdapterModel::E1000e => "e1000e",
            AdapterModel::Pcnet32 => "pcnet32",
            AdapterModel::Sriov => "sriov",
            AdapterModel::Vmxnet => "vmxnet",
            AdapterModel::Vmxnet3 => "vmxnet3",
        }
    }

    /// Remote device type the adapter is created as.
    pub fn device_type(&self) -> &'static str {
        match self {
            AdapterModel::E1000 => "VirtualE1000",
            AdapterModel::E1000e => "VirtualE1000e",
            AdapterModel::Pcnet32 => "VirtualPCNet32",
            AdapterModel::Sriov => "VirtualSriovEthernetCard",
            AdapterModel::Vmxnet => "VirtualVmxnet",
            AdapterModel::Vmxnet3 => "VirtualVmxnet3",
        }
    }
}

impl FromStr for AdapterModel {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "e1000" => Ok(AdapterModel::E1000),
            "e1000e" => Ok(AdapterModel::E1000e),
            "pcnet32" => Ok(AdapterModel::Pcnet32),
            "sriov" => Ok(AdapterModel::Sriov),
            "vmxnet" => Ok(AdapterModel::Vmxnet),
            "vmxnet3" => Ok(AdapterModel::Vmxnet3),
            _ => Err(ControlPlaneError::UnsupportedAdapterModel {
                model: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// VM SPECIFICATIONS
// =============================================================================

/// A network adapter bound to a resolved network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VifSpec {
    pub mac_address: Option<String>,
    pub model: AdapterModel,
    pub network: NetworkAttachment,
    /// Negative placeholder, replaced by the remote side on success
    pub device_key: i32,
}

/// Storage controller all disks of a VM attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    pub device_key: i32,
    /// Remote device type, e.g. `VirtualLsiLogicController`
    pub device_type: String,
    pub bus_number: u32,
    pub shared_bus: String,
}

/// Backing of an attached storage device after datastore resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageBacking {
    RawDevice { device_name: String },
    FlatFile { file_name: String, capacity_kb: u64 },
}

/// A storage device attached to the VM's controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAttachment {
    pub device_key: i32,
    pub controller_key: i32,
    pub unit_number: u32,
    pub backing: StorageBacking,
}

/// Key/value option stored in the VM's extra configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

impl OptionValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Guest tools power-cycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    pub after_power_on: bool,
    pub after_resume: bool,
    pub before_guest_standby: bool,
    pub before_guest_shutdown: bool,
    pub before_guest_reboot: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            after_power_on: true,
            after_resume: true,
            before_guest_standby: true,
            before_guest_shutdown: true,
            before_guest_reboot: true,
        }
    }
}

/// Payload of a VM creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCreateSpec {
    pub name: String,
    pub instance_uuid: String,
    pub guest_id: String,
    /// Datastore the VM files live on, e.g. `[ds1]`
    pub vm_path_name: String,
    pub cpus: u32,
    pub cores_per_socket: u32,
    pub memory_mb: u64,
    pub vifs: Vec<VifSpec>,
    pub controller: ControllerSpec,
    pub storage: Vec<StorageAttachment>,
    pub vnc_port: u16,
    pub firmware: Firmware,
    pub tools: ToolsConfig,
    pub extra_config: Vec<OptionValue>,
}

/// Payload of a VM reconfiguration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmReconfigureSpec {
    pub name: String,
    pub cpus: u32,
    pub cores_per_socket: u32,
    pub memory_mb: u64,
    pub vifs: Vec<VifSpec>,
    pub vnc_port: Option<u16>,
    pub extra_config: Vec<OptionValue>,
}

impl VmCreateSpec {
    /// Look up an extra-config option by key.
    pub fn option(&self, key: &str) -> Option<&str> {
        find_option(&self.extra_config, key)
    }
}

impl VmReconfigureSpec {
    /// Look up an extra-config option by key.
    pub fn option(&self, key: &str) -> Option<&str> {
        find_option(&self.extra_config, key)
    }
}

fn find_option<'a>(options: &'a [OptionValue], key: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|o| o.key == key)
        .map(|o| o.value.as_str())
}

// =============================================================================
// TASKS AND VM STATE
// =============================================================================

/// Handle to an asynchronous remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_ref: ManagedObjectRef,
    /// Remote method that produced the task
    pub kind: String,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    pub fn submitted(task_ref: ManagedObjectRef, kind: impl Into<String>) -> Self {
        Self {
            task_ref,
            kind: kind.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Successful terminal state of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub task: Task,
    pub result: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

/// A VNC port chosen for a VM. Advisory: nothing reserves it remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncPortLease {
    pub port: u16,
}

/// Power state reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        }
    }
}

/// Result of a successful VM creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedVm {
    pub vm_ref: ManagedObjectRef,
    pub instance_uuid: String,
    pub vnc_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_ids() {
        assert_eq!(Vlan::None.id(), None);
        assert_eq!(Vlan::Single { id: 42 }.id().as_deref(), Some("42"));
        assert_eq!(
            Vlan::TrunkRange { start: 10, end: 20 }.id().as_deref(),
            Some("[10,20]")
        );
        assert_eq!(Vlan::Private { id: 7 }.kind(), VlanKind::Private);
    }

    #[test]
    fn test_adapter_model_parse() {
        assert_eq!("VMXNET3".parse::<AdapterModel>().unwrap(), AdapterModel::Vmxnet3);
        assert_eq!(AdapterModel::E1000e.device_type(), "VirtualE1000e");
        assert!(matches!(
            "virtio".parse::<AdapterModel>(),
            Err(ControlPlaneError::UnsupportedAdapterModel { model }) if model == "virtio"
        ));
    }

    #[test]
    fn test_managed_object_ref_wire_shape() {
        let host = ManagedObjectRef::new(kinds::HOST, "host-12");
        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json, serde_json::json!({"_type": "HostSystem", "value": "host-12"}));
        assert_eq!(host.to_string(), "HostSystem:host-12");
        assert!(ManagedObjectRef::new(kinds::CLUSTER, "c1").is_compute_resource());
    }

    #[test]
    fn test_distributed_attachment_carries_port() {
        let port = DistributedPort {
            dvs_uuid: "50 2a".to_string(),
            portgroup_key: "dvportgroup-9".to_string(),
        };
        let net = NetworkAttachment::distributed("dv-prod", Vlan::Single { id: 42 }, port);
        assert_eq!(net.kind, NetworkKind::Distributed);
        assert!(net.distributed.is_some());
        assert!(NetworkAttachment::standard("VM Network", Vlan::None).distributed.is_none());
    }
}
