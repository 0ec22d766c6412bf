//! Decoding of property values returned by the control plane.
//!
//! Replies arrive as loosely-typed JSON. This module turns them into typed
//! structs once, at the boundary, so nothing downstream has to look at
//! `_type` tags or raw maps.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ControlPlaneError, Result};
use crate::types::{ManagedObjectRef, Vlan};

/// Property path -> value, as returned for one object.
pub type PropertyMap = BTreeMap<String, Value>;

/// One object and the requested properties that are set on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectContent {
    pub obj: ManagedObjectRef,
    #[serde(default)]
    pub props: PropertyMap,
}

impl ObjectContent {
    pub fn prop(&self, path: &str) -> Option<&Value> {
        self.props.get(path)
    }

    pub fn string(&self, path: &str) -> Option<&str> {
        self.props.get(path).and_then(Value::as_str)
    }
}

/// One page of an enumeration. `token` is present while more pages remain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub objects: Vec<ObjectContent>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Decode a property value into `T`, naming the path on failure.
pub fn decode<T: DeserializeOwned>(path: &str, value: &Value) -> Result<T> {
    T::deserialize(value)
        .map_err(|e| ControlPlaneError::MalformedReply(format!("{}: {}", path, e)))
}

/// Decode a property that must be present.
pub fn required<T: DeserializeOwned>(props: &PropertyMap, path: &str) -> Result<T> {
    let value = props
        .get(path)
        .ok_or_else(|| ControlPlaneError::MalformedReply(format!("missing property {}", path)))?;
    decode(path, value)
}

/// Decode a property that may be unset.
pub fn optional<T: DeserializeOwned>(props: &PropertyMap, path: &str) -> Result<Option<T>> {
    match props.get(path) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(path, value).map(Some),
    }
}

// =============================================================================
// NETWORKS
// =============================================================================

/// `summary` of a network object.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSummary {
    pub network: ManagedObjectRef,
    pub name: String,
}

/// Entry of a host's `config.network.portgroup` list.
#[derive(Debug, Clone, Deserialize)]
pub struct HostPortGroup {
    pub spec: HostPortGroupSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPortGroupSpec {
    pub name: String,
    #[serde(default)]
    pub vlan_id: Option<u16>,
    #[serde(default)]
    pub vswitch_name: Option<String>,
}

/// Entry of a host's `config.network.vswitch` list.
#[derive(Debug, Clone, Deserialize)]
pub struct HostVirtualSwitch {
    pub name: String,
}

/// `config` of a distributed virtual portgroup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DvPortgroupConfig {
    pub key: String,
    pub name: String,
    pub distributed_virtual_switch: ManagedObjectRef,
    #[serde(default)]
    pub default_port_config: DvPortSetting,
}

impl DvPortgroupConfig {
    /// Uplink portgroups override the teaming order instead of inheriting it.
    pub fn is_uplink(&self) -> bool {
        self.default_port_config
            .uplink_teaming_policy
            .as_ref()
            .and_then(|policy| policy.uplink_port_order.as_ref())
            .map(|order| !order.inherited)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DvPortSetting {
    #[serde(default)]
    pub vlan: Option<Value>,
    #[serde(default)]
    pub uplink_teaming_policy: Option<UplinkTeamingPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkTeamingPolicy {
    #[serde(default)]
    pub uplink_port_order: Option<InheritablePolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InheritablePolicy {
    pub inherited: bool,
}

pub const VLAN_ID_SPEC: &str = "VmwareDistributedVirtualSwitchVlanIdSpec";
pub const TRUNK_VLAN_SPEC: &str = "VmwareDistributedVirtualSwitchTrunkVlanSpec";
pub const PVLAN_SPEC: &str = "VmwareDistributedVirtualSwitchPvlanSpec";

#[derive(Deserialize)]
#[serde(tag = "_type")]
enum WireVlan {
    #[serde(rename = "VmwareDistributedVirtualSwitchVlanIdSpec")]
    VlanId {
        #[serde(rename = "vlanId")]
        vlan_id: u16,
    },
    #[serde(rename = "VmwareDistributedVirtualSwitchTrunkVlanSpec")]
    Trunk {
        #[serde(rename = "vlanId")]
        ranges: Vec<NumericRange>,
    },
    #[serde(rename = "VmwareDistributedVirtualSwitchPvlanSpec")]
    Pvlan {
        #[serde(rename = "pvlanId")]
        pvlan_id: u16,
    },
}

#[derive(Deserialize)]
struct NumericRange {
    start: u16,
    end: u16,
}

/// Decode a distributed portgroup's VLAN setting.
///
/// Unknown `_type` tags are `UnsupportedVlanKind`; a known tag with a bad body
/// is `MalformedReply`. Only the first trunk range is reported.
pub fn decode_vlan(value: &Value) -> Result<Vlan> {
    let tag = value
        .get("_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ControlPlaneError::UnsupportedVlanKind("<untagged>".to_string()))?;

    if ![VLAN_ID_SPEC, TRUNK_VLAN_SPEC, PVLAN_SPEC].contains(&tag) {
        return Err(ControlPlaneError::UnsupportedVlanKind(tag.to_string()));
    }

    match decode::<WireVlan>("vlan", value)? {
        WireVlan::VlanId { vlan_id } => Ok(Vlan::Single { id: vlan_id }),
        WireVlan::Trunk { ranges } => ranges
            .first()
            .map(|r| Vlan::TrunkRange {
                start: r.start,
                end: r.end,
            })
            .ok_or_else(|| ControlPlaneError::MalformedReply("trunk VLAN without ranges".to_string())),
        WireVlan::Pvlan { pvlan_id } => Ok(Vlan::Private { id: pvlan_id }),
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Entry of a datastore's `host` list.
#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreHostMount {
    pub key: ManagedObjectRef,
}

/// Entry of a host's `config.storageDevice.hostBusAdapter` list.
#[derive(Debug, Clone, Deserialize)]
pub struct HostBusAdapter {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(rename = "iScsiName", default)]
    pub iscsi_name: Option<String>,
}

impl HostBusAdapter {
    pub fn is_iscsi(&self) -> bool {
        self.kind == "HostInternetScsiHba"
    }
}

// =============================================================================
// TASKS AND VMS
// =============================================================================

/// Remote task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

/// `info` of a task object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub state: TaskState,
    #[serde(default)]
    pub progress: Option<u32>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Node of a VM's `snapshot.rootSnapshotList` tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTree {
    pub name: String,
    pub snapshot: ManagedObjectRef,
    #[serde(default)]
    pub child_snapshot_list: Vec<SnapshotTree>,
}

impl SnapshotTree {
    /// Depth-first search for a snapshot by name.
    pub fn find<'a>(trees: &'a [SnapshotTree], name: &str) -> Option<&'a SnapshotTree> {
        trees.iter().find_map(|tree| {
            if tree.name == name {
                Some(tree)
            } else {
                Self::find(&tree.child_snapshot_list, name)
            }
        })
    }
}

/// Parse a VNC port option value, which may be stored as a string or a number.
pub fn parse_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
