//! In-memory control plane for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::transport::{ConnectionHandle, Credentials, Endpoint, Transport, TransportFault, TransportResult};
use crate::types::{kinds, ManagedObjectRef, PowerState, VmCreateSpec, VmReconfigureSpec};
use crate::wire::{ObjectContent, Page, PropertyMap, TaskInfo, TaskState};
use crate::allocator::VNC_PORT_PROPERTY;

/// Mock control plane that keeps its inventory in memory.
///
/// Models the parts of a managed-object hierarchy the client walks:
/// datacenters, folders, clusters, hosts, datastores, standard and
/// distributed networks, VMs, snapshots and tasks. Useful for:
/// - Unit and integration testing
/// - Development without a reachable control plane (`virtplane --dev`)
///
/// Every call is recorded, and faults can be injected: rejected logins,
/// unauthorized replies, per-method remote errors, failing and stalled tasks.
pub struct MockControlPlane {
    inventory: RwLock<Inventory>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<RecordedCall>>,
    logins: AtomicUsize,
}

/// One call received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// `login`, `logout`, `invoke`, `properties`, `enumerate` or `continue`
    pub operation: &'static str,
    pub target: Option<ManagedObjectRef>,
    /// Method name for `invoke`, object kind for `enumerate`
    pub method: Option<String>,
}

struct MockObject {
    obj: ManagedObjectRef,
    props: PropertyMap,
}

struct Cursor {
    remaining: Vec<ObjectContent>,
    page_size: usize,
}

struct PendingTask {
    polls_left: u32,
    outcome: TaskInfo,
}

#[derive(Default)]
struct Inventory {
    objects: Vec<MockObject>,
    next_id: u64,
    sessions: HashSet<String>,
    cursors: HashMap<String, Cursor>,
    pending: HashMap<ManagedObjectRef, PendingTask>,
}

#[derive(Default)]
struct Faults {
    reject_logins: bool,
    unauthorized_calls: usize,
    method_errors: HashMap<String, (u16, String)>,
    task_errors: HashMap<String, Value>,
    stall_tasks: bool,
    task_polls: u32,
}

enum Outcome {
    Immediate(Value),
    Task(Result<Option<Value>, Value>),
}

fn props<const N: usize>(entries: [(&str, Value); N]) -> PropertyMap {
    entries
        .into_iter()
        .map(|(path, value)| (path.to_string(), value))
        .collect()
}

fn to_json(obj: &ManagedObjectRef) -> Value {
    json!({"_type": obj.kind, "value": obj.id})
}

fn bad_request(message: impl Into<String>) -> TransportFault {
    TransportFault::Status {
        code: 400,
        body: message.into(),
    }
}

fn not_found(obj: &ManagedObjectRef) -> TransportFault {
    TransportFault::Status {
        code: 404,
        body: format!("ManagedObjectNotFound: {}", obj),
    }
}

impl Inventory {
    fn allocate(&mut self, kind: &str, prefix: &str) -> ManagedObjectRef {
        self.next_id += 1;
        ManagedObjectRef::new(kind, format!("{}-{}", prefix, self.next_id))
    }

    fn insert(&mut self, obj: ManagedObjectRef, props: PropertyMap) {
        self.objects.push(MockObject { obj, props });
    }

    fn get(&self, obj: &ManagedObjectRef) -> Option<&PropertyMap> {
        self.objects.iter().find(|o| &o.obj == obj).map(|o| &o.props)
    }

    fn get_mut(&mut self, obj: &ManagedObjectRef) -> Option<&mut PropertyMap> {
        self.objects
            .iter_mut()
            .find(|o| &o.obj == obj)
            .map(|o| &mut o.props)
    }

    fn set(&mut self, obj: &ManagedObjectRef, path: &str, value: Value) {
        if let Some(props) = self.get_mut(obj) {
            props.insert(path.to_string(), value);
        }
    }

    fn push(&mut self, obj: &ManagedObjectRef, path: &str, value: Value) {
        if let Some(props) = self.get_mut(obj) {
            let list = props.entry(path.to_string()).or_insert_with(|| json!([]));
            if let Value::Array(items) = list {
                items.push(value);
            }
        }
    }

    fn retain(&mut self, obj: &ManagedObjectRef, path: &str, keep: impl Fn(&Value) -> bool) {
        if let Some(Value::Array(items)) = self.get_mut(obj).and_then(|p| p.get_mut(path)) {
            items.retain(|item| keep(item));
        }
    }

    fn remove(&mut self, obj: &ManagedObjectRef) {
        self.objects.retain(|o| &o.obj != obj);
    }

    fn reference(&self, obj: &ManagedObjectRef, path: &str) -> Option<ManagedObjectRef> {
        self.get(obj)
            .and_then(|p| p.get(path))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn find_by_name(&self, kind: &str, name: &str) -> Option<ManagedObjectRef> {
        self.objects
            .iter()
            .find(|o| o.obj.kind == kind && o.props.get("name").and_then(Value::as_str) == Some(name))
            .map(|o| o.obj.clone())
    }

    fn matches_kind(obj: &ManagedObjectRef, kind: &str) -> bool {
        obj.kind == kind
            || (kind == kinds::COMPUTE_RESOURCE && obj.kind == kinds::CLUSTER)
            || (kind == kinds::NETWORK && obj.kind == kinds::DV_PORTGROUP)
    }

    fn select(props: &PropertyMap, paths: &[String]) -> PropertyMap {
        paths
            .iter()
            .filter_map(|path| props.get(path).map(|v| (path.clone(), v.clone())))
            .collect()
    }

    fn new_host(&mut self, name: &str) -> ManagedObjectRef {
        let host = self.allocate(kinds::HOST, "host");
        let network_system = self.allocate(kinds::NETWORK_SYSTEM, "networkSystem");
        self.insert(network_system.clone(), props([("host", to_json(&host))]));
        self.insert(
            host.clone(),
            props([
                ("name", json!(name)),
                ("summary.hardware.numCpuCores", json!(16)),
                ("summary.hardware.memorySize", json!(68_719_476_736u64)),
                ("summary.quickStats.overallMemoryUsage", json!(8192)),
                ("vm", json!([])),
                ("network", json!([])),
                ("config.network.portgroup", json!([])),
                ("config.network.vswitch", json!([{"name": "vSwitch0"}])),
                ("configManager.networkSystem", to_json(&network_system)),
                ("config.storageDevice.hostBusAdapter", json!([])),
            ]),
        );
        host
    }

    fn attach_standard_network(&mut self, host: &ManagedObjectRef, name: &str, vswitch: &str, vlan: Option<u16>) -> ManagedObjectRef {
        let network = match self.find_by_name(kinds::NETWORK, name) {
            Some(existing) => existing,
            None => {
                let network = self.allocate(kinds::NETWORK, "network");
                self.insert(
                    network.clone(),
                    props([
                        ("name", json!(name)),
                        ("summary", json!({"network": to_json(&network), "name": name})),
                    ]),
                );
                network
            }
        };

        let mut spec = json!({"name": name, "vswitchName": vswitch});
        if let Some(vlan) = vlan {
            spec["vlanId"] = json!(vlan);
        }
        self.push(host, "config.network.portgroup", json!({"spec": spec}));
        self.push(host, "network", to_json(&network));
        network
    }

    fn task_owner_vm(&self, target: &ManagedObjectRef) -> Option<ManagedObjectRef> {
        if target.is_kind(kinds::VIRTUAL_MACHINE) {
            Some(target.clone())
        } else {
            self.reference(target, "vm")
        }
    }
}

impl MockControlPlane {
    /// Create an empty mock reporting the given `about.apiType`.
    pub fn new(api_type: &str) -> Self {
        info!(api_type, "Creating mock control plane");
        let mut inventory = Inventory::default();
        inventory.insert(
            ManagedObjectRef::service_instance(),
            props([("content.about.apiType", json!(api_type))]),
        );

        Self {
            inventory: RwLock::new(inventory),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(Vec::new()),
            logins: AtomicUsize::new(0),
        }
    }

    /// An empty central manager (vCenter-style).
    pub fn central() -> Self {
        Self::new("VirtualCenter")
    }

    /// An empty single-host endpoint (ESXi-style).
    pub fn standalone() -> Self {
        Self::new("HostAgent")
    }

    /// A central manager seeded with a small demo inventory.
    ///
    /// Host `10.0.0.5` sees datastores `Drp_scratch`, `ds0` (full) and `ds1`,
    /// the standard networks `VM Network` and `Storage Net` (VLAN 42), and the
    /// distributed portgroups `dv-prod`, `dv-trunk` and `dv-uplinks`. VM
    /// `web-01` holds VNC port 5901 and tracks one SCSI and one IDE disk.
    pub fn demo() -> Self {
        let mock = Self::central();
        let dc = mock.add_datacenter("dc1");
        let cluster = mock.add_cluster(&dc, "cluster1");
        let h5 = mock.add_host(&cluster, "10.0.0.5");
        let h6 = mock.add_host(&cluster, "10.0.0.6");

        mock.add_datastore("Drp_scratch", 500u64 << 30, &[&h5]);
        mock.add_datastore("ds0", 0, &[&h5, &h6]);
        mock.add_datastore("ds1", 2u64 << 40, &[&h5]);
        mock.add_datastore("ds2", 1u64 << 40, &[&h6]);

        mock.add_standard_network(&h5, "VM Network", None);
        mock.add_standard_network(&h6, "VM Network", None);
        mock.add_standard_network(&h5, "Storage Net", Some(42));

        let dvs = mock.add_dvs("dvs-prod", "50 2a 3c 9e 11 7f 4b d0-8c 61 0a 7e 25 41 93 b2");
        mock.add_dv_portgroup(
            &dvs,
            &[&h5, &h6],
            "dv-prod",
            json!({"_type": "VmwareDistributedVirtualSwitchVlanIdSpec", "vlanId": 42}),
            false,
        );
        mock.add_dv_portgroup(
            &dvs,
            &[&h5],
            "dv-trunk",
            json!({"_type": "VmwareDistributedVirtualSwitchTrunkVlanSpec", "vlanId": [{"start": 10, "end": 20}]}),
            false,
        );
        mock.add_dv_portgroup(
            &dvs,
            &[&h5, &h6],
            "dv-uplinks",
            json!({"_type": "VmwareDistributedVirtualSwitchTrunkVlanSpec", "vlanId": [{"start": 0, "end": 4094}]}),
            true,
        );

        mock.add_iscsi_adapter(&h5, "iqn.1998-01.com.vmware:esx-05");
        let web = mock.add_vm(&h5, "web-01", PowerState::PoweredOn, Some(5901));
        mock.set_property(
            &web,
            "config.extraConfig",
            json!([
                {"key": "scsi0:0.ctkEnabled", "value": "TRUE"},
                {"key": "scsi0:1.ctkEnabled", "value": "FALSE"},
                {"key": "ide0:0.ctkEnabled", "value": "TRUE"},
                {"key": "ctkEnabled", "value": "TRUE"}
            ]),
        );
        mock.add_vm(&h6, "db-01", PowerState::PoweredOff, None);
        mock
    }

    fn seed(&self) -> RwLockWriteGuard<'_, Inventory> {
        self.inventory.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> TransportResult<RwLockWriteGuard<'_, Inventory>> {
        self.inventory
            .write()
            .map_err(|_| TransportFault::Io("Lock poisoned".to_string()))
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Inventory seeding
    // =========================================================================

    /// Add a datacenter with empty host and VM folders.
    pub fn add_datacenter(&self, name: &str) -> ManagedObjectRef {
        let mut inv = self.seed();
        let host_folder = inv.allocate(kinds::FOLDER, "group-h");
        let vm_folder = inv.allocate(kinds::FOLDER, "group-v");
        inv.insert(host_folder.clone(), props([("childEntity", json!([]))]));
        inv.insert(vm_folder.clone(), props([("childEntity", json!([]))]));

        let dc = inv.allocate(kinds::DATACENTER, "datacenter");
        inv.insert(
            dc.clone(),
            props([
                ("name", json!(name)),
                ("hostFolder", to_json(&host_folder)),
                ("vmFolder", to_json(&vm_folder)),
            ]),
        );
        dc
    }

    /// Add a cluster (with its root resource pool) to a datacenter's host folder.
    pub fn add_cluster(&self, datacenter: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let mut inv = self.seed();
        let pool = inv.allocate(kinds::RESOURCE_POOL, "resgroup");
        inv.insert(pool.clone(), props([("name", json!("Resources"))]));

        let cluster = inv.allocate(kinds::CLUSTER, "domain-c");
        inv.insert(
            cluster.clone(),
            props([
                ("name", json!(name)),
                ("host", json!([])),
                ("resourcePool", to_json(&pool)),
            ]),
        );
        if let Some(folder) = inv.reference(datacenter, "hostFolder") {
            inv.push(&folder, "childEntity", to_json(&cluster));
        }
        cluster
    }

    /// Add a host as a member of a cluster.
    pub fn add_host(&self, cluster: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let mut inv = self.seed();
        let host = inv.new_host(name);
        inv.push(cluster, "host", to_json(&host));
        inv.set(&host, "parent", to_json(cluster));
        host
    }

    /// Add a host directly under a datacenter's host folder, outside any
    /// cluster. Its parent is a single-host compute resource with its own
    /// root resource pool.
    pub fn add_standalone_host(&self, datacenter: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let mut inv = self.seed();
        let host = inv.new_host(name);

        let pool = inv.allocate(kinds::RESOURCE_POOL, "resgroup");
        inv.insert(pool.clone(), props([("name", json!("Resources"))]));
        let compute = inv.allocate(kinds::COMPUTE_RESOURCE, "domain-s");
        inv.insert(
            compute.clone(),
            props([("name", json!(name)), ("resourcePool", to_json(&pool))]),
        );
        inv.set(&host, "parent", to_json(&compute));

        if let Some(folder) = inv.reference(datacenter, "hostFolder") {
            inv.push(&folder, "childEntity", to_json(&host));
        }
        host
    }

    /// Add a datastore mounted on the given hosts.
    pub fn add_datastore(&self, name: &str, free_space: u64, hosts: &[&ManagedObjectRef]) -> ManagedObjectRef {
        let mut inv = self.seed();
        let datastore = inv.allocate(kinds::DATASTORE, "datastore");
        let mounts: Vec<Value> = hosts
            .iter()
            .map(|h| json!({"key": to_json(h), "mountInfo": {"accessible": true}}))
            .collect();
        inv.insert(
            datastore.clone(),
            props([
                ("name", json!(name)),
                ("summary.freeSpace", json!(free_space)),
                ("host", Value::Array(mounts)),
            ]),
        );
        datastore
    }

    /// Add a standard-switch port group on `vSwitch0` of a host.
    pub fn add_standard_network(&self, host: &ManagedObjectRef, name: &str, vlan: Option<u16>) -> ManagedObjectRef {
        self.seed().attach_standard_network(host, name, "vSwitch0", vlan)
    }

    /// Add a network object the host can see without any local port group.
    pub fn add_orphan_network(&self, host: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let mut inv = self.seed();
        let network = inv.allocate(kinds::NETWORK, "network");
        inv.insert(
            network.clone(),
            props([
                ("name", json!(name)),
                ("summary", json!({"network": to_json(&network), "name": name})),
            ]),
        );
        inv.push(host, "network", to_json(&network));
        network
    }

    /// Add a distributed virtual switch.
    pub fn add_dvs(&self, name: &str, uuid: &str) -> ManagedObjectRef {
        let mut inv = self.seed();
        let dvs = inv.allocate(kinds::DV_SWITCH, "dvs");
        inv.insert(dvs.clone(), props([("name", json!(name)), ("config.uuid", json!(uuid))]));
        dvs
    }

    /// Add a distributed portgroup visible to the given hosts.
    ///
    /// `vlan` is the raw wire value of the portgroup's VLAN setting. Uplink
    /// portgroups do not inherit their teaming order.
    pub fn add_dv_portgroup(
        &self,
        dvs: &ManagedObjectRef,
        hosts: &[&ManagedObjectRef],
        name: &str,
        vlan: Value,
        uplink: bool,
    ) -> ManagedObjectRef {
        let mut inv = self.seed();
        let portgroup = inv.allocate(kinds::DV_PORTGROUP, "dvportgroup");
        inv.insert(
            portgroup.clone(),
            props([
                ("name", json!(name)),
                ("summary", json!({"network": to_json(&portgroup), "name": name})),
                (
                    "config",
                    json!({
                        "key": portgroup.id,
                        "name": name,
                        "distributedVirtualSwitch": to_json(dvs),
                        "defaultPortConfig": {
                            "vlan": vlan,
                            "uplinkTeamingPolicy": {"uplinkPortOrder": {"inherited": !uplink}}
                        }
                    }),
                ),
            ]),
        );
        for host in hosts {
            inv.push(host, "network", to_json(&portgroup));
        }
        portgroup
    }

    /// Add an iSCSI bus adapter to a host.
    pub fn add_iscsi_adapter(&self, host: &ManagedObjectRef, iqn: &str) {
        self.seed().push(
            host,
            "config.storageDevice.hostBusAdapter",
            json!({"_type": "HostInternetScsiHba", "device": "vmhba64", "iScsiName": iqn}),
        );
    }

    /// Add a VM on a host, optionally holding a VNC port.
    pub fn add_vm(&self, host: &ManagedObjectRef, name: &str, power: PowerState, vnc_port: Option<u16>) -> ManagedObjectRef {
        let mut inv = self.seed();
        let vm = inv.allocate(kinds::VIRTUAL_MACHINE, "vm");
        let mut vm_props = props([
            ("name", json!(name)),
            ("runtime.powerState", json!(power.as_str())),
            ("runtime.host", to_json(host)),
            ("config.instanceUuid", json!(uuid::Uuid::new_v4().to_string())),
            ("snapshot.rootSnapshotList", json!([])),
        ]);
        if let Some(port) = vnc_port {
            vm_props.insert(VNC_PORT_PROPERTY.to_string(), json!(port.to_string()));
        }
        inv.insert(vm.clone(), vm_props);
        inv.push(host, "vm", to_json(&vm));
        vm
    }

    /// Overwrite a property of any object.
    pub fn set_property(&self, obj: &ManagedObjectRef, path: &str, value: Value) {
        self.seed().set(obj, path, value);
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Invalidate every issued connection handle.
    pub fn expire_sessions(&self) {
        self.seed().sessions.clear();
    }

    /// Reject every login attempt.
    pub fn reject_logins(&self, reject: bool) {
        self.faults().reject_logins = reject;
    }

    /// Answer the next `count` non-login calls with unauthorized.
    pub fn reject_next_calls(&self, count: usize) {
        self.faults().unauthorized_calls = count;
    }

    /// Make every invocation of `method` fail with the given status.
    pub fn fail_method(&self, method: &str, code: u16, body: &str) {
        self.faults()
            .method_errors
            .insert(method.to_string(), (code, body.to_string()));
    }

    /// Make tasks created by `method` terminate in the error state.
    pub fn fail_tasks(&self, method: &str, error: Value) {
        self.faults().task_errors.insert(method.to_string(), error);
    }

    /// Keep new tasks running forever.
    pub fn stall_tasks(&self, stall: bool) {
        self.faults().stall_tasks = stall;
    }

    /// Report new tasks as running for `polls` property reads before they finish.
    pub fn task_polls(&self, polls: u32) {
        self.faults().task_polls = polls;
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }

    /// Methods invoked so far, in order.
    pub fn invoked_methods(&self) -> Vec<String> {
        self.calls_of("invoke")
            .into_iter()
            .filter_map(|c| c.method)
            .collect()
    }

    pub fn property(&self, obj: &ManagedObjectRef, path: &str) -> Option<Value> {
        self.seed().get(obj).and_then(|p| p.get(path)).cloned()
    }

    pub fn find(&self, kind: &str, name: &str) -> Option<ManagedObjectRef> {
        self.seed().find_by_name(kind, name)
    }

    fn record(&self, operation: &'static str, target: Option<&ManagedObjectRef>, method: Option<&str>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                operation,
                target: target.cloned(),
                method: method.map(str::to_string),
            });
        }
    }

    fn authorize(&self, handle: &ConnectionHandle) -> TransportResult<()> {
        {
            let mut faults = self.faults();
            if faults.unauthorized_calls > 0 {
                faults.unauthorized_calls -= 1;
                return Err(TransportFault::Unauthorized);
            }
        }
        if self.state()?.sessions.contains(handle.as_str()) {
            Ok(())
        } else {
            Err(TransportFault::Unauthorized)
        }
    }

    // =========================================================================
    // Remote method effects
    // =========================================================================

    fn apply(inv: &mut Inventory, target: &ManagedObjectRef, method: &str, args: &Value) -> TransportResult<Outcome> {
        match method {
            "CreateVM_Task" => {
                let spec: VmCreateSpec = serde_json::from_value(args["config"].clone())
                    .map_err(|e| bad_request(format!("invalid config: {}", e)))?;
                let host: ManagedObjectRef = serde_json::from_value(args["host"].clone())
                    .map_err(|e| bad_request(format!("invalid host: {}", e)))?;

                if inv.find_by_name(kinds::VIRTUAL_MACHINE, &spec.name).is_some() {
                    return Ok(Outcome::Task(Err(json!({"fault": "DuplicateName", "name": spec.name}))));
                }

                let vm = inv.allocate(kinds::VIRTUAL_MACHINE, "vm");
                inv.insert(
                    vm.clone(),
                    props([
                        ("name", json!(spec.name)),
                        ("runtime.powerState", json!(PowerState::PoweredOff.as_str())),
                        ("runtime.host", to_json(&host)),
                        ("resourcePool", args["pool"].clone()),
                        ("config.instanceUuid", json!(spec.instance_uuid)),
                        ("config.hardware.numCPU", json!(spec.cpus)),
                        ("config.hardware.memoryMB", json!(spec.memory_mb)),
                        ("config.hardware.device", json!(spec.vifs.len() + spec.storage.len() + 1)),
                        (VNC_PORT_PROPERTY, json!(spec.vnc_port.to_string())),
                        ("snapshot.rootSnapshotList", json!([])),
                    ]),
                );
                inv.push(&host, "vm", to_json(&vm));
                inv.push(target, "childEntity", to_json(&vm));
                Ok(Outcome::Task(Ok(Some(to_json(&vm)))))
            }
            "PowerOnVM_Task" | "PowerOffVM_Task" => {
                let state = if method == "PowerOnVM_Task" {
                    PowerState::PoweredOn
                } else {
                    PowerState::PoweredOff
                };
                inv.set(target, "runtime.powerState", json!(state.as_str()));
                Ok(Outcome::Task(Ok(None)))
            }
            "Destroy_Task" => {
                let powered_on = inv
                    .get(target)
                    .and_then(|p| p.get("runtime.powerState"))
                    .and_then(Value::as_str)
                    == Some(PowerState::PoweredOn.as_str());
                if powered_on {
                    return Ok(Outcome::Task(Err(json!({
                        "fault": "InvalidPowerState",
                        "message": "The attempted operation cannot be performed in the current state (Powered on)."
                    }))));
                }
                if let Some(host) = inv.reference(target, "runtime.host") {
                    let id = target.id.clone();
                    inv.retain(&host, "vm", |v| v["value"] != json!(id));
                }
                inv.remove(target);
                Ok(Outcome::Task(Ok(None)))
            }
            "ReconfigVM_Task" => {
                let spec: VmReconfigureSpec = serde_json::from_value(args["spec"].clone())
                    .map_err(|e| bad_request(format!("invalid spec: {}", e)))?;
                inv.set(target, "config.hardware.numCPU", json!(spec.cpus));
                inv.set(target, "config.hardware.memoryMB", json!(spec.memory_mb));
                if let Some(port) = spec.vnc_port {
                    inv.set(target, VNC_PORT_PROPERTY, json!(port.to_string()));
                }
                Ok(Outcome::Task(Ok(None)))
            }
            "MigrateVM_Task" => {
                let destination: ManagedObjectRef = serde_json::from_value(args["host"].clone())
                    .map_err(|e| bad_request(format!("invalid host: {}", e)))?;
                if let Some(source) = inv.reference(target, "runtime.host") {
                    let id = target.id.clone();
                    inv.retain(&source, "vm", |v| v["value"] != json!(id));
                }
                inv.push(&destination, "vm", to_json(target));
                inv.set(target, "runtime.host", to_json(&destination));
                Ok(Outcome::Task(Ok(None)))
            }
            "CreateSnapshot_Task" => {
                let name = args["name"]
                    .as_str()
                    .ok_or_else(|| bad_request("snapshot name is required"))?
                    .to_string();
                let snapshot = inv.allocate(kinds::SNAPSHOT, "snapshot");
                inv.insert(
                    snapshot.clone(),
                    props([("name", json!(name)), ("vm", to_json(target))]),
                );
                inv.push(
                    target,
                    "snapshot.rootSnapshotList",
                    json!({"name": name, "snapshot": to_json(&snapshot), "childSnapshotList": []}),
                );
                Ok(Outcome::Task(Ok(Some(to_json(&snapshot)))))
            }
            "RevertToSnapshot_Task" => {
                let vm = inv
                    .task_owner_vm(target)
                    .ok_or_else(|| bad_request("snapshot has no owning VM"))?;
                // Snapshots are taken without memory, so reverting leaves the VM off
                debug!(vm = %vm, "Reverting mock VM");
                inv.set(&vm, "runtime.powerState", json!(PowerState::PoweredOff.as_str()));
                Ok(Outcome::Task(Ok(None)))
            }
            "AddPortGroup" => {
                let host = inv
                    .reference(target, "host")
                    .ok_or_else(|| bad_request("network system has no host"))?;
                let spec = &args["portgrp"];
                let name = spec["name"]
                    .as_str()
                    .ok_or_else(|| bad_request("port group name is required"))?;
                let vswitch = spec["vswitchName"].as_str().unwrap_or("vSwitch0");
                let vlan = spec["vlanId"].as_u64().and_then(|v| u16::try_from(v).ok());

                let exists = inv
                    .get(&host)
                    .and_then(|p| p.get("config.network.portgroup"))
                    .and_then(Value::as_array)
                    .map(|groups| groups.iter().any(|g| g["spec"]["name"] == json!(name)))
                    .unwrap_or(false);
                if exists {
                    return Err(TransportFault::Status {
                        code: 409,
                        body: format!("AlreadyExists: port group {}", name),
                    });
                }

                let name = name.to_string();
                let vswitch = vswitch.to_string();
                inv.attach_standard_network(&host, &name, &vswitch, vlan);
                Ok(Outcome::Immediate(Value::Null))
            }
            "RemovePortGroup" => {
                let host = inv
                    .reference(target, "host")
                    .ok_or_else(|| bad_request("network system has no host"))?;
                let name = args["pgName"]
                    .as_str()
                    .ok_or_else(|| bad_request("pgName is required"))?
                    .to_string();

                let before = inv
                    .get(&host)
                    .and_then(|p| p.get("config.network.portgroup"))
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                inv.retain(&host, "config.network.portgroup", |g| g["spec"]["name"] != json!(name));
                let after = inv
                    .get(&host)
                    .and_then(|p| p.get("config.network.portgroup"))
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                if before == after {
                    return Err(TransportFault::Status {
                        code: 404,
                        body: format!("NotFound: port group {}", name),
                    });
                }

                if let Some(network) = inv.find_by_name(kinds::NETWORK, &name) {
                    let id = network.id.clone();
                    inv.retain(&host, "network", |n| n["value"] != json!(id));
                }
                Ok(Outcome::Immediate(Value::Null))
            }
            other => Err(bad_request(format!("InvalidRequest: unknown method {}", other))),
        }
    }

    fn create_task(&self, inv: &mut Inventory, method: &str, result: Result<Option<Value>, Value>) -> ManagedObjectRef {
        let faults = self.faults();
        let task = inv.allocate(kinds::TASK, "task");

        let outcome = match result {
            Ok(result) => TaskInfo {
                state: TaskState::Success,
                progress: Some(100),
                result,
                error: None,
            },
            Err(error) => TaskInfo {
                state: TaskState::Error,
                progress: None,
                result: None,
                error: Some(error),
            },
        };

        let running = TaskInfo {
            state: TaskState::Running,
            progress: Some(if faults.stall_tasks { 50 } else { 0 }),
            result: None,
            error: None,
        };

        let info = if faults.stall_tasks {
            running
        } else if faults.task_polls > 0 {
            inv.pending.insert(
                task.clone(),
                PendingTask {
                    polls_left: faults.task_polls,
                    outcome,
                },
            );
            running
        } else {
            outcome
        };

        inv.insert(
            task.clone(),
            props([
                ("info", serde_json::to_value(&info).unwrap_or(Value::Null)),
                ("info.descriptionId", json!(method)),
            ]),
        );
        task
    }

    fn advance_task(inv: &mut Inventory, task: &ManagedObjectRef) {
        let Some(pending) = inv.pending.get_mut(task) else {
            return;
        };
        pending.polls_left = pending.polls_left.saturating_sub(1);

        if pending.polls_left == 0 {
            if let Some(done) = inv.pending.remove(task) {
                let info = serde_json::to_value(&done.outcome).unwrap_or(Value::Null);
                inv.set(task, "info", info);
            }
        } else {
            let progress = 100 / (pending.polls_left + 1);
            inv.set(task, "info", json!({"state": "running", "progress": progress}));
        }
    }
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::central()
    }
}

#[async_trait]
impl Transport for MockControlPlane {
    #[instrument(skip(self, credentials), fields(user = %credentials.username))]
    async fn login(&self, endpoint: &Endpoint, credentials: &Credentials) -> TransportResult<ConnectionHandle> {
        self.record("login", None, None);
        let count = self.logins.fetch_add(1, Ordering::SeqCst) + 1;

        if self.faults().reject_logins {
            debug!(endpoint = %endpoint, "Rejecting mock login");
            return Err(TransportFault::Unauthorized);
        }

        let token = format!("session-{}", count);
        self.state()?.sessions.insert(token.clone());
        debug!(endpoint = %endpoint, token = %token, "Mock login");
        Ok(ConnectionHandle::new(token))
    }

    async fn logout(&self, handle: &ConnectionHandle) -> TransportResult<()> {
        self.record("logout", None, None);
        self.state()?.sessions.remove(handle.as_str());
        Ok(())
    }

    #[instrument(skip(self, handle, args), fields(object = %target, method = %method))]
    async fn invoke(
        &self,
        handle: &ConnectionHandle,
        target: &ManagedObjectRef,
        method: &str,
        args: &Value,
    ) -> TransportResult<Value> {
        self.record("invoke", Some(target), Some(method));
        self.authorize(handle)?;

        let (injected_status, injected_task_error) = {
            let faults = self.faults();
            (
                faults.method_errors.get(method).cloned(),
                faults.task_errors.get(method).cloned(),
            )
        };
        if let Some((code, body)) = injected_status {
            return Err(TransportFault::Status { code, body });
        }

        let mut inv = self.state()?;
        if inv.get(target).is_none() {
            return Err(not_found(target));
        }

        let outcome = match injected_task_error {
            Some(error) => Outcome::Task(Err(error)),
            None => Self::apply(&mut inv, target, method, args)?,
        };

        match outcome {
            Outcome::Immediate(value) => Ok(value),
            Outcome::Task(result) => {
                let task = self.create_task(&mut inv, method, result);
                info!(task = %task, "Mock task created");
                Ok(to_json(&task))
            }
        }
    }

    async fn get_properties(
        &self,
        handle: &ConnectionHandle,
        target: &ManagedObjectRef,
        paths: &[String],
    ) -> TransportResult<PropertyMap> {
        self.record("properties", Some(target), None);
        self.authorize(handle)?;

        let mut inv = self.state()?;
        if target.is_kind(kinds::TASK) && paths.iter().any(|p| p == "info") {
            Self::advance_task(&mut inv, target);
        }

        inv.get(target)
            .map(|props| Inventory::select(props, paths))
            .ok_or_else(|| not_found(target))
    }

    async fn enumerate(
        &self,
        handle: &ConnectionHandle,
        kind: &str,
        paths: &[String],
        page_size: usize,
    ) -> TransportResult<Page> {
        self.record("enumerate", None, Some(kind));
        self.authorize(handle)?;

        let mut inv = self.state()?;
        let remaining: Vec<ObjectContent> = inv
            .objects
            .iter()
            .filter(|o| Inventory::matches_kind(&o.obj, kind))
            .map(|o| ObjectContent {
                obj: o.obj.clone(),
                props: Inventory::select(&o.props, paths),
            })
            .collect();

        Ok(Self::next_page(&mut inv, remaining, page_size.max(1)))
    }

    async fn continue_enumeration(&self, handle: &ConnectionHandle, token: &str) -> TransportResult<Page> {
        self.record("continue", None, None);
        self.authorize(handle)?;

        let mut inv = self.state()?;
        let cursor = inv.cursors.remove(token).ok_or_else(|| TransportFault::Status {
            code: 400,
            body: format!("InvalidArgument: unknown token {}", token),
        })?;
        Ok(Self::next_page(&mut inv, cursor.remaining, cursor.page_size))
    }
}

impl MockControlPlane {
    fn next_page(inv: &mut Inventory, mut remaining: Vec<ObjectContent>, page_size: usize) -> Page {
        if remaining.len() <= page_size {
            return Page {
                objects: remaining,
                token: None,
            };
        }

        let rest = remaining.split_off(page_size);
        inv.next_id += 1;
        let token = format!("token-{}", inv.next_id);
        inv.cursors.insert(
            token.clone(),
            Cursor {
                remaining: rest,
                page_size,
            },
        );
        Page {
            objects: remaining,
            token: Some(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn login(mock: &MockControlPlane) -> ConnectionHandle {
        mock.login(
            &Endpoint::parse("https://mock.local/sdk").unwrap(),
            &Credentials::new("root", "pw"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enumerate_pages() {
        let mock = MockControlPlane::central();
        let dc = mock.add_datacenter("dc1");
        for i in 0..3 {
            mock.add_standalone_host(&dc, &format!("10.1.0.{}", i));
        }
        let handle = login(&mock).await;
        let paths = vec!["name".to_string()];

        let first = mock.enumerate(&handle, kinds::HOST, &paths, 2).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let token = first.token.unwrap();

        let second = mock.continue_enumeration(&handle, &token).await.unwrap();
        assert_eq!(second.objects.len(), 1);
        assert!(second.token.is_none());

        // Tokens are single use
        assert!(mock.continue_enumeration(&handle, &token).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_handle_is_unauthorized() {
        let mock = MockControlPlane::central();
        let bogus = ConnectionHandle::new("forged");
        let err = mock
            .get_properties(&bogus, &ManagedObjectRef::service_instance(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, TransportFault::Unauthorized);
    }

    #[tokio::test]
    async fn test_power_task_lifecycle() {
        let mock = MockControlPlane::demo();
        let handle = login(&mock).await;
        let vm = mock.find(kinds::VIRTUAL_MACHINE, "db-01").unwrap();

        mock.task_polls(2);
        let task: ManagedObjectRef = serde_json::from_value(
            mock.invoke(&handle, &vm, "PowerOnVM_Task", &json!({})).await.unwrap(),
        )
        .unwrap();

        let paths = vec!["info".to_string()];
        let info = mock.get_properties(&handle, &task, &paths).await.unwrap();
        assert_eq!(info["info"]["state"], "running");
        let info = mock.get_properties(&handle, &task, &paths).await.unwrap();
        assert_eq!(info["info"]["state"], "success");

        assert_eq!(mock.property(&vm, "runtime.powerState"), Some(json!("poweredOn")));
    }

    #[tokio::test]
    async fn test_destroy_powered_on_vm_fails_task() {
        let mock = MockControlPlane::demo();
        let handle = login(&mock).await;
        let vm = mock.find(kinds::VIRTUAL_MACHINE, "web-01").unwrap();

        let task: ManagedObjectRef = serde_json::from_value(
            mock.invoke(&handle, &vm, "Destroy_Task", &json!({})).await.unwrap(),
        )
        .unwrap();
        let info = mock
            .get_properties(&handle, &task, &["info".to_string()])
            .await
            .unwrap();
        assert_eq!(info["info"]["state"], "error");
        assert!(mock.find(kinds::VIRTUAL_MACHINE, "web-01").is_some());
    }

    #[tokio::test]
    async fn test_injected_method_error() {
        let mock = MockControlPlane::demo();
        let handle = login(&mock).await;
        let vm = mock.find(kinds::VIRTUAL_MACHINE, "db-01").unwrap();
        mock.fail_method("PowerOnVM_Task", 500, "SystemError");

        let err = mock
            .invoke(&handle, &vm, "PowerOnVM_Task", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportFault::Status {
                code: 500,
                body: "SystemError".to_string()
            }
        );
        assert_eq!(mock.invoked_methods(), vec!["PowerOnVM_Task".to_string()]);
    }
}
