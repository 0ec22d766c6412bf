//! VM lifecycle orchestration.
//!
//! Every mutating operation is a remote task: the orchestrator submits it,
//! waits for it through the [`TaskWaiter`], and reports the phase the VM
//! ended up in.
//!
//! ```text
//! Unprovisioned ──create──▶ TaskPending ──▶ Provisioned(off)
//! Provisioned(*) ──power_on/power_off/restart──▶ TaskPending ──▶ Provisioned(*)
//! Provisioned(*) ──migrate/reconfigure/backup/restore──▶ TaskPending ──▶ Provisioned(*)
//! Provisioned(*) ──destroy──▶ TaskPending ──▶ Deleted
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::error::{ControlPlaneError, Result};
use crate::resolver::Resolver;
use crate::session::Session;
use crate::spec::SpecBuilder;
use crate::task::TaskWaiter;
use crate::types::*;
use crate::wire::{self, SnapshotTree};

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Where a VM is in its lifecycle, as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "power", rename_all = "snake_case")]
pub enum VmPhase {
    Unprovisioned,
    TaskPending,
    Provisioned(PowerState),
    Deleted,
}

/// Lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    PowerOn,
    PowerOff,
    Restart,
    Reconfigure,
    Migrate,
    Destroy,
    Backup,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::PowerOn => "power_on",
            Operation::PowerOff => "power_off",
            Operation::Restart => "restart",
            Operation::Reconfigure => "reconfigure",
            Operation::Migrate => "migrate",
            Operation::Destroy => "destroy",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        };
        f.write_str(name)
    }
}

impl VmPhase {
    /// Check that `op` may start from this phase and return the pending phase.
    pub fn transition(self, op: Operation) -> Result<VmPhase> {
        let allowed = match (self, op) {
            (VmPhase::Unprovisioned | VmPhase::Deleted, Operation::Create) => true,
            (VmPhase::Provisioned(_), Operation::Create) => false,
            (VmPhase::Provisioned(_), _) => true,
            _ => false,
        };

        if allowed {
            Ok(VmPhase::TaskPending)
        } else {
            Err(ControlPlaneError::PreconditionFailed(format!(
                "cannot {} a VM that is {}",
                op, self
            )))
        }
    }

    /// Phase reached once `op` completed, given the power state before it.
    pub fn settled(op: Operation, before: PowerState) -> VmPhase {
        match op {
            Operation::Create | Operation::PowerOff => VmPhase::Provisioned(PowerState::PoweredOff),
            Operation::PowerOn | Operation::Restart => VmPhase::Provisioned(PowerState::PoweredOn),
            Operation::Destroy => VmPhase::Deleted,
            Operation::Reconfigure | Operation::Migrate | Operation::Backup | Operation::Restore => {
                VmPhase::Provisioned(before)
            }
        }
    }
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPhase::Unprovisioned => f.write_str("unprovisioned"),
            VmPhase::TaskPending => f.write_str("pending"),
            VmPhase::Provisioned(power) => write!(f, "provisioned ({})", power.as_str()),
            VmPhase::Deleted => f.write_str("deleted"),
        }
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Everything needed to create a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    /// Host identity (IP or name)
    pub host: String,
    pub sizing: Sizing,
    pub vifs: Vec<VifInput>,
    pub storage: Vec<StorageInput>,
    pub firmware: Firmware,
}

/// Drives VMs through their lifecycle with remote tasks.
pub struct Orchestrator {
    session: Arc<Session>,
    resolver: Arc<Resolver>,
    builder: Arc<SpecBuilder>,
    waiter: Arc<TaskWaiter>,
}

impl Orchestrator {
    pub fn new(
        session: Arc<Session>,
        resolver: Arc<Resolver>,
        builder: Arc<SpecBuilder>,
        waiter: Arc<TaskWaiter>,
    ) -> Self {
        Self {
            session,
            resolver,
            builder,
            waiter,
        }
    }

    /// Current phase of the VM called `name`.
    pub async fn phase(&self, name: &str) -> Result<VmPhase> {
        match self.resolver.find_vm(name).await? {
            Some(vm) => Ok(VmPhase::Provisioned(self.resolver.power_state(&vm).await?)),
            None => Ok(VmPhase::Unprovisioned),
        }
    }

    /// Current power state of the VM called `name`.
    pub async fn power_state(&self, name: &str) -> Result<PowerState> {
        let vm = self.resolver.resolve_vm(name).await?;
        self.resolver.power_state(&vm).await
    }

    async fn run_task(&self, target: &ManagedObjectRef, method: &str, args: Value) -> Result<TaskCompletion> {
        let reply = self.session.invoke(target, method, args).await?;
        let task = TaskWaiter::task_from_reply(&reply, method)?;
        info!(task = %task.task_ref, method, object = %target, "Submitted task");
        self.waiter.wait(&task).await
    }

    /// Resolve `name` and check that `op` may start on it.
    async fn provisioned(&self, name: &str, op: Operation) -> Result<(ManagedObjectRef, PowerState)> {
        let vm = self.resolver.resolve_vm(name).await?;
        let power = self.resolver.power_state(&vm).await?;
        VmPhase::Provisioned(power).transition(op)?;
        Ok((vm, power))
    }

    /// Create a VM and wait for the creation task.
    #[instrument(skip(self, request), fields(vm = %request.name, host = %request.host))]
    pub async fn create(&self, request: &CreateVmRequest) -> Result<CreatedVm> {
        self.phase(&request.name).await?.transition(Operation::Create)?;

        let host = self.resolver.resolve_host(&request.host).await?;
        let spec = self
            .builder
            .build_create_spec(
                &request.name,
                &host,
                &request.sizing,
                &request.vifs,
                &request.storage,
                request.firmware,
            )
            .await?;
        let folder = self.resolver.resolve_vm_folder(&host).await?;
        let pool = self.resolver.resolve_host_pool(&host).await?;

        let args = json!({"config": spec, "pool": pool, "host": host});
        let completion = self.run_task(&folder, "CreateVM_Task", args).await?;
        let vm_ref: ManagedObjectRef = match &completion.result {
            Some(result) => wire::decode("CreateVM_Task result", result)?,
            None => {
                return Err(ControlPlaneError::MalformedReply(
                    "CreateVM_Task completed without a VM reference".to_string(),
                ))
            }
        };

        info!(vm_ref = %vm_ref, vnc_port = spec.vnc_port, "VM created");
        Ok(CreatedVm {
            vm_ref,
            instance_uuid: spec.instance_uuid,
            vnc_port: spec.vnc_port,
        })
    }

    #[instrument(skip(self))]
    pub async fn power_on(&self, name: &str) -> Result<VmPhase> {
        let (vm, power) = self.provisioned(name, Operation::PowerOn).await?;
        self.run_task(&vm, "PowerOnVM_Task", json!({})).await?;
        Ok(VmPhase::settled(Operation::PowerOn, power))
    }

    #[instrument(skip(self))]
    pub async fn power_off(&self, name: &str) -> Result<VmPhase> {
        let (vm, power) = self.provisioned(name, Operation::PowerOff).await?;
        self.run_task(&vm, "PowerOffVM_Task", json!({})).await?;
        Ok(VmPhase::settled(Operation::PowerOff, power))
    }

    /// Power off, then power on, waiting for each.
    #[instrument(skip(self))]
    pub async fn restart(&self, name: &str) -> Result<VmPhase> {
        let (vm, power) = self.provisioned(name, Operation::Restart).await?;
        self.run_task(&vm, "PowerOffVM_Task", json!({})).await?;
        self.run_task(&vm, "PowerOnVM_Task", json!({})).await?;
        Ok(VmPhase::settled(Operation::Restart, power))
    }

    /// Destroy a VM, powering it off first when it is running.
    #[instrument(skip(self))]
    pub async fn destroy(&self, name: &str) -> Result<VmPhase> {
        let (vm, power) = self.provisioned(name, Operation::Destroy).await?;
        if power == PowerState::PoweredOn {
            info!("Powering off before destroy");
            self.run_task(&vm, "PowerOffVM_Task", json!({})).await?;
        }
        self.run_task(&vm, "Destroy_Task", json!({})).await?;
        Ok(VmPhase::settled(Operation::Destroy, power))
    }

    /// Apply new sizing and adapters to an existing VM.
    #[instrument(skip(self, sizing, vifs))]
    pub async fn reconfigure(&self, name: &str, sizing: &Sizing, vifs: &[VifInput], set_vnc: bool) -> Result<VmPhase> {
        let (vm, power) = self.provisioned(name, Operation::Reconfigure).await?;
        let spec = self.builder.build_reconfigure_spec(name, sizing, vifs, set_vnc).await?;
        self.run_task(&vm, "ReconfigVM_Task", json!({"spec": spec})).await?;
        Ok(VmPhase::settled(Operation::Reconfigure, power))
    }

    /// Move a VM to another host. Fails without submitting anything when the
    /// VM already runs there.
    #[instrument(skip(self))]
    pub async fn migrate(&self, name: &str, destination: &str) -> Result<VmPhase> {
        let (vm, power) = self.provisioned(name, Operation::Migrate).await?;
        let host = self.resolver.resolve_host(destination).await?;

        if self.resolver.vms_on_host(&host).await?.contains(&vm) {
            return Err(ControlPlaneError::PreconditionFailed(format!(
                "VM {} is already on host {}",
                name, destination
            )));
        }

        let pool = self.resolver.resolve_host_pool(&host).await?;
        let args = json!({"pool": pool, "host": host, "priority": "defaultPriority"});
        self.run_task(&vm, "MigrateVM_Task", args).await?;
        Ok(VmPhase::settled(Operation::Migrate, power))
    }

    /// Take a quiesced, memory-less snapshot called `label`.
    #[instrument(skip(self))]
    pub async fn backup(&self, name: &str, label: &str) -> Result<ManagedObjectRef> {
        let (vm, _) = self.provisioned(name, Operation::Backup).await?;
        let args = json!({
            "name": label,
            "description": format!("backup {} of {}", label, name),
            "memory": false,
            "quiesce": true
        });

        let completion = self.run_task(&vm, "CreateSnapshot_Task", args).await?;
        match &completion.result {
            Some(result) => wire::decode("CreateSnapshot_Task result", result),
            None => Err(ControlPlaneError::MalformedReply(
                "CreateSnapshot_Task completed without a snapshot reference".to_string(),
            )),
        }
    }

    /// Revert a VM to the snapshot called `label`.
    #[instrument(skip(self))]
    pub async fn restore(&self, name: &str, label: &str) -> Result<VmPhase> {
        let (vm, _) = self.provisioned(name, Operation::Restore).await?;
        let trees: Vec<SnapshotTree> = match self.session.property(&vm, "snapshot.rootSnapshotList").await? {
            Some(value) => wire::decode("snapshot.rootSnapshotList", &value)?,
            None => Vec::new(),
        };
        let snapshot = SnapshotTree::find(&trees, label)
            .map(|tree| tree.snapshot.clone())
            .ok_or_else(|| ControlPlaneError::not_found("snapshot", label))?;

        self.run_task(&snapshot, "RevertToSnapshot_Task", json!({})).await?;
        let power = self.resolver.power_state(&vm).await?;
        Ok(VmPhase::settled(Operation::Restore, power))
    }
}
