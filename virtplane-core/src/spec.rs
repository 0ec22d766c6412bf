//! Assembly of VM create and reconfigure payloads.
//!
//! The builder resolves everything a payload refers to (datastore, networks,
//! VNC port) and fills in placeholder device keys. Adapter models are
//! validated before anything is sent to the endpoint, so a bad model never
//! leaves a partial submission behind.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::allocator::{
    DeviceKeys, IdentifierAllocator, CONTROLLER_KEY_SENTINEL, DISK_KEY_SENTINEL, NIC_KEY_SENTINEL,
};
use crate::error::{ControlPlaneError, Result};
use crate::network::NetworkNormalizer;
use crate::resolver::Resolver;
use crate::types::*;

/// Guest id used for every VM; the guest OS is not modelled.
pub const GUEST_ID: &str = "otherGuest";
/// Device type of the single storage controller.
pub const CONTROLLER_TYPE: &str = "VirtualLsiLogicController";
/// Unit number the SCSI controller itself occupies.
const CONTROLLER_UNIT: u32 = 7;
/// Highest unit number on the controller's bus.
const MAX_UNIT: u32 = 15;

/// Builds [`VmCreateSpec`] and [`VmReconfigureSpec`] payloads.
pub struct SpecBuilder {
    resolver: Arc<Resolver>,
    networks: Arc<NetworkNormalizer>,
    allocator: Arc<IdentifierAllocator>,
    keymap: String,
}

impl SpecBuilder {
    pub fn new(
        resolver: Arc<Resolver>,
        networks: Arc<NetworkNormalizer>,
        allocator: Arc<IdentifierAllocator>,
        keymap: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            networks,
            allocator,
            keymap: keymap.into(),
        }
    }

    /// Build the payload to create `name` on `host`.
    #[instrument(skip(self, sizing, vifs, storage), fields(host = %host))]
    pub async fn build_create_spec(
        &self,
        name: &str,
        host: &ManagedObjectRef,
        sizing: &Sizing,
        vifs: &[VifInput],
        storage: &[StorageInput],
        firmware: Firmware,
    ) -> Result<VmCreateSpec> {
        let models = parse_models(vifs)?;
        check_storage_fits(storage)?;

        let central = self.resolver.is_central().await?;
        let datastore = self.resolver.resolve_datastore(host).await?;
        let vif_specs = self.bind_vifs(host, central, vifs, &models).await?;
        let lease = self.allocator.lease_vnc_port().await?;

        let controller = lsi_controller();
        let attachments = attach_storage(&datastore, controller.device_key, storage);

        let instance_uuid = Uuid::new_v4().to_string();
        let mut extra_config = vec![OptionValue::new("nvp.vm-uuid", &instance_uuid)];
        if firmware == Firmware::Efi {
            extra_config.push(OptionValue::new("firmware", "efi"));
        }
        extra_config.extend(vnc_options(lease.port, &self.keymap));

        info!(
            vm = name,
            datastore = %datastore,
            vnc_port = lease.port,
            vifs = vif_specs.len(),
            disks = attachments.len(),
            "Built create spec"
        );

        Ok(VmCreateSpec {
            name: name.to_string(),
            instance_uuid,
            guest_id: GUEST_ID.to_string(),
            vm_path_name: format!("[{}]", datastore),
            cpus: sizing.cpus,
            cores_per_socket: sizing.cores_per_socket,
            memory_mb: sizing.memory_mb,
            vifs: vif_specs,
            controller,
            storage: attachments,
            vnc_port: lease.port,
            firmware,
            tools: ToolsConfig::default(),
            extra_config,
        })
    }

    /// Build the payload to reconfigure the existing VM `name`.
    ///
    /// Networks are resolved against the host currently running the VM. With
    /// `set_vnc` false the VM keeps its current console port.
    #[instrument(skip(self, sizing, vifs))]
    pub async fn build_reconfigure_spec(
        &self,
        name: &str,
        sizing: &Sizing,
        vifs: &[VifInput],
        set_vnc: bool,
    ) -> Result<VmReconfigureSpec> {
        let models = parse_models(vifs)?;

        let vm = self.resolver.resolve_vm(name).await?;
        let host = self.resolver.host_of_vm(&vm).await?;
        let central = self.resolver.is_central().await?;
        let vif_specs = self.bind_vifs(&host, central, vifs, &models).await?;

        let mut extra_config = iface_id_options(vifs);
        let vnc_port = if set_vnc {
            let lease = self.allocator.lease_vnc_port().await?;
            extra_config.extend(vnc_options(lease.port, &self.keymap));
            Some(lease.port)
        } else {
            None
        };

        debug!(vm = %vm, vifs = vif_specs.len(), ?vnc_port, "Built reconfigure spec");
        Ok(VmReconfigureSpec {
            name: name.to_string(),
            cpus: sizing.cpus,
            cores_per_socket: sizing.cores_per_socket,
            memory_mb: sizing.memory_mb,
            vifs: vif_specs,
            vnc_port,
            extra_config,
        })
    }

    async fn bind_vifs(
        &self,
        host: &ManagedObjectRef,
        central: bool,
        vifs: &[VifInput],
        models: &[AdapterModel],
    ) -> Result<Vec<VifSpec>> {
        if vifs.is_empty() {
            return Ok(Vec::new());
        }

        let mut specs = Vec::with_capacity(vifs.len());
        for ((vif, model), device_key) in vifs.iter().zip(models).zip(DeviceKeys::starting_at(NIC_KEY_SENTINEL)) {
            let network = self.networks.find_network(host, &vif.network, central).await?;
            specs.push(VifSpec {
                mac_address: vif.mac_address.clone(),
                model: *model,
                network,
                device_key,
            });
        }
        Ok(specs)
    }
}

/// Parse every adapter model up front.
fn parse_models(vifs: &[VifInput]) -> Result<Vec<AdapterModel>> {
    vifs.iter().map(|vif| vif.model.parse::<AdapterModel>()).collect()
}

fn check_storage_fits(storage: &[StorageInput]) -> Result<()> {
    // Units 0..=15 minus the controller's own unit
    if storage.len() > MAX_UNIT as usize {
        return Err(ControlPlaneError::PreconditionFailed(format!(
            "{} storage devices exceed the {} units of a single controller",
            storage.len(),
            MAX_UNIT
        )));
    }
    Ok(())
}

fn lsi_controller() -> ControllerSpec {
    ControllerSpec {
        device_key: CONTROLLER_KEY_SENTINEL,
        device_type: CONTROLLER_TYPE.to_string(),
        bus_number: 0,
        shared_bus: "noSharing".to_string(),
    }
}

/// Attach storage inputs to the controller in order.
fn attach_storage(datastore: &str, controller_key: i32, storage: &[StorageInput]) -> Vec<StorageAttachment> {
    let units = (0..=MAX_UNIT).filter(|unit| *unit != CONTROLLER_UNIT);

    storage
        .iter()
        .zip(units)
        .zip(DeviceKeys::starting_at(DISK_KEY_SENTINEL))
        .map(|((input, unit_number), device_key)| StorageAttachment {
            device_key,
            controller_key,
            unit_number,
            backing: match input {
                StorageInput::Block { device_path } => StorageBacking::RawDevice {
                    device_name: device_path.clone(),
                },
                StorageInput::Disk { file_name, capacity_kb } => StorageBacking::FlatFile {
                    file_name: datastore_path(datastore, file_name),
                    capacity_kb: *capacity_kb,
                },
            },
        })
        .collect()
}

/// `[ds] file` unless the file name already names a datastore.
fn datastore_path(datastore: &str, file_name: &str) -> String {
    if file_name.starts_with('[') {
        file_name.to_string()
    } else {
        format!("[{}] {}", datastore, file_name)
    }
}

fn iface_id_options(vifs: &[VifInput]) -> Vec<OptionValue> {
    vifs.iter()
        .enumerate()
        .map(|(index, vif)| {
            let value = vif.iface_id.clone().unwrap_or_else(|| index.to_string());
            OptionValue::new(format!("nvp.iface-id.{}", index), value)
        })
        .collect()
}

/// Options enabling the VNC console on `port`.
pub fn vnc_options(port: u16, keymap: &str) -> Vec<OptionValue> {
    vec![
        OptionValue::new("RemoteDisplay.vnc.enabled", "true"),
        OptionValue::new("RemoteDisplay.vnc.port", port.to_string()),
        OptionValue::new("RemoteDisplay.vnc.keyMap", keymap),
    ]
}
