//! High-level client wiring every component to one session.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::allocator::{IdentifierAllocator, VncPortRange, VNC_PORT_PROPERTY};
use crate::config::ClientConfig;
use crate::error::{ControlPlaneError, Result};
use crate::lifecycle::Orchestrator;
use crate::network::{NetworkNormalizer, PortGroupManager};
use crate::resolver::Resolver;
use crate::session::Session;
use crate::spec::SpecBuilder;
use crate::task::TaskWaiter;
use crate::transport::Transport;
use crate::types::{ConsoleInfo, HostInfo, HostInitiator, NetworkAttachment, VncPortLease};
use crate::wire;

/// Entry point for talking to one control-plane endpoint.
///
/// Components share the session, so a re-login triggered by one of them is
/// seen by all the others.
pub struct ControlPlaneClient {
    config: ClientConfig,
    session: Arc<Session>,
    resolver: Arc<Resolver>,
    networks: Arc<NetworkNormalizer>,
    port_groups: PortGroupManager,
    allocator: Arc<IdentifierAllocator>,
    builder: Arc<SpecBuilder>,
    waiter: Arc<TaskWaiter>,
    orchestrator: Orchestrator,
}

impl ControlPlaneClient {
    /// Build a client. No request is sent until the first operation.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let session = Arc::new(Session::new(
            config.parsed_endpoint()?,
            config.credentials(),
            transport,
            config.inventory.page_size,
        ));
        let resolver = Arc::new(Resolver::new(
            session.clone(),
            config.endpoint.controller,
            config.inventory.reserved_datastore_prefix.clone(),
        ));
        let networks = Arc::new(NetworkNormalizer::new(session.clone()));
        let port_groups = PortGroupManager::new(session.clone());
        let allocator = Arc::new(IdentifierAllocator::new(
            session.clone(),
            VncPortRange::new(config.vnc.port_start, config.vnc.port_count),
        ));
        let builder = Arc::new(SpecBuilder::new(
            resolver.clone(),
            networks.clone(),
            allocator.clone(),
            config.vnc.keymap.clone(),
        ));
        let waiter = Arc::new(TaskWaiter::new(
            session.clone(),
            config.tasks.poll_interval(),
            config.tasks.timeout(),
        ));
        let orchestrator = Orchestrator::new(session.clone(), resolver.clone(), builder.clone(), waiter.clone());

        info!(endpoint = %session.endpoint().url, "Control-plane client ready");

        Ok(Self {
            config,
            session,
            resolver,
            networks,
            port_groups,
            allocator,
            builder,
            waiter,
            orchestrator,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn networks(&self) -> &NetworkNormalizer {
        &self.networks
    }

    pub fn allocator(&self) -> &IdentifierAllocator {
        &self.allocator
    }

    pub fn spec_builder(&self) -> &SpecBuilder {
        &self.builder
    }

    pub fn task_waiter(&self) -> &TaskWaiter {
        &self.waiter
    }

    pub fn vms(&self) -> &Orchestrator {
        &self.orchestrator
    }

    // =========================================================================
    // Convenience operations
    // =========================================================================

    pub async fn list_hosts(&self) -> Result<Vec<HostInfo>> {
        self.resolver.list_hosts().await
    }

    pub async fn host_info(&self, identity: &str) -> Result<HostInfo> {
        self.resolver.host_info(identity).await
    }

    pub async fn host_initiator(&self, identity: &str) -> Result<HostInitiator> {
        self.resolver.host_initiator(identity).await
    }

    /// Attachable networks of the host with the given identity.
    pub async fn host_networks(&self, identity: &str) -> Result<Vec<NetworkAttachment>> {
        let host = self.resolver.resolve_host(identity).await?;
        let central = self.resolver.is_central().await?;
        self.networks.host_networks(&host, central).await
    }

    pub async fn lease_vnc_port(&self) -> Result<VncPortLease> {
        self.allocator.lease_vnc_port().await
    }

    /// Where to connect a VNC client for the VM called `name`.
    #[instrument(skip(self))]
    pub async fn console(&self, name: &str) -> Result<ConsoleInfo> {
        let vm = self.resolver.resolve_vm(name).await?;
        let port = self
            .session
            .property(&vm, VNC_PORT_PROPERTY)
            .await?
            .as_ref()
            .and_then(wire::parse_port)
            .ok_or_else(|| ControlPlaneError::not_found("vnc-port", name))?;

        let host = self.resolver.host_of_vm(&vm).await?;
        let host_name: String = match self.session.property(&host, "name").await? {
            Some(value) => wire::decode("name", &value)?,
            None => host.id.clone(),
        };

        Ok(ConsoleInfo { host: host_name, port })
    }

    /// Bus kinds of the change-tracked disks of the VM called `name`.
    pub async fn vdisk_drivers(&self, name: &str) -> Result<Vec<String>> {
        let vm = self.resolver.resolve_vm(name).await?;
        self.resolver.vdisk_drivers(&vm).await
    }

    /// Virtual switches of the host with the given identity.
    pub async fn virtual_switches(&self, identity: &str) -> Result<Vec<String>> {
        let host = self.resolver.resolve_host(identity).await?;
        self.port_groups.virtual_switches(&host).await
    }

    pub async fn create_port_group(&self, identity: &str, vswitch: &str, name: &str, vlan_id: u16) -> Result<()> {
        let host = self.resolver.resolve_host(identity).await?;
        self.port_groups.create_port_group(&host, vswitch, name, vlan_id).await
    }

    pub async fn remove_port_group(&self, identity: &str, name: &str) -> Result<()> {
        let host = self.resolver.resolve_host(identity).await?;
        self.port_groups.remove_port_group(&host, name).await
    }

    /// Log out. The client logs in again on its next operation.
    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}
