//! End-to-end scenarios against the in-memory control plane.

use std::sync::Arc;

use virtplane_core::{
    kinds, ClientConfig, ControlPlaneClient, ControlPlaneError, CreateVmRequest, Firmware, MockControlPlane,
    NetworkKind, PowerState, Sizing, StorageInput, VifInput, Vlan, VmPhase,
};

fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.endpoint.url = "https://10.0.0.2/sdk".to_string();
    config.endpoint.username = "administrator".to_string();
    config.endpoint.password = "secret".to_string();
    config.tasks.poll_interval_ms = 5;
    config.tasks.timeout_secs = 5;
    config
}

fn client(mock: &Arc<MockControlPlane>) -> ControlPlaneClient {
    ControlPlaneClient::new(config(), mock.clone()).unwrap()
}

fn web_request(name: &str) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        host: "10.0.0.5".to_string(),
        sizing: Sizing::new(2, 1, 4096),
        vifs: vec![VifInput::new("VM Network", "vmxnet3").with_iface_id("port-1")],
        storage: vec![StorageInput::Disk {
            file_name: format!("{}/disk0.vmdk", name),
            capacity_kb: 20 * 1024 * 1024,
        }],
        firmware: Firmware::Efi,
    }
}

// =============================================================================
// Resolution
// =============================================================================

#[tokio::test]
async fn test_standalone_endpoint_resolves_its_only_host() {
    let mock = Arc::new(MockControlPlane::standalone());
    let dc = mock.add_datacenter("ha-datacenter");
    let host = mock.add_standalone_host(&dc, "esx-01.lab");
    let client = client(&mock);

    let resolved = client.resolver().resolve_host("192.168.1.20").await.unwrap();
    assert_eq!(resolved, host);
    assert!(!client.resolver().is_central().await.unwrap());

    let info = client.host_info("anything").await.unwrap();
    assert!(!info.managed_by_central_controller);
}

#[tokio::test]
async fn test_central_endpoint_matches_host_identity() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let host = client.resolver().resolve_host("10.0.0.6").await.unwrap();
    assert_eq!(Some(host), mock.find(kinds::HOST, "10.0.0.6"));

    let err = client.resolver().resolve_host("10.0.0.99").await.unwrap_err();
    assert!(err.is_not_found());

    let hosts = client.list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 2);
    assert!(hosts.iter().all(|h| h.managed_by_central_controller));
}

#[tokio::test]
async fn test_host_networks_cover_every_vlan_kind() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let networks = client.host_networks("10.0.0.5").await.unwrap();
    let by_name = |name: &str| networks.iter().find(|n| n.name == name).cloned();

    let plain = by_name("VM Network").unwrap();
    assert_eq!(plain.kind, NetworkKind::Standard);
    assert_eq!(plain.vlan, Vlan::None);
    assert_eq!(plain.vlan_id(), None);

    let tagged = by_name("Storage Net").unwrap();
    assert_eq!(tagged.vlan, Vlan::Single { id: 42 });

    let prod = by_name("dv-prod").unwrap();
    assert_eq!(prod.kind, NetworkKind::Distributed);
    assert_eq!(prod.vlan_id().as_deref(), Some("42"));
    assert!(prod.distributed.is_some());

    let trunk = by_name("dv-trunk").unwrap();
    assert_eq!(trunk.vlan, Vlan::TrunkRange { start: 10, end: 20 });
    assert_eq!(trunk.vlan_id().as_deref(), Some("[10,20]"));

    assert!(by_name("dv-uplinks").is_none());
}

// =============================================================================
// Allocation
// =============================================================================

#[tokio::test]
async fn test_vnc_range_exhausted() {
    let mock = Arc::new(MockControlPlane::demo());
    let host = mock.find(kinds::HOST, "10.0.0.6").unwrap();
    mock.add_vm(&host, "app-01", PowerState::PoweredOn, Some(5900));

    let mut config = config();
    config.vnc.port_start = 5900;
    config.vnc.port_count = 2;
    let client = ControlPlaneClient::new(config, mock.clone()).unwrap();

    match client.lease_vnc_port().await.unwrap_err() {
        ControlPlaneError::PortRangeExhausted { start, end } => {
            assert_eq!((start, end), (5900, 5902));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_concurrent_leases_may_collide() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let (a, b) = tokio::join!(client.lease_vnc_port(), client.lease_vnc_port());
    assert_eq!(a.unwrap().port, 5900);
    assert_eq!(b.unwrap().port, 5900);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_on_demo_host() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let created = client.vms().create(&web_request("web-02")).await.unwrap();
    assert_eq!(created.vnc_port, 5900);
    assert!(uuid::Uuid::parse_str(&created.instance_uuid).is_ok());

    let create_calls = mock.calls_of("invoke");
    assert_eq!(create_calls.len(), 1);
    assert_eq!(create_calls[0].method.as_deref(), Some("CreateVM_Task"));

    assert_eq!(
        mock.property(&created.vm_ref, "config.instanceUuid"),
        Some(serde_json::json!(created.instance_uuid))
    );
    assert_eq!(
        client.vms().phase("web-02").await.unwrap(),
        VmPhase::Provisioned(PowerState::PoweredOff)
    );

    let console = client.console("web-02").await.unwrap();
    assert_eq!((console.host.as_str(), console.port), ("10.0.0.5", 5900));

    // The new VM now holds 5900
    assert_eq!(client.lease_vnc_port().await.unwrap().port, 5902);
}

#[tokio::test]
async fn test_create_on_standalone_endpoint() {
    let mock = Arc::new(MockControlPlane::standalone());
    let dc = mock.add_datacenter("ha-datacenter");
    let host = mock.add_standalone_host(&dc, "esx-01.lab");
    mock.add_datastore("datastore1", 1u64 << 40, &[&host]);
    mock.add_standard_network(&host, "VM Network", None);
    let client = client(&mock);

    let mut request = web_request("edge-01");
    request.host = "esx-01.lab".to_string();
    let created = client.vms().create(&request).await.unwrap();

    let compute = mock.property(&host, "parent").unwrap();
    let compute: virtplane_core::ManagedObjectRef = serde_json::from_value(compute).unwrap();
    assert_eq!(
        mock.property(&created.vm_ref, "resourcePool"),
        mock.property(&compute, "resourcePool")
    );
    assert_eq!(
        mock.property(&created.vm_ref, "runtime.host"),
        Some(serde_json::to_value(&host).unwrap())
    );
    assert_eq!(
        client.vms().phase("edge-01").await.unwrap(),
        VmPhase::Provisioned(PowerState::PoweredOff)
    );
}

#[tokio::test]
async fn test_create_demo_with_block_device() {
    let mock = Arc::new(MockControlPlane::demo());
    let mut config = config();
    config.tasks.timeout_secs = 120;
    let client = ControlPlaneClient::new(config, mock.clone()).unwrap();

    let request = CreateVmRequest {
        name: "demo".to_string(),
        host: "10.0.0.5".to_string(),
        sizing: Sizing::new(1, 1, 1024),
        vifs: vec![VifInput::new("VM Network", "e1000")],
        storage: vec![StorageInput::Block {
            device_path: "/vmfs/devices/disks/naa.600a0980".to_string(),
        }],
        firmware: Firmware::Bios,
    };
    let created = client.vms().create(&request).await.unwrap();

    assert_eq!(created.vnc_port, 5900);
    assert!(!created.instance_uuid.is_empty());
    let vm = mock.find(kinds::VIRTUAL_MACHINE, "demo").unwrap();
    assert_eq!(vm, created.vm_ref);
}

#[tokio::test]
async fn test_create_spec_is_reproducible() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);
    let host = client.resolver().resolve_host("10.0.0.5").await.unwrap();
    let request = web_request("web-03");

    let build = || {
        client.spec_builder().build_create_spec(
            &request.name,
            &host,
            &request.sizing,
            &request.vifs,
            &request.storage,
            request.firmware,
        )
    };
    let first = build().await.unwrap();
    let mut second = build().await.unwrap();

    assert_ne!(first.instance_uuid, second.instance_uuid);
    second.extra_config.retain(|o| o.key != "nvp.vm-uuid");
    second
        .extra_config
        .insert(0, virtplane_core::OptionValue::new("nvp.vm-uuid", &first.instance_uuid));
    second.instance_uuid = first.instance_uuid.clone();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_create_existing_name_submits_nothing() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let err = client.vms().create(&web_request("web-01")).await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::PreconditionFailed(_)));
    assert!(mock.invoked_methods().is_empty());
}

#[tokio::test]
async fn test_destroy_running_vm_powers_off_first() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let phase = client.vms().destroy("web-01").await.unwrap();
    assert_eq!(phase, VmPhase::Deleted);
    assert_eq!(mock.invoked_methods(), vec!["PowerOffVM_Task", "Destroy_Task"]);
    assert_eq!(client.vms().phase("web-01").await.unwrap(), VmPhase::Unprovisioned);
}

#[tokio::test]
async fn test_restart_cycles_power() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let phase = client.vms().restart("db-01").await.unwrap();
    assert_eq!(phase, VmPhase::Provisioned(PowerState::PoweredOn));
    assert_eq!(mock.invoked_methods(), vec!["PowerOffVM_Task", "PowerOnVM_Task"]);
    assert_eq!(client.vms().power_state("db-01").await.unwrap(), PowerState::PoweredOn);
}

#[tokio::test]
async fn test_migrate() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let err = client.vms().migrate("web-01", "10.0.0.5").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::PreconditionFailed(_)));
    assert!(mock.invoked_methods().is_empty());

    client.vms().migrate("web-01", "10.0.0.6").await.unwrap();
    let vm = client.resolver().resolve_vm("web-01").await.unwrap();
    let host = client.resolver().host_of_vm(&vm).await.unwrap();
    assert_eq!(Some(host), mock.find(kinds::HOST, "10.0.0.6"));
}

#[tokio::test]
async fn test_backup_and_restore() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    let snapshot = client.vms().backup("web-01", "nightly").await.unwrap();
    assert!(snapshot.is_kind(kinds::SNAPSHOT));

    let phase = client.vms().restore("web-01", "nightly").await.unwrap();
    assert_eq!(phase, VmPhase::Provisioned(PowerState::PoweredOff));
    assert_eq!(
        mock.invoked_methods(),
        vec!["CreateSnapshot_Task", "RevertToSnapshot_Task"]
    );

    let err = client.vms().restore("web-01", "weekly").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_reconfigure_keeps_console_port() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    client
        .vms()
        .reconfigure("web-01", &Sizing::new(4, 2, 8192), &[], false)
        .await
        .unwrap();

    let vm = mock.find(kinds::VIRTUAL_MACHINE, "web-01").unwrap();
    assert_eq!(mock.property(&vm, "config.hardware.numCPU"), Some(serde_json::json!(4)));
    assert_eq!(client.console("web-01").await.unwrap().port, 5901);
}

#[tokio::test]
async fn test_failed_task_surfaces_remote_error() {
    let mock = Arc::new(MockControlPlane::demo());
    mock.fail_tasks("PowerOnVM_Task", serde_json::json!({"fault": "InsufficientResourcesFault"}));
    let client = client(&mock);

    let err = client.vms().power_on("db-01").await.unwrap_err();
    assert!(matches!(err, ControlPlaneError::TaskFailed { .. }));
    assert_eq!(client.vms().power_state("db-01").await.unwrap(), PowerState::PoweredOff);
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test]
async fn test_expired_session_recovers_with_one_login() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    client.list_hosts().await.unwrap();
    assert_eq!(mock.login_count(), 1);

    mock.expire_sessions();
    client.vms().power_on("db-01").await.unwrap();
    assert_eq!(mock.login_count(), 2);
    assert_eq!(client.vms().power_state("db-01").await.unwrap(), PowerState::PoweredOn);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_relogin() {
    let mock = Arc::new(MockControlPlane::demo());
    let client = client(&mock);

    client.list_hosts().await.unwrap();
    mock.expire_sessions();

    let (hosts, lease, networks) = tokio::join!(
        client.list_hosts(),
        client.lease_vnc_port(),
        client.host_networks("10.0.0.5")
    );
    assert_eq!(hosts.unwrap().len(), 2);
    assert_eq!(lease.unwrap().port, 5900);
    assert!(networks.unwrap().iter().any(|n| n.name == "VM Network"));
    assert_eq!(mock.login_count(), 2);
}
