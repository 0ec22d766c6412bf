//! Leasing of VNC ports and placeholder device keys.
//!
//! Nothing here reserves anything remotely. A VNC port is "free" when no VM
//! currently known to the endpoint carries it in its extra configuration, so
//! two leases taken from the same inventory snapshot can collide. Device keys
//! are negative placeholders the remote side replaces on success; they only
//! need to be unique within one create or reconfigure request.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{ControlPlaneError, Result};
use crate::session::Session;
use crate::types::{kinds, VncPortLease};
use crate::wire::parse_port;

/// Extra-config property holding a VM's VNC port.
pub const VNC_PORT_PROPERTY: &str = "config.extraConfig[\"RemoteDisplay.vnc.port\"]";

/// First placeholder key for network adapters.
pub const NIC_KEY_SENTINEL: i32 = -47;
/// Placeholder key for the storage controller.
pub const CONTROLLER_KEY_SENTINEL: i32 = -101;
/// First placeholder key for virtual disks.
pub const DISK_KEY_SENTINEL: i32 = -201;

/// Half-open range of VNC ports: `start .. start + count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VncPortRange {
    pub start: u16,
    pub count: u16,
}

impl VncPortRange {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    /// Lowest port of the range not in `used`.
    pub fn first_free(&self, used: &BTreeSet<u16>) -> Result<u16> {
        (u32::from(self.start)..self.end())
            .filter_map(|port| u16::try_from(port).ok())
            .find(|port| !used.contains(port))
            .ok_or(ControlPlaneError::PortRangeExhausted {
                start: u32::from(self.start),
                end: self.end(),
            })
    }
}

impl Default for VncPortRange {
    fn default() -> Self {
        Self::new(5900, 1000)
    }
}

/// Strictly decreasing placeholder keys starting at a sentinel.
#[derive(Debug, Clone)]
pub struct DeviceKeys {
    next: i32,
}

impl DeviceKeys {
    pub fn starting_at(sentinel: i32) -> Self {
        Self { next: sentinel }
    }
}

impl Iterator for DeviceKeys {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        let key = self.next;
        self.next = self.next.checked_sub(1)?;
        Some(key)
    }
}

/// `count` placeholder keys starting at `sentinel`.
pub fn allocate_device_keys(sentinel: i32, count: usize) -> Vec<i32> {
    DeviceKeys::starting_at(sentinel).take(count).collect()
}

/// Leases identifiers by scanning the endpoint's current inventory.
pub struct IdentifierAllocator {
    session: Arc<Session>,
    range: VncPortRange,
}

impl IdentifierAllocator {
    pub fn new(session: Arc<Session>, range: VncPortRange) -> Self {
        Self { session, range }
    }

    pub fn range(&self) -> VncPortRange {
        self.range
    }

    /// VNC ports held by any VM. Values that are not a port number are skipped.
    pub async fn used_vnc_ports(&self) -> Result<BTreeSet<u16>> {
        let vms = self
            .session
            .enumerate_all(kinds::VIRTUAL_MACHINE, &["name", VNC_PORT_PROPERTY])
            .await?;

        let mut used = BTreeSet::new();
        for vm in &vms {
            let Some(value) = vm.prop(VNC_PORT_PROPERTY) else {
                continue;
            };
            match parse_port(value) {
                Some(port) => {
                    used.insert(port);
                }
                None => warn!(
                    vm = vm.string("name").unwrap_or(&vm.obj.id),
                    value = %value,
                    "Ignoring malformed VNC port"
                ),
            }
        }

        debug!(scanned = vms.len(), used = used.len(), "Scanned VNC ports");
        Ok(used)
    }

    /// Lowest VNC port in the configured range not used by any VM.
    #[instrument(skip(self), fields(start = self.range.start, count = self.range.count))]
    pub async fn lease_vnc_port(&self) -> Result<VncPortLease> {
        let used = self.used_vnc_ports().await?;
        let port = self.range.first_free(&used)?;
        info!(port, "Leased VNC port");
        Ok(VncPortLease { port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlPlane;
    use crate::transport::{Credentials, Endpoint};
    use crate::types::PowerState;
    use serde_json::json;

    fn allocator(mock: &Arc<MockControlPlane>, range: VncPortRange) -> IdentifierAllocator {
        let session = Session::new(
            Endpoint::parse("https://10.0.0.2/sdk").unwrap(),
            Credentials::new("admin", "secret"),
            mock.clone(),
            2,
        );
        IdentifierAllocator::new(Arc::new(session), range)
    }

    #[test]
    fn test_device_keys_strictly_decreasing() {
        assert_eq!(allocate_device_keys(NIC_KEY_SENTINEL, 3), vec![-47, -48, -49]);
        assert_eq!(allocate_device_keys(DISK_KEY_SENTINEL, 0), Vec::<i32>::new());
        let mut keys = DeviceKeys::starting_at(CONTROLLER_KEY_SENTINEL);
        assert_eq!(keys.next(), Some(-101));
        assert_eq!(keys.next(), Some(-102));
    }

    #[test]
    fn test_first_free_skips_used() {
        let range = VncPortRange::new(5900, 3);
        let used: BTreeSet<u16> = [5900, 5901].into_iter().collect();
        assert_eq!(range.first_free(&used).unwrap(), 5902);

        let used: BTreeSet<u16> = [5900, 5901, 5902].into_iter().collect();
        assert!(matches!(
            range.first_free(&used),
            Err(ControlPlaneError::PortRangeExhausted { start: 5900, end: 5903 })
        ));
    }

    #[test]
    fn test_range_reaching_top_of_port_space() {
        let range = VncPortRange::new(65534, 2);
        let used: BTreeSet<u16> = [65534].into_iter().collect();
        assert_eq!(range.first_free(&used).unwrap(), 65535);
    }

    #[tokio::test]
    async fn test_lease_skips_ports_across_pages() {
        let mock = Arc::new(MockControlPlane::central());
        let dc = mock.add_datacenter("dc1");
        let cluster = mock.add_cluster(&dc, "c1");
        let host = mock.add_host(&cluster, "10.0.0.5");
        for (i, port) in [5900u16, 5901, 5903].iter().enumerate() {
            mock.add_vm(&host, &format!("vm-{}", i), PowerState::PoweredOn, Some(*port));
        }
        mock.add_vm(&host, "no-console", PowerState::PoweredOff, None);

        let lease = allocator(&mock, VncPortRange::default()).lease_vnc_port().await.unwrap();
        assert_eq!(lease.port, 5902);
    }

    #[tokio::test]
    async fn test_malformed_port_ignored() {
        let mock = Arc::new(MockControlPlane::central());
        let dc = mock.add_datacenter("dc1");
        let cluster = mock.add_cluster(&dc, "c1");
        let host = mock.add_host(&cluster, "10.0.0.5");
        let vm = mock.add_vm(&host, "odd", PowerState::PoweredOn, None);
        mock.set_property(&vm, VNC_PORT_PROPERTY, json!("auto"));
        mock.add_vm(&host, "numeric", PowerState::PoweredOn, None);
        let numeric = mock.find(kinds::VIRTUAL_MACHINE, "numeric").unwrap();
        mock.set_property(&numeric, VNC_PORT_PROPERTY, json!(5900));

        let used = allocator(&mock, VncPortRange::default()).used_vnc_ports().await.unwrap();
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![5900]);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let mock = Arc::new(MockControlPlane::central());
        let dc = mock.add_datacenter("dc1");
        let cluster = mock.add_cluster(&dc, "c1");
        let host = mock.add_host(&cluster, "10.0.0.5");
        mock.add_vm(&host, "a", PowerState::PoweredOn, Some(6000));
        mock.add_vm(&host, "b", PowerState::PoweredOn, Some(6001));

        let err = allocator(&mock, VncPortRange::new(6000, 2))
            .lease_vnc_port()
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::PortRangeExhausted { start: 6000, end: 6002 }));
    }
}
