//! Secondary-address allocation, release, and the free-IP query.

use std::collections::HashSet;
use std::net::IpAddr;

use log::{info, warn};

use crate::cloud::{AddressAllocation, CloudClient, InstanceLimits, Interface};
use crate::error::{Error, Result};
use crate::netstate::NetState;
use crate::registry::Registry;

/// Remaining secondary-address slots on one adapter.
fn capacity(iface: &Interface, limits: InstanceLimits) -> u32 {
    (limits.ipv4_per_adapter as usize).saturating_sub(iface.ipv4s.len()) as u32
}

/// Allocate up to `batch_size` addresses on `iface`; 0 requests exactly the
/// remaining capacity. A short grant from the cloud comes back as
/// [`Error::PartialAllocation`] carrying the addresses that were granted.
pub(crate) fn allocate_on(
    cloud: &dyn CloudClient,
    iface: &Interface,
    batch_size: u32,
    limits: InstanceLimits,
) -> Result<Vec<AddressAllocation>> {
    let cap = capacity(iface, limits);
    if cap == 0 {
        return Err(Error::Quota(format!(
            "interface {} is at its per-adapter address limit of {}",
            iface.id, limits.ipv4_per_adapter
        )));
    }
    let want = if batch_size == 0 { cap } else { batch_size.min(cap) };

    let granted = cloud.allocate_addresses(iface, want)?;
    for ip in &granted {
        if !iface.subnet_cidr.contains(ip) {
            warn!("granted address {ip} lies outside subnet {}", iface.subnet_cidr);
        }
        info!("allocated {ip} on {}", iface.local_name());
    }
    let allocations: Vec<AddressAllocation> = granted
        .into_iter()
        .map(|ip| AddressAllocation {
            ip,
            interface: iface.clone(),
        })
        .collect();

    if allocations.len() < want as usize {
        return Err(Error::PartialAllocation {
            granted: allocations,
            requested: want as usize,
        });
    }
    Ok(allocations)
}

/// Allocate a batch on the interface at `index`, or on the first interface
/// with spare capacity when `index` is `None`.
pub fn allocate_at_index(
    cloud: &dyn CloudClient,
    index: Option<usize>,
    batch_size: u32,
) -> Result<Vec<AddressAllocation>> {
    let limits = cloud.instance_limits()?;
    let interfaces = cloud.list_interfaces()?;

    let target = match index {
        Some(i) => Some(interfaces.get(i).ok_or_else(|| {
            Error::NotFound(format!("no interface at index {i}"))
        })?),
        None => interfaces.iter().find(|i| capacity(i, limits) > 0),
    };
    let Some(iface) = target else {
        return Err(Error::Quota(
            "no interface has spare address capacity".to_string(),
        ));
    };
    allocate_on(cloud, iface, batch_size, limits)
}

/// Release one allocated address. The address must currently be assigned to
/// one of this instance's interfaces; the registry entry (if any) goes with
/// it.
pub fn deallocate(cloud: &dyn CloudClient, registry: &Registry, ip: IpAddr) -> Result<()> {
    let owned = cloud
        .list_interfaces()?
        .iter()
        .any(|iface| iface.ipv4s.contains(&ip));
    if !owned {
        return Err(Error::NotFound(format!(
            "{ip} is not allocated to any interface on this instance"
        )));
    }
    cloud.release_address(ip)?;
    registry.forget(ip)?;
    info!("released {ip}");
    Ok(())
}

/// Release several addresses; one failure does not stop the rest.
pub fn deallocate_all(
    cloud: &dyn CloudClient,
    registry: &Registry,
    ips: &[IpAddr],
) -> Result<()> {
    let mut errors = Vec::new();
    for &ip in ips {
        if let Err(e) = deallocate(cloud, registry, ip) {
            warn!("deallocate {ip}: {e}");
            errors.push(e);
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Batch {
            errors,
            total: ips.len(),
        })
    }
}

/// Addresses granted to this instance's interfaces but not bound in the
/// kernel. The primary address of each adapter is reserved for the host and
/// never reported. With `track`, each free address gets its registry stamp
/// refreshed.
pub fn find_free_ips(
    cloud: &dyn CloudClient,
    net: &dyn NetState,
    registry: &Registry,
    track: bool,
) -> Result<Vec<AddressAllocation>> {
    let bound: HashSet<IpAddr> = net
        .list_assigned_addresses()?
        .into_iter()
        .map(|b| b.ip)
        .collect();

    let mut free = Vec::new();
    for iface in cloud.list_interfaces()? {
        for &ip in iface.ipv4s.iter().skip(1) {
            if bound.contains(&ip) {
                continue;
            }
            if track {
                registry.track(ip)?;
            }
            free.push(AddressAllocation {
                ip,
                interface: iface.clone(),
            });
        }
    }
    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstate::BoundAddress;
    use crate::test_support::{ip, interface_with, MockCloud, MockNet};

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::at_path(dir.path().join("registry.json"));
        (dir, registry)
    }

    #[test]
    fn test_batch_is_clamped_to_capacity() {
        // Limit 4 per adapter, 2 already assigned: capacity is 2.
        let cloud = MockCloud::with_limits(2, 4)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.11"])]);
        let allocs = allocate_at_index(&cloud, Some(0), 10).unwrap();
        assert_eq!(allocs.len(), 2);
        assert_eq!(cloud.interfaces.borrow()[0].ipv4s.len(), 4);
    }

    #[test]
    fn test_batch_zero_fills_remaining_capacity() {
        let cloud = MockCloud::with_limits(2, 5)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.11"])]);
        let allocs = allocate_at_index(&cloud, Some(0), 0).unwrap();
        assert_eq!(allocs.len(), 3);
        assert!(allocs.iter().all(|a| a.interface.id == "eni-1"));
    }

    #[test]
    fn test_small_batch_returns_exactly_requested() {
        let cloud = MockCloud::with_limits(2, 10)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10"])]);
        let allocs = allocate_at_index(&cloud, Some(0), 2).unwrap();
        assert_eq!(allocs.len(), 2);
    }

    #[test]
    fn test_full_interface_is_a_quota_error() {
        let cloud = MockCloud::with_limits(2, 2)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.11"])]);
        assert!(matches!(
            allocate_at_index(&cloud, Some(0), 1),
            Err(Error::Quota(_))
        ));
    }

    #[test]
    fn test_first_available_skips_full_interfaces() {
        let cloud = MockCloud::with_limits(2, 2).with_interfaces(vec![
            interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.11"]),
            interface_with("eni-2", 1, &["10.0.1.20"]),
        ]);
        let allocs = allocate_at_index(&cloud, None, 1).unwrap();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].interface.id, "eni-2");
    }

    #[test]
    fn test_no_spare_capacity_anywhere_is_a_quota_error() {
        let cloud = MockCloud::with_limits(2, 1).with_interfaces(vec![
            interface_with("eni-1", 0, &["10.0.1.10"]),
            interface_with("eni-2", 1, &["10.0.1.20"]),
        ]);
        assert!(matches!(
            allocate_at_index(&cloud, None, 1),
            Err(Error::Quota(_))
        ));
    }

    #[test]
    fn test_out_of_range_index_is_not_found() {
        let cloud = MockCloud::with_limits(2, 4)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10"])]);
        assert!(matches!(
            allocate_at_index(&cloud, Some(3), 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_short_grant_surfaces_partial_allocation() {
        let cloud = MockCloud::with_limits(2, 10)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10"])])
            .with_grant_cap(2);
        let err = allocate_at_index(&cloud, Some(0), 3).unwrap_err();
        match err {
            Error::PartialAllocation { granted, requested } => {
                assert_eq!(granted.len(), 2);
                assert_eq!(requested, 3);
            }
            other => panic!("expected partial allocation, got {other}"),
        }
    }

    #[test]
    fn test_deallocate_unknown_address_is_not_found() {
        let (_dir, reg) = registry();
        let cloud = MockCloud::with_limits(2, 4)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10"])]);
        assert!(matches!(
            deallocate(&cloud, &reg, ip("10.0.9.9")),
            Err(Error::NotFound(_))
        ));
        assert!(cloud.released.borrow().is_empty());
    }

    #[test]
    fn test_deallocate_releases_and_forgets() {
        let (_dir, reg) = registry();
        let cloud = MockCloud::with_limits(2, 4)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.11"])]);
        reg.track(ip("10.0.1.11")).unwrap();

        deallocate(&cloud, &reg, ip("10.0.1.11")).unwrap();
        assert_eq!(*cloud.released.borrow(), vec![ip("10.0.1.11")]);
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn test_deallocate_all_continues_past_failures() {
        let (_dir, reg) = registry();
        let cloud = MockCloud::with_limits(2, 4)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.11"])]);

        let err = deallocate_all(&cloud, &reg, &[ip("10.0.9.9"), ip("10.0.1.11")]).unwrap_err();
        match err {
            Error::Batch { errors, total } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected batch error, got {other}"),
        }
        // The second address was still released.
        assert_eq!(*cloud.released.borrow(), vec![ip("10.0.1.11")]);
    }

    #[test]
    fn test_free_ips_skips_primary_and_bound() {
        let cloud = MockCloud::with_limits(2, 4).with_interfaces(vec![interface_with(
            "eni-1",
            0,
            &["10.0.1.10", "10.0.1.11", "10.0.1.12"],
        )]);
        let net = MockNet {
            bound: vec![BoundAddress {
                label: "eth0".to_string(),
                ip: ip("10.0.1.11"),
            }],
        };
        let (_dir, reg) = registry();

        let free = find_free_ips(&cloud, &net, &reg, false).unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].ip, ip("10.0.1.12"));
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn test_free_ips_with_track_refreshes_registry() {
        let cloud = MockCloud::with_limits(2, 4)
            .with_interfaces(vec![interface_with("eni-1", 0, &["10.0.1.10", "10.0.1.12"])]);
        let net = MockNet { bound: vec![] };
        let (_dir, reg) = registry();

        find_free_ips(&cloud, &net, &reg, true).unwrap();
        assert_eq!(reg.list().unwrap(), vec![ip("10.0.1.12")]);
    }
}
