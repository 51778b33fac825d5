//! Cloud-side data model and the `CloudClient` capability.
//!
//! The engine never talks to the cloud directly; every operation takes an
//! explicit `&dyn CloudClient` so tests can substitute deterministic doubles.
//! The concrete adapter lives in [`awscli`], the metadata-service probe in
//! [`imds`].

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod awscli;
pub mod imds;

/// A virtual network interface attached to this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub id: String,
    pub mac: String,
    pub security_group_ids: Vec<String>,
    pub subnet_id: String,
    pub subnet_cidr: IpNet,
    pub vpc_id: String,
    pub device_index: u32,
    /// All assigned IPv4 addresses, primary first, in cloud order.
    pub ipv4s: Vec<IpAddr>,
}

impl Interface {
    /// Kernel-side device name the adapter appears under.
    pub fn local_name(&self) -> String {
        format!("eth{}", self.device_index)
    }
}

/// Per-instance-type adapter and address quotas. Fetched on demand and
/// immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceLimits {
    pub adapters: u32,
    pub ipv4_per_adapter: u32,
    pub ipv6_per_adapter: u32,
}

impl InstanceLimits {
    /// Pod address capacity: every adapter except the first carries pod
    /// addresses. A positive `cap` lowers the result, never raises it.
    pub fn max_pods(&self, cap: Option<u32>) -> u32 {
        let raw = self.adapters.saturating_sub(1) * self.ipv4_per_adapter;
        match cap {
            Some(c) if c > 0 && c < raw => c,
            _ => raw,
        }
    }
}

/// A subnet the instance may attach interfaces to. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub cidr: IpNet,
    pub is_default: bool,
    pub available_addresses: u32,
    pub tags: BTreeMap<String, String>,
}

/// An address granted on a specific interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocation {
    pub ip: IpAddr,
    pub interface: Interface,
}

/// Everything the engine needs from the cloud side.
///
/// Calls are blocking, fallible I/O. Multi-step sequences are not atomic:
/// a batch address request may partially succeed, and callers of
/// [`CloudClient::allocate_addresses`] must handle a short grant.
pub trait CloudClient {
    /// Cheap probe: is this process running on a cloud compute instance?
    fn is_running_on_cloud_instance(&self) -> bool;

    /// Adapter and per-adapter address limits for this instance's type.
    fn instance_limits(&self) -> Result<InstanceLimits>;

    /// All interfaces attached to this instance, ordered by device index.
    fn list_interfaces(&self) -> Result<Vec<Interface>>;

    /// Subnets available to this instance (its VPC and availability zone).
    fn list_subnets(&self) -> Result<Vec<Subnet>>;

    /// Create an interface in `subnet` with the given security groups and
    /// attach it to this instance.
    fn create_interface(&self, subnet: &Subnet, security_groups: &[String]) -> Result<Interface>;

    /// Detach and destroy one interface; its addresses are implicitly
    /// released.
    fn remove_interface(&self, id: &str) -> Result<()>;

    /// Request `count` secondary addresses on `interface`. May grant fewer
    /// than requested.
    fn allocate_addresses(&self, interface: &Interface, count: u32) -> Result<Vec<IpAddr>>;

    /// Release one secondary address back to its subnet.
    fn release_address(&self, ip: IpAddr) -> Result<()>;

    /// CIDR blocks associated with a VPC.
    fn describe_vpc_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>>;

    /// CIDR blocks of VPCs peered with the given VPC.
    fn describe_vpc_peer_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>>;
}
