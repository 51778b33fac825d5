//! Deterministic collaborator doubles for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;

use crate::cloud::{CloudClient, InstanceLimits, Interface, Subnet};
use crate::error::{Error, Result};
use crate::netstate::{BoundAddress, NetState};

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn subnet_with(id: &str, available: u32, tags: &[(&str, &str)]) -> Subnet {
    Subnet {
        id: id.to_string(),
        cidr: "10.0.1.0/24".parse().unwrap(),
        is_default: false,
        available_addresses: available,
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

pub fn interface_with(id: &str, device_index: u32, ips: &[&str]) -> Interface {
    Interface {
        id: id.to_string(),
        mac: format!("02:00:00:00:00:{device_index:02x}"),
        security_group_ids: vec!["sg-123".to_string()],
        subnet_id: "subnet-1".to_string(),
        subnet_cidr: "10.0.1.0/24".parse().unwrap(),
        vpc_id: "vpc-1".to_string(),
        device_index,
        ipv4s: ips.iter().map(|s| ip(s)).collect(),
    }
}

/// Scriptable in-memory cloud. Interfaces live in a `RefCell` so mutating
/// calls are visible to subsequent reads within a test.
pub struct MockCloud {
    pub limits: InstanceLimits,
    pub interfaces: RefCell<Vec<Interface>>,
    pub subnets: Vec<Subnet>,
    pub released: RefCell<Vec<IpAddr>>,
    pub vpc_cidrs: BTreeMap<String, Vec<IpNet>>,
    pub peer_cidrs: BTreeMap<String, Vec<IpNet>>,
    grant_cap: Option<u32>,
    failing_release: Option<IpAddr>,
    next_host: Cell<u32>,
    call_count: Cell<u64>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::with_limits(4, 15)
    }
}

impl MockCloud {
    pub fn with_limits(adapters: u32, ipv4_per_adapter: u32) -> Self {
        MockCloud {
            limits: InstanceLimits {
                adapters,
                ipv4_per_adapter,
                ipv6_per_adapter: ipv4_per_adapter,
            },
            interfaces: RefCell::new(Vec::new()),
            subnets: Vec::new(),
            released: RefCell::new(Vec::new()),
            vpc_cidrs: BTreeMap::new(),
            peer_cidrs: BTreeMap::new(),
            grant_cap: None,
            failing_release: None,
            next_host: Cell::new(100),
            call_count: Cell::new(0),
        }
    }

    pub fn with_interfaces(self, interfaces: Vec<Interface>) -> Self {
        *self.interfaces.borrow_mut() = interfaces;
        self
    }

    pub fn with_subnets(mut self, subnets: Vec<Subnet>) -> Self {
        self.subnets = subnets;
        self
    }

    /// The cloud will grant at most this many addresses per request,
    /// regardless of how many were asked for.
    pub fn with_grant_cap(mut self, cap: u32) -> Self {
        self.grant_cap = Some(cap);
        self
    }

    /// Releasing this address fails with a cloud error.
    pub fn with_failing_release(mut self, ip: IpAddr) -> Self {
        self.failing_release = Some(ip);
        self
    }

    /// Total collaborator calls seen so far.
    pub fn calls(&self) -> u64 {
        self.call_count.get()
    }

    fn tick(&self) {
        self.call_count.set(self.call_count.get() + 1);
    }

    fn mint_ip(&self, cidr: IpNet) -> IpAddr {
        let host = self.next_host.get();
        self.next_host.set(host + 1);
        match cidr.network() {
            IpAddr::V4(base) => IpAddr::V4(Ipv4Addr::from(u32::from(base) + host)),
            IpAddr::V6(v6) => IpAddr::V6(v6),
        }
    }
}

impl CloudClient for MockCloud {
    fn is_running_on_cloud_instance(&self) -> bool {
        true
    }

    fn instance_limits(&self) -> Result<InstanceLimits> {
        self.tick();
        Ok(self.limits)
    }

    fn list_interfaces(&self) -> Result<Vec<Interface>> {
        self.tick();
        Ok(self.interfaces.borrow().clone())
    }

    fn list_subnets(&self) -> Result<Vec<Subnet>> {
        self.tick();
        Ok(self.subnets.clone())
    }

    fn create_interface(&self, subnet: &Subnet, security_groups: &[String]) -> Result<Interface> {
        self.tick();
        let device_index = self.interfaces.borrow().len() as u32;
        let iface = Interface {
            id: format!("eni-mock-{device_index}"),
            mac: format!("02:00:00:00:00:{device_index:02x}"),
            security_group_ids: security_groups.to_vec(),
            subnet_id: subnet.id.clone(),
            subnet_cidr: subnet.cidr,
            vpc_id: "vpc-1".to_string(),
            device_index,
            ipv4s: vec![self.mint_ip(subnet.cidr)],
        };
        self.interfaces.borrow_mut().push(iface.clone());
        Ok(iface)
    }

    fn remove_interface(&self, id: &str) -> Result<()> {
        self.tick();
        let mut interfaces = self.interfaces.borrow_mut();
        let before = interfaces.len();
        interfaces.retain(|iface| iface.id != id);
        if interfaces.len() == before {
            return Err(Error::NotFound(format!("interface {id}")));
        }
        Ok(())
    }

    fn allocate_addresses(&self, interface: &Interface, count: u32) -> Result<Vec<IpAddr>> {
        self.tick();
        let granted = match self.grant_cap {
            Some(cap) => count.min(cap),
            None => count,
        };
        let mut interfaces = self.interfaces.borrow_mut();
        let iface = interfaces
            .iter_mut()
            .find(|i| i.id == interface.id)
            .ok_or_else(|| Error::NotFound(format!("interface {}", interface.id)))?;
        let ips: Vec<IpAddr> = (0..granted).map(|_| self.mint_ip(iface.subnet_cidr)).collect();
        iface.ipv4s.extend(&ips);
        Ok(ips)
    }

    fn release_address(&self, ip: IpAddr) -> Result<()> {
        self.tick();
        if self.failing_release == Some(ip) {
            return Err(Error::Cloud(format!("simulated failure releasing {ip}")));
        }
        for iface in self.interfaces.borrow_mut().iter_mut() {
            iface.ipv4s.retain(|&assigned| assigned != ip);
        }
        self.released.borrow_mut().push(ip);
        Ok(())
    }

    fn describe_vpc_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>> {
        self.tick();
        Ok(self.vpc_cidrs.get(vpc_id).cloned().unwrap_or_default())
    }

    fn describe_vpc_peer_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>> {
        self.tick();
        Ok(self.peer_cidrs.get(vpc_id).cloned().unwrap_or_default())
    }
}

/// Fixed kernel snapshot.
pub struct MockNet {
    pub bound: Vec<BoundAddress>,
}

impl NetState for MockNet {
    fn list_assigned_addresses(&self) -> Result<Vec<BoundAddress>> {
        Ok(self.bound.clone())
    }
}
