//! Diagnostic rules over a snapshot of instance state.
//!
//! Each rule is an independent, pure predicate evaluated against one
//! snapshot; `true` means the condition is present on this host. The CLI
//! prints the whole set as a {name, present} table.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::cloud::{CloudClient, InstanceLimits, Interface};
use crate::error::Result;
use crate::netstate::NetState;
use crate::registry::Registry;

/// Everything a rule may inspect, gathered once per evaluation.
pub struct Snapshot {
    pub limits: InstanceLimits,
    pub interfaces: Vec<Interface>,
    pub registry_ips: Vec<IpAddr>,
    pub kernel_ips: HashSet<IpAddr>,
}

impl Snapshot {
    pub fn gather(
        cloud: &dyn CloudClient,
        net: &dyn NetState,
        registry: &Registry,
    ) -> Result<Self> {
        Ok(Snapshot {
            limits: cloud.instance_limits()?,
            interfaces: cloud.list_interfaces()?,
            registry_ips: registry.list()?,
            kernel_ips: net
                .list_assigned_addresses()?
                .into_iter()
                .map(|b| b.ip)
                .collect(),
        })
    }

    fn granted_ips(&self) -> HashSet<IpAddr> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.ipv4s.iter().copied())
            .collect()
    }
}

/// A named predicate over the snapshot.
pub struct Rule {
    pub name: &'static str,
    pub check: fn(&Snapshot) -> bool,
}

/// The registered rule set, evaluated uniformly by the `diagnostics`
/// command.
pub const RULES: &[Rule] = &[
    Rule {
        name: "no-secondary-interface",
        check: |s| s.limits.adapters > 1 && s.interfaces.len() < 2,
    },
    Rule {
        name: "adapter-quota-exhausted",
        check: |s| s.interfaces.len() as u32 >= s.limits.adapters,
    },
    Rule {
        // Registry entries for addresses no interface owns anymore; GC will
        // fail to release these until they are forgotten.
        name: "stale-registry-entries",
        check: |s| {
            let granted = s.granted_ips();
            s.registry_ips.iter().any(|ip| !granted.contains(ip))
        },
    },
    Rule {
        // Kernel-bound pod addresses whose cloud-side grant has vanished.
        name: "kernel-cloud-drift",
        check: |s| {
            let granted = s.granted_ips();
            s.kernel_ips
                .iter()
                .any(|ip| ip.is_ipv4() && !granted.contains(ip) && is_private(ip))
        },
    },
];

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// Evaluate every registered rule against `snapshot`.
pub fn evaluate(snapshot: &Snapshot) -> Vec<(&'static str, bool)> {
    RULES
        .iter()
        .map(|rule| (rule.name, (rule.check)(snapshot)))
        .collect()
}
