//! Kernel network state, read via `getifaddrs`.
//!
//! The GC reaper and the free-IP query both need to know which addresses the
//! kernel currently has bound. That read goes through the [`NetState`] trait
//! so tests can supply a fixed snapshot.

use std::net::IpAddr;

use crate::error::{Error, Result};

/// One kernel-bound address with its interface label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundAddress {
    pub label: String,
    pub ip: IpAddr,
}

pub trait NetState {
    /// Every non-loopback address currently bound to a kernel interface.
    fn list_assigned_addresses(&self) -> Result<Vec<BoundAddress>>;
}

/// Live reader backed by `getifaddrs(3)`.
pub struct KernelNetState;

impl NetState for KernelNetState {
    fn list_assigned_addresses(&self) -> Result<Vec<BoundAddress>> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| Error::Cloud(format!("getifaddrs: {e}")))?;

        let mut out = Vec::new();
        for ifaddr in addrs {
            let Some(storage) = ifaddr.address else {
                continue;
            };
            let ip = if let Some(sin) = storage.as_sockaddr_in() {
                IpAddr::V4(sin.ip())
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                IpAddr::V6(sin6.ip())
            } else {
                continue;
            };
            if ip.is_loopback() {
                continue;
            }
            out.push(BoundAddress {
                label: ifaddr.interface_name,
                ip,
            });
        }
        Ok(out)
    }
}
