//! Interface lifecycle: creation against a selected subnet, removal.

use log::{info, warn};

use super::address;
use super::subnet::{select_subnet, Filter};
use crate::cloud::{CloudClient, Interface};
use crate::error::{Error, Result};

/// Create a new interface with the given security groups, attached to the
/// best subnet matching `filter`, then request `batch_size` addresses on it
/// (0 fills the adapter to its per-adapter limit).
pub fn new_interface(
    cloud: &dyn CloudClient,
    security_groups: &[String],
    filter: &Filter,
    batch_size: u32,
) -> Result<Interface> {
    if security_groups.is_empty() {
        return Err(Error::Validation(
            "at least one security group is required".to_string(),
        ));
    }
    let limits = cloud.instance_limits()?;
    let existing = cloud.list_interfaces()?;
    if existing.len() as u32 >= limits.adapters {
        return Err(Error::Quota(format!(
            "instance already has {} of {} adapters",
            existing.len(),
            limits.adapters
        )));
    }

    let subnet = select_subnet(cloud, filter)?;
    let iface = cloud.create_interface(&subnet, security_groups)?;
    info!("created interface {} in subnet {}", iface.id, subnet.id);

    // The adapter exists from here on; an address shortfall is reported but
    // does not undo the create.
    if let Err(e) = address::allocate_on(cloud, &iface, batch_size, limits) {
        warn!("address allocation on new interface {}: {e}", iface.id);
    }

    // Re-read so the returned interface carries the addresses just granted.
    let refreshed = cloud
        .list_interfaces()?
        .into_iter()
        .find(|i| i.id == iface.id);
    Ok(refreshed.unwrap_or(iface))
}

/// Remove each named interface. Unknown ids are reported together with any
/// removal failures; the remaining ids are still processed.
pub fn remove_interfaces(cloud: &dyn CloudClient, ids: &[String]) -> Result<()> {
    let existing = cloud.list_interfaces()?;
    let mut errors = Vec::new();
    for id in ids {
        let outcome = match existing.iter().find(|iface| &iface.id == id) {
            None => Err(Error::NotFound(format!(
                "interface {id} is not attached to this instance"
            ))),
            Some(iface) => cloud.remove_interface(&iface.id),
        };
        match outcome {
            Ok(()) => info!("removed interface {id}"),
            Err(e) => {
                warn!("remove {id}: {e}");
                errors.push(e);
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Batch {
            errors,
            total: ids.len(),
        })
    }
}
