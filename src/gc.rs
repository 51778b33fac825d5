//! Time-based reclamation of idle free addresses.
//!
//! A run draws one randomized cutoff, collects registry entries older than
//! it, cross-checks each against a kernel snapshot taken at decision time,
//! and releases the ones that are genuinely idle. An address the kernel
//! still has bound is only forgotten from the registry; it is never released
//! through the cloud path.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;

use crate::alloc::address;
use crate::cloud::CloudClient;
use crate::error::{Error, Result};
use crate::netstate::NetState;
use crate::registry::Registry;

/// Default jitter applied to `free_after`, as a fraction of the period.
/// Smears reap timing across hosts so many instances do not hit the cloud
/// API in lockstep.
pub const DEFAULT_JITTER: f64 = 0.15;

/// One cutoff for the whole run: `now - free_after * (1 + U)` with `U`
/// drawn once from `[-jitter, +jitter]`.
fn jittered_cutoff(now: DateTime<Utc>, free_after: Duration, jitter: f64) -> DateTime<Utc> {
    let spread = if jitter > 0.0 {
        rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        0.0
    };
    let window_ms = free_after.as_secs_f64() * (1.0 + spread) * 1000.0;
    now - chrono::Duration::milliseconds(window_ms as i64)
}

/// Reap registry entries idle for longer than `free_after`, releasing at
/// most `max_reap` addresses; a negative `max_reap` reaps without limit.
pub fn run(
    cloud: &dyn CloudClient,
    net: &dyn NetState,
    registry: &Registry,
    free_after: Duration,
    jitter: f64,
    max_reap: i64,
) -> Result<()> {
    if free_after.is_zero() {
        return Err(Error::Validation(
            "free-after must be greater than zero".to_string(),
        ));
    }

    let cutoff = jittered_cutoff(Utc::now(), free_after, jitter);
    let candidates = registry.tracked_before(cutoff)?;
    if candidates.is_empty() {
        return Ok(());
    }
    info!("{} gc candidates tracked before {cutoff}", candidates.len());

    // Snapshot of kernel-bound addresses. Advisory for scheduling, but the
    // membership test below is the decision-time check: an address in this
    // set is never released.
    let live: HashSet<_> = net
        .list_assigned_addresses()?
        .into_iter()
        .map(|b| b.ip)
        .collect();

    let mut remaining = max_reap;
    for ip in candidates {
        if live.contains(&ip) {
            // Reused since it was last tracked. Drop the entry, no cloud call.
            registry.forget(ip)?;
            continue;
        }
        match address::deallocate(cloud, registry, ip) {
            Ok(()) => {
                info!("reclaimed idle address {ip}");
                remaining -= 1;
                // A negative max_reap never reaches zero.
                if remaining == 0 {
                    break;
                }
            }
            Err(e) => warn!("cannot reclaim {ip}: {e}"),
        }
    }
    Ok(())
}
