//! Interface and address allocation under per-instance quotas.
//!
//! - `subnet`: key=value filtering and candidate selection.
//! - `interface`: adapter creation and removal.
//! - `address`: secondary-address batches, release, and the free-IP query.

pub mod address;
pub mod interface;
pub mod subnet;
