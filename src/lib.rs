//! # eni-ipam - ENI and secondary-IP lifecycle engine for CNI IPAM
//!
//! This library manages elastic network interfaces (ENIs) and their
//! secondary private IP addresses on a cloud compute instance, exposing
//! spare addresses for assignment to container sandboxes on that host.
//!
//! ## Overview
//!
//! Container lifecycle hooks invoke the `eni-ipam` binary as independent,
//! possibly concurrent processes. The engine allocates secondary addresses
//! across multiple interfaces under per-instance quota limits, keeps a
//! durable ledger of addresses believed free, and garbage-collects idle
//! addresses on a jittered schedule, reconciled against live kernel state.
//! A host-wide advisory lock serializes every mutating operation.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `cloud`: data model and the `CloudClient` capability, with the AWS CLI
//!   adapter and the instance-metadata probe
//! - `alloc`: subnet selection, interface lifecycle, and address batches
//! - `registry`: the durable free-IP ledger
//! - `gc`: jittered, quota-bounded reclamation of idle addresses
//! - `lock`: host-wide mutual exclusion backed by an advisory `flock`
//! - `netstate`: kernel-bound address enumeration via `getifaddrs`
//! - `diag`: diagnostic rules evaluated over a state snapshot
//! - `error`: the error taxonomy shared by all of the above
//!
//! ## Concurrency model
//!
//! There is no intra-process parallelism; correctness depends on
//! cross-process coordination. Mutating operations (interface create and
//! remove, address allocate and deallocate, GC runs) acquire the host lock
//! first and hold it for the whole operation. Read-only queries run
//! unlocked and tolerate observing a mid-mutation snapshot. The lock is an
//! OS advisory lock, so a killed process can never leave it held.
//!
//! ## Error handling
//!
//! Typed errors live in [`error::Error`]. Validation and precondition
//! failures are raised before any lock or mutation; batch operations report
//! per-item failures together instead of aborting early.

pub mod alloc;
pub mod cloud;
pub mod diag;
pub mod error;
pub mod gc;
pub mod lock;
pub mod netstate;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;
