//! Error taxonomy for the IPAM engine.
//!
//! Validation and precondition failures are raised before any lock is taken
//! or any state is mutated. Batch operations collect per-item failures and
//! report them together instead of aborting on the first one.

use crate::cloud::AddressAllocation;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input: bad filter syntax, unparseable IP, non-positive
    /// durations, missing required arguments.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The process environment does not allow the command to run at all.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Adapter or per-adapter address limit exhausted.
    #[error("quota exhausted: {0}")]
    Quota(String),

    /// Unknown interface id, or an address that is not currently allocated.
    #[error("not found: {0}")]
    NotFound(String),

    /// Collaborator I/O failed (cloud API or kernel state reader). Never
    /// retried here; retry policy belongs to the caller.
    #[error("collaborator request failed: {0}")]
    Cloud(String),

    /// The persisted free-IP ledger is unreadable or corrupt.
    #[error("free-ip registry unusable: {0}")]
    Registry(String),

    /// Another invocation holds the host-wide lock. Fail-fast by design;
    /// orchestration hooks carry their own retry policy.
    #[error("another invocation holds the host lock")]
    LockBusy,

    #[error("lock file error: {0}")]
    Lock(#[source] std::io::Error),

    /// The cloud granted fewer addresses than requested. The grants that did
    /// succeed are carried here; callers must not assume all-or-nothing.
    #[error("allocated {} of {requested} requested addresses", granted.len())]
    PartialAllocation {
        granted: Vec<AddressAllocation>,
        requested: usize,
    },

    /// One or more items of a batch operation failed; the rest were still
    /// processed.
    #[error("{} of {total} items failed: {}", errors.len(), join_all(errors))]
    Batch { errors: Vec<Error>, total: usize },
}

fn join_all(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
