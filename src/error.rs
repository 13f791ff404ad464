//! Typed error kinds for the PG layer (spec §7).
//!
//! The teacher repo (`client/pull.rs`) downcasts a `proxmox::api::error::HttpError`
//! out of an `anyhow::Error` to decide whether a failure is retriable; the same
//! shape is used here for `PgError`. Call sites that just need to propagate a
//! failure keep using `anyhow::Error` with `?`, matching the teacher idiom;
//! call sites that need to *decide* based on the failure kind downcast via
//! `.downcast_ref::<PgError>()`.

use thiserror::Error;

use crate::types::{Epoch, PgId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PgError {
    /// Peer unreachable right now; the sender should retry after backoff.
    /// Never surfaces to the client.
    #[error("pg {pg}: peer {peer} unreachable")]
    TransientPeerUnreachable { pg: PgId, peer: crate::types::NodeId },

    /// Caller's assumed epoch is behind the PG's current epoch; caller must
    /// refresh its map and retry.
    #[error("pg {pg}: stale epoch {caller_epoch}, current is {current_epoch}")]
    StaleEpoch {
        pg: PgId,
        caller_epoch: Epoch,
        current_epoch: Epoch,
    },

    /// The PG is mid-peering; the client should retry later.
    #[error("pg {pg}: not active (peering)")]
    NotActive { pg: PgId },

    /// The requested object is present but not at a version this member
    /// holds; the caller should block on recovery.
    #[error("pg {pg}: object {object} missing, needed version {needed}")]
    ObjectMissing {
        pg: PgId,
        object: String,
        needed: crate::types::Version,
    },

    /// Fewer than `k` shards were reachable to satisfy an erasure-coded read.
    #[error("pg {pg}: EC reconstruction impossible, have {available} of {required} shards")]
    EcReconstructionImpossible {
        pg: PgId,
        available: usize,
        required: usize,
    },

    /// The local object store returned an I/O error. Fatal for this PG: the
    /// PG must be marked down and writes aborted pending intervention.
    #[error("pg {pg}: object store I/O error: {message}")]
    ObjectStoreIo { pg: PgId, message: String },

    /// Peering proved that acknowledged data may be unrecoverable; an
    /// administrator must run `mark-lost`.
    #[error("pg {pg}: mark-lost required for {count} object(s)")]
    MarkLostRequired { pg: PgId, count: usize },
}

impl PgError {
    /// Whether a primary may silently retry this failure rather than
    /// surfacing it, per spec §7 ("transient peer unreachable ... retry
    /// after backoff; never surfaces to client").
    pub fn is_retriable_internally(&self) -> bool {
        matches!(self, PgError::TransientPeerUnreachable { .. })
    }

    /// Whether the client library should refresh its map and retry, per
    /// spec §7's "stale epoch" and "not active" kinds.
    pub fn caller_should_refresh_and_retry(&self) -> bool {
        matches!(self, PgError::StaleEpoch { .. } | PgError::NotActive { .. })
    }
}

/// Panics the process on an invariant violation (spec §7: "crash the
/// process so the rest of the cluster can recover from this node's absence
/// rather than from corrupted state"). Never used for ordinary error paths.
#[macro_export]
macro_rules! pg_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("PG invariant violated: {}", format_args!($($arg)+));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_internally_retriable() {
        let err = PgError::TransientPeerUnreachable { pg: PgId::new(1, 0), peer: 7 };
        assert!(err.is_retriable_internally());
        assert!(!err.caller_should_refresh_and_retry());
    }

    #[test]
    fn stale_epoch_tells_caller_to_refresh() {
        let err = PgError::StaleEpoch { pg: PgId::new(1, 0), caller_epoch: 3, current_epoch: 5 };
        assert!(err.caller_should_refresh_and_retry());
        assert!(!err.is_retriable_internally());
    }
}
