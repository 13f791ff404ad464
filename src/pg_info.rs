//! Per-PG metadata persisted on every commit (spec §3 "PG info").

use serde::{Deserialize, Serialize};

use crate::types::{Epoch, Version};

/// Timestamped record of a peering milestone, kept in `PgInfo::history` so
/// an operator (or a later peering round) can see when the PG last went
/// active, last went clean, etc.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub epoch: Epoch,
    pub milestone: Milestone,
    pub at_unix_time: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Milestone {
    LastEpochStarted,
    LastClean,
    LastBecameActive,
    LastFullscrub,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PgStats {
    pub num_objects: u64,
    pub num_bytes: u64,
    pub num_recoveries: u64,
    pub num_backfilled_objects: u64,
}

/// Per-PG metadata: spec §3 "PG info" — "last-update version, last-complete
/// version ..., history ..., statistics. Persisted on every commit."
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PgInfo {
    pub last_update: Version,
    pub last_complete: Version,
    pub history: Vec<HistoryEntry>,
    pub stats: PgStats,
}

impl Default for PgInfo {
    fn default() -> Self {
        Self {
            last_update: Version::ZERO,
            last_complete: Version::ZERO,
            history: Vec::new(),
            stats: PgStats::default(),
        }
    }
}

impl PgInfo {
    /// spec §3 invariant: "last-complete ≤ last-update always; equality ⇒
    /// the PG is locally complete."
    pub fn is_locally_complete(&self) -> bool {
        crate::pg_invariant!(
            self.last_complete <= self.last_update,
            "last_complete {} > last_update {}",
            self.last_complete,
            self.last_update
        );
        self.last_complete == self.last_update
    }

    pub fn record_milestone(&mut self, epoch: Epoch, milestone: Milestone, at_unix_time: i64) {
        self.history.push(HistoryEntry { epoch, milestone, at_unix_time });
    }

    /// Advances `last_update` after a successful append, enforcing
    /// monotonicity (spec §3 "Version ... strictly monotonic").
    pub fn advance_last_update(&mut self, version: Version) {
        crate::pg_invariant!(
            version >= self.last_update,
            "last_update must be monotonic: {} < {}",
            version,
            self.last_update
        );
        self.last_update = version;
    }

    pub fn advance_last_complete(&mut self, version: Version) {
        crate::pg_invariant!(
            version <= self.last_update,
            "last_complete {} cannot exceed last_update {}",
            version,
            self.last_update
        );
        self.last_complete = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_info_is_locally_complete() {
        let info = PgInfo::default();
        assert!(info.is_locally_complete());
    }

    #[test]
    fn advancing_last_update_leaves_pg_incomplete_until_caught_up() {
        let mut info = PgInfo::default();
        info.advance_last_update(Version::new(1, 5));
        assert!(!info.is_locally_complete());
        info.advance_last_complete(Version::new(1, 5));
        assert!(info.is_locally_complete());
    }

    #[test]
    #[should_panic(expected = "PG invariant violated")]
    fn last_complete_cannot_exceed_last_update() {
        let mut info = PgInfo::default();
        info.advance_last_complete(Version::new(1, 1));
    }
}
