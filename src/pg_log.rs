//! The per-PG bounded ordered log and its divergence-reconciliation logic
//! (spec §3, §4.2). This is the structure peering reconciles and the write
//! path appends to; idempotent request handling reads it directly.
//!
//! Grounded on the teacher's `backup/prune.rs` for the shape of "walk an
//! ordered list, classify each entry, produce a decision map" logic, and on
//! `client/pull.rs`'s atomic-rename discipline for what "commit" means on
//! disk (applied in `pg_store.rs`).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::missing::MissingSet;
use crate::types::{NodeId, ObjectId, RequestId, Version};

/// The kind of mutation a log entry records.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpKind {
    Modify,
    Delete,
    Clone,
    RollbackExtent,
    /// An object is deliberately abandoned after `mark-lost` (spec §8
    /// scenario 6).
    LostDelete,
    /// Marks that a client write to this object may have been acked without
    /// being durable anywhere recoverable; produced by `mark-lost`.
    LostMark,
}

/// Enough information to undo a logged mutation byte-for-byte, used by
/// erasure-coded pools' read-modify-write path (spec §4.2, §4.4). Modeled
/// opaquely here: the object-store layer (out of scope, §1) interprets the
/// bytes; this crate only threads them through peering.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackDescriptor {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub version: Version,
    pub prior_version: Option<Version>,
    pub object: ObjectId,
    pub op: OpKind,
    pub request_id: RequestId,
    pub user_version: u64,
    pub rollback: Option<RollbackDescriptor>,
    pub mtime: i64,
}

impl LogEntry {
    /// Whether two entries "describe the same mutation" per spec §3's
    /// invariant: same object, same op, same user version (version itself
    /// is the comparison key the caller already matched on).
    pub fn agrees_with(&self, other: &LogEntry) -> bool {
        self.version == other.version
            && self.object == other.object
            && self.op == other.op
            && self.user_version == other.user_version
    }
}

/// A compact tombstone retained after trim to preserve request-id
/// idempotence without keeping the full entry (spec §3, §4.2, §8).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DupEntry {
    pub request_id: RequestId,
    pub user_version: u64,
    pub version: Version,
}

/// An object that the merge step found to have diverged: either it needs
/// recovery from the authoritative owner, or it can be rolled back locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DivergentResolution {
    NeedsRecovery { object: ObjectId, needed: Version },
    Rollback { object: ObjectId, entry: LogEntry },
}

/// Per-PG bounded ordered log (spec §3 "PG log").
#[derive(Debug, Default)]
pub struct PgLog {
    /// Entries ordered tail..head, i.e. oldest first.
    entries: VecDeque<LogEntry>,
    dups: VecDeque<DupEntry>,
    max_length: usize,
    max_dups: usize,
}

impl PgLog {
    pub fn new(max_length: usize, max_dups: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            dups: VecDeque::new(),
            max_length,
            max_dups,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<Version> {
        self.entries.back().map(|e| e.version)
    }

    pub fn tail(&self) -> Option<Version> {
        self.entries.front().map(|e| e.version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Entries with version strictly greater than `floor`, in order. Used
    /// both to serve a "GetLog" peering request and to splice during merge.
    pub fn entries_above(&self, floor: Version) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.version > floor)
            .cloned()
            .collect()
    }

    /// Appends a new entry at the head (spec §4.2 "Append (primary)"). The
    /// caller is responsible for allocating `entry.version` as
    /// `(current_epoch, counter+1)` and for setting `prior_version` to the
    /// object's previous last-update.
    pub fn append(&mut self, entry: LogEntry) {
        crate::pg_invariant!(
            self.head().map_or(true, |h| entry.version > h),
            "log append out of order: new {} <= head {:?}",
            entry.version,
            self.head()
        );
        self.entries.push_back(entry);
        self.trim();
    }

    /// Looks up a request id in the combined (log ∪ dups), returning the
    /// stored user version for idempotent replay (spec §4.4 step 3, §8
    /// scenario 5).
    pub fn find_request(&self, id: RequestId) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.request_id == id)
            .map(|e| e.user_version)
            .or_else(|| self.dups.iter().find(|d| d.request_id == id).map(|d| d.user_version))
    }

    /// Converts entries below `min_last_complete` to dups once the log
    /// exceeds `max_length`, then drops dups once they exceed `max_dups`
    /// (spec §4.2 "Trim", §8 boundary cases).
    fn trim(&mut self) {
        while self.entries.len() > self.max_length {
            if let Some(entry) = self.entries.pop_front() {
                self.dups.push_back(DupEntry {
                    request_id: entry.request_id,
                    user_version: entry.user_version,
                    version: entry.version,
                });
            }
        }
        while self.dups.len() > self.max_dups {
            self.dups.pop_front();
        }
    }

    /// Explicit trim driven by the minimum last-complete version across the
    /// acting set, as spec §4.2 specifies ("entries whose version is below
    /// min-last-complete-of-acting-set are converted to dup entries").
    pub fn trim_below(&mut self, min_last_complete: Version) {
        while self
            .entries
            .front()
            .map(|e| e.version < min_last_complete)
            .unwrap_or(false)
        {
            if let Some(entry) = self.entries.pop_front() {
                self.dups.push_back(DupEntry {
                    request_id: entry.request_id,
                    user_version: entry.user_version,
                    version: entry.version,
                });
            }
        }
        while self.dups.len() > self.max_dups {
            self.dups.pop_front();
        }
    }

    pub fn dup_count(&self) -> usize {
        self.dups.len()
    }

    /// Verifies the invariant that the prior-version chain is dense from
    /// tail to head (spec §3, §8). Returns the first gap found, if any.
    pub fn find_gap(&self) -> Option<(Version, Option<Version>)> {
        let mut prev: Option<Version> = None;
        for entry in &self.entries {
            if let Some(p) = prev {
                if entry.prior_version != Some(p) {
                    return Some((entry.version, entry.prior_version));
                }
            }
            prev = Some(entry.version);
        }
        None
    }

    /// Finds the lower bound of divergence (LBD) between this (local) log
    /// and an authoritative log: the highest version at which both logs
    /// agree, scanning from the overlapping tail (spec §4.2 step 1).
    pub fn lower_bound_of_divergence(&self, authoritative: &PgLog) -> Option<Version> {
        let local: HashMap<Version, &LogEntry> =
            self.entries.iter().map(|e| (e.version, e)).collect();
        let mut lbd: Option<Version> = None;
        for auth_entry in &authoritative.entries {
            match local.get(&auth_entry.version) {
                Some(local_entry) if local_entry.agrees_with(auth_entry) => {
                    lbd = Some(auth_entry.version);
                }
                Some(_) => break, // same version, different content: divergence starts here
                None => {
                    // Authoritative has an entry we've never seen; if we have
                    // nothing past this point either it's simply new, not
                    // divergent, so keep scanning forward.
                    continue;
                }
            }
        }
        lbd
    }

    /// Entries strictly above `lbd` on the local log: candidates for
    /// divergence classification (spec §4.2 step 2).
    pub fn divergent_local_entries(&self, lbd: Option<Version>) -> Vec<LogEntry> {
        match lbd {
            Some(v) => self.entries_above(v),
            None => self.entries.iter().cloned().collect(),
        }
    }

    /// Splices authoritative entries above `lbd` onto the local log,
    /// replacing any local entries above `lbd` (spec §4.2 step 3). Callers
    /// must have already classified and recorded the divergent entries via
    /// `divergent_local_entries`/`classify_divergence` before calling this,
    /// since those entries are discarded here.
    pub fn splice_authoritative(&mut self, lbd: Option<Version>, authoritative: &PgLog) {
        if let Some(v) = lbd {
            self.entries.retain(|e| e.version <= v);
        } else {
            self.entries.clear();
        }
        for entry in authoritative.entries_above(lbd.unwrap_or(Version::ZERO)) {
            self.entries.push_back(entry);
        }
        self.trim();
    }
}

/// Classifies one divergent local entry per spec §4.2 step 2, given the
/// object's current authoritative last-update version.
pub fn classify_divergence(
    divergent: &LogEntry,
    authoritative_last_update: Option<Version>,
) -> DivergentResolution {
    let superseded = authoritative_last_update
        .map(|au| au >= divergent.version)
        .unwrap_or(false);
    if superseded {
        DivergentResolution::NeedsRecovery {
            object: divergent.object.clone(),
            needed: authoritative_last_update.unwrap(),
        }
    } else if divergent.rollback.is_some() {
        DivergentResolution::Rollback {
            object: divergent.object.clone(),
            entry: divergent.clone(),
        }
    } else {
        DivergentResolution::NeedsRecovery {
            object: divergent.object.clone(),
            needed: divergent.version,
        }
    }
}

/// Recomputes a missing set by replaying `tail..head` of an authoritative
/// log against a map of locally stored object versions (spec §4.2 step 4).
pub fn recompute_missing(
    authoritative: &PgLog,
    stored_versions: &HashMap<ObjectId, Version>,
    from: NodeId,
) -> MissingSet {
    let mut missing = MissingSet::new();
    for entry in authoritative.entries() {
        let have = stored_versions.get(&entry.object).copied();
        if have.map(|v| v < entry.version).unwrap_or(true) {
            missing.insert(entry.object.clone(), entry.version, Some(from));
        } else {
            missing.remove(&entry.object);
        }
    }
    missing
}

/// Total order spec §4.2 uses to pick the authoritative log during peering:
/// longer last-update wins; ties broken by longer log, then by greater
/// completeness, then by lower shard id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthoritativeCandidate {
    pub node: NodeId,
    pub last_update: Version,
    pub log_length: usize,
    pub complete: bool,
    pub shard: i8,
}

impl AuthoritativeCandidate {
    fn sort_key(&self) -> (Version, usize, bool, std::cmp::Reverse<i8>) {
        (self.last_update, self.log_length, self.complete, std::cmp::Reverse(self.shard))
    }
}

/// Picks the authoritative candidate (and thus preferred primary) per spec
/// §4.2. Returns `None` for an empty candidate list.
pub fn pick_authoritative(candidates: &[AuthoritativeCandidate]) -> Option<AuthoritativeCandidate> {
    candidates.iter().copied().max_by_key(|c| c.sort_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(epoch: u64, counter: u64, obj: &str, uv: u64) -> LogEntry {
        let prior = if counter == 0 { None } else { Some(Version::new(epoch, counter - 1)) };
        LogEntry {
            version: Version::new(epoch, counter),
            prior_version: prior,
            object: ObjectId::new(1, obj, 7),
            op: OpKind::Modify,
            request_id: RequestId { client: 1, tid: counter },
            user_version: uv,
            rollback: None,
            mtime: 0,
        }
    }

    #[test]
    fn append_trims_to_dups_then_drops_dups() {
        let mut log = PgLog::new(2, 1);
        for i in 0..4 {
            log.append(entry(1, i, "x", i));
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.dup_count(), 1); // max_dups caps it, oldest dup dropped
        // The request id for the earliest write should no longer be
        // resolvable at all once its dup ages out.
        assert!(log.find_request(RequestId { client: 1, tid: 0 }).is_none());
        // But the most recently trimmed one should still be in dups.
        assert_eq!(log.find_request(RequestId { client: 1, tid: 2 }), Some(2));
    }

    #[test]
    fn find_gap_detects_missing_prior_version() {
        let mut log = PgLog::new(100, 100);
        log.append(entry(1, 0, "x", 0));
        log.append(entry(1, 2, "x", 1)); // skips counter 1: dense chain broken
        assert!(log.find_gap().is_some());
    }

    #[test]
    fn lbd_found_at_highest_agreeing_version() {
        let mut local = PgLog::new(100, 100);
        let mut auth = PgLog::new(100, 100);
        for i in 0..3 {
            local.append(entry(1, i, "x", i));
            auth.append(entry(1, i, "x", i));
        }
        // local diverges at counter 3 (different user_version)
        let mut diverged = entry(1, 3, "x", 99);
        diverged.user_version = 999;
        local.append(diverged.clone());
        let mut auth_entry_3 = entry(1, 3, "x", 3);
        auth_entry_3.user_version = 3;
        auth.append(auth_entry_3);

        let lbd = local.lower_bound_of_divergence(&auth);
        assert_eq!(lbd, Some(Version::new(1, 2)));
    }

    #[test]
    fn classify_prefers_rollback_when_available_and_not_superseded() {
        let mut e = entry(1, 5, "x", 5);
        e.rollback = Some(RollbackDescriptor { data: vec![1, 2, 3] });
        let resolution = classify_divergence(&e, None);
        assert!(matches!(resolution, DivergentResolution::Rollback { .. }));
    }

    #[test]
    fn classify_needs_recovery_when_authoritative_is_ahead() {
        let e = entry(1, 5, "x", 5);
        let resolution = classify_divergence(&e, Some(Version::new(1, 6)));
        assert!(matches!(resolution, DivergentResolution::NeedsRecovery { .. }));
    }

    #[test]
    fn pick_authoritative_prefers_longer_last_update() {
        let a = AuthoritativeCandidate {
            node: 1,
            last_update: Version::new(2, 10),
            log_length: 5,
            complete: true,
            shard: 0,
        };
        let b = AuthoritativeCandidate {
            node: 2,
            last_update: Version::new(3, 1),
            log_length: 1,
            complete: false,
            shard: 0,
        };
        let winner = pick_authoritative(&[a, b]).unwrap();
        assert_eq!(winner.node, 2);
    }

    #[test]
    fn pick_authoritative_breaks_ties_by_log_length_then_shard() {
        let same_update = Version::new(2, 10);
        let a = AuthoritativeCandidate { node: 1, last_update: same_update, log_length: 5, complete: true, shard: 1 };
        let b = AuthoritativeCandidate { node: 2, last_update: same_update, log_length: 9, complete: true, shard: 0 };
        let winner = pick_authoritative(&[a, b]).unwrap();
        assert_eq!(winner.node, 2); // longer log wins
    }
}
