//! Past intervals: a compact encoding of historical acting-set changes since
//! "last epoch started", used during peering to decide which peers might
//! hold unreplicated writes (spec §3, §4.3, §9 "Cyclic references").

use serde::{Deserialize, Serialize};

use crate::types::{ActingSet, Epoch, NodeId};

/// A maximal range of consecutive epochs over which the acting set was
/// unchanged (spec GLOSSARY "Interval").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interval {
    pub first_epoch: Epoch,
    pub last_epoch: Epoch,
    pub acting: ActingSet,
    /// Whether the primary's `up_thru` marker (spec §4.3 WaitUpThru) proves
    /// this interval could have accepted client writes.
    pub maybe_went_active: bool,
}

impl Interval {
    pub fn contains(&self, node: NodeId) -> bool {
        self.acting.contains(&node)
    }
}

/// Ordered history of past intervals for one PG, oldest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PastIntervals {
    intervals: Vec<Interval>,
}

impl PastIntervals {
    pub fn new() -> Self {
        Self { intervals: Vec::new() }
    }

    /// Records a newly closed interval, e.g. after a map advance changes the
    /// acting set. Callers append in epoch order.
    pub fn push(&mut self, interval: Interval) {
        debug_assert!(
            self.intervals.last().map_or(true, |last| interval.first_epoch > last.last_epoch),
            "intervals must be appended in non-overlapping epoch order"
        );
        self.intervals.push(interval);
    }

    /// Every node that was in the acting set of some interval that might
    /// have accepted writes, i.e. candidates peering must query beyond the
    /// current up set (spec §4.3 "Primary / Peering / GetInfo": "every peer
    /// that was an acting member during any past interval that could have
    /// accepted writes").
    pub fn query_candidates(&self, since_epoch: Epoch) -> Vec<NodeId> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for interval in self.intervals.iter().rev() {
            if interval.last_epoch < since_epoch {
                break;
            }
            if !interval.maybe_went_active {
                continue;
            }
            for &node in &interval.acting {
                if seen.insert(node) {
                    out.push(node);
                }
            }
        }
        out
    }

    /// Discards intervals entirely older than `floor`, mirroring how the map
    /// cache trims epochs a PG no longer references (spec §9).
    pub fn trim_before(&mut self, floor: Epoch) {
        self.intervals.retain(|iv| iv.last_epoch >= floor);
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_candidates_excludes_intervals_with_no_writes() {
        let mut history = PastIntervals::new();
        history.push(Interval {
            first_epoch: 1,
            last_epoch: 3,
            acting: vec![1, 2, 3],
            maybe_went_active: false,
        });
        history.push(Interval {
            first_epoch: 4,
            last_epoch: 6,
            acting: vec![1, 2, 4],
            maybe_went_active: true,
        });
        let candidates = history.query_candidates(0);
        assert!(candidates.contains(&4));
        assert_eq!(candidates.len(), 3); // 1, 2, 4 — no duplicate 1/2
    }

    #[test]
    fn query_candidates_respects_since_epoch_floor() {
        let mut history = PastIntervals::new();
        history.push(Interval { first_epoch: 1, last_epoch: 3, acting: vec![9], maybe_went_active: true });
        history.push(Interval { first_epoch: 4, last_epoch: 6, acting: vec![1], maybe_went_active: true });
        let candidates = history.query_candidates(4);
        assert_eq!(candidates, vec![1]);
    }
}
