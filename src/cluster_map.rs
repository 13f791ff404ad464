//! Cluster map epochs and the per-PG placement function (spec §3, §4.1, §6).
//!
//! The map itself is an external collaborator (the monitor quorum owns
//! issuing epochs); this module holds the client-side cache and the
//! placement computation, the way the teacher's `config/datastore.rs`
//! caches a section-config behind `lazy_static` and reloads it from a
//! single authoritative source.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

use crate::types::{ActingSet, Epoch, NodeId, ObjectHash, PgId, PoolId};

/// Erasure-coding parameters for a pool: `k` data shards, `m` parity shards.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcParams {
    pub k: u8,
    pub m: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PoolKind {
    Replicated { replicas: u8 },
    ErasureCoded(EcParams),
}

impl PoolKind {
    /// Minimum number of acting members required to serve I/O.
    pub fn min_size(&self) -> u8 {
        match self {
            PoolKind::Replicated { replicas } => (*replicas / 2) + 1,
            PoolKind::ErasureCoded(ec) => ec.k,
        }
    }

    pub fn full_size(&self) -> u8 {
        match self {
            PoolKind::Replicated { replicas } => *replicas,
            PoolKind::ErasureCoded(ec) => ec.k + ec.m,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolDef {
    pub id: PoolId,
    pub name: String,
    pub kind: PoolKind,
    pub pg_count: u32,
}

/// One weighted node in the placement hierarchy. A real deployment nests
/// these under failure domains (host/rack/row); this crate models only the
/// flat leaf weights, which is all the placement function below needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeWeight {
    pub node: NodeId,
    pub weight: u32,
    pub up: bool,
    pub in_cluster: bool,
}

/// One immutable cluster-map epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterMap {
    pub epoch: Epoch,
    pub pools: Vec<PoolDef>,
    pub nodes: Vec<NodeWeight>,
}

impl ClusterMap {
    pub fn pool(&self, id: PoolId) -> Option<&PoolDef> {
        self.pools.iter().find(|p| p.id == id)
    }

    fn up_nodes(&self) -> Vec<&NodeWeight> {
        self.nodes.iter().filter(|n| n.up && n.in_cluster).collect()
    }

    /// Deterministic placement: hashes (epoch, pg) to seed a weighted pick of
    /// `full_size` distinct up nodes (the "up set"). This stands in for the
    /// real hierarchical CRUSH-style placement function spec §3 calls for;
    /// it satisfies the same contract (deterministic, a function of epoch +
    /// pg id + pool topology only) without modeling failure domains, which
    /// this crate's scope (§1, cluster-membership service is out of scope)
    /// does not require.
    pub fn up_set(&self, pg: PgId) -> Result<ActingSet, Error> {
        let pool = self
            .pool(pg.pool)
            .ok_or_else(|| anyhow::anyhow!("no such pool {}", pg.pool))?;
        let full = pool.kind.full_size() as usize;
        let mut candidates = self.up_nodes();
        if candidates.is_empty() {
            bail!("no up nodes in map epoch {}", self.epoch);
        }
        candidates.sort_by_key(|n| n.node);

        let mut picked: Vec<NodeId> = Vec::new();
        let mut remaining: Vec<&NodeWeight> = candidates.clone();
        for slot in 0..full {
            if remaining.is_empty() {
                break;
            }
            let mut hasher = SipHasher13::new_with_keys(self.epoch, pg_seed(pg));
            hasher.write_u64(slot as u64);
            let total_weight: u64 = remaining.iter().map(|n| n.weight as u64).sum();
            if total_weight == 0 {
                break;
            }
            let mut target = hasher.finish() % total_weight;
            let mut idx = 0;
            for (i, n) in remaining.iter().enumerate() {
                if target < n.weight as u64 {
                    idx = i;
                    break;
                }
                target -= n.weight as u64;
            }
            picked.push(remaining.remove(idx).node);
        }
        Ok(picked)
    }

    /// The acting set: the up set, degraded to only the nodes currently
    /// reachable (spec §3: "currently responsible members, possibly smaller
    /// after degradation"). Down nodes are simply dropped, preserving order.
    pub fn acting_set(&self, pg: PgId) -> Result<ActingSet, Error> {
        let up = self.up_set(pg)?;
        let up_node_status: HashMap<NodeId, bool> =
            self.nodes.iter().map(|n| (n.node, n.up && n.in_cluster)).collect();
        Ok(up
            .into_iter()
            .filter(|n| *up_node_status.get(n).unwrap_or(&false))
            .collect())
    }

    /// Hashes an object to its PG id within its pool, per spec §3 ("Each
    /// object hashes to exactly one PG id").
    pub fn object_pg(&self, pool: PoolId, hash: ObjectHash) -> Result<PgId, Error> {
        let pool_def = self
            .pool(pool)
            .ok_or_else(|| anyhow::anyhow!("no such pool {}", pool))?;
        if pool_def.pg_count == 0 {
            bail!("pool {} has zero PGs", pool);
        }
        let seq = hash % pool_def.pg_count;
        Ok(PgId::new(pool, seq))
    }
}

fn pg_seed(pg: PgId) -> u64 {
    ((pg.pool as u64) << 32) ^ (pg.seq as u64) ^ ((pg.shard as i64 as u64) << 48)
}

/// Read-mostly, copy-on-write cache of cluster-map epochs (spec §4.1, §5).
/// Readers hold an `Arc<ClusterMap>` snapshot; the writer (the map
/// subscriber) installs new epochs without blocking readers.
pub struct MapCache {
    inner: RwLock<BTreeMap<Epoch, Arc<ClusterMap>>>,
    /// The oldest epoch any PG on this node still references; epochs below
    /// this are safe to trim (spec §4.1: "Maps older than the oldest epoch
    /// any PG still references are trimmed").
    floor: RwLock<Epoch>,
}

impl Default for MapCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MapCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            floor: RwLock::new(0),
        }
    }

    pub fn get(&self, epoch: Epoch) -> Option<Arc<ClusterMap>> {
        self.inner.read().unwrap().get(&epoch).cloned()
    }

    pub fn latest(&self) -> Option<Arc<ClusterMap>> {
        self.inner.read().unwrap().values().next_back().cloned()
    }

    pub fn latest_epoch(&self) -> Epoch {
        self.latest().map(|m| m.epoch).unwrap_or(0)
    }

    /// Installs a map epoch, either a full map or (conceptually) one
    /// resolved from an incremental diff applied by the caller. Epochs must
    /// be installed in non-decreasing order; a gap is the caller's
    /// responsibility to fill first (spec §3: "gaps are filled by
    /// requesting ranges from peers").
    pub fn insert(&self, map: ClusterMap) {
        self.inner.write().unwrap().insert(map.epoch, Arc::new(map));
    }

    /// Returns the contiguous range of epochs missing between the cache's
    /// newest epoch and `target`, inclusive, so the caller can request
    /// exactly that range from the monitor or a peer.
    pub fn missing_range(&self, target: Epoch) -> Vec<Epoch> {
        let guard = self.inner.read().unwrap();
        let newest = guard.keys().next_back().copied().unwrap_or(0);
        if target <= newest {
            return Vec::new();
        }
        ((newest + 1)..=target).collect()
    }

    /// Raises the trim floor and drops any epoch strictly below it.
    pub fn advance_floor(&self, new_floor: Epoch) {
        let mut floor = self.floor.write().unwrap();
        if new_floor <= *floor {
            return;
        }
        *floor = new_floor;
        drop(floor);
        self.inner.write().unwrap().retain(|&epoch, _| epoch >= new_floor);
    }

    pub fn floor(&self) -> Epoch {
        *self.floor.read().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map(epoch: Epoch, up_nodes: &[NodeId]) -> ClusterMap {
        ClusterMap {
            epoch,
            pools: vec![PoolDef {
                id: 1,
                name: "data".into(),
                kind: PoolKind::Replicated { replicas: 3 },
                pg_count: 8,
            }],
            nodes: up_nodes
                .iter()
                .map(|&n| NodeWeight { node: n, weight: 100, up: true, in_cluster: true })
                .collect(),
        }
    }

    #[test]
    fn placement_is_deterministic_for_fixed_epoch() {
        let map = sample_map(5, &[1, 2, 3, 4, 5]);
        let pg = PgId::new(1, 3);
        let a = map.up_set(pg).unwrap();
        let b = map.up_set(pg).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3); // replicas = 3
    }

    #[test]
    fn acting_set_drops_down_nodes_but_keeps_order() {
        let mut map = sample_map(5, &[1, 2, 3, 4, 5]);
        let pg = PgId::new(1, 3);
        let up = map.up_set(pg).unwrap();
        // take one member down
        let down_node = up[1];
        for n in map.nodes.iter_mut() {
            if n.node == down_node {
                n.up = false;
            }
        }
        let acting = map.acting_set(pg).unwrap();
        assert_eq!(acting.len(), up.len() - 1);
        assert!(!acting.contains(&down_node));
    }

    #[test]
    fn map_cache_reports_missing_range() {
        let cache = MapCache::new();
        cache.insert(sample_map(5, &[1, 2, 3]));
        assert_eq!(cache.missing_range(5), Vec::<Epoch>::new());
        assert_eq!(cache.missing_range(8), vec![6, 7, 8]);
    }

    #[test]
    fn map_cache_trims_below_floor() {
        let cache = MapCache::new();
        for e in 1..=5 {
            cache.insert(sample_map(e, &[1, 2, 3]));
        }
        cache.advance_floor(3);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.latest_epoch(), 5);
    }

    #[test]
    fn object_pg_hashes_within_pool_pg_count() {
        let map = sample_map(1, &[1, 2, 3]);
        let pg = map.object_pg(1, 123456).unwrap();
        assert_eq!(pg.pool, 1);
        assert!(pg.seq < 8);
    }
}
