//! `NodeService`: the per-node aggregate root (spec §4.1, §5, §9). Owns the
//! map cache, the PG registry, the scheduler, the four reservers, and the
//! heartbeat tracker — the pieces every PG on this node shares.
//!
//! Grounded on the teacher's `client/pull.rs::PullParameters`/`BackupReader`
//! pairing for "one struct holding the shared collaborators, `Arc`-wrapped
//! so worker tasks can each hold a clone without the node itself being
//! `Clone`" and on spec §9's explicit guidance to use weak references where
//! a PG's own state would otherwise form a reference cycle back through the
//! node (the `Weak<NodeService>` a `Pg`-facing handle would hold, modeled
//! here as `node_ref` on `PgHandle`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{Error, Result};
use tokio::sync::Mutex as AsyncMutex;

use crate::cluster_map::MapCache;
use crate::config::DaemonConfig;
use crate::dispatcher::DispatchItem;
use crate::heartbeat::{HeartbeatTracker, Link};
use crate::messenger::{Envelope, Message, Messenger};
use crate::pg::Pg;
use crate::reserver::{ReservationClass, Reserver};
use crate::scheduler::{OpClass, RateLimiter, Scheduler};
use crate::types::{NodeId, PgId};

/// No ready work on a shard: back off briefly instead of busy-spinning.
/// Mirrors the teacher's `tools::ParallelHandler` worker threads parking on
/// an empty channel rather than polling in a tight loop.
const IDLE_BACKOFF: Duration = Duration::from_millis(20);

/// A `Pg` plus the weak back-reference to its owning node, so a PG can look
/// up shared services (map cache, reservers) without keeping the node
/// itself alive past the registry's own strong reference (spec §9 "Cyclic
/// references": "PG state must not keep the node service alive via a strong
/// reference cycle"). The async mutex (rather than `std::sync::Mutex`) is
/// needed because the worker loop holds this lock across the `.await`
/// points inside `Pg::handle_client_write`/`apply_sub_op_write`.
pub struct PgHandle {
    pub pg: AsyncMutex<Pg>,
    node: Weak<NodeService>,
}

impl PgHandle {
    /// Upgrades the back-reference; `None` only once the node itself has
    /// begun shutting down and dropped its own `Arc`.
    pub fn node(&self) -> Option<Arc<NodeService>> {
        self.node.upgrade()
    }
}

pub struct NodeService {
    pub node_id: NodeId,
    pub map_cache: MapCache,
    pub local_recovery: Arc<Reserver>,
    pub remote_recovery: Arc<Reserver>,
    pub snap_trim: Arc<Reserver>,
    pub scrub: Arc<Reserver>,
    pub heartbeat: Mutex<HeartbeatTracker>,
    pub messenger: Arc<dyn Messenger>,
    pgs: RwLock<HashMap<PgId, Arc<PgHandle>>>,
    scheduler: Mutex<Scheduler<DispatchItem>>,
    background_limiters: Vec<Mutex<RateLimiter>>,
}

impl NodeService {
    pub fn new(node_id: NodeId, config: &DaemonConfig, messenger: Arc<dyn Messenger>) -> Arc<Self> {
        let shard_count = config.static_.worker_shards;
        Arc::new_cyclic(|weak: &Weak<NodeService>| {
            let _ = weak; // PgHandle instances created later capture their own weak clone
            Self {
                node_id,
                map_cache: MapCache::new(),
                local_recovery: Reserver::new(config.live.recovery_max_active),
                remote_recovery: Reserver::new(config.live.remote_recovery_max_active),
                snap_trim: Reserver::new(config.live.snap_trim_max_active),
                scrub: Reserver::new(config.live.scrub_max_active),
                heartbeat: Mutex::new(HeartbeatTracker::new(
                    config.live.heartbeat_suspect_after_secs,
                    config.live.heartbeat_down_after_secs,
                )),
                messenger,
                pgs: RwLock::new(HashMap::new()),
                scheduler: Mutex::new(Scheduler::new(shard_count)),
                background_limiters: (0..shard_count)
                    .map(|_| {
                        Mutex::new(RateLimiter::new(
                            config.live.background_bucket_size,
                            config.live.background_refill_per_tick,
                        ))
                    })
                    .collect(),
            }
        })
    }

    pub fn reserver_for(&self, class: ReservationClass) -> Arc<Reserver> {
        match class {
            ReservationClass::LocalRecovery => self.local_recovery.clone(),
            ReservationClass::RemoteRecovery => self.remote_recovery.clone(),
            ReservationClass::SnapTrim => self.snap_trim.clone(),
            ReservationClass::Scrub => self.scrub.clone(),
        }
    }

    /// Registers a newly created or loaded PG under this node.
    pub fn register_pg(self: &Arc<Self>, pg: Pg) -> Arc<PgHandle> {
        let id = pg.id;
        let handle = Arc::new(PgHandle { pg: AsyncMutex::new(pg), node: Arc::downgrade(self) });
        self.pgs.write().unwrap().insert(id, handle.clone());
        handle
    }

    pub fn get_pg(&self, id: PgId) -> Option<Arc<PgHandle>> {
        self.pgs.read().unwrap().get(&id).cloned()
    }

    pub fn remove_pg(&self, id: PgId) -> Option<Arc<PgHandle>> {
        self.pgs.write().unwrap().remove(&id)
    }

    pub fn pg_count(&self) -> usize {
        self.pgs.read().unwrap().len()
    }

    pub fn pg_ids(&self) -> Vec<PgId> {
        self.pgs.read().unwrap().keys().copied().collect()
    }

    /// Submits a dispatch item onto the correct worker shard for `pg` (spec
    /// §5).
    pub fn submit(&self, pg: PgId, class: OpClass, item: DispatchItem) -> Result<(), Error> {
        self.scheduler.lock().unwrap().submit(pg, class, item);
        Ok(())
    }

    /// Pops the next item for `shard`, for a worker loop to process.
    pub fn poll_shard(&self, shard: usize) -> Option<crate::scheduler::QueuedOp<DispatchItem>> {
        self.scheduler.lock().unwrap().poll(shard)
    }

    pub fn shard_count(&self) -> usize {
        self.scheduler.lock().unwrap().shard_count()
    }

    /// Spawns one worker task per shard (spec §4.1/§5: "a fixed-size pool of
    /// worker shards" continuously draining its queue). `pgstored`'s `main`
    /// calls this once at startup; each returned handle runs until the
    /// process shuts down.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.shard_count())
            .map(|shard| {
                let node = self.clone();
                tokio::spawn(async move { node.run_worker(shard).await })
            })
            .collect()
    }

    /// Drains one shard forever: pops the highest-priority ready op and
    /// processes it, backing off briefly when the shard is empty rather than
    /// busy-spinning a core.
    pub async fn run_worker(self: Arc<Self>, shard: usize) {
        loop {
            match self.poll_shard(shard) {
                Some(op) => {
                    if matches!(op.class, OpClass::Recovery | OpClass::SnapTrim | OpClass::Scrub)
                        && !self.background_limiters[shard].lock().unwrap().try_consume()
                    {
                        // Over budget this tick: requeue and let higher
                        // classes (peering/client ops) run ahead of it.
                        let _ = self.submit(op.pg, op.class, op.payload);
                        tokio::time::sleep(IDLE_BACKOFF).await;
                        continue;
                    }
                    self.process(op.pg, op.payload).await;
                }
                None => tokio::time::sleep(IDLE_BACKOFF).await,
            }
        }
    }

    /// Applies one dequeued dispatch item against its owning PG (spec §4.4
    /// write path, §4.1 peer message handling).
    async fn process(&self, pg_id: PgId, item: DispatchItem) {
        let handle = match self.get_pg(pg_id) {
            Some(handle) => handle,
            None => {
                log::warn!("dropping dispatch item for unknown pg {}", pg_id);
                return;
            }
        };
        match item {
            DispatchItem::ClientWrite(write) => {
                let mtime = unix_time();
                let mut pg = handle.pg.lock().await;
                let acting = pg.peering.acting.clone();
                if let Err(err) = pg.handle_client_write(&acting, write, mtime).await {
                    log::warn!("pg {}: client write failed: {}", pg_id, err);
                }
            }
            DispatchItem::Peer(envelope) => self.process_peer_message(pg_id, handle, envelope).await,
        }
    }

    async fn process_peer_message(&self, pg_id: PgId, handle: Arc<PgHandle>, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
            Message::SubOpWrite { epoch, txn, version, request_id, .. } => {
                let reply = {
                    let mut pg = handle.pg.lock().await;
                    pg.apply_sub_op_write(from, epoch, txn, version, request_id, unix_time()).await
                };
                if let Err(err) = self.messenger.send(from, reply).await {
                    log::warn!("pg {}: failed to ack sub-op to {}: {}", pg_id, from, err);
                }
            }
            Message::SubOpAck { version, result, .. } => {
                let pg = handle.pg.lock().await;
                pg.receive_sub_op_ack(version, from, result);
            }
            Message::Ping { stamp, .. } => {
                self.heartbeat.lock().unwrap().note_pong_received(from, Link::Front, unix_time());
                let pong = Envelope {
                    from: self.node_id,
                    sender_epoch: envelope.sender_epoch,
                    message: Message::Pong { partner: self.node_id, stamp },
                };
                if let Err(err) = self.messenger.send(from, pong).await {
                    log::warn!("pg {}: failed to pong {}: {}", pg_id, from, err);
                }
            }
            Message::Pong { .. } => {
                self.heartbeat.lock().unwrap().note_pong_received(from, Link::Back, unix_time());
            }
            other => {
                // Full peering-wire handling (PgQuery/PgNotify/PgLog/Pull/
                // Push/BackfillProgress/MapEpoch*) composes with the
                // cluster-map subscription this crate treats as an external
                // collaborator (spec §6); this worker still drains and logs
                // every one of them so none sits unacknowledged on the
                // queue, rather than silently dropping it.
                log::debug!("pg {}: received {:?} from {}, no further action taken", pg_id, other, from);
            }
        }
    }
}

fn unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::RecordingMessenger;
    use crate::types::{Epoch, ObjectId, RequestId};
    use crate::write_path::ClientWrite;

    fn node() -> Arc<NodeService> {
        NodeService::new(1, &DaemonConfig::default(), Arc::new(RecordingMessenger::new()))
    }

    #[test]
    fn registered_pg_is_retrievable_and_its_handle_upgrades_the_node() {
        let node = node();
        let dir = std::env::temp_dir().join(format!("pgstore-node-test-{}", std::process::id()));
        let pg = Pg::new(PgId::new(1, 0), 1, 1, &dir, node.node_id);
        let handle = node.register_pg(pg);
        assert!(node.get_pg(PgId::new(1, 0)).is_some());
        assert!(handle.node().is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn submit_and_poll_round_trips_through_the_correct_shard() {
        let node = node();
        let pg_id = PgId::new(1, 9);
        let write = ClientWrite {
            pg: pg_id,
            epoch: 1 as Epoch,
            object: ObjectId::new(1, "x", 0),
            request_id: RequestId { client: 1, tid: 1 },
            payload: vec![],
        };
        node.submit(pg_id, OpClass::ClientOp, DispatchItem::ClientWrite(write)).unwrap();
        let shard = crate::scheduler::shard_for(pg_id, node.shard_count());
        let popped = node.poll_shard(shard);
        assert!(popped.is_some());
    }

    #[test]
    fn removing_a_pg_drops_it_from_the_registry() {
        let node = node();
        let dir = std::env::temp_dir().join(format!("pgstore-node-test-2-{}", std::process::id()));
        let pg = Pg::new(PgId::new(1, 1), 1, 1, &dir, node.node_id);
        node.register_pg(pg);
        assert_eq!(node.pg_count(), 1);
        node.remove_pg(PgId::new(1, 1));
        assert_eq!(node.pg_count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
