//! The write path (spec §4.4): a client mutation becomes a durable,
//! totally-ordered update on every acting member before the primary acks.
//!
//! Grounded on the teacher's `client/pull.rs` for the "fan out, collect
//! results, only then declare success" shape (`pull_index_chunks`'s
//! `try_buffer_unordered` loop is the closest async-fan-out analogue in the
//! teacher repo, though here acks must be gathered from *every* member, not
//! raced) and on `tools.rs::lock_file` for "acquire before mutate, release
//! after durable" discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Error, Result};
use tokio::sync::Notify;

use crate::backend::PgBackend;
use crate::error::PgError;
use crate::messenger::{Envelope, Message, Messenger, SubOpResult};
use crate::object_ctx::ObjectContextCache;
use crate::object_store::{ObjectStore, Transaction};
use crate::pg_log::{LogEntry, OpKind, PgLog};
use crate::types::{ActingSet, Epoch, NodeId, ObjectId, PgId, RequestId, Version};

/// A client write request (spec §4.4 step 1: "carrying PG id and an epoch").
pub struct ClientWrite {
    pub pg: PgId,
    pub epoch: Epoch,
    pub object: ObjectId,
    pub request_id: RequestId,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed { version: Version, user_version: u64 },
    Replayed { user_version: u64 },
}

/// Allocates monotonically increasing (epoch, counter) pairs for one PG.
/// The epoch resets the counter's scope conceptually, but per spec §3 the
/// counter itself only needs to be monotonic *within* an epoch at the
/// primary that is currently assigning it; a fresh primary starts a new
/// epoch at counter 0.
pub struct VersionAllocator {
    epoch: Epoch,
    counter: AtomicU64,
}

impl VersionAllocator {
    pub fn new(epoch: Epoch) -> Self {
        Self { epoch, counter: AtomicU64::new(0) }
    }

    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        self.counter.store(0, Ordering::SeqCst);
    }

    pub fn next(&self) -> Version {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(self.epoch, counter)
    }
}

/// One in-flight write's ack bookkeeping plus the `Notify` that wakes the
/// coordinator's waiting task every time a new ack arrives (spec §5: the
/// wait must suspend the task, not block a worker thread).
struct AckWaiter {
    tracker: Mutex<AckTracker>,
    notify: Notify,
}

/// Coordinates one PG's write path on its primary (spec §4.4).
pub struct WriteCoordinator {
    pub pg: PgId,
    pub backend: Arc<dyn PgBackend>,
    pub messenger: Arc<dyn Messenger>,
    pub store: Arc<dyn ObjectStore>,
    pub contexts: Arc<ObjectContextCache>,
    pub versions: VersionAllocator,
    pending: Mutex<HashMap<Version, Arc<AckWaiter>>>,
}

impl WriteCoordinator {
    pub fn new(
        pg: PgId,
        backend: Arc<dyn PgBackend>,
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn ObjectStore>,
        epoch: Epoch,
    ) -> Self {
        Self {
            pg,
            backend,
            messenger,
            store,
            contexts: Arc::new(ObjectContextCache::new()),
            versions: VersionAllocator::new(epoch),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Records a sub-op ack (or rejection) arriving from a peer, and wakes
    /// whichever task is waiting on that version's commit (spec §4.4 step
    /// 8). A no-op if the write already finished (late/duplicate ack).
    pub fn record_ack(&self, version: Version, node: NodeId, result: SubOpResult) {
        let waiter = match self.pending.lock().unwrap().get(&version).cloned() {
            Some(waiter) => waiter,
            None => return,
        };
        if let SubOpResult::Rejected { ref reason } = result {
            crate::pg_log_warn!(self.pg, self.versions_epoch(), "sub-op on node {} rejected for version {}: {}", node, version, reason);
        }
        waiter.tracker.lock().unwrap().ack(node, &result);
        waiter.notify.notify_waiters();
    }

    /// Drops a member from an in-flight write's ack requirement (spec §4.4
    /// "Map change mid-write"): either it left the acting set before acking,
    /// or the acting set shrank out from under it.
    pub fn drop_ack_requirement(&self, version: Version, node: NodeId) {
        if let Some(waiter) = self.pending.lock().unwrap().get(&version).cloned() {
            waiter.tracker.lock().unwrap().drop_requirement(node);
            waiter.notify.notify_waiters();
        }
    }

    /// Executes the write path steps 1-9 against an already-active PG. The
    /// caller (the peering/dispatch layer) is responsible for step 1's
    /// epoch/active check before invoking this — `write_path.rs` assumes it
    /// is only called once the PG is confirmed active at `write.epoch`.
    pub async fn handle_write(
        &self,
        log: &mut PgLog,
        acting: &ActingSet,
        write: ClientWrite,
        last_update_of: &mut HashMap<ObjectId, Version>,
        mtime: i64,
    ) -> Result<WriteOutcome, Error> {
        // Step 3: duplicate detection happens before acquiring the lock so
        // a retried request never re-contends for it.
        if let Some(user_version) = log.find_request(write.request_id) {
            return Ok(WriteOutcome::Replayed { user_version });
        }

        // Step 2: FIFO write-lock acquisition preserves client-observed
        // per-object ordering (spec §4.4, §5).
        let ctx = self.contexts.get_or_create(&write.object);
        let _guard = ctx.write_lock.lock().await;

        // Re-check for the duplicate after acquiring the lock: a
        // concurrent identical retry could have raced us to the log.
        if let Some(user_version) = log.find_request(write.request_id) {
            return Ok(WriteOutcome::Replayed { user_version });
        }

        // Step 4: allocate version, build the entry + transaction.
        let version = self.versions.next();
        let prior_version = last_update_of.get(&write.object).copied();
        let user_version = version.counter;

        let mut txn = Transaction::new();
        txn.push(crate::object_store::TxnOp::Write {
            object: write.object.clone(),
            offset: 0,
            data: write.payload.clone(),
        });

        let entry = LogEntry {
            version,
            prior_version,
            object: write.object.clone(),
            op: OpKind::Modify,
            request_id: write.request_id,
            user_version,
            rollback: None,
            mtime,
        };

        // Step 5: register this write's ack tracker *before* dispatching any
        // sub-op, so a reply that races ahead of our own bookkeeping can
        // never be dropped on the floor (spec §4.4 step 8).
        let waiter = Arc::new(AckWaiter {
            tracker: Mutex::new(AckTracker::new(version, acting.iter().copied())),
            notify: Notify::new(),
        });
        self.pending.lock().unwrap().insert(version, waiter.clone());

        let sharded = self.backend.shard_transaction(acting, &txn);
        for shard in &sharded {
            if shard.target == acting[0] {
                continue; // primary applies its own transaction directly below
            }
            self.messenger
                .send(
                    shard.target,
                    Envelope {
                        from: acting[0],
                        sender_epoch: self.versions_epoch(),
                        message: Message::SubOpWrite {
                            epoch: self.versions_epoch(),
                            pg: self.pg,
                            txn: shard.txn.clone(),
                            version,
                            request_id: write.request_id,
                        },
                    },
                )
                .await?;
        }

        // Step 6: primary submits its own transaction to the object store,
        // then acks itself the same way a replica's `SubOpAck` would.
        if let Err(err) = self.store.submit(txn).await {
            self.pending.lock().unwrap().remove(&version);
            return Err(anyhow::Error::new(PgError::ObjectStoreIo {
                pg: self.pg,
                message: err.to_string(),
            }));
        }
        self.record_ack(version, acting[0], SubOpResult::Ack);

        // Step 7/8: suspend until every acting member (including this one)
        // has acked durability — never ack the client before then (spec
        // §4.4 step 8, §3's core durability invariant). `record_ack` is fed
        // by the node's worker loop as `SubOpAck` envelopes arrive
        // (`node.rs`/`dispatcher.rs`); this only suspends the task, per spec
        // §5's "no blocked OS threads" requirement.
        loop {
            let notified = waiter.notify.notified();
            if waiter.tracker.lock().unwrap().is_committed() {
                break;
            }
            notified.await;
        }
        self.pending.lock().unwrap().remove(&version);

        log.append(entry);
        last_update_of.insert(write.object.clone(), version);

        Ok(WriteOutcome::Committed { version, user_version })
    }

    fn versions_epoch(&self) -> Epoch {
        self.versions.epoch
    }
}

/// Tracks outstanding sub-op acks for one in-flight write so the primary
/// knows when *every* acting member (including itself) is durable (spec
/// §4.4 step 8). Membership can shrink mid-write if the acting set
/// degrades (spec §4.4 "Map change mid-write").
pub struct AckTracker {
    version: Version,
    required: std::collections::HashSet<NodeId>,
    acked: std::collections::HashSet<NodeId>,
}

impl AckTracker {
    pub fn new(version: Version, required: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            version,
            required: required.into_iter().collect(),
            acked: std::collections::HashSet::new(),
        }
    }

    pub fn ack(&mut self, node: NodeId, result: &SubOpResult) {
        if matches!(result, SubOpResult::Ack) {
            self.acked.insert(node);
        }
    }

    /// Drops a member from the required set: either it left the acting set
    /// before acking (spec: "its ack is no longer required"), or it joined
    /// after the write started (spec: "the write completes without it").
    pub fn drop_requirement(&mut self, node: NodeId) {
        self.required.remove(&node);
        self.acked.remove(&node);
    }

    pub fn is_committed(&self) -> bool {
        self.required.is_subset(&self.acked)
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReplicatedBackend;
    use crate::messenger::RecordingMessenger;
    use crate::object_store::MemObjectStore;

    fn coordinator(pg: PgId, epoch: Epoch) -> WriteCoordinator {
        WriteCoordinator::new(
            pg,
            Arc::new(ReplicatedBackend),
            Arc::new(RecordingMessenger::new()),
            Arc::new(MemObjectStore::new()),
            epoch,
        )
    }

    #[tokio::test]
    async fn write_commits_and_appends_log_entry() {
        let pg = PgId::new(1, 0);
        let coord = coordinator(pg, 4);
        let mut log = PgLog::new(100, 100);
        let mut last_update = HashMap::new();
        let write = ClientWrite {
            pg,
            epoch: 4,
            object: ObjectId::new(1, "x", 0),
            request_id: RequestId { client: 1, tid: 1 },
            payload: b"hello".to_vec(),
        };
        let outcome = coord
            .handle_write(&mut log, &vec![10, 20, 30], write, &mut last_update, 0)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Committed { version, .. } if version.epoch == 4));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_request_id_is_replayed_not_reexecuted() {
        let pg = PgId::new(1, 0);
        let coord = coordinator(pg, 4);
        let mut log = PgLog::new(100, 100);
        let mut last_update = HashMap::new();
        let rid = RequestId { client: 1, tid: 1 };
        let write1 = ClientWrite {
            pg,
            epoch: 4,
            object: ObjectId::new(1, "x", 0),
            request_id: rid,
            payload: b"hello".to_vec(),
        };
        coord.handle_write(&mut log, &vec![10, 20, 30], write1, &mut last_update, 0).await.unwrap();
        assert_eq!(log.len(), 1);

        let write2 = ClientWrite {
            pg,
            epoch: 4,
            object: ObjectId::new(1, "x", 0),
            request_id: rid,
            payload: b"should-not-apply".to_vec(),
        };
        let outcome = coord.handle_write(&mut log, &vec![10, 20, 30], write2, &mut last_update, 0).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Replayed { .. }));
        assert_eq!(log.len(), 1); // no second entry
    }

    #[test]
    fn ack_tracker_commits_only_once_every_required_member_acks() {
        let mut tracker = AckTracker::new(Version::new(1, 1), [10, 20, 30]);
        assert!(!tracker.is_committed());
        tracker.ack(10, &SubOpResult::Ack);
        tracker.ack(20, &SubOpResult::Ack);
        assert!(!tracker.is_committed());
        tracker.ack(30, &SubOpResult::Ack);
        assert!(tracker.is_committed());
    }

    #[test]
    fn ack_tracker_commits_with_acting_set_of_one() {
        let mut tracker = AckTracker::new(Version::new(1, 1), [10]);
        tracker.ack(10, &SubOpResult::Ack);
        assert!(tracker.is_committed());
    }

    #[test]
    fn dropping_requirement_for_unacked_member_allows_commit() {
        let mut tracker = AckTracker::new(Version::new(1, 1), [10, 20]);
        tracker.ack(10, &SubOpResult::Ack);
        tracker.drop_requirement(20); // degraded out before acking
        assert!(tracker.is_committed());
    }
}
