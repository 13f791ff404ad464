//! The peer wire protocol (spec §6): message kinds and the narrow
//! send/receive contract this crate needs from the (out-of-scope, §1)
//! messenger. Modeled as a trait plus an in-process channel-backed
//! implementation for tests, the way `object_store.rs` models the object
//! store — this crate drives the contract, it does not implement a real
//! network transport.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pg_log::LogEntry;
use crate::pg_info::PgInfo;
use crate::missing::MissingSet;
use crate::object_store::Transaction;
use crate::types::{Epoch, NodeId, ObjectId, PgId, RequestId, Version};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueryKind {
    Info,
    Log,
    Missing,
    FullLog,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SubOpResult {
    Ack,
    Rejected { reason: String },
}

/// Every message kind in spec §6's wire protocol table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    PgQuery { epoch: Epoch, pg: PgId, kind: QueryKind },
    PgNotify { epoch: Epoch, pg: PgId, info: PgInfo },
    PgLog { epoch: Epoch, pg: PgId, entries: Vec<LogEntry>, missing: MissingSet },
    SubOpWrite { epoch: Epoch, pg: PgId, txn: Transaction, version: Version, request_id: RequestId },
    SubOpAck { epoch: Epoch, pg: PgId, version: Version, result: SubOpResult },
    Pull { pg: PgId, object: ObjectId, version: Version },
    Push { pg: PgId, object: ObjectId, version: Version, data: Vec<u8> },
    BackfillProgress { pg: PgId, pointer: ObjectId, pushed: Vec<ObjectId> },
    MapEpochShare { epochs: Vec<Epoch> },
    MapEpochRequest { from: Epoch, to: Epoch },
    Ping { partner: NodeId, stamp: i64 },
    Pong { partner: NodeId, stamp: i64 },
}

/// Every message is tagged with the sender's claimed current epoch (spec
/// §6: "All messages are tagged with the sender's claimed current epoch").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub sender_epoch: Epoch,
    pub message: Message,
}

/// Narrow send contract the PG layer needs from the messenger.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends on the given peer's link. Spec §5 requires per-link ordering:
    /// "messages delivered in send order and applied in that order on the
    /// peer" — the trait leaves ordering to the implementation, as it would
    /// for a real reliable ordered transport.
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), Error>;
}

/// Loopback/test messenger: records every send so a test can assert on
/// what was dispatched without standing up a real network.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<HashMap<NodeId, Vec<Envelope>>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_to(&self, node: NodeId) -> Vec<Envelope> {
        self.sent.lock().unwrap().get(&node).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), Error> {
        self.sent.lock().unwrap().entry(to).or_default().push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_messenger_preserves_send_order_per_peer() {
        let messenger = RecordingMessenger::new();
        for stamp in 0..3 {
            messenger
                .send(7, Envelope { from: 1, sender_epoch: 1, message: Message::Ping { partner: 7, stamp } })
                .await
                .unwrap();
        }
        let sent = messenger.sent_to(7);
        assert_eq!(sent.len(), 3);
        for (i, env) in sent.iter().enumerate() {
            match env.message {
                Message::Ping { stamp, .. } => assert_eq!(stamp, i as i64),
                _ => panic!("unexpected message"),
            }
        }
    }
}
