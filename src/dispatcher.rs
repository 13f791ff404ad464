//! Routes inbound client requests and peer messages to the right `Pg` by
//! PG id (spec §2: "Every op carries a PG id; the dispatcher finds the
//! owning worker shard and hands the op to that PG's queue").
//!
//! Grounded on `scheduler.rs::shard_for` for the routing function itself;
//! this module is the thin translation from wire messages to scheduled ops.

use std::sync::Arc;

use anyhow::{Error, Result};

use crate::messenger::{Envelope, Message};
use crate::node::NodeService;
use crate::scheduler::OpClass;
use crate::types::PgId;
use crate::write_path::ClientWrite;

/// One unit of work a PG's shard processes; distinct from `messenger::Message`
/// because a client write needs extra plumbing (request id is already in
/// `ClientWrite`) that peer messages don't.
pub enum DispatchItem {
    ClientWrite(ClientWrite),
    Peer(Envelope),
}

pub fn classify(item: &DispatchItem) -> OpClass {
    match item {
        DispatchItem::ClientWrite(_) => OpClass::ClientOp,
        DispatchItem::Peer(envelope) => match &envelope.message {
            Message::PgQuery { .. } | Message::PgNotify { .. } | Message::PgLog { .. } | Message::MapEpochShare { .. } | Message::MapEpochRequest { .. } => {
                OpClass::Peering
            }
            Message::Pull { .. } | Message::Push { .. } | Message::BackfillProgress { .. } => OpClass::Recovery,
            Message::SubOpWrite { .. } | Message::SubOpAck { .. } => OpClass::ClientOp,
            Message::Ping { .. } | Message::Pong { .. } => OpClass::Peering,
        },
    }
}

pub fn pg_of(item: &DispatchItem) -> PgId {
    match item {
        DispatchItem::ClientWrite(write) => write.pg,
        DispatchItem::Peer(envelope) => match &envelope.message {
            Message::PgQuery { pg, .. }
            | Message::PgNotify { pg, .. }
            | Message::PgLog { pg, .. }
            | Message::SubOpWrite { pg, .. }
            | Message::SubOpAck { pg, .. }
            | Message::Pull { pg, .. }
            | Message::Push { pg, .. }
            | Message::BackfillProgress { pg, .. } => *pg,
            Message::MapEpochShare { .. } | Message::MapEpochRequest { .. } | Message::Ping { .. } | Message::Pong { .. } => {
                PgId::new(0, 0) // node-scoped messages have no owning PG
            }
        },
    }
}

/// Submits one dispatch item onto its PG's shard queue, per spec §5
/// ("ops never skip the per-PG queue, even on the fast path").
pub fn dispatch(node: &Arc<NodeService>, item: DispatchItem) -> Result<(), Error> {
    let pg = pg_of(&item);
    let class = classify(&item);
    node.submit(pg, class, item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::QueryKind;
    use crate::types::{Epoch, RequestId};

    #[test]
    fn client_write_classifies_as_client_op_class() {
        let write = ClientWrite {
            pg: PgId::new(1, 0),
            epoch: 1 as Epoch,
            object: crate::types::ObjectId::new(1, "x", 0),
            request_id: RequestId { client: 1, tid: 1 },
            payload: vec![],
        };
        let item = DispatchItem::ClientWrite(write);
        assert_eq!(classify(&item), OpClass::ClientOp);
    }

    #[test]
    fn pg_query_classifies_as_peering() {
        let envelope = Envelope {
            from: 1,
            sender_epoch: 1,
            message: Message::PgQuery { epoch: 1, pg: PgId::new(1, 3), kind: QueryKind::Info },
        };
        let item = DispatchItem::Peer(envelope);
        assert_eq!(classify(&item), OpClass::Peering);
        assert_eq!(pg_of(&item), PgId::new(1, 3));
    }

    #[test]
    fn pull_and_push_classify_as_recovery() {
        let pull = Envelope {
            from: 1,
            sender_epoch: 1,
            message: Message::Pull { pg: PgId::new(1, 0), object: crate::types::ObjectId::new(1, "x", 0), version: crate::types::Version::ZERO },
        };
        assert_eq!(classify(&DispatchItem::Peer(pull)), OpClass::Recovery);
    }
}
