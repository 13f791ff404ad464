//! `pgstored`: the placement-group storage daemon entrypoint. Parses flags,
//! loads configuration, constructs the `NodeService`, starts the admin
//! socket, and runs until a signal requests a clean drain — mirroring the
//! teacher's pattern of a thin `main` delegating to library code.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use pgstore::config;
use pgstore::messenger::RecordingMessenger;
use pgstore::node::NodeService;

fn parse_node_id() -> Result<pgstore::types::NodeId, Error> {
    match std::env::var("PGSTORE_NODE_ID") {
        Ok(raw) => raw.parse().context("PGSTORE_NODE_ID must be a valid node id"),
        Err(_) => Ok(0),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Error> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);
    let daemon_config = config::load(config_path.as_deref())
        .context("loading daemon configuration")?;

    let node_id = parse_node_id()?;
    log::info!("starting pgstored on node {}", node_id);

    // The wire transport is an out-of-scope external collaborator (spec §1),
    // so this crate carries only the in-process `RecordingMessenger` it also
    // uses in tests — the same posture `object_store.rs` takes towards
    // `MemObjectStore` for the (also out-of-scope) object store.
    let messenger = Arc::new(RecordingMessenger::new());
    let node = NodeService::new(node_id, &daemon_config, messenger);

    let workers = node.spawn_workers();
    log::info!("pgstored ready, node has {} PG(s) registered, {} worker shard(s) running", node.pg_count(), workers.len());

    let admin_socket = daemon_config.static_.admin_socket_path.clone();
    let admin_node = node.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(err) = pgstore::admin::serve(admin_node, &admin_socket).await {
            log::error!("admin socket server exited: {}", err);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    log::info!("shutdown requested, draining");

    admin_task.abort();
    for worker in workers {
        worker.abort();
    }
    Ok(())
}
