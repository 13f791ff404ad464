//! `pgstore-admin`: a thin CLI over `pgstored`'s Unix-socket admin channel,
//! mirroring how `proxmox_backup_manager` is a thin CLI over the daemon's
//! own API router (`src/bin/proxmox_backup_manager/datastore.rs`, `sg-tape-cmd.rs`).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Error};
use proxmox::api::{
    api,
    cli::{run_cli_command, CliCommand, CliCommandMap, CliEnvironment},
    schema::StringSchema,
    RpcEnvironment,
};
use serde_json::Value;

const PG_ID_SCHEMA: proxmox::api::schema::Schema =
    StringSchema::new("Placement group id, e.g. '1.3'.").schema();

fn socket_path() -> PathBuf {
    std::env::var_os("PGSTORE_ADMIN_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/run/pgstore/admin.sock"))
}

/// Sends one JSON-encoded admin request and returns the parsed response.
fn call(request: Value) -> Result<Value, Error> {
    let path = socket_path();
    let mut stream = UnixStream::connect(&path)
        .map_err(|err| anyhow::anyhow!("connecting to {:?}: {}", path, err))?;
    let mut line = serde_json::to_vec(&request)?;
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.flush()?;
    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;
    if response_line.is_empty() {
        bail!("no response from pgstored admin socket");
    }
    Ok(serde_json::from_str(&response_line)?)
}

#[api]
/// Lists every PG registered on the local node.
fn list_pgs() -> Result<Value, Error> {
    call(serde_json::json!({ "cmd": "list-pgs" }))
}

#[api(
    input: {
        properties: {
            pg: { schema: PG_ID_SCHEMA },
        },
    },
)]
/// Dumps one PG's persisted info and current peering/missing summary.
fn pg_info(pg: String) -> Result<Value, Error> {
    call(serde_json::json!({ "cmd": "pg-info", "pg": parse_pg(&pg)? }))
}

#[api(
    input: {
        properties: {
            pg: { schema: PG_ID_SCHEMA },
            object: { type: String, description: "Object name to mark lost." },
        },
    },
)]
/// Marks an unrecoverable object lost so peering can proceed past it.
fn mark_lost(pg: String, object: String) -> Result<Value, Error> {
    call(serde_json::json!({ "cmd": "mark-lost", "pg": parse_pg(&pg)?, "object": object }))
}

#[api(
    input: {
        properties: {
            pg: { schema: PG_ID_SCHEMA },
        },
    },
)]
/// Requests an immediate recovery pass for a PG.
fn force_recover(pg: String) -> Result<Value, Error> {
    call(serde_json::json!({ "cmd": "force-recover", "pg": parse_pg(&pg)? }))
}

#[api(
    input: {
        properties: {
            pg: { schema: PG_ID_SCHEMA },
        },
    },
)]
/// Requests an immediate backfill pass for a PG.
fn force_backfill(pg: String) -> Result<Value, Error> {
    call(serde_json::json!({ "cmd": "force-backfill", "pg": parse_pg(&pg)? }))
}

#[api(
    input: {
        properties: {
            level: { type: String, description: "New log level (error/warn/info/debug/trace)." },
        },
    },
)]
/// Changes the daemon's live log level without a restart.
fn set_debug(level: String) -> Result<Value, Error> {
    call(serde_json::json!({ "cmd": "set-debug", "level": level }))
}

/// Parses `pool.seq` (optionally `pool.seq s<shard>`) into the PG id JSON
/// shape the daemon expects; this CLI stays a thin translation layer, never
/// duplicating `types::PgId`'s own parsing rules.
fn parse_pg(raw: &str) -> Result<Value, Error> {
    let (pool_str, rest) = raw
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("expected PG id like '1.3', got {:?}", raw))?;
    let (seq_str, shard) = match rest.split_once('s') {
        Some((seq, shard)) => (seq, shard.parse::<i8>()?),
        None => (rest, -1i8),
    };
    Ok(serde_json::json!({
        "pool": pool_str.parse::<i64>()?,
        "seq": u32::from_str_radix(seq_str, 16)?,
        "shard": shard,
    }))
}

fn main() -> Result<(), Error> {
    let cmd_def = CliCommandMap::new()
        .insert("list-pgs", CliCommand::new(&API_METHOD_LIST_PGS))
        .insert("pg-info", CliCommand::new(&API_METHOD_PG_INFO).arg_param(&["pg"]))
        .insert("mark-lost", CliCommand::new(&API_METHOD_MARK_LOST).arg_param(&["pg", "object"]))
        .insert("force-recover", CliCommand::new(&API_METHOD_FORCE_RECOVER).arg_param(&["pg"]))
        .insert("force-backfill", CliCommand::new(&API_METHOD_FORCE_BACKFILL).arg_param(&["pg"]))
        .insert("set-debug", CliCommand::new(&API_METHOD_SET_DEBUG).arg_param(&["level"]));

    let mut rpcenv = CliEnvironment::new();
    rpcenv.set_auth_id(Some(String::from("root@pam")));

    run_cli_command(cmd_def, rpcenv, None);

    Ok(())
}
