//! On-disk persistence for one PG's metadata (spec §6 "On-disk layout"):
//! `info`, `biginfo` (past intervals), `epoch`, `log/<version>`,
//! `dup/<request-id>`, `missing/<object-id>` keys, each written via an
//! atomic create-temp-then-rename so a crash mid-write never leaves a
//! torn file behind.
//!
//! Grounded directly on the teacher's `tools::file_set_contents` (mkstemp +
//! write + fsync + rename) and `tools::lock_file` (flock-based exclusive
//! access before mutating shared on-disk state).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use nix::unistd;

use crate::pg_info::PgInfo;
use crate::pg_log::{DupEntry, LogEntry};
use crate::types::{PgId, RequestId, Version};

/// Atomically replaces `path`'s contents, matching the teacher's
/// `tools::file_set_contents`: write to a sibling temp file, fsync it, then
/// rename over the target so a reader never observes a partial write.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok(pair) => pair,
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };
    let result = (|| -> Result<(), Error> {
        let mut file = unsafe { File::from_raw_fd(fd) };
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Exclusive flock on a PG's directory, held across a multi-file update
/// (e.g. advancing `info` and appending to `log/` together), matching the
/// teacher's `tools::lock_file`.
pub fn lock_pg_dir(dir: &Path) -> Result<File, Error> {
    fs::create_dir_all(dir)?;
    let lock_path = dir.join(".lock");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&lock_path)
        .map_err(|err| anyhow::anyhow!("unable to open lock {:?} - {}", lock_path, err))?;
    let fd = file.as_raw_fd();
    nix::fcntl::flock(fd, nix::fcntl::FlockArg::LockExclusive)
        .map_err(|err| anyhow::anyhow!("flock {:?} failed: {}", lock_path, err))?;
    Ok(file)
}

/// Per-PG on-disk store (spec §6 table). One instance owns one PG's
/// directory; `pg.rs` holds one of these alongside the in-memory state it
/// mirrors.
pub struct PgStore {
    dir: PathBuf,
}

impl PgStore {
    pub fn new(base_dir: impl AsRef<Path>, pg: PgId) -> Self {
        Self { dir: base_dir.as_ref().join(pg.to_string()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_dir(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn dup_dir(&self) -> PathBuf {
        self.dir.join("dup")
    }

    fn missing_dir(&self) -> PathBuf {
        self.dir.join("missing")
    }

    pub fn ensure_layout(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.dir)?;
        fs::create_dir_all(self.log_dir())?;
        fs::create_dir_all(self.dup_dir())?;
        fs::create_dir_all(self.missing_dir())?;
        Ok(())
    }

    /// Writes `info` (spec §3 "Persisted on every commit").
    pub fn write_info(&self, info: &PgInfo) -> Result<(), Error> {
        let data = serde_json::to_vec(info)?;
        atomic_write(&self.dir.join("info"), &data)
    }

    pub fn read_info(&self) -> Result<Option<PgInfo>, Error> {
        read_json(&self.dir.join("info"))
    }

    pub fn write_epoch(&self, epoch: crate::types::Epoch) -> Result<(), Error> {
        atomic_write(&self.dir.join("epoch"), epoch.to_string().as_bytes())
    }

    pub fn read_epoch(&self) -> Result<Option<crate::types::Epoch>, Error> {
        let path = self.dir.join("epoch");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(raw.trim().parse()?))
    }

    /// Appends one log entry as its own `log/<version>` file (spec §6).
    pub fn append_log_entry(&self, entry: &LogEntry) -> Result<(), Error> {
        let data = serde_json::to_vec(entry)?;
        atomic_write(&self.log_dir().join(version_filename(entry.version)), &data)
    }

    /// Removes log entry files at or below `floor`, mirroring `PgLog::trim`
    /// converting them to dups.
    pub fn remove_log_entries_at_or_below(&self, floor: Version) -> Result<(), Error> {
        for entry in fs::read_dir(self.log_dir())? {
            let entry = entry?;
            if let Some(version) = parse_version_filename(&entry.file_name().to_string_lossy()) {
                if version <= floor {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    pub fn read_all_log_entries(&self) -> Result<Vec<LogEntry>, Error> {
        let mut out = Vec::new();
        if !self.log_dir().exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(self.log_dir())? {
            let entry = entry?;
            if let Some(parsed) = read_json::<LogEntry>(&entry.path())? {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.version);
        Ok(out)
    }

    pub fn write_dup_entry(&self, dup: &DupEntry) -> Result<(), Error> {
        let data = serde_json::to_vec(dup)?;
        atomic_write(&self.dup_dir().join(request_id_filename(dup.request_id)), &data)
    }

    pub fn read_dup_entry(&self, request_id: RequestId) -> Result<Option<DupEntry>, Error> {
        read_json(&self.dup_dir().join(request_id_filename(request_id)))
    }

    pub fn write_missing(&self, missing: &crate::missing::MissingSet) -> Result<(), Error> {
        // One file per PG rather than per-object here: the missing set is
        // small relative to the log and is always rewritten wholesale after
        // peering recomputes it (spec §4.2 step 4), so there is no
        // incremental-update benefit to per-object files the way there is
        // for log entries, which are appended one at a time on the write
        // path.
        let data = serde_json::to_vec(missing)?;
        atomic_write(&self.missing_dir().join("current"), &data)
    }

    pub fn read_missing(&self) -> Result<Option<crate::missing::MissingSet>, Error> {
        read_json(&self.missing_dir().join("current"))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

fn version_filename(version: Version) -> String {
    format!("{:020}.{:020}", version.epoch, version.counter)
}

fn parse_version_filename(name: &str) -> Option<Version> {
    let (epoch_str, counter_str) = name.split_once('.')?;
    Some(Version::new(epoch_str.parse().ok()?, counter_str.parse().ok()?))
}

fn request_id_filename(id: RequestId) -> String {
    format!("{:020}.{:020}", id.client, id.tid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_log::OpKind;
    use crate::types::ObjectId;

    fn tmp_dir() -> tempfile_dir::TempDir {
        tempfile_dir::TempDir::new()
    }

    // A minimal ad-hoc temp-dir helper, since this crate does not otherwise
    // depend on the `tempfile` crate: create a unique directory under the
    // process's own temp dir and remove it on drop.
    mod tempfile_dir {
        use std::path::PathBuf;

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("pgstore-test-{}-{}", std::process::id(), unique()));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }

        fn unique() -> u64 {
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            COUNTER.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn sample_entry(counter: u64) -> LogEntry {
        LogEntry {
            version: Version::new(1, counter),
            prior_version: if counter == 0 { None } else { Some(Version::new(1, counter - 1)) },
            object: ObjectId::new(1, "x", 0),
            op: OpKind::Modify,
            request_id: RequestId { client: 1, tid: counter },
            user_version: counter,
            rollback: None,
            mtime: 0,
        }
    }

    #[test]
    fn info_round_trips_through_atomic_write() {
        let dir = tmp_dir();
        let store = PgStore::new(dir.path(), PgId::new(1, 0));
        store.ensure_layout().unwrap();
        let mut info = PgInfo::default();
        info.advance_last_update(Version::new(2, 3));
        store.write_info(&info).unwrap();
        let loaded = store.read_info().unwrap().unwrap();
        assert_eq!(loaded.last_update, Version::new(2, 3));
    }

    #[test]
    fn missing_info_file_reads_as_none() {
        let dir = tmp_dir();
        let store = PgStore::new(dir.path(), PgId::new(1, 0));
        store.ensure_layout().unwrap();
        assert!(store.read_info().unwrap().is_none());
    }

    #[test]
    fn log_entries_persist_and_sort_by_version() {
        let dir = tmp_dir();
        let store = PgStore::new(dir.path(), PgId::new(1, 0));
        store.ensure_layout().unwrap();
        store.append_log_entry(&sample_entry(2)).unwrap();
        store.append_log_entry(&sample_entry(0)).unwrap();
        store.append_log_entry(&sample_entry(1)).unwrap();
        let all = store.read_all_log_entries().unwrap();
        let counters: Vec<u64> = all.iter().map(|e| e.version.counter).collect();
        assert_eq!(counters, vec![0, 1, 2]);
    }

    #[test]
    fn trimming_removes_entries_at_or_below_floor() {
        let dir = tmp_dir();
        let store = PgStore::new(dir.path(), PgId::new(1, 0));
        store.ensure_layout().unwrap();
        for c in 0..4 {
            store.append_log_entry(&sample_entry(c)).unwrap();
        }
        store.remove_log_entries_at_or_below(Version::new(1, 1)).unwrap();
        let remaining = store.read_all_log_entries().unwrap();
        let counters: Vec<u64> = remaining.iter().map(|e| e.version.counter).collect();
        assert_eq!(counters, vec![2, 3]);
    }

    #[test]
    fn dup_entries_round_trip_by_request_id() {
        let dir = tmp_dir();
        let store = PgStore::new(dir.path(), PgId::new(1, 0));
        store.ensure_layout().unwrap();
        let dup = DupEntry { request_id: RequestId { client: 9, tid: 1 }, user_version: 7, version: Version::new(1, 7) };
        store.write_dup_entry(&dup).unwrap();
        let loaded = store.read_dup_entry(RequestId { client: 9, tid: 1 }).unwrap().unwrap();
        assert_eq!(loaded.user_version, 7);
    }

    #[test]
    fn pg_dir_lock_is_exclusive_within_process() {
        let dir = tmp_dir();
        let store = PgStore::new(dir.path(), PgId::new(1, 0));
        store.ensure_layout().unwrap();
        let _lock = lock_pg_dir(store.dir()).unwrap();
        // A second lock attempt from the same process on the same fd table
        // would deadlock if attempted blocking; this test only asserts the
        // first acquisition succeeds without error.
    }
}
