//! Per-server catalog store: the on-disk truth about backups and WAL files.
//!
//! Layout rooted at the server's backup directory:
//!
//! ```text
//! base/<backup_id>/        backup directory, holds backup.info + data
//! wals/<prefix>/<name>     WAL archive, sharded by the first 16 hex digits
//! wals/xlog.db             append-only index, one line per archived file
//! streaming/               landing area for the streaming receiver
//! incoming/                landing area for archive_command deliveries
//! errors/                  rejected or duplicated files
//! meta/                    status files and lock files
//! ```
//!
//! Every write is either a fresh file published by rename, or an append to
//! xlog.db under the archive lock. A crash leaves either the old state or a
//! `*.tmp` / trash residue that maintenance sweeps away.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use utils::crashsafe;

use crate::backup_info::{BackupInfo, BackupStatus, BackupType, KeepTarget};
use crate::compression::CompressionAlg;
use crate::config::ServerConfig;
use crate::error::BarmanError;
use crate::xlog;

/// Hidden prefix a backup directory is renamed to before removal, so that a
/// crash mid-delete is detectable and completable.
const TRASH_PREFIX: &str = ".delete.";

pub const BACKUP_INFO_FILE: &str = "backup.info";

/// Lock file names, all under `meta/`. The scopes match the coordination
/// contract: no two processes may hold overlapping scopes on one server.
pub const SERVER_LOCK: &str = "server.lock";
pub const BACKUP_LOCK: &str = "backup.lock";
pub const ARCHIVE_LOCK: &str = "archive.lock";
pub const RECEIVER_LOCK: &str = "receive-wal.lock";

/// Per-server status files under `meta/`.
pub const META_LAST_ARCHIVED: &str = "last-archived-wal";
pub const META_CRON_HEARTBEAT: &str = "cron-heartbeat";
pub const META_RECEIVER_PID: &str = "receive-wal.pid";

/// One line of the `xlog.db` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlogDbEntry {
    pub name: String,
    pub size: u64,
    pub time: u64,
    pub compression: Option<String>,
}

impl XlogDbEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\n",
            self.name,
            self.size,
            self.time,
            self.compression.as_deref().unwrap_or("None")
        )
    }

    pub fn parse_line(line: &str) -> anyhow::Result<XlogDbEntry> {
        let mut parts = line.trim_end_matches('\n').split('\t');
        let (name, size, time, compression) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(n), Some(s), Some(t), Some(c), None) => (n, s, t, c),
            _ => {
                return Err(
                    BarmanError::Catalog(format!("malformed xlog.db line: {line:?}")).into(),
                )
            }
        };
        Ok(XlogDbEntry {
            name: name.to_string(),
            size: size
                .parse()
                .map_err(|_| BarmanError::Catalog(format!("bad size in xlog.db line {line:?}")))?,
            time: time
                .parse()
                .map_err(|_| BarmanError::Catalog(format!("bad time in xlog.db line {line:?}")))?,
            compression: (compression != "None").then(|| compression.to_string()),
        })
    }
}

/// Outcome of an idempotent WAL store attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordWalOutcome {
    Stored,
    /// Identical content already archived; the late arrival was dropped.
    Duplicate,
}

/// Filter for backup listings.
#[derive(Debug, Default, Clone)]
pub struct BackupFilter {
    pub status: Option<BackupStatus>,
    pub backup_type: Option<BackupType>,
    pub keep: Option<KeepTarget>,
}

impl BackupFilter {
    fn matches(&self, info: &BackupInfo) -> bool {
        self.status.map_or(true, |s| info.status == s)
            && self.backup_type.map_or(true, |t| info.backup_type == t)
            && self.keep.map_or(true, |k| info.keep == Some(k))
    }
}

pub struct Catalog<'a> {
    pub server: &'a ServerConfig,
}

impl<'a> Catalog<'a> {
    pub fn new(server: &'a ServerConfig) -> Self {
        Catalog { server }
    }

    /// Create the whole directory tree for a server. Idempotent.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            &self.server.backup_directory,
            &self.server.basebackups_directory,
            &self.server.wals_directory,
            &self.server.incoming_wals_directory,
            &self.server.streaming_wals_directory,
            &self.server.errors_directory,
            &self.server.meta_directory,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
        }
        Ok(())
    }

    pub fn lock_path(&self, lock_name: &str) -> Utf8PathBuf {
        self.server.meta_directory.join(lock_name)
    }

    /// Take one of the per-server advisory locks, or fail with
    /// [`BarmanError::LockBusy`] so callers exit with the contention status.
    pub fn try_lock(&self, lock_name: &str) -> anyhow::Result<utils::lock_file::LockFileGuard> {
        fs::create_dir_all(&self.server.meta_directory)?;
        match utils::lock_file::create_exclusive(&self.lock_path(lock_name))? {
            utils::lock_file::LockAcquireResult::Acquired(guard) => Ok(guard),
            utils::lock_file::LockAcquireResult::AlreadyLocked { holder_pid } => {
                Err(BarmanError::LockBusy {
                    lock_name: lock_name.to_string(),
                    holder_pid,
                }
                .into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    pub fn backup_dir(&self, backup_id: &str) -> Utf8PathBuf {
        self.server.basebackups_directory.join(backup_id)
    }

    pub fn backup_info_path(&self, backup_id: &str) -> Utf8PathBuf {
        self.backup_dir(backup_id).join(BACKUP_INFO_FILE)
    }

    /// Create an EMPTY placeholder directory for a new backup id.
    pub fn create_backup_dir(&self, backup_id: &str) -> anyhow::Result<Utf8PathBuf> {
        let dir = self.backup_dir(backup_id);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(BarmanError::Catalog(
                format!("backup id '{backup_id}' already exists"),
            )
            .into()),
            Err(e) => Err(e).with_context(|| format!("failed to create {dir:?}")),
        }
    }

    /// Atomically publish backup metadata; readers see old or new content.
    pub fn write_backup_info(&self, info: &BackupInfo) -> anyhow::Result<()> {
        let path = self.backup_info_path(&info.backup_id);
        crashsafe::overwrite_file(&path, info.to_file_content().as_bytes())
            .with_context(|| format!("failed to write {path:?}"))
    }

    pub fn load_backup_info(&self, backup_id: &str) -> anyhow::Result<BackupInfo> {
        let path = self.backup_info_path(backup_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {path:?}"))?;
        BackupInfo::from_file_content(&content)
            .with_context(|| format!("corrupt backup.info at {path:?}"))
    }

    /// All backups matching the filter, ordered by id ascending (which is
    /// creation order, ids being timestamps).
    ///
    /// Entries with unreadable metadata are skipped with a warning; `check`
    /// reports them through [`Catalog::corrupt_backups`].
    pub fn list_backups(&self, filter: &BackupFilter) -> anyhow::Result<Vec<BackupInfo>> {
        let mut result = Vec::new();
        for id in self.backup_ids()? {
            match self.load_backup_info(&id) {
                Ok(info) => {
                    if filter.matches(&info) {
                        result.push(info);
                    }
                }
                Err(e) => warn!("skipping backup '{id}': {e:#}"),
            }
        }
        Ok(result)
    }

    /// Ids of all backup directories, ascending, trash and temp excluded.
    pub fn backup_ids(&self) -> anyhow::Result<Vec<String>> {
        let base = &self.server.basebackups_directory;
        let mut ids = Vec::new();
        let entries = match base.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).with_context(|| format!("failed to list {base:?}")),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.starts_with(TRASH_PREFIX) || crashsafe::is_temporary(entry.path()) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Backup ids whose metadata cannot be parsed.
    pub fn corrupt_backups(&self) -> anyhow::Result<Vec<String>> {
        let mut bad = Vec::new();
        for id in self.backup_ids()? {
            if self.load_backup_info(&id).is_err() {
                bad.push(id);
            }
        }
        Ok(bad)
    }

    /// Resolve the id shortcuts accepted by every backup-addressing
    /// command. Anything that is not a shortcut is returned as-is after an
    /// existence check.
    pub fn resolve_backup_id(&self, spec: &str) -> anyhow::Result<String> {
        let done = || -> anyhow::Result<Vec<BackupInfo>> {
            self.list_backups(&BackupFilter {
                status: Some(BackupStatus::Done),
                ..Default::default()
            })
        };
        let pick = |choice: Option<BackupInfo>, what: &str| -> anyhow::Result<String> {
            choice
                .map(|info| info.backup_id)
                .ok_or_else(|| BarmanError::Catalog(format!("no {what} backup found")).into())
        };
        match spec {
            "first" | "oldest" => pick(done()?.into_iter().next(), "DONE"),
            "last" | "latest" => pick(done()?.into_iter().next_back(), "DONE"),
            "last-full" | "latest-full" => pick(
                done()?
                    .into_iter()
                    .filter(|info| info.backup_type == BackupType::Full)
                    .next_back(),
                "full DONE",
            ),
            "last-failed" => pick(
                self.list_backups(&BackupFilter {
                    status: Some(BackupStatus::Failed),
                    ..Default::default()
                })?
                .into_iter()
                .next_back(),
                "FAILED",
            ),
            id => {
                if self.backup_dir(id).is_dir() {
                    Ok(id.to_string())
                } else {
                    Err(BarmanError::Catalog(format!("unknown backup '{id}'")).into())
                }
            }
        }
    }

    /// Direct incremental children of a backup, regardless of status.
    pub fn backup_children(&self, backup_id: &str) -> anyhow::Result<Vec<String>> {
        let mut children = Vec::new();
        for info in self.list_backups(&BackupFilter::default())? {
            if info.parent_backup_id.as_deref() == Some(backup_id) {
                children.push(info.backup_id);
            }
        }
        Ok(children)
    }

    /// Remove a backup directory. Refuses while descendant incrementals
    /// remain; does not reclaim WAL (retention does that).
    ///
    /// Deletion is a rename to a hidden trash name followed by removal, so a
    /// crash in between leaves a trash entry that the next maintenance sweep
    /// completes.
    pub fn delete_backup(&self, backup_id: &str) -> anyhow::Result<()> {
        let children = self.backup_children(backup_id)?;
        if !children.is_empty() {
            return Err(BarmanError::RetentionViolation(format!(
                "backup '{backup_id}' still has incremental children: {children:?}"
            ))
            .into());
        }
        let dir = self.backup_dir(backup_id);
        if !dir.is_dir() {
            return Err(
                BarmanError::Catalog(format!("backup '{backup_id}' does not exist")).into(),
            );
        }
        let trash = self
            .server
            .basebackups_directory
            .join(format!("{TRASH_PREFIX}{backup_id}"));
        fs::rename(&dir, &trash).with_context(|| format!("failed to trash {dir:?}"))?;
        crashsafe::fsync_parent(&trash)?;
        fs::remove_dir_all(&trash).with_context(|| format!("failed to remove {trash:?}"))?;
        debug!("deleted backup directory {dir}");
        Ok(())
    }

    /// Finish interrupted deletions and drop stale temp files. Returns how
    /// many residues were cleaned.
    pub fn cleanup_residue(&self) -> anyhow::Result<usize> {
        let mut cleaned = 0;
        let base = &self.server.basebackups_directory;
        if base.is_dir() {
            for entry in base.read_dir_utf8()? {
                let entry = entry?;
                if entry.file_name().starts_with(TRASH_PREFIX) {
                    warn!("completing interrupted deletion of {}", entry.path());
                    fs::remove_dir_all(entry.path())
                        .with_context(|| format!("failed to remove {:?}", entry.path()))?;
                    cleaned += 1;
                }
            }
        }
        for dir in [&self.server.wals_directory, &self.server.meta_directory] {
            if !dir.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(dir.as_std_path()) {
                let entry = entry?;
                let path = Utf8Path::from_path(entry.path())
                    .ok_or_else(|| anyhow::anyhow!("non-UTF8 path in {dir:?}"))?;
                if entry.file_type().is_file() && crashsafe::is_temporary(path) {
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove {path:?}"))?;
                    cleaned += 1;
                }
            }
        }
        Ok(cleaned)
    }

    // ------------------------------------------------------------------
    // WAL archive
    // ------------------------------------------------------------------

    /// Final path of an archived WAL file.
    pub fn wal_path(&self, name: &str, compression: Option<CompressionAlg>) -> Utf8PathBuf {
        let file_name = match compression {
            Some(alg) => format!("{name}.{}", alg.suffix()),
            None => name.to_string(),
        };
        self.server
            .wals_directory
            .join(xlog::hash_dir(name))
            .join(file_name)
    }

    /// Locate an archived WAL file on disk by canonical name, regardless of
    /// compression suffix.
    pub fn find_wal_file(&self, name: &str) -> anyhow::Result<Option<Utf8PathBuf>> {
        let shard = self.server.wals_directory.join(xlog::hash_dir(name));
        let entries = match shard.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to list {shard:?}")),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let matches = file_name == name
                || file_name
                    .strip_prefix(name)
                    .map(|rest| rest.starts_with('.'))
                    .unwrap_or(false);
            if matches && !crashsafe::is_temporary(entry.path()) {
                return Ok(Some(entry.path().to_owned()));
            }
        }
        Ok(None)
    }

    /// Store WAL content under its canonical name. Idempotent: identical
    /// content already present is a silent duplicate, differing content is a
    /// [`BarmanError::Duplication`].
    pub fn record_wal(
        &self,
        name: &str,
        content: &[u8],
        compression: Option<CompressionAlg>,
    ) -> anyhow::Result<RecordWalOutcome> {
        if !xlog::is_archivable_name(name) {
            return Err(BarmanError::Input(format!("'{name}' is not an archivable WAL name")).into());
        }
        if let Some(existing) = self.find_wal_file(name)? {
            let existing_content = fs::read(&existing)
                .with_context(|| format!("failed to read {existing:?}"))?;
            if sha256(&existing_content) == sha256(content) {
                debug!("segment {name} already archived with identical content");
                return Ok(RecordWalOutcome::Duplicate);
            }
            return Err(BarmanError::Duplication {
                name: name.to_string(),
            }
            .into());
        }

        let final_path = self.wal_path(name, compression);
        fs::create_dir_all(final_path.parent().expect("wal path has a parent"))?;
        crashsafe::overwrite_file(&final_path, content)
            .with_context(|| format!("failed to publish {final_path:?}"))?;
        self.append_xlogdb(&XlogDbEntry {
            name: name.to_string(),
            size: content.len() as u64,
            time: now_unix(),
            compression: compression.map(|c| c.to_string()),
        })?;
        Ok(RecordWalOutcome::Stored)
    }

    pub fn read_xlogdb(&self) -> anyhow::Result<Vec<XlogDbEntry>> {
        let path = self.server.xlogdb_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {path:?}")),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(XlogDbEntry::parse_line)
            .collect()
    }

    pub fn lookup_wal(&self, name: &str) -> anyhow::Result<Option<XlogDbEntry>> {
        Ok(self
            .read_xlogdb()?
            .into_iter()
            .find(|entry| entry.name == name))
    }

    /// Append one line and fsync the index. Callers hold the archive lock.
    pub fn append_xlogdb(&self, entry: &XlogDbEntry) -> anyhow::Result<()> {
        let path = self.server.xlogdb_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {path:?}"))?;
        file.write_all(entry.to_line().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the whole index atomically. Callers hold the archive lock.
    pub fn rewrite_xlogdb(&self, entries: &[XlogDbEntry]) -> anyhow::Result<()> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.to_line());
        }
        let path = self.server.xlogdb_path();
        crashsafe::overwrite_file(&path, content.as_bytes())
            .with_context(|| format!("failed to rewrite {path:?}"))
    }

    /// Scan `wals/` and re-emit the index from what is actually on disk, in
    /// canonical order. Callers hold the archive lock.
    pub fn rebuild_xlogdb(&self) -> anyhow::Result<usize> {
        let wals = &self.server.wals_directory;
        let mut entries = Vec::new();
        if wals.is_dir() {
            for shard in wals.read_dir_utf8()? {
                let shard = shard?;
                if !shard.file_type()?.is_dir() {
                    continue;
                }
                for file in shard.path().read_dir_utf8()? {
                    let file = file?;
                    if !file.file_type()?.is_file() || crashsafe::is_temporary(file.path()) {
                        continue;
                    }
                    let file_name = file.file_name();
                    let (name, compression) = split_compression_suffix(file_name);
                    if !xlog::is_archivable_name(name) {
                        warn!("ignoring alien file {} during rebuild", file.path());
                        continue;
                    }
                    let meta = file.path().metadata()?;
                    entries.push(XlogDbEntry {
                        name: name.to_string(),
                        size: meta.len(),
                        time: meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs())
                            .unwrap_or_default(),
                        compression,
                    });
                }
            }
        }
        entries.sort_by_key(|e| xlog::sort_key(&e.name));
        let count = entries.len();
        self.rewrite_xlogdb(&entries)?;
        Ok(count)
    }

    /// Names present in the archive directories (canonical, suffix-stripped).
    pub fn wal_files_on_disk(&self) -> anyhow::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        let wals = &self.server.wals_directory;
        if !wals.is_dir() {
            return Ok(names);
        }
        for shard in wals.read_dir_utf8()? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in shard.path().read_dir_utf8()? {
                let file = file?;
                if file.file_type()?.is_file() && !crashsafe::is_temporary(file.path()) {
                    let (name, _) = split_compression_suffix(file.file_name());
                    if xlog::is_archivable_name(name) {
                        names.insert(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    /// Delete one archived WAL file and drop empty shard directories.
    pub fn remove_wal_file(&self, name: &str) -> anyhow::Result<()> {
        if let Some(path) = self.find_wal_file(name)? {
            fs::remove_file(&path).with_context(|| format!("failed to remove {path:?}"))?;
            if let Some(shard) = path.parent() {
                // Best effort: the shard may still hold other segments.
                let _ = fs::remove_dir(shard);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status files
    // ------------------------------------------------------------------

    pub fn write_meta(&self, file_name: &str, content: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.server.meta_directory)?;
        crashsafe::overwrite_file(
            &self.server.meta_directory.join(file_name),
            content.as_bytes(),
        )
        .with_context(|| format!("failed to write meta file {file_name}"))
    }

    pub fn read_meta(&self, file_name: &str) -> Option<String> {
        fs::read_to_string(self.server.meta_directory.join(file_name))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

/// Split a trailing compression suffix off an archived file name.
fn split_compression_suffix(file_name: &str) -> (&str, Option<String>) {
    for alg in CompressionAlg::ALL {
        if let Some(stem) = file_name.strip_suffix(&format!(".{}", alg.suffix())) {
            return (stem, Some(alg.to_string()));
        }
    }
    (file_name, None)
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn sha256(content: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.finalize().into()
}

/// Hash a file without loading it whole.
pub fn sha256_file(path: &Utf8Path) -> anyhow::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}
