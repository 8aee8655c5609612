//! The base-backup orchestrator.
//!
//! Drives one backup end-to-end against a primary or standby:
//!
//! ```text
//! IDLE → PREPARE → LABEL_BEGIN → COPY_TREE → LABEL_END → WAIT_WAL → DONE
//!                        │            │            │
//!                        └── FAILED ──┴── FAILED ──┘
//! ```
//!
//! Once LABEL_BEGIN has succeeded, every failure path issues a best-effort
//! backup-stop so the upstream never stays in backup mode, then persists the
//! catalog entry as FAILED.

pub mod rsync;
pub mod streaming;

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::backup_info::{BackupInfo, BackupMode, BackupStatus, BackupType};
use crate::catalog::{self, BackupFilter, Catalog};
use crate::config::{BackupMethod, ReuseMode, ServerConfig};
use crate::error::BarmanError;
use crate::hooks::{self, HookEnvironment, HookEvent, HookOutcome, HookPhase};
use crate::postgres::{PostgresConnection, MINIMAL_STANDBY_BACKUP_VERSION};
use crate::xlog::{self, Segment};

/// How often WAIT_WAL polls the archive for the fence segments.
const WAIT_WAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone)]
pub struct BackupOptions {
    /// Optional human-readable name recorded in the catalog entry.
    pub name: Option<String>,
    /// Parent backup id (or shortcut) for a block-level incremental.
    pub incremental_parent: Option<String>,
    pub immediate_checkpoint: Option<bool>,
    pub reuse_backup: Option<ReuseMode>,
    /// Stay around until the WAL fence is complete instead of handing the
    /// WAITING_FOR_WALS entry to the scheduler.
    pub wait_for_wals: bool,
    pub wait_timeout: Option<Duration>,
}

/// Take one base backup. Returns the final catalog entry, whose status is
/// DONE or WAITING_FOR_WALS.
pub async fn backup(
    server: &ServerConfig,
    options: &BackupOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<BackupInfo> {
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;
    let _server_lock = catalog.try_lock(catalog::SERVER_LOCK)?;
    let _backup_lock = catalog.try_lock(catalog::BACKUP_LOCK)?;

    let env = HookEnvironment::new(server);
    if hooks::run_hooks(server, HookEvent::Backup, HookPhase::Pre, &env).await?
        == HookOutcome::Abort
    {
        anyhow::bail!("backup aborted by pre-backup hook");
    }

    let conn = Arc::new(PostgresConnection::connect(&server.conninfo).await?);
    let prepared = prepare(server, &catalog, &conn, options).await?;
    let backup_id = prepared.info.backup_id.clone();

    let result = run_from_label_begin(server, &catalog, &conn, prepared, options, cancel)
        .instrument(info_span!("backup", server = %server.name, backup_id = %backup_id))
        .await;

    match result {
        Ok(info) => {
            let env = HookEnvironment::new(server).with_backup(
                &info,
                &catalog.backup_dir(&info.backup_id),
                None,
                None,
            );
            hooks::run_hooks(server, HookEvent::Backup, HookPhase::Post, &env).await?;
            Ok(info)
        }
        Err(e) => {
            // Release the upstream backup state no matter what failed.
            conn.backup_stop_cleanup().await;
            if let Ok(mut info) = catalog.load_backup_info(&backup_id) {
                info.status = BackupStatus::Failed;
                info.end_time = Some(Utc::now());
                let _ = catalog.write_backup_info(&info);
                let env = HookEnvironment::new(server)
                    .with_backup(&info, &catalog.backup_dir(&backup_id), None, None)
                    .with_error(&format!("{e:#}"));
                let _ = hooks::run_hooks(server, HookEvent::Backup, HookPhase::Post, &env).await;
            }
            Err(e)
        }
    }
}

struct Prepared {
    info: BackupInfo,
    parent: Option<BackupInfo>,
    reuse: ReuseMode,
    reference: Option<BackupInfo>,
}

/// PREPARE: method validation, parent resolution, id selection, EMPTY entry.
async fn prepare(
    server: &ServerConfig,
    catalog: &Catalog<'_>,
    conn: &PostgresConnection,
    options: &BackupOptions,
) -> anyhow::Result<Prepared> {
    let standby = conn.is_in_recovery().await?;
    if standby && conn.server_version_num() < MINIMAL_STANDBY_BACKUP_VERSION {
        return Err(BarmanError::UnsupportedOperation(format!(
            "server version {} cannot run a concurrent backup on a standby",
            conn.server_version_num()
        ))
        .into());
    }

    // Parent resolution for a block-level incremental.
    let parent = match &options.incremental_parent {
        Some(parent_spec) => {
            if server.backup_method != BackupMethod::Postgres {
                return Err(BarmanError::UnsupportedOperation(format!(
                    "incremental backups require backup_method = postgres, not {}",
                    server.backup_method
                ))
                .into());
            }
            if !conn.wal_summarizer_enabled().await? {
                return Err(BarmanError::UnsupportedOperation(
                    "block-level incremental backups need summarize_wal enabled upstream".into(),
                )
                .into());
            }
            let parent_id = catalog.resolve_backup_id(parent_spec)?;
            let parent = catalog.load_backup_info(&parent_id)?;
            validate_block_parent(
                &parent,
                &conn.system_identifier().await?,
                conn.server_version_num(),
            )?;
            Some(parent)
        }
        None => None,
    };

    // Reference backup for rsync deduplication: the latest DONE backup.
    let reuse = options.reuse_backup.unwrap_or(server.reuse_backup);
    let reference = if matches!(server.backup_method, BackupMethod::Rsync | BackupMethod::LocalRsync)
        && reuse != ReuseMode::Off
    {
        catalog
            .list_backups(&BackupFilter {
                status: Some(BackupStatus::Done),
                ..Default::default()
            })?
            .into_iter()
            .next_back()
    } else {
        None
    };

    let mode = match server.backup_method {
        BackupMethod::Rsync => BackupMode::Rsync,
        BackupMethod::LocalRsync => BackupMode::LocalRsync,
        BackupMethod::Postgres => BackupMode::PostgresStreaming,
        BackupMethod::Snapshot => BackupMode::Snapshot,
    };
    let backup_type = if parent.is_some() {
        BackupType::IncrementalBlockLevel
    } else if reference.is_some() {
        // File-level deduplicated entries stay independent in the catalog:
        // hard links make them self-contained, so no parent is recorded.
        BackupType::IncrementalFileLevel
    } else if server.backup_method == BackupMethod::Snapshot {
        BackupType::Snapshot
    } else {
        BackupType::Full
    };

    // The backup lock is held, so serial creation cannot race; same-second
    // invocations still need a nudge.
    let mut now = Utc::now();
    let backup_id = loop {
        let id = BackupInfo::generate_id(now);
        if !catalog.backup_dir(&id).is_dir() {
            break id;
        }
        now += chrono::Duration::seconds(1);
    };
    catalog.create_backup_dir(&backup_id)?;

    let mut info = BackupInfo::new(&backup_id, &server.name, mode, backup_type);
    info.backup_name = options.name.clone();
    info.parent_backup_id = parent.as_ref().map(|p| p.backup_id.clone());
    catalog.write_backup_info(&info)?;

    Ok(Prepared {
        info,
        parent,
        reuse,
        reference,
    })
}

/// Compatibility rules for chaining a block-level incremental onto a parent.
fn validate_block_parent(
    parent: &BackupInfo,
    systemid: &str,
    server_version_num: u32,
) -> anyhow::Result<()> {
    if parent.status != BackupStatus::Done {
        return Err(BarmanError::UnsupportedOperation(format!(
            "parent backup '{}' is {}, need DONE",
            parent.backup_id, parent.status
        ))
        .into());
    }
    if parent.mode != BackupMode::PostgresStreaming {
        return Err(BarmanError::UnsupportedOperation(format!(
            "parent backup '{}' was taken with mode {}, incremental chains need \
             postgres-streaming",
            parent.backup_id, parent.mode
        ))
        .into());
    }
    if parent.systemid.as_deref() != Some(systemid) {
        return Err(BarmanError::UnsupportedOperation(format!(
            "parent backup '{}' belongs to another cluster (systemid mismatch)",
            parent.backup_id
        ))
        .into());
    }
    if let Some(parent_version) = parent.server_version {
        if parent_version / 10000 != server_version_num / 10000 {
            return Err(BarmanError::UnsupportedOperation(format!(
                "parent backup '{}' was taken on major version {}, server is on {}",
                parent.backup_id,
                parent_version / 10000,
                server_version_num / 10000
            ))
            .into());
        }
    }
    Ok(())
}

async fn run_from_label_begin(
    server: &ServerConfig,
    catalog: &Catalog<'_>,
    conn: &Arc<PostgresConnection>,
    prepared: Prepared,
    options: &BackupOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<BackupInfo> {
    let Prepared {
        mut info,
        parent,
        reuse,
        reference,
    } = prepared;
    let backup_dir = catalog.backup_dir(&info.backup_id);
    let standby = conn.is_in_recovery().await?;

    // LABEL_BEGIN. A standby with no configured primary cannot be nudged
    // into producing WAL, so ask for the checkpoint up front.
    let immediate = options
        .immediate_checkpoint
        .unwrap_or(server.immediate_checkpoint)
        || (standby && server.primary_conninfo.is_none());
    let label = format!("barman backup {} {}", server.name, info.backup_id);
    let start = conn.backup_start(&label, immediate).await?;

    info.status = BackupStatus::Started;
    info.begin_time = Some(Utc::now());
    info.begin_lsn = Some(start.lsn);
    info.timeline = Some(start.timeline);
    info.begin_wal = Some(Segment::containing(start.timeline, start.lsn).name());
    info.systemid = Some(conn.system_identifier().await?);
    info.server_version = Some(conn.server_version_num());
    info.tablespaces = conn.tablespaces().await?;
    info.compression = server.compression.map(|c| c.to_string());
    catalog.write_backup_info(&info)?;
    info!(
        "backup started at {} on timeline {}",
        start.lsn, start.timeline
    );

    // COPY_TREE, with the control connection kept warm underneath.
    let keepalive_cancel = CancellationToken::new();
    let keepalive = conn.spawn_keepalive(server.keepalive_interval, keepalive_cancel.clone());
    let copy_result = copy_tree(
        server,
        conn,
        &info,
        &backup_dir,
        reuse,
        reference.as_ref(),
        parent.as_ref(),
        immediate,
        cancel,
    )
    .await;
    keepalive_cancel.cancel();
    let _ = keepalive.await;
    copy_result?;

    // LABEL_END.
    let stop = conn.backup_stop().await?;
    info.end_time = Some(Utc::now());
    info.end_lsn = Some(stop.lsn);
    info.end_wal = Some(Segment::containing(start.timeline, stop.lsn).name());
    store_backup_label(server, &backup_dir, &stop.backup_label, stop.tablespace_map.as_deref())?;
    let (size, deduplicated_size) = compute_tree_sizes(&backup_dir)?;
    info.size = Some(size);
    info.deduplicated_size = Some(deduplicated_size);
    catalog.write_backup_info(&info)?;
    info!("backup stopped at {}", stop.lsn);

    // WAIT_WAL: fence on [begin_wal, end_wal]. Close the end segment first:
    // on a primary directly, on a standby through its primary when one is
    // configured, otherwise the spread of natural traffic has to do it.
    if standby {
        if let Some(primary_conninfo) = &server.primary_conninfo {
            let primary = PostgresConnection::connect(primary_conninfo).await?;
            primary.switch_wal().await?;
        }
    } else {
        conn.switch_wal().await?;
    }

    let begin_wal = info.begin_wal.clone().expect("set at LABEL_BEGIN");
    let end_wal = info.end_wal.clone().expect("set at LABEL_END");
    if options.wait_for_wals {
        let timeout = options.wait_timeout.unwrap_or(server.wait_for_wals_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if wal_range_complete(catalog, &begin_wal, &end_wal)? {
                info.status = BackupStatus::Done;
                break;
            }
            if tokio::time::Instant::now() >= deadline || cancel.is_cancelled() {
                warn!(
                    "WAL fence [{begin_wal}, {end_wal}] incomplete after {timeout:?}, \
                     leaving the backup WAITING_FOR_WALS"
                );
                info.status = BackupStatus::WaitingForWals;
                break;
            }
            tokio::time::sleep(WAIT_WAL_POLL_INTERVAL).await;
        }
    } else if wal_range_complete(catalog, &begin_wal, &end_wal)? {
        info.status = BackupStatus::Done;
    } else {
        info.status = BackupStatus::WaitingForWals;
    }
    catalog.write_backup_info(&info)?;
    info!("backup {} is {}", info.backup_id, info.status);
    Ok(info)
}

#[allow(clippy::too_many_arguments)]
async fn copy_tree(
    server: &ServerConfig,
    conn: &PostgresConnection,
    info: &BackupInfo,
    backup_dir: &Utf8Path,
    reuse: ReuseMode,
    reference: Option<&BackupInfo>,
    parent: Option<&BackupInfo>,
    immediate_checkpoint: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match server.backup_method {
        BackupMethod::Rsync | BackupMethod::LocalRsync => {
            let engine = rsync::RsyncCopyEngine::new(server, reuse);
            let reference_dir = reference.map(|r| {
                server
                    .basebackups_directory
                    .join(&r.backup_id)
            });
            let data_directory = conn.data_directory().await?;
            let mut tasks = vec![rsync::CopyTask {
                label: "pgdata".to_string(),
                source: data_directory,
                destination: backup_dir.join("data"),
                reference: reference_dir.as_ref().map(|d| d.join("data")),
                is_pgdata: true,
            }];
            for tablespace in &info.tablespaces {
                tasks.push(rsync::CopyTask {
                    label: tablespace.name.clone(),
                    source: tablespace.location.clone(),
                    destination: backup_dir.join("tablespaces").join(&tablespace.name),
                    reference: reference_dir
                        .as_ref()
                        .map(|d| d.join("tablespaces").join(&tablespace.name)),
                    is_pgdata: false,
                });
            }
            engine.copy(tasks, cancel).await
        }
        BackupMethod::Postgres => {
            let engine = streaming::StreamingCopyEngine::new(server);
            let parent_manifest = parent.map(|p| {
                let parent_dir = server.basebackups_directory.join(&p.backup_id);
                match p.compression {
                    Some(_) => parent_dir.join("backup_manifest"),
                    None => parent_dir.join("data").join("backup_manifest"),
                }
            });
            let label = format!("barman backup {} {}", server.name, info.backup_id);
            engine
                .copy(
                    backup_dir,
                    &label,
                    immediate_checkpoint,
                    parent_manifest.as_deref(),
                    cancel,
                )
                .await
        }
        BackupMethod::Snapshot => snapshot_copy(server, info, backup_dir).await,
    }
}

/// Snapshot mode: the configured provider command snapshots each disk; the
/// catalog keeps only labels and metadata. The provider is expected to drop
/// a `snapshot_metadata.json` describing the snapshotted disks into the
/// backup directory; recovery validates mounts against it.
async fn snapshot_copy(
    server: &ServerConfig,
    info: &BackupInfo,
    backup_dir: &Utf8Path,
) -> anyhow::Result<()> {
    let Some(command) = &server.snapshot_provider_command else {
        return Err(BarmanError::UnsupportedOperation(
            "backup_method = snapshot requires snapshot_provider_command".into(),
        )
        .into());
    };
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("BARMAN_SERVER", &server.name)
        .env("BARMAN_BACKUP_ID", &info.backup_id)
        .env("BARMAN_BACKUP_DIR", backup_dir.as_str())
        .stdin(Stdio::null())
        .status()
        .await
        .context("failed to spawn snapshot provider")?;
    if !status.success() {
        return Err(BarmanError::Protocol(format!(
            "snapshot provider exited with {status}"
        ))
        .into());
    }
    Ok(())
}

/// Persist the backup label (and tablespace map) produced by the stop call.
/// For tree-shaped backups it also lands inside `data/` so the restored
/// directory is startable as-is.
fn store_backup_label(
    server: &ServerConfig,
    backup_dir: &Utf8Path,
    backup_label: &str,
    tablespace_map: Option<&str>,
) -> anyhow::Result<()> {
    utils::crashsafe::overwrite_file(&backup_dir.join("backup_label"), backup_label.as_bytes())?;
    if let Some(map) = tablespace_map {
        utils::crashsafe::overwrite_file(&backup_dir.join("tablespace_map"), map.as_bytes())?;
    }
    let data_dir = backup_dir.join("data");
    if data_dir.is_dir() && server.compression.is_none() {
        utils::crashsafe::overwrite_file(&data_dir.join("backup_label"), backup_label.as_bytes())?;
        if let Some(map) = tablespace_map {
            utils::crashsafe::overwrite_file(&data_dir.join("tablespace_map"), map.as_bytes())?;
        }
    }
    Ok(())
}

/// True when every segment of the inclusive fence range is in the archive.
pub fn wal_range_complete(
    catalog: &Catalog<'_>,
    begin_wal: &str,
    end_wal: &str,
) -> anyhow::Result<bool> {
    for name in xlog::segment_range(begin_wal, end_wal)? {
        if catalog.find_wal_file(&name)?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Total and deduplicated sizes of a backup tree. Hard-linked files are
/// counted once in the deduplicated figure, which is what `reuse_backup`
/// savings show up as.
pub fn compute_tree_sizes(dir: &Utf8Path) -> anyhow::Result<(u64, u64)> {
    let mut size = 0u64;
    let mut deduplicated = 0u64;
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    for entry in walkdir::WalkDir::new(dir.as_std_path()) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata()?;
        size += meta.len();
        if meta.nlink() <= 1 || seen.insert((meta.dev(), meta.ino())) {
            deduplicated += meta.len();
        }
    }
    Ok((size, deduplicated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use camino_tempfile::Utf8TempDir;
    use std::fs;

    fn test_server(home: &Utf8Path) -> ServerConfig {
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=db'
archiver = true
"#
        );
        Config::from_toml(&toml, &[])
            .unwrap()
            .server("main")
            .unwrap()
            .clone()
    }

    #[test]
    fn wal_fence_completeness() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path());
        let catalog = Catalog::new(&server);
        catalog.ensure_layout().unwrap();

        catalog
            .record_wal("000000010000000000000002", b"w2", None)
            .unwrap();
        catalog
            .record_wal("000000010000000000000004", b"w4", None)
            .unwrap();

        // Gap at ...003.
        assert!(!wal_range_complete(
            &catalog,
            "000000010000000000000002",
            "000000010000000000000004"
        )
        .unwrap());

        catalog
            .record_wal("000000010000000000000003", b"w3", None)
            .unwrap();
        assert!(wal_range_complete(
            &catalog,
            "000000010000000000000002",
            "000000010000000000000004"
        )
        .unwrap());
    }

    #[test]
    fn tree_sizes_count_hard_links_once() {
        let dir = Utf8TempDir::new().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(&a).unwrap();
        fs::write(a.join("shared"), vec![1u8; 1000]).unwrap();
        fs::write(a.join("own"), vec![2u8; 500]).unwrap();
        fs::hard_link(a.join("shared"), a.join("shared-link")).unwrap();

        let (size, dedup) = compute_tree_sizes(dir.path()).unwrap();
        assert_eq!(size, 2500);
        assert_eq!(dedup, 1500);
    }

    #[test]
    fn block_parent_validation_rules() {
        let mut parent = BackupInfo::new(
            "20260801T090000",
            "main",
            BackupMode::PostgresStreaming,
            BackupType::Full,
        );
        parent.status = BackupStatus::Done;
        parent.systemid = Some("7000000000000000001".into());
        parent.server_version = Some(170002);

        assert!(validate_block_parent(&parent, "7000000000000000001", 170004).is_ok());

        // Wrong cluster.
        let err =
            validate_block_parent(&parent, "7000000000000000002", 170004).unwrap_err();
        assert!(err.to_string().contains("systemid"));

        // Wrong major version.
        let err = validate_block_parent(&parent, "7000000000000000001", 160009).unwrap_err();
        assert!(err.to_string().contains("major version"));

        // Parent not DONE.
        parent.status = BackupStatus::WaitingForWals;
        assert!(validate_block_parent(&parent, "7000000000000000001", 170004).is_err());

        // Parent from another engine.
        parent.status = BackupStatus::Done;
        parent.mode = BackupMode::Rsync;
        assert!(validate_block_parent(&parent, "7000000000000000001", 170004).is_err());
    }

    #[test]
    fn backup_label_lands_in_tree_for_plain_backups() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path());
        let backup_dir = dir.path().join("base/20260801T120000");
        fs::create_dir_all(backup_dir.join("data")).unwrap();

        store_backup_label(
            &server,
            &backup_dir,
            "START WAL LOCATION: 0/2000028\n",
            Some("16384 /srv/tbs1\n"),
        )
        .unwrap();

        assert!(backup_dir.join("backup_label").exists());
        assert!(backup_dir.join("data/backup_label").exists());
        assert!(backup_dir.join("data/tablespace_map").exists());
        assert_eq!(
            fs::read_to_string(backup_dir.join("data/backup_label")).unwrap(),
            "START WAL LOCATION: 0/2000028\n"
        );
    }
}
