//! The maintenance scheduler: one idempotent sweep, intended to fire once
//! per minute from the system crontab.
//!
//! Per server, under that server's own locks: restart a dead streaming
//! receiver, run an archiver pass, promote backups whose WAL fence has
//! arrived, apply retention when configured for automatic mode, and sweep
//! crash residue. A global cron lock keeps sweeps from overlapping; a busy
//! per-server lock just skips that server until the next minute.

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use utils::lock_file::{self, LockAcquireResult};

use crate::backup::wal_range_complete;
use crate::backup_info::BackupStatus;
use crate::catalog::{self, BackupFilter, Catalog};
use crate::config::{Config, ServerConfig};
use crate::error::BarmanError;
use crate::receive_wal;
use crate::retention;
use crate::wal_archive;

/// Summary of one sweep, per server.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub servers_processed: usize,
    pub servers_skipped: usize,
    pub wals_archived: usize,
    pub backups_promoted: usize,
}

/// Run one scheduler sweep over every configured server.
pub async fn cron(config: &Config, cancel: &CancellationToken) -> anyhow::Result<SweepReport> {
    let cron_lock_path = config.barman_home.join("barman-cron.lock");
    std::fs::create_dir_all(&config.barman_home)
        .with_context(|| format!("failed to create {:?}", config.barman_home))?;
    let _cron_lock = match lock_file::create_exclusive(&cron_lock_path)? {
        LockAcquireResult::Acquired(guard) => guard,
        LockAcquireResult::AlreadyLocked { holder_pid } => {
            return Err(BarmanError::LockBusy {
                lock_name: "barman-cron.lock".to_string(),
                holder_pid,
            }
            .into())
        }
    };

    let mut report = SweepReport::default();
    for server in config.servers() {
        if cancel.is_cancelled() {
            info!("sweep cancelled");
            break;
        }
        match sweep_server(server, cancel)
            .instrument(info_span!("cron", server = %server.name))
            .await
        {
            Ok((archived, promoted)) => {
                report.servers_processed += 1;
                report.wals_archived += archived;
                report.backups_promoted += promoted;
            }
            Err(e) if is_lock_busy(&e) => {
                // Another command owns the server right now; its work is as
                // good as ours. Next sweep picks the server up again.
                info!("server busy, skipping: {e:#}");
                report.servers_skipped += 1;
            }
            Err(e) => {
                warn!("sweep failed for server '{}': {e:#}", server.name);
                report.servers_skipped += 1;
            }
        }
    }
    Ok(report)
}

fn is_lock_busy(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|c| matches!(c.downcast_ref::<BarmanError>(), Some(BarmanError::LockBusy { .. })))
}

async fn sweep_server(
    server: &ServerConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<(usize, usize)> {
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;

    // Finish interrupted deletions and clear torn writes before anything
    // else looks at the tree.
    let cleaned = catalog.cleanup_residue()?;
    if cleaned > 0 {
        info!("cleaned {cleaned} crash residue(s)");
    }

    // 1. Keep the streaming receiver alive.
    if server.streaming_archiver {
        if let Err(e) = receive_wal::ensure_receiver(server).await {
            warn!("could not (re)start the streaming receiver: {e:#}");
        }
    }

    // 2. Archiver pass.
    let stats = wal_archive::archive_wal(server, cancel).await?;

    // 3. Promote backups whose fence has arrived.
    let promoted = promote_waiting_backups(&catalog)?;

    // 4. Automatic retention.
    if server.retention_policy.is_some() && server.retention_policy_auto {
        match retention::apply_retention(server, false, cancel).await {
            Ok(outcome) => {
                if !outcome.deleted_backups.is_empty() || outcome.reclaimed_wals > 0 {
                    info!(
                        "retention removed {} backup(s) and {} WAL file(s)",
                        outcome.deleted_backups.len(),
                        outcome.reclaimed_wals
                    );
                }
            }
            Err(e) if is_lock_busy(&e) => info!("retention skipped, server busy"),
            Err(e) => return Err(e),
        }
    }

    catalog.write_meta(catalog::META_CRON_HEARTBEAT, &Utc::now().to_rfc3339())?;
    Ok((stats.archived, promoted))
}

/// Advance WAITING_FOR_WALS entries whose end-wal has now been archived.
pub fn promote_waiting_backups(catalog: &Catalog<'_>) -> anyhow::Result<usize> {
    let waiting = catalog.list_backups(&BackupFilter {
        status: Some(BackupStatus::WaitingForWals),
        ..Default::default()
    })?;
    let mut promoted = 0;
    for mut info in waiting {
        let (Some(begin), Some(end)) = (info.begin_wal.clone(), info.end_wal.clone()) else {
            warn!(
                "backup '{}' waits for WALs but has no fence recorded",
                info.backup_id
            );
            continue;
        };
        if wal_range_complete(catalog, &begin, &end)? {
            info.status = BackupStatus::Done;
            catalog.write_backup_info(&info)?;
            info!("backup '{}' completed its WAL fence, now DONE", info.backup_id);
            promoted += 1;
        }
    }
    Ok(promoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_info::{BackupInfo, BackupMode, BackupType};
    use camino_tempfile::Utf8TempDir;
    use std::fs;

    fn test_config(home: &camino::Utf8Path) -> Config {
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=db'
archiver = true
"#
        );
        Config::from_toml(&toml, &[]).unwrap()
    }

    fn waiting_backup(catalog: &Catalog<'_>, id: &str, begin: &str, end: &str) -> BackupInfo {
        catalog.create_backup_dir(id).unwrap();
        let mut info = BackupInfo::new(id, "main", BackupMode::Rsync, BackupType::Full);
        info.status = BackupStatus::WaitingForWals;
        info.begin_wal = Some(begin.to_string());
        info.end_wal = Some(end.to_string());
        catalog.write_backup_info(&info).unwrap();
        info
    }

    #[tokio::test]
    async fn sweep_archives_promotes_and_heartbeats() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let server = config.server("main").unwrap();
        let catalog = Catalog::new(server);
        catalog.ensure_layout().unwrap();

        // A backup stuck on its fence, whose segments sit in incoming/.
        waiting_backup(
            &catalog,
            "20260801T090000",
            "000000010000000000000002",
            "000000010000000000000003",
        );
        for name in ["000000010000000000000002", "000000010000000000000003"] {
            fs::write(server.incoming_wals_directory.join(name), b"wal").unwrap();
        }

        let report = cron(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.servers_processed, 1);
        assert_eq!(report.wals_archived, 2);
        assert_eq!(report.backups_promoted, 1);

        let info = catalog.load_backup_info("20260801T090000").unwrap();
        assert_eq!(info.status, BackupStatus::Done);
        assert!(catalog.read_meta(catalog::META_CRON_HEARTBEAT).is_some());
    }

    #[tokio::test]
    async fn incomplete_fence_stays_waiting() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let server = config.server("main").unwrap();
        let catalog = Catalog::new(server);
        catalog.ensure_layout().unwrap();

        waiting_backup(
            &catalog,
            "20260801T090000",
            "000000010000000000000002",
            "000000010000000000000004",
        );
        // Only the first segment of the fence arrives.
        fs::write(
            server
                .incoming_wals_directory
                .join("000000010000000000000002"),
            b"wal",
        )
        .unwrap();

        let report = cron(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.backups_promoted, 0);
        let info = catalog.load_backup_info("20260801T090000").unwrap();
        assert_eq!(info.status, BackupStatus::WaitingForWals);
    }

    #[tokio::test]
    async fn overlapping_sweeps_are_refused() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.barman_home).unwrap();

        let _held = match lock_file::create_exclusive(
            &config.barman_home.join("barman-cron.lock"),
        )
        .unwrap()
        {
            LockAcquireResult::Acquired(guard) => guard,
            LockAcquireResult::AlreadyLocked { .. } => panic!("fresh lock reported busy"),
        };

        let err = cron(&config, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), crate::error::EXIT_LOCK_BUSY);
    }

    #[tokio::test]
    async fn busy_server_is_skipped_not_fatal() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let server = config.server("main").unwrap();
        let catalog = Catalog::new(server);
        catalog.ensure_layout().unwrap();

        // Another process is mid-archiving on this server.
        let _archive_lock = catalog.try_lock(catalog::ARCHIVE_LOCK).unwrap();

        let report = cron(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.servers_processed, 0);
        assert_eq!(report.servers_skipped, 1);
    }
}
