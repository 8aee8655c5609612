//! Command surface for geographic redundancy.
//!
//! A passive barman host mirrors an upstream barman instead of a PostgreSQL
//! cluster. The full passive-node orchestration lives elsewhere; these
//! commands are its building blocks: `sync-info` describes the local
//! catalog for a downstream peer, `sync-backup` and `sync-wals` pull
//! content from the upstream named by the server's ssh_command, reusing the
//! catalog layout on both ends.

use std::collections::BTreeSet;
use std::process::Stdio;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup_info::BackupStatus;
use crate::catalog::{self, BackupFilter, Catalog, XlogDbEntry};
use crate::config::ServerConfig;
use crate::error::BarmanError;

/// The payload `sync-info` emits and a passive peer consumes.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncInfo {
    pub server_name: String,
    pub backups: Vec<SyncBackupInfo>,
    pub last_archived_wal: Option<String>,
    pub wal_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncBackupInfo {
    pub backup_id: String,
    pub status: BackupStatus,
    pub size: Option<u64>,
    pub begin_wal: Option<String>,
    pub end_wal: Option<String>,
}

/// Describe the local catalog for a downstream passive node.
pub fn sync_info(server: &ServerConfig) -> anyhow::Result<SyncInfo> {
    let catalog = Catalog::new(server);
    let backups = catalog
        .list_backups(&BackupFilter::default())?
        .into_iter()
        .map(|info| SyncBackupInfo {
            backup_id: info.backup_id,
            status: info.status,
            size: info.size,
            begin_wal: info.begin_wal,
            end_wal: info.end_wal,
        })
        .collect();
    let xlogdb = catalog.read_xlogdb()?;
    Ok(SyncInfo {
        server_name: server.name.clone(),
        last_archived_wal: xlogdb.last().map(|entry| entry.name.clone()),
        wal_count: xlogdb.len(),
        backups,
    })
}

fn upstream_transport(server: &ServerConfig) -> anyhow::Result<&str> {
    server.ssh_command.as_deref().ok_or_else(|| {
        BarmanError::Configuration(format!(
            "server '{}' has no ssh_command; sync commands need a transport to the \
             upstream barman",
            server.name
        ))
        .into()
    })
}

/// Pull one backup directory from the upstream barman host. The entry is
/// SYNCING while the copy runs and adopts the upstream status afterwards.
pub async fn sync_backup(
    server: &ServerConfig,
    backup_id: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let ssh = upstream_transport(server)?.to_string();
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;
    let _server_lock = catalog.try_lock(catalog::SERVER_LOCK)?;

    let local_dir = catalog.backup_dir(backup_id);
    let remote_dir = format!("remote:{}/", catalog.backup_dir(backup_id));
    tokio::fs::create_dir_all(&local_dir).await?;

    info!("syncing backup '{backup_id}' from upstream");
    let mut child = tokio::process::Command::new("rsync")
        .args([
            "-a",
            "-e",
            &ssh,
            &remote_dir,
            &format!("{local_dir}/"),
        ])
        .stdin(Stdio::null())
        .spawn()
        .context("failed to spawn rsync")?;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            anyhow::bail!("sync-backup cancelled");
        }
    };
    if !status.success() {
        return Err(BarmanError::Connection(format!(
            "rsync from upstream exited with {status}"
        ))
        .into());
    }

    // The upstream backup.info travelled with the copy; if it is somehow
    // missing or unreadable the entry stays visibly broken for `check`.
    match catalog.load_backup_info(backup_id) {
        Ok(info) => info!(
            "backup '{backup_id}' synced from upstream, status {}",
            info.status
        ),
        Err(e) => warn!("synced backup '{backup_id}' has unreadable metadata: {e:#}"),
    }
    Ok(())
}

/// Pull archived WAL files the upstream has and we lack. The upstream's
/// xlog.db is fetched over the transport, diffed against ours, and each
/// missing file is copied and indexed.
pub async fn sync_wals(
    server: &ServerConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<usize> {
    let ssh = upstream_transport(server)?.to_string();
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;
    let _archive_lock = catalog.try_lock(catalog::ARCHIVE_LOCK)?;

    let remote_xlogdb = fetch_upstream_xlogdb(&ssh, server).await?;
    let local_names: BTreeSet<String> = catalog
        .read_xlogdb()?
        .into_iter()
        .map(|entry| entry.name)
        .collect();

    let mut synced = 0;
    for entry in remote_xlogdb {
        if cancel.is_cancelled() {
            info!("sync-wals cancelled after {synced} file(s)");
            break;
        }
        if local_names.contains(&entry.name) {
            continue;
        }
        let compression = entry
            .compression
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| {
                BarmanError::Catalog(format!(
                    "upstream xlog.db has unknown compression for {}",
                    entry.name
                ))
            })?;
        let target = catalog.wal_path(&entry.name, compression);
        tokio::fs::create_dir_all(target.parent().expect("wal path has a parent")).await?;
        // The upstream uses the same catalog layout, so its path for this
        // file matches ours.
        let remote_path = format!("remote:{target}");
        let status = tokio::process::Command::new("rsync")
            .args(["-a", "-e", &ssh, &remote_path, target.as_str()])
            .stdin(Stdio::null())
            .status()
            .await
            .context("failed to spawn rsync")?;
        if !status.success() {
            return Err(BarmanError::Connection(format!(
                "rsync of {} exited with {status}",
                entry.name
            ))
            .into());
        }
        catalog.append_xlogdb(&entry)?;
        synced += 1;
    }
    if synced > 0 {
        info!("synced {synced} WAL file(s) from upstream");
    }
    Ok(synced)
}

async fn fetch_upstream_xlogdb(
    ssh: &str,
    server: &ServerConfig,
) -> anyhow::Result<Vec<XlogDbEntry>> {
    let mut parts = ssh.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| BarmanError::Configuration("empty ssh_command".into()))?;
    let output = tokio::process::Command::new(program)
        .args(parts)
        .arg(format!("cat '{}'", server.xlogdb_path()))
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to spawn ssh")?;
    if !output.status.success() {
        return Err(BarmanError::Connection(format!(
            "could not read the upstream xlog.db (exit {})",
            output.status
        ))
        .into());
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(XlogDbEntry::parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_info::{BackupInfo, BackupMode, BackupType};
    use crate::config::Config;
    use camino_tempfile::Utf8TempDir;

    fn test_server(home: &camino::Utf8Path, extra: &str) -> ServerConfig {
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=db'
archiver = true
{extra}
"#
        );
        Config::from_toml(&toml, &[])
            .unwrap()
            .server("main")
            .unwrap()
            .clone()
    }

    #[test]
    fn sync_info_reflects_the_catalog() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let catalog = Catalog::new(&server);
        catalog.ensure_layout().unwrap();

        catalog.create_backup_dir("20260801T090000").unwrap();
        let mut info = BackupInfo::new(
            "20260801T090000",
            "main",
            BackupMode::Rsync,
            BackupType::Full,
        );
        info.status = BackupStatus::Done;
        info.begin_wal = Some("000000010000000000000002".into());
        catalog.write_backup_info(&info).unwrap();
        catalog
            .record_wal("000000010000000000000002", b"w", None)
            .unwrap();
        catalog
            .record_wal("000000010000000000000003", b"w", None)
            .unwrap();

        let payload = sync_info(&server).unwrap();
        assert_eq!(payload.server_name, "main");
        assert_eq!(payload.backups.len(), 1);
        assert_eq!(payload.wal_count, 2);
        assert_eq!(
            payload.last_archived_wal.as_deref(),
            Some("000000010000000000000003")
        );

        // The payload is machine-readable end to end.
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: SyncInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.backups[0].backup_id, "20260801T090000");
    }

    #[tokio::test]
    async fn sync_commands_need_a_transport() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let err = sync_backup(&server, "20260801T090000", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ssh_command"));

        let err = sync_wals(&server, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ssh_command"));
    }
}
