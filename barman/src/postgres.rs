//! SQL-side wrappers around the managed PostgreSQL cluster.
//!
//! Everything barman asks over libpq goes through here: probes, the
//! concurrent backup-control calls, WAL switches and replication-slot
//! management. The replication protocol itself is never spoken in-process;
//! `pg_basebackup` and `pg_receivewal` own that wire.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utils::lsn::Lsn;

use crate::backup_info::Tablespace;
use crate::error::BarmanError;

/// Oldest server version able to run a concurrent backup on a standby.
pub const MINIMAL_STANDBY_BACKUP_VERSION: u32 = 90600;
/// First version with the renamed backup-control functions.
const BACKUP_CONTROL_RENAME_VERSION: u32 = 150000;

/// Captured at LABEL_BEGIN.
#[derive(Debug, Clone)]
pub struct BackupStartResult {
    pub lsn: Lsn,
    pub timeline: u32,
}

/// Captured at LABEL_END.
#[derive(Debug, Clone)]
pub struct BackupStopResult {
    pub lsn: Lsn,
    pub backup_label: String,
    pub tablespace_map: Option<String>,
}

/// One row of `pg_stat_replication`, as shown by `replication-status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicationStanding {
    pub application_name: Option<String>,
    pub client_addr: Option<String>,
    pub state: Option<String>,
    pub sent_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
    pub sync_state: Option<String>,
}

pub struct PostgresConnection {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
    version_num: u32,
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl PostgresConnection {
    /// Open a libpq connection. Failures here are connection errors by
    /// definition, whatever the underlying cause.
    pub async fn connect(conninfo: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, tokio_postgres::NoTls)
            .await
            .map_err(|e| BarmanError::Connection(format!("connect failed: {e}")))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("postgres connection closed: {e}");
            }
        });

        let row = client
            .query_one("SELECT current_setting('server_version_num')::int", &[])
            .await
            .map_err(|e| BarmanError::Connection(format!("version probe failed: {e}")))?;
        let version_num: i32 = row.get(0);

        Ok(PostgresConnection {
            client,
            driver,
            version_num: version_num as u32,
        })
    }

    pub fn server_version_num(&self) -> u32 {
        self.version_num
    }

    pub async fn system_identifier(&self) -> anyhow::Result<String> {
        let row = self
            .client
            .query_one(
                "SELECT system_identifier::text FROM pg_control_system()",
                &[],
            )
            .await
            .map_err(protocol_err("system identifier probe"))?;
        Ok(row.get(0))
    }

    pub async fn is_in_recovery(&self) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .map_err(protocol_err("recovery probe"))?;
        Ok(row.get(0))
    }

    pub async fn current_timeline(&self) -> anyhow::Result<u32> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .await
            .map_err(protocol_err("timeline probe"))?;
        let tli: i32 = row.get(0);
        Ok(tli as u32)
    }

    /// Current WAL position: insert LSN on a primary, replay LSN on a
    /// standby.
    pub async fn current_wal_lsn(&self) -> anyhow::Result<Lsn> {
        let sql = if self.is_in_recovery().await? {
            "SELECT pg_last_wal_replay_lsn()::text"
        } else {
            "SELECT pg_current_wal_lsn()::text"
        };
        let row = self
            .client
            .query_one(sql, &[])
            .await
            .map_err(protocol_err("WAL position probe"))?;
        parse_lsn_column(row.get(0))
    }

    pub async fn data_directory(&self) -> anyhow::Result<String> {
        let row = self
            .client
            .query_one("SELECT current_setting('data_directory')", &[])
            .await
            .map_err(protocol_err("data_directory probe"))?;
        Ok(row.get(0))
    }

    pub async fn setting(&self, name: &str) -> anyhow::Result<Option<String>> {
        let row = self
            .client
            .query_opt(
                "SELECT setting FROM pg_settings WHERE name = $1",
                &[&name],
            )
            .await
            .map_err(protocol_err("setting probe"))?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn data_checksums_enabled(&self) -> anyhow::Result<bool> {
        Ok(self.setting("data_checksums").await?.as_deref() == Some("on"))
    }

    pub async fn wal_summarizer_enabled(&self) -> anyhow::Result<bool> {
        Ok(self.setting("summarize_wal").await?.as_deref() == Some("on"))
    }

    /// Tablespaces with a real on-disk location (user tablespaces).
    pub async fn tablespaces(&self) -> anyhow::Result<Vec<Tablespace>> {
        let rows = self
            .client
            .query(
                "SELECT spcname, oid, pg_tablespace_location(oid) AS location \
                 FROM pg_tablespace WHERE pg_tablespace_location(oid) <> ''",
                &[],
            )
            .await
            .map_err(protocol_err("tablespace listing"))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let oid: tokio_postgres::types::Oid = row.get(1);
                Tablespace {
                    name: row.get(0),
                    oid,
                    location: row.get(2),
                }
            })
            .collect())
    }

    /// Start a concurrent base backup. Exclusive mode is never used.
    pub async fn backup_start(
        &self,
        label: &str,
        immediate_checkpoint: bool,
    ) -> anyhow::Result<BackupStartResult> {
        let sql = backup_start_sql(self.version_num);
        let row = self
            .client
            .query_one(sql, &[&label, &immediate_checkpoint])
            .await
            .map_err(protocol_err("backup start call"))?;
        let lsn = parse_lsn_column(row.get(0))?;
        let timeline = self.current_timeline().await?;
        Ok(BackupStartResult { lsn, timeline })
    }

    /// Stop the concurrent backup, returning the stop LSN, the backup_label
    /// content and the tablespace map. Safe to call as cleanup: if no backup
    /// is in progress the server raises and we surface a protocol error.
    pub async fn backup_stop(&self) -> anyhow::Result<BackupStopResult> {
        let sql = backup_stop_sql(self.version_num);
        let row = self
            .client
            .query_one(sql, &[])
            .await
            .map_err(protocol_err("backup stop call"))?;
        let lsn = parse_lsn_column(row.get(0))?;
        let backup_label: String = row.get(1);
        let tablespace_map: Option<String> = row.get(2);
        Ok(BackupStopResult {
            lsn,
            backup_label,
            tablespace_map: tablespace_map.filter(|m| !m.is_empty()),
        })
    }

    /// Best-effort backup stop on the failure path: release the upstream
    /// backup state, swallow the error if there is nothing to release.
    pub async fn backup_stop_cleanup(&self) {
        if let Err(e) = self.backup_stop().await {
            warn!("cleanup backup-stop failed (likely no backup in progress): {e:#}");
        }
    }

    pub async fn switch_wal(&self) -> anyhow::Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT pg_switch_wal()::text", &[])
            .await
            .map_err(protocol_err("WAL switch"))?;
        parse_lsn_column(row.get(0))
    }

    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        self.client
            .execute("CHECKPOINT", &[])
            .await
            .map_err(protocol_err("checkpoint"))?;
        Ok(())
    }

    pub async fn create_physical_slot(&self, slot_name: &str) -> anyhow::Result<()> {
        self.client
            .execute(
                "SELECT pg_create_physical_replication_slot($1)",
                &[&slot_name],
            )
            .await
            .map_err(protocol_err("slot creation"))?;
        Ok(())
    }

    pub async fn drop_physical_slot(&self, slot_name: &str) -> anyhow::Result<()> {
        self.client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
            .await
            .map_err(protocol_err("slot drop"))?;
        Ok(())
    }

    /// (exists, active) for a physical replication slot.
    pub async fn slot_status(&self, slot_name: &str) -> anyhow::Result<Option<bool>> {
        let row = self
            .client
            .query_opt(
                "SELECT active FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await
            .map_err(protocol_err("slot probe"))?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn replication_status(&self) -> anyhow::Result<Vec<ReplicationStanding>> {
        let rows = self
            .client
            .query(
                "SELECT application_name, client_addr::text, state, \
                        sent_lsn::text, replay_lsn::text, sync_state \
                 FROM pg_stat_replication ORDER BY application_name",
                &[],
            )
            .await
            .map_err(protocol_err("replication status query"))?;
        rows.into_iter()
            .map(|row| {
                let sent: Option<String> = row.get(3);
                let replay: Option<String> = row.get(4);
                Ok(ReplicationStanding {
                    application_name: row.get(0),
                    client_addr: row.get(1),
                    state: row.get(2),
                    sent_lsn: sent.as_deref().map(parse_lsn_column).transpose()?,
                    replay_lsn: replay.as_deref().map(parse_lsn_column).transpose()?,
                    sync_state: row.get(5),
                })
            })
            .collect()
    }

    /// Trivial query proving the connection is alive. Spawned as a ticker
    /// during long copies so that NAT/firewall idle timers never fire.
    pub async fn keepalive(&self) -> anyhow::Result<()> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| BarmanError::Connection(format!("keepalive failed: {e}")))?;
        Ok(())
    }

    /// Run the keepalive on an interval until cancelled. Errors are logged
    /// and terminate the ticker: a broken control connection will fail the
    /// enclosing operation on its next real query.
    pub fn spawn_keepalive(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let conn = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = conn.keepalive().await {
                            warn!("keepalive ticker stopping: {e:#}");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn protocol_err(what: &'static str) -> impl Fn(tokio_postgres::Error) -> anyhow::Error {
    move |e| BarmanError::Protocol(format!("{what} failed: {e}")).into()
}

fn parse_lsn_column(text: &str) -> anyhow::Result<Lsn> {
    text.parse::<Lsn>()
        .map_err(|_| BarmanError::Protocol(format!("server returned unparsable LSN {text:?}")).into())
}

/// SQL for the concurrent backup-start call, by server version. The
/// functions were renamed in PostgreSQL 15; both spellings are concurrent,
/// the old exclusive variant is never requested.
fn backup_start_sql(version_num: u32) -> &'static str {
    if version_num >= BACKUP_CONTROL_RENAME_VERSION {
        "SELECT pg_backup_start($1, $2)::text"
    } else {
        "SELECT pg_start_backup($1, $2, false)::text"
    }
}

fn backup_stop_sql(version_num: u32) -> &'static str {
    if version_num >= BACKUP_CONTROL_RENAME_VERSION {
        "SELECT lsn::text, labelfile, spcmapfile FROM pg_backup_stop(wait_for_archive => false)"
    } else {
        "SELECT lsn::text, labelfile, spcmapfile FROM pg_stop_backup(false, false)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_control_sql_tracks_the_rename() {
        assert!(backup_start_sql(140005).contains("pg_start_backup"));
        assert!(backup_start_sql(150000).contains("pg_backup_start"));
        assert!(backup_stop_sql(140005).contains("pg_stop_backup"));
        assert!(backup_stop_sql(160002).contains("pg_backup_stop"));
    }

    #[test]
    fn lsn_column_parsing() {
        assert_eq!(parse_lsn_column("0/2000028").unwrap(), Lsn(0x2000028));
        assert!(parse_lsn_column("not-an-lsn").is_err());
    }
}
