//! The check framework: named per-server predicates feeding both human
//! output and monitoring systems.

use serde::Serialize;

use crate::backup_info::BackupStatus;
use crate::catalog::{BackupFilter, Catalog};
use crate::config::ServerConfig;
use crate::postgres::PostgresConnection;
use crate::receive_wal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Ok,
    Warning,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub hint: Option<String>,
}

impl CheckResult {
    fn ok(name: &'static str) -> Self {
        CheckResult {
            name,
            status: CheckStatus::Ok,
            hint: None,
        }
    }

    fn ok_with(name: &'static str, hint: impl Into<String>) -> Self {
        CheckResult {
            name,
            status: CheckStatus::Ok,
            hint: Some(hint.into()),
        }
    }

    fn warning(name: &'static str, hint: impl Into<String>) -> Self {
        CheckResult {
            name,
            status: CheckStatus::Warning,
            hint: Some(hint.into()),
        }
    }

    fn failed(name: &'static str, hint: impl Into<String>) -> Self {
        CheckResult {
            name,
            status: CheckStatus::Failed,
            hint: Some(hint.into()),
        }
    }
}

/// Evaluate every predicate for one server. Individual failures never stop
/// the sweep; each check reports independently.
pub async fn run_checks(server: &ServerConfig) -> Vec<CheckResult> {
    let catalog = Catalog::new(server);
    let mut results = Vec::new();

    // Backup directory writable.
    results.push(match catalog.ensure_layout() {
        Ok(()) => CheckResult::ok("backup directory"),
        Err(e) => CheckResult::failed("backup directory", format!("{e:#}")),
    });

    // PostgreSQL reachable, plus the probes that need the connection.
    match PostgresConnection::connect(&server.conninfo).await {
        Ok(conn) => {
            results.push(CheckResult::ok_with(
                "postgresql connection",
                format!("server version {}", conn.server_version_num()),
            ));
            if server.archiver {
                match conn.setting("archive_mode").await {
                    Ok(Some(mode)) if mode != "off" => {
                        match conn.setting("archive_command").await {
                            Ok(Some(cmd)) if !cmd.trim().is_empty() && cmd != "(disabled)" => {
                                results.push(CheckResult::ok("archive_command"));
                            }
                            Ok(_) => results.push(CheckResult::failed(
                                "archive_command",
                                "archive_mode is on but archive_command is not set",
                            )),
                            Err(e) => results
                                .push(CheckResult::failed("archive_command", format!("{e:#}"))),
                        }
                    }
                    Ok(_) => results.push(CheckResult::failed(
                        "archive_command",
                        "archive_mode is off on the server",
                    )),
                    Err(e) => {
                        results.push(CheckResult::failed("archive_command", format!("{e:#}")))
                    }
                }
            }
            if let Some(slot_name) = &server.slot_name {
                match conn.slot_status(slot_name).await {
                    Ok(Some(active)) => {
                        if active || !server.streaming_archiver {
                            results.push(CheckResult::ok("replication slot"));
                        } else {
                            results.push(CheckResult::warning(
                                "replication slot",
                                format!("slot '{slot_name}' exists but has no consumer"),
                            ));
                        }
                    }
                    Ok(None) => results.push(CheckResult::failed(
                        "replication slot",
                        format!("slot '{slot_name}' does not exist"),
                    )),
                    Err(e) => {
                        results.push(CheckResult::failed("replication slot", format!("{e:#}")))
                    }
                }
            }
        }
        Err(e) => results.push(CheckResult::failed("postgresql connection", format!("{e:#}"))),
    }

    // Replication (streaming) connection.
    if server.streaming_archiver {
        let conninfo = server
            .streaming_conninfo
            .as_deref()
            .unwrap_or(&server.conninfo);
        results.push(match PostgresConnection::connect(conninfo).await {
            Ok(_) => CheckResult::ok("replication connection"),
            Err(e) => CheckResult::failed("replication connection", format!("{e:#}")),
        });

        // Receiver liveness.
        results.push(match receive_wal::receiver_pid(&catalog) {
            Some(pid) => CheckResult::ok_with("receive-wal running", format!("pid {pid}")),
            None => CheckResult::warning(
                "receive-wal running",
                "no streaming receiver is alive for this server",
            ),
        });
    }

    // Rejected WAL quarantine must be empty.
    results.push(match failed_wal_count(server) {
        Ok(0) => CheckResult::ok("failed WAL files"),
        Ok(n) => CheckResult::failed(
            "failed WAL files",
            format!("{n} file(s) in {}", server.errors_directory),
        ),
        Err(e) => CheckResult::failed("failed WAL files", format!("{e:#}")),
    });

    // Catalog-level checks.
    match catalog.list_backups(&BackupFilter {
        status: Some(BackupStatus::Done),
        ..Default::default()
    }) {
        Ok(done) => {
            let count = done.len() as u32;
            if count >= server.minimum_redundancy {
                results.push(CheckResult::ok_with(
                    "minimum redundancy",
                    format!("{count} backups, expected at least {}", server.minimum_redundancy),
                ));
            } else {
                results.push(CheckResult::failed(
                    "minimum redundancy",
                    format!("{count} backups, expected at least {}", server.minimum_redundancy),
                ));
            }

            if let Some(maximum_age) = server.last_backup_maximum_age {
                let newest_end = done.last().and_then(|b| b.end_time);
                let fresh = newest_end
                    .map(|end| {
                        chrono::Utc::now() - end
                            <= chrono::Duration::from_std(maximum_age)
                                .unwrap_or_else(|_| chrono::Duration::days(36500))
                    })
                    .unwrap_or(false);
                results.push(if fresh {
                    CheckResult::ok("backup maximum age")
                } else {
                    CheckResult::failed(
                        "backup maximum age",
                        "no backup within the configured maximum age",
                    )
                });
            }
        }
        Err(e) => results.push(CheckResult::failed("minimum redundancy", format!("{e:#}"))),
    }

    // Corrupt metadata blocks retention, so surface it here.
    match catalog.corrupt_backups() {
        Ok(bad) if bad.is_empty() => results.push(CheckResult::ok("backup metadata")),
        Ok(bad) => results.push(CheckResult::warning(
            "backup metadata",
            format!("unreadable backup.info for: {}", bad.join(", ")),
        )),
        Err(e) => results.push(CheckResult::failed("backup metadata", format!("{e:#}"))),
    }

    // Every indexed WAL file must exist in the archive.
    results.push(match xlogdb_consistency(&catalog) {
        Ok(None) => CheckResult::ok("wal archive consistency"),
        Ok(Some(missing)) => CheckResult::failed(
            "wal archive consistency",
            format!("xlog.db lists {missing} but the file is gone"),
        ),
        Err(e) => CheckResult::failed("wal archive consistency", format!("{e:#}")),
    });

    // Retention policy shape.
    results.push(match &server.retention_policy {
        Some(policy) => CheckResult::ok_with("retention policy", policy.to_string()),
        None => CheckResult::warning("retention policy", "no retention policy configured"),
    });

    results
}

fn failed_wal_count(server: &ServerConfig) -> anyhow::Result<usize> {
    if !server.errors_directory.is_dir() {
        return Ok(0);
    }
    Ok(server.errors_directory.read_dir_utf8()?.count())
}

fn xlogdb_consistency(catalog: &Catalog<'_>) -> anyhow::Result<Option<String>> {
    for entry in catalog.read_xlogdb()? {
        if catalog.find_wal_file(&entry.name)?.is_none() {
            return Ok(Some(entry.name));
        }
    }
    Ok(None)
}

/// Collapse a check run into the worst status, for exit codes and the
/// monitoring output line.
pub fn overall_status(results: &[CheckResult]) -> CheckStatus {
    results
        .iter()
        .map(|r| r.status)
        .max_by_key(|status| match status {
            CheckStatus::Ok => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Failed => 2,
        })
        .unwrap_or(CheckStatus::Ok)
}

/// One-line monitoring-tool rendering (nagios convention).
pub fn monitoring_line(server_name: &str, results: &[CheckResult]) -> String {
    let status = overall_status(results);
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| r.status == CheckStatus::Failed)
        .map(|r| r.name)
        .collect();
    match status {
        CheckStatus::Ok => format!("BARMAN OK - server {server_name} has no issues"),
        CheckStatus::Warning => {
            let warned: Vec<&str> = results
                .iter()
                .filter(|r| r.status == CheckStatus::Warning)
                .map(|r| r.name)
                .collect();
            format!(
                "BARMAN WARNING - server {server_name}: {}",
                warned.join(", ")
            )
        }
        CheckStatus::Failed => format!(
            "BARMAN CRITICAL - server {server_name} has failures: {}",
            failed.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use camino_tempfile::Utf8TempDir;
    use std::fs;

    fn test_server(home: &camino::Utf8Path, extra: &str) -> ServerConfig {
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=127.0.0.1 port=1 connect_timeout=1'
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

    fn result_for<'a>(results: &'a [CheckResult], name: &str) -> &'a CheckResult {
        results
            .iter()
            .find(|r| r.name == name)
            .unwrap_or_else(|| panic!("no check named {name}"))
    }

    #[tokio::test]
    async fn unreachable_server_fails_only_the_connection_checks() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "minimum_redundancy = 0");
        let results = run_checks(&server).await;

        assert_eq!(
            result_for(&results, "postgresql connection").status,
            CheckStatus::Failed
        );
        // Filesystem-side checks still pass.
        assert_eq!(
            result_for(&results, "backup directory").status,
            CheckStatus::Ok
        );
        assert_eq!(
            result_for(&results, "failed WAL files").status,
            CheckStatus::Ok
        );
        assert_eq!(overall_status(&results), CheckStatus::Failed);
    }

    #[tokio::test]
    async fn quarantined_wal_and_index_inconsistency_are_reported() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let cat = Catalog::new(&server);
        cat.ensure_layout().unwrap();

        // A duplication victim in errors/.
        fs::write(
            server.errors_directory.join("0000000100000001000000A0"),
            b"diverging",
        )
        .unwrap();
        // An indexed segment whose file was removed behind our back.
        cat.record_wal("000000010000000000000001", b"x", None).unwrap();
        cat.remove_wal_file("000000010000000000000001").unwrap();

        let results = run_checks(&server).await;
        let failed_wals = result_for(&results, "failed WAL files");
        assert_eq!(failed_wals.status, CheckStatus::Failed);
        assert!(failed_wals.hint.as_ref().unwrap().contains("1 file"));

        let consistency = result_for(&results, "wal archive consistency");
        assert_eq!(consistency.status, CheckStatus::Failed);
        assert!(consistency
            .hint
            .as_ref()
            .unwrap()
            .contains("000000010000000000000001"));
    }

    #[tokio::test]
    async fn minimum_redundancy_check_counts_done_backups() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "minimum_redundancy = 1");
        let cat = Catalog::new(&server);
        cat.ensure_layout().unwrap();

        let results = run_checks(&server).await;
        assert_eq!(
            result_for(&results, "minimum redundancy").status,
            CheckStatus::Failed
        );

        cat.create_backup_dir("20260801T090000").unwrap();
        let mut info = crate::backup_info::BackupInfo::new(
            "20260801T090000",
            "main",
            crate::backup_info::BackupMode::Rsync,
            crate::backup_info::BackupType::Full,
        );
        info.status = BackupStatus::Done;
        cat.write_backup_info(&info).unwrap();

        let results = run_checks(&server).await;
        assert_eq!(
            result_for(&results, "minimum redundancy").status,
            CheckStatus::Ok
        );
    }

    #[tokio::test]
    async fn corrupt_metadata_is_a_warning() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let cat = Catalog::new(&server);
        cat.ensure_layout().unwrap();
        cat.create_backup_dir("20260801T090000").unwrap();
        fs::write(
            cat.backup_info_path("20260801T090000"),
            "status DONE without equals sign\n",
        )
        .unwrap();

        let results = run_checks(&server).await;
        let metadata = result_for(&results, "backup metadata");
        assert_eq!(metadata.status, CheckStatus::Warning);
        assert!(metadata.hint.as_ref().unwrap().contains("20260801T090000"));
    }

    #[test]
    fn monitoring_line_shapes() {
        let ok = vec![CheckResult::ok("backup directory")];
        assert_eq!(
            monitoring_line("main", &ok),
            "BARMAN OK - server main has no issues"
        );

        let failing = vec![
            CheckResult::ok("backup directory"),
            CheckResult::failed("postgresql connection", "refused"),
        ];
        let line = monitoring_line("main", &failing);
        assert!(line.starts_with("BARMAN CRITICAL"));
        assert!(line.contains("postgresql connection"));
    }

}
