//! The backup entity and its on-disk metadata file.
//!
//! Every backup directory carries a `backup.info` file of `key=value` lines.
//! External tooling parses this file, so the key set and the value grammar
//! are a stable interface: RFC 3339 timestamps, `None` for absent optionals,
//! and a JSON array for the tablespace list.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;

use crate::error::BarmanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Empty,
    Started,
    WaitingForWals,
    Done,
    Failed,
    /// Only ever set on passive replicas of another barman host.
    Syncing,
}

impl BackupStatus {
    /// DONE and FAILED are terminal apart from deletion.
    pub fn is_terminal(self) -> bool {
        matches!(self, BackupStatus::Done | BackupStatus::Failed)
    }

    /// The legal forward transitions of the orchestrator state machine.
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        matches!(
            (self, next),
            (Empty, Started)
                | (Started, WaitingForWals)
                | (Started, Done)
                | (Started, Failed)
                | (WaitingForWals, Done)
                | (WaitingForWals, Failed)
                | (Syncing, Done)
                | (Syncing, Failed)
        )
    }
}

/// How the copy was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackupMode {
    Rsync,
    PostgresStreaming,
    Snapshot,
    LocalRsync,
}

/// What the backup contains relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackupType {
    Full,
    IncrementalFileLevel,
    IncrementalBlockLevel,
    Snapshot,
}

impl BackupType {
    pub fn is_incremental(self) -> bool {
        matches!(
            self,
            BackupType::IncrementalFileLevel | BackupType::IncrementalBlockLevel
        )
    }
}

/// Operator pin exempting a backup from retention-driven deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeepTarget {
    /// Keep the backup and all WALs up to the next backup.
    Full,
    /// Keep only the backup and its own required WAL range.
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablespace {
    pub name: String,
    pub oid: u32,
    pub location: String,
}

/// In-memory form of one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub server_name: String,
    pub backup_name: Option<String>,
    pub status: BackupStatus,
    pub mode: BackupMode,
    pub backup_type: BackupType,
    pub parent_backup_id: Option<String>,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub begin_lsn: Option<Lsn>,
    pub end_lsn: Option<Lsn>,
    pub begin_wal: Option<String>,
    pub end_wal: Option<String>,
    pub timeline: Option<u32>,
    pub systemid: Option<String>,
    pub size: Option<u64>,
    pub deduplicated_size: Option<u64>,
    pub compression: Option<String>,
    pub keep: Option<KeepTarget>,
    pub tablespaces: Vec<Tablespace>,
    pub included_files: Vec<String>,
    pub server_version: Option<u32>,
}

impl BackupInfo {
    /// Fresh EMPTY entry, before the orchestrator has touched PostgreSQL.
    pub fn new(backup_id: &str, server_name: &str, mode: BackupMode, backup_type: BackupType) -> Self {
        BackupInfo {
            backup_id: backup_id.to_string(),
            server_name: server_name.to_string(),
            backup_name: None,
            status: BackupStatus::Empty,
            mode,
            backup_type,
            parent_backup_id: None,
            begin_time: None,
            end_time: None,
            begin_lsn: None,
            end_lsn: None,
            begin_wal: None,
            end_wal: None,
            timeline: None,
            systemid: None,
            size: None,
            deduplicated_size: None,
            compression: None,
            keep: None,
            tablespaces: Vec::new(),
            included_files: Vec::new(),
            server_version: None,
        }
    }

    /// Generate a backup id from a timestamp. Uniqueness under serial
    /// creation is enforced by the backup lock, which outlives id selection.
    pub fn generate_id(now: DateTime<Utc>) -> String {
        now.format("%Y%m%dT%H%M%S").to_string()
    }

    fn put(out: &mut String, key: &str, value: impl fmt::Display) {
        out.push_str(key);
        out.push('=');
        out.push_str(&value.to_string());
        out.push('\n');
    }

    fn put_opt<T: fmt::Display>(out: &mut String, key: &str, value: &Option<T>) {
        match value {
            Some(v) => Self::put(out, key, v),
            None => Self::put(out, key, "None"),
        }
    }

    /// Render the backup.info file content.
    pub fn to_file_content(&self) -> String {
        let mut out = String::new();
        Self::put(&mut out, "backup_id", &self.backup_id);
        Self::put(&mut out, "server_name", &self.server_name);
        Self::put_opt(&mut out, "backup_name", &self.backup_name);
        Self::put(&mut out, "status", self.status);
        Self::put(&mut out, "mode", self.mode);
        Self::put(&mut out, "backup_type", self.backup_type);
        Self::put_opt(&mut out, "parent_backup_id", &self.parent_backup_id);
        Self::put_opt(
            &mut out,
            "begin_time",
            &self
                .begin_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        Self::put_opt(
            &mut out,
            "end_time",
            &self
                .end_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        Self::put_opt(&mut out, "begin_lsn", &self.begin_lsn);
        Self::put_opt(&mut out, "end_lsn", &self.end_lsn);
        Self::put_opt(&mut out, "begin_wal", &self.begin_wal);
        Self::put_opt(&mut out, "end_wal", &self.end_wal);
        Self::put_opt(&mut out, "timeline", &self.timeline);
        Self::put_opt(&mut out, "systemid", &self.systemid);
        Self::put_opt(&mut out, "size", &self.size);
        Self::put_opt(&mut out, "deduplicated_size", &self.deduplicated_size);
        Self::put_opt(&mut out, "compression", &self.compression);
        Self::put_opt(&mut out, "keep", &self.keep);
        Self::put(
            &mut out,
            "tablespaces",
            serde_json::to_string(&self.tablespaces).expect("tablespace list is serializable"),
        );
        Self::put(
            &mut out,
            "included_files",
            serde_json::to_string(&self.included_files).expect("file list is serializable"),
        );
        Self::put_opt(&mut out, "server_version", &self.server_version);
        out
    }

    /// Parse a backup.info file. Unknown keys are preserved-by-ignoring so
    /// that newer writers do not break older readers.
    pub fn from_file_content(content: &str) -> anyhow::Result<BackupInfo> {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                BarmanError::Catalog(format!(
                    "backup.info line {} is not key=value: {line:?}",
                    lineno + 1
                ))
            })?;
            fields.insert(key, value);
        }

        fn required<'a>(
            fields: &BTreeMap<&str, &'a str>,
            key: &str,
        ) -> anyhow::Result<&'a str> {
            fields
                .get(key)
                .copied()
                .ok_or_else(|| BarmanError::Catalog(format!("backup.info misses key '{key}'")).into())
        }

        fn optional<'a>(fields: &BTreeMap<&str, &'a str>, key: &str) -> Option<&'a str> {
            fields.get(key).copied().filter(|v| *v != "None")
        }

        fn parse_opt<T: FromStr>(
            fields: &BTreeMap<&str, &str>,
            key: &str,
        ) -> anyhow::Result<Option<T>>
        where
            T::Err: fmt::Display,
        {
            optional(fields, key)
                .map(|v| {
                    v.parse::<T>().map_err(|e| {
                        anyhow::Error::new(BarmanError::Catalog(format!(
                            "backup.info key '{key}' has bad value {v:?}: {e}"
                        )))
                    })
                })
                .transpose()
        }

        let parse_time = |key: &str| -> anyhow::Result<Option<DateTime<Utc>>> {
            optional(&fields, key)
                .map(|v| {
                    DateTime::parse_from_rfc3339(v)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| {
                            anyhow::Error::new(BarmanError::Catalog(format!(
                                "backup.info key '{key}' has bad timestamp {v:?}: {e}"
                            )))
                        })
                })
                .transpose()
        };

        let tablespaces: Vec<Tablespace> = match optional(&fields, "tablespaces") {
            Some(v) => serde_json::from_str(v).context("parsing tablespaces")?,
            None => Vec::new(),
        };
        let included_files: Vec<String> = match optional(&fields, "included_files") {
            Some(v) => serde_json::from_str(v).context("parsing included_files")?,
            None => Vec::new(),
        };

        Ok(BackupInfo {
            backup_id: required(&fields, "backup_id")?.to_string(),
            server_name: required(&fields, "server_name")?.to_string(),
            backup_name: optional(&fields, "backup_name").map(str::to_string),
            status: required(&fields, "status")?
                .parse()
                .map_err(|_| BarmanError::Catalog("bad status value".into()))?,
            mode: required(&fields, "mode")?
                .parse()
                .map_err(|_| BarmanError::Catalog("bad mode value".into()))?,
            backup_type: required(&fields, "backup_type")?
                .parse()
                .map_err(|_| BarmanError::Catalog("bad backup_type value".into()))?,
            parent_backup_id: optional(&fields, "parent_backup_id").map(str::to_string),
            begin_time: parse_time("begin_time")?,
            end_time: parse_time("end_time")?,
            begin_lsn: parse_opt(&fields, "begin_lsn")?,
            end_lsn: parse_opt(&fields, "end_lsn")?,
            begin_wal: optional(&fields, "begin_wal").map(str::to_string),
            end_wal: optional(&fields, "end_wal").map(str::to_string),
            timeline: parse_opt(&fields, "timeline")?,
            systemid: optional(&fields, "systemid").map(str::to_string),
            size: parse_opt(&fields, "size")?,
            deduplicated_size: parse_opt(&fields, "deduplicated_size")?,
            compression: optional(&fields, "compression").map(str::to_string),
            keep: parse_opt(&fields, "keep")?,
            tablespaces,
            included_files,
            server_version: parse_opt(&fields, "server_version")?,
        })
    }
}
