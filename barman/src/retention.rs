//! Retention and obsolescence.
//!
//! The policy is parsed once into an algebraic value and evaluated against a
//! snapshot of the catalog. Classification is read-only; the reclaim phase
//! is the only part that mutates the store, under the server lock.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup_info::{BackupInfo, BackupStatus, BackupType, KeepTarget};
use crate::catalog::{self, BackupFilter, Catalog};
use crate::config::ServerConfig;
use crate::error::BarmanError;
use crate::hooks::{self, HookEnvironment, HookEvent, HookPhase};
use crate::xlog;

/// A parsed retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the n newest DONE backups.
    Redundancy(u32),
    /// Keep everything needed to reach any instant in the window ending now.
    RecoveryWindow(Duration),
}

static REDUNDANCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*REDUNDANCY\s+(\d+)\s*$").unwrap());
static WINDOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*RECOVERY\s+WINDOW\s+OF\s+(\d+)\s+(DAYS?|WEEKS?|MONTHS?)\s*$").unwrap()
});

impl RetentionPolicy {
    pub fn parse(s: &str) -> anyhow::Result<RetentionPolicy> {
        if let Some(captures) = REDUNDANCY_RE.captures(s) {
            let n: u32 = captures[1].parse()?;
            return Ok(RetentionPolicy::Redundancy(n));
        }
        if let Some(captures) = WINDOW_RE.captures(s) {
            let n: i64 = captures[1].parse()?;
            let unit = captures[2].to_ascii_uppercase();
            let window = match unit.trim_end_matches('S') {
                "DAY" => Duration::days(n),
                "WEEK" => Duration::weeks(n),
                "MONTH" => Duration::days(30 * n),
                _ => unreachable!("the regex only admits known units"),
            };
            return Ok(RetentionPolicy::RecoveryWindow(window));
        }
        Err(BarmanError::Configuration(format!(
            "unparsable retention policy {s:?}; expected 'REDUNDANCY n' or \
             'RECOVERY WINDOW OF n {{DAYS|WEEKS|MONTHS}}'"
        ))
        .into())
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Redundancy(n) => write!(f, "REDUNDANCY {n}"),
            RetentionPolicy::RecoveryWindow(window) => {
                write!(f, "RECOVERY WINDOW OF {} DAYS", window.num_days())
            }
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RetentionPolicy::parse(s)
    }
}

/// Classification of one backup against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupClass {
    Valid,
    Obsolete,
    KeepFull,
    KeepStandalone,
}

impl BackupClass {
    pub fn is_retained(self) -> bool {
        !matches!(self, BackupClass::Obsolete)
    }
}

/// The read-only outcome of a retention pass over a catalog snapshot.
#[derive(Debug, PartialEq, Eq)]
pub struct RetentionReport {
    /// backup id → class, covering every DONE backup in the snapshot.
    pub backups: BTreeMap<String, BackupClass>,
    /// Archived names to reclaim, in index order.
    pub reclaimable_wals: Vec<String>,
    pub warnings: Vec<String>,
}

/// Classify every DONE backup and every archived WAL in the snapshot.
pub fn classify(
    policy: RetentionPolicy,
    minimum_redundancy: u32,
    snapshot: &[BackupInfo],
    xlogdb: &[catalog::XlogDbEntry],
    now: DateTime<Utc>,
) -> RetentionReport {
    let mut warnings = Vec::new();

    // Ordered sequence of DONE backups, begin-time ascending. Ids are
    // timestamps, so they break ties deterministically.
    let mut done: Vec<&BackupInfo> = snapshot
        .iter()
        .filter(|b| b.status == BackupStatus::Done)
        .collect();
    done.sort_by_key(|b| (b.begin_time, b.backup_id.clone()));

    // Block-level chains are judged through their root; resolve each backup
    // to its chain root first.
    let by_id: BTreeMap<&str, &BackupInfo> =
        done.iter().map(|b| (b.backup_id.as_str(), *b)).collect();
    fn root_of<'a>(
        mut backup: &'a BackupInfo,
        by_id: &BTreeMap<&str, &'a BackupInfo>,
    ) -> &'a str {
        while backup.backup_type == BackupType::IncrementalBlockLevel {
            match backup
                .parent_backup_id
                .as_deref()
                .and_then(|id| by_id.get(id))
            {
                Some(parent) => backup = parent,
                None => break,
            }
        }
        backup.backup_id.as_str()
    }

    // Policy decision over the chain roots only.
    let roots: Vec<&BackupInfo> = done
        .iter()
        .filter(|b| b.backup_type != BackupType::IncrementalBlockLevel)
        .copied()
        .collect();

    let mut root_class: BTreeMap<&str, BackupClass> = BTreeMap::new();
    for root in &roots {
        if let Some(keep) = root.keep {
            let class = match keep {
                KeepTarget::Full => BackupClass::KeepFull,
                KeepTarget::Standalone => BackupClass::KeepStandalone,
            };
            root_class.insert(root.backup_id.as_str(), class);
        }
    }

    let unpinned: Vec<&BackupInfo> = roots
        .iter()
        .filter(|b| b.keep.is_none())
        .copied()
        .collect();
    let valid_from = match policy {
        RetentionPolicy::Redundancy(n) => unpinned.len().saturating_sub(n as usize),
        RetentionPolicy::RecoveryWindow(window) => {
            let horizon = now - window;
            // The oldest VALID backup is the newest one that can reach the
            // start of the window.
            let anchor = unpinned
                .iter()
                .rposition(|b| b.begin_time.map(|t| t <= horizon).unwrap_or(false));
            match anchor {
                Some(idx) => idx,
                // Every backup begins inside the window: all VALID.
                None => 0,
            }
        }
    };
    for (idx, backup) in unpinned.iter().enumerate() {
        let class = if idx >= valid_from {
            BackupClass::Valid
        } else {
            BackupClass::Obsolete
        };
        root_class.insert(backup.backup_id.as_str(), class);
    }

    // Minimum-redundancy floor: promote the newest OBSOLETE backups back to
    // VALID until the floor is met.
    let mut valid_count = root_class
        .values()
        .filter(|c| c.is_retained())
        .count() as u32;
    if valid_count < minimum_redundancy {
        for backup in unpinned.iter().rev() {
            if valid_count >= minimum_redundancy {
                break;
            }
            let class = root_class
                .get_mut(backup.backup_id.as_str())
                .expect("every unpinned root is classified");
            if *class == BackupClass::Obsolete {
                warnings.push(format!(
                    "backup '{}' is obsolete by policy but retained to satisfy \
                     minimum_redundancy = {minimum_redundancy}",
                    backup.backup_id
                ));
                *class = BackupClass::Valid;
                valid_count += 1;
            }
        }
    }

    // Chains inherit the class of their root.
    let mut backups = BTreeMap::new();
    for backup in &done {
        let root = root_of(backup, &by_id);
        let class = root_class
            .get(root)
            .copied()
            // An orphaned chain (root already gone) keeps nothing alive.
            .unwrap_or(BackupClass::Obsolete);
        backups.insert(backup.backup_id.clone(), class);
    }

    // WAL classification. A segment is retained from the begin_wal of the
    // oldest continuously-retained backup onward; older segments survive
    // only inside the explicit ranges of KEEP-pinned backups.
    let retained_infos: Vec<&BackupInfo> = done
        .iter()
        .filter(|b| backups[&b.backup_id].is_retained())
        .copied()
        .collect();
    let reclaimable_wals = match retained_infos.first() {
        None if done.is_empty() => Vec::new(), // nothing to anchor on, keep all WAL
        None => Vec::new(),
        Some(_) => {
            let continuous_threshold = retained_infos
                .iter()
                .filter(|b| backups[&b.backup_id] != BackupClass::KeepStandalone)
                .filter_map(|b| b.begin_wal.as_deref())
                .min_by_key(|name| xlog::sort_key(name));
            let mut standalone_ranges: Vec<(String, String)> = Vec::new();
            for backup in &retained_infos {
                if backups[&backup.backup_id] == BackupClass::KeepStandalone {
                    if let (Some(begin), Some(end)) =
                        (backup.begin_wal.clone(), backup.end_wal.clone())
                    {
                        standalone_ranges.push((begin, end));
                    }
                }
            }
            xlogdb
                .iter()
                .filter(|entry| {
                    if xlog::is_history_name(&entry.name) {
                        return false; // timeline history is always retained
                    }
                    let key = xlog::sort_key(&entry.name);
                    if let Some(threshold) = continuous_threshold {
                        if key >= xlog::sort_key(threshold) {
                            return false;
                        }
                    }
                    !standalone_ranges.iter().any(|(begin, end)| {
                        key >= xlog::sort_key(begin) && key <= xlog::sort_key(end)
                    })
                })
                .map(|entry| entry.name.clone())
                .collect()
        }
    };

    RetentionReport {
        backups,
        reclaimable_wals,
        warnings,
    }
}

/// Refuse deletions that retention rules forbid: KEEP pins and the
/// minimum-redundancy floor.
pub fn ensure_deletable(
    server: &ServerConfig,
    snapshot: &[BackupInfo],
    target: &BackupInfo,
) -> anyhow::Result<()> {
    if let Some(keep) = target.keep {
        return Err(BarmanError::RetentionViolation(format!(
            "backup '{}' is pinned with keep:{keep}",
            target.backup_id
        ))
        .into());
    }
    if target.status == BackupStatus::Done {
        let done_count = snapshot
            .iter()
            .filter(|b| b.status == BackupStatus::Done)
            .count() as u32;
        if done_count <= server.minimum_redundancy {
            return Err(BarmanError::RetentionViolation(format!(
                "deleting backup '{}' would leave {} DONE backups, below \
                 minimum_redundancy = {}",
                target.backup_id,
                done_count.saturating_sub(1),
                server.minimum_redundancy
            ))
            .into());
        }
    }
    Ok(())
}

/// What an applied retention pass actually removed.
#[derive(Debug, Default)]
pub struct RetentionOutcome {
    pub deleted_backups: Vec<String>,
    pub reclaimed_wals: usize,
    pub warnings: Vec<String>,
}

/// Run classification against a fresh snapshot and reclaim everything
/// OBSOLETE. Takes the server lock; mutations by other commands during the
/// pass are observed only by the next pass.
pub async fn apply_retention(
    server: &ServerConfig,
    dry_run: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<RetentionOutcome> {
    let Some(policy) = server.retention_policy else {
        return Err(BarmanError::Configuration(format!(
            "server '{}' has no retention_policy",
            server.name
        ))
        .into());
    };
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;
    let _server_lock = catalog.try_lock(catalog::SERVER_LOCK)?;

    let snapshot = catalog.list_backups(&BackupFilter::default())?;
    let xlogdb = catalog.read_xlogdb()?;
    let report = classify(policy, server.minimum_redundancy, &snapshot, &xlogdb, Utc::now());
    for warning in &report.warnings {
        warn!("{warning}");
    }

    let mut outcome = RetentionOutcome {
        warnings: report.warnings.clone(),
        ..Default::default()
    };
    if dry_run {
        return Ok(outcome);
    }

    // Obsolete backups first, newest first so block-level children go
    // before their parents.
    let mut obsolete: Vec<&BackupInfo> = snapshot
        .iter()
        .filter(|b| report.backups.get(&b.backup_id) == Some(&BackupClass::Obsolete))
        .collect();
    obsolete.sort_by(|a, b| b.backup_id.cmp(&a.backup_id));
    for backup in obsolete {
        if cancel.is_cancelled() {
            info!("retention pass cancelled");
            return Ok(outcome);
        }
        let env = HookEnvironment::new(server).with_backup(
            backup,
            &catalog.backup_dir(&backup.backup_id),
            None,
            None,
        );
        if hooks::run_hooks(server, HookEvent::Delete, HookPhase::Pre, &env).await?
            == hooks::HookOutcome::Abort
        {
            warn!("pre-delete hook aborted deletion of '{}'", backup.backup_id);
            continue;
        }
        catalog.delete_backup(&backup.backup_id)?;
        info!("deleted obsolete backup '{}'", backup.backup_id);
        outcome.deleted_backups.push(backup.backup_id.clone());
        hooks::run_hooks(server, HookEvent::Delete, HookPhase::Post, &env).await?;
    }

    // Then the WAL files, then the index, under the archive lock.
    if !report.reclaimable_wals.is_empty() {
        let _archive_lock = catalog.try_lock(catalog::ARCHIVE_LOCK)?;
        let reclaim: std::collections::BTreeSet<&str> = report
            .reclaimable_wals
            .iter()
            .map(String::as_str)
            .collect();
        for name in &report.reclaimable_wals {
            if cancel.is_cancelled() {
                break;
            }
            let path = catalog
                .find_wal_file(name)?
                .unwrap_or_else(|| catalog.wal_path(name, None));
            let env = HookEnvironment::new(server).with_wal(name, &path, 0, 0, None);
            hooks::run_hooks(server, HookEvent::WalDelete, HookPhase::Pre, &env).await?;
            catalog.remove_wal_file(name)?;
            outcome.reclaimed_wals += 1;
            hooks::run_hooks(server, HookEvent::WalDelete, HookPhase::Post, &env).await?;
        }
        let remaining: Vec<_> = xlogdb
            .into_iter()
            .filter(|entry| !reclaim.contains(entry.name.as_str()))
            .collect();
        catalog.rewrite_xlogdb(&remaining)?;
        info!("reclaimed {} WAL files", outcome.reclaimed_wals);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_info::BackupMode;
    use crate::catalog::XlogDbEntry;

    fn done_backup(id: &str, begin_days_ago: i64, now: DateTime<Utc>) -> BackupInfo {
        let mut info = BackupInfo::new(id, "main", BackupMode::Rsync, BackupType::Full);
        info.status = BackupStatus::Done;
        info.begin_time = Some(now - Duration::days(begin_days_ago));
        info.end_time = info.begin_time.map(|t| t + Duration::minutes(10));
        info
    }

    fn xlog_entries(names: &[&str]) -> Vec<XlogDbEntry> {
        names
            .iter()
            .map(|name| XlogDbEntry {
                name: name.to_string(),
                size: 16777216,
                time: 0,
                compression: None,
            })
            .collect()
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(
            RetentionPolicy::parse("REDUNDANCY 4").unwrap(),
            RetentionPolicy::Redundancy(4)
        );
        assert_eq!(
            RetentionPolicy::parse("recovery window of 7 days").unwrap(),
            RetentionPolicy::RecoveryWindow(Duration::days(7))
        );
        assert_eq!(
            RetentionPolicy::parse("RECOVERY WINDOW OF 2 WEEKS").unwrap(),
            RetentionPolicy::RecoveryWindow(Duration::weeks(2))
        );
        assert_eq!(
            RetentionPolicy::parse("RECOVERY WINDOW OF 1 MONTH").unwrap(),
            RetentionPolicy::RecoveryWindow(Duration::days(30))
        );
        assert!(RetentionPolicy::parse("KEEP FOREVER").is_err());
        assert!(RetentionPolicy::parse("REDUNDANCY").is_err());
    }

    #[test]
    fn redundancy_keeps_the_newest_n() {
        let now = Utc::now();
        let snapshot = vec![
            done_backup("20260701T000000", 31, now),
            done_backup("20260715T000000", 17, now),
            done_backup("20260729T000000", 3, now),
        ];
        let report = classify(RetentionPolicy::Redundancy(2), 0, &snapshot, &[], now);
        assert_eq!(report.backups["20260701T000000"], BackupClass::Obsolete);
        assert_eq!(report.backups["20260715T000000"], BackupClass::Valid);
        assert_eq!(report.backups["20260729T000000"], BackupClass::Valid);
    }

    #[test]
    fn minimum_redundancy_floor_promotes_with_a_warning() {
        let now = Utc::now();
        let snapshot = vec![
            done_backup("20260701T000000", 31, now),
            done_backup("20260715T000000", 17, now),
            done_backup("20260729T000000", 3, now),
        ];
        let report = classify(RetentionPolicy::Redundancy(1), 2, &snapshot, &[], now);
        assert_eq!(report.backups["20260701T000000"], BackupClass::Obsolete);
        assert_eq!(report.backups["20260715T000000"], BackupClass::Valid);
        assert_eq!(report.backups["20260729T000000"], BackupClass::Valid);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("minimum_redundancy")));
    }

    #[test]
    fn recovery_window_with_minimum_redundancy_floor() {
        // The seed scenario: backups at days -14, -10, -5, -1 with a 7-day
        // window and a floor of 2.
        let now = Utc::now();
        let mut b14 = done_backup("20260718T000000", 14, now);
        let mut b10 = done_backup("20260722T000000", 10, now);
        let b5 = done_backup("20260727T000000", 5, now);
        let b1 = done_backup("20260731T000000", 1, now);
        b14.begin_wal = Some("000000010000000000000010".into());
        b14.end_wal = Some("000000010000000000000011".into());
        b10.begin_wal = Some("000000010000000000000020".into());
        b10.end_wal = Some("000000010000000000000021".into());
        let mut b5 = b5;
        b5.begin_wal = Some("000000010000000000000030".into());
        let mut b1 = b1;
        b1.begin_wal = Some("000000010000000000000040".into());
        let snapshot = vec![b14, b10, b5, b1];

        let xlogdb = xlog_entries(&[
            "000000010000000000000010",
            "000000010000000000000015",
            "000000010000000000000020",
            "000000010000000000000025",
            "000000010000000000000030",
            "000000010000000000000040",
        ]);

        let report = classify(
            RetentionPolicy::RecoveryWindow(Duration::days(7)),
            2,
            &snapshot,
            &xlogdb,
            now,
        );
        // The -10 backup is the newest one able to reach the start of the
        // window, so it anchors VALID; only -14 is obsolete.
        assert_eq!(report.backups["20260718T000000"], BackupClass::Obsolete);
        assert_eq!(report.backups["20260722T000000"], BackupClass::Valid);
        assert_eq!(report.backups["20260727T000000"], BackupClass::Valid);
        assert_eq!(report.backups["20260731T000000"], BackupClass::Valid);

        // WAL older than the begin_wal of the retained -10 backup goes.
        assert_eq!(
            report.reclaimable_wals,
            vec![
                "000000010000000000000010".to_string(),
                "000000010000000000000015".to_string(),
            ]
        );
    }

    #[test]
    fn window_entirely_covered_keeps_everything() {
        let now = Utc::now();
        let snapshot = vec![
            done_backup("20260730T000000", 2, now),
            done_backup("20260731T000000", 1, now),
        ];
        let report = classify(
            RetentionPolicy::RecoveryWindow(Duration::days(7)),
            0,
            &snapshot,
            &[],
            now,
        );
        assert!(report.backups.values().all(|c| *c == BackupClass::Valid));
    }

    #[test]
    fn keep_pins_survive_any_policy() {
        let now = Utc::now();
        let mut pinned = done_backup("20260601T000000", 61, now);
        pinned.keep = Some(KeepTarget::Standalone);
        pinned.begin_wal = Some("000000010000000000000001".into());
        pinned.end_wal = Some("000000010000000000000002".into());
        let mut recent = done_backup("20260731T000000", 1, now);
        recent.begin_wal = Some("000000010000000000000050".into());
        let snapshot = vec![pinned, recent];

        let xlogdb = xlog_entries(&[
            "000000010000000000000001",
            "000000010000000000000002",
            "000000010000000000000003",
            "000000010000000000000050",
        ]);
        let report = classify(RetentionPolicy::Redundancy(1), 0, &snapshot, &xlogdb, now);
        assert_eq!(report.backups["20260601T000000"], BackupClass::KeepStandalone);
        assert_eq!(report.backups["20260731T000000"], BackupClass::Valid);
        // The standalone pin retains exactly its own range; the segment
        // after it is reclaimable.
        assert_eq!(
            report.reclaimable_wals,
            vec!["000000010000000000000003".to_string()]
        );
    }

    #[test]
    fn block_level_chain_follows_its_root() {
        let now = Utc::now();
        let root_old = done_backup("20260710T000000", 22, now);
        let mut child_old = done_backup("20260711T000000", 21, now);
        child_old.backup_type = BackupType::IncrementalBlockLevel;
        child_old.parent_backup_id = Some("20260710T000000".into());
        child_old.mode = BackupMode::PostgresStreaming;
        let root_new = done_backup("20260730T000000", 2, now);
        let mut child_new = done_backup("20260731T000000", 1, now);
        child_new.backup_type = BackupType::IncrementalBlockLevel;
        child_new.parent_backup_id = Some("20260730T000000".into());
        child_new.mode = BackupMode::PostgresStreaming;

        let snapshot = vec![root_old, child_old, root_new, child_new];
        let report = classify(RetentionPolicy::Redundancy(1), 0, &snapshot, &[], now);

        assert_eq!(report.backups["20260710T000000"], BackupClass::Obsolete);
        assert_eq!(report.backups["20260711T000000"], BackupClass::Obsolete);
        assert_eq!(report.backups["20260730T000000"], BackupClass::Valid);
        assert_eq!(report.backups["20260731T000000"], BackupClass::Valid);
    }

    #[test]
    fn classification_is_idempotent() {
        let now = Utc::now();
        let snapshot = vec![
            done_backup("20260701T000000", 31, now),
            done_backup("20260729T000000", 3, now),
        ];
        let xlogdb = xlog_entries(&["000000010000000000000001"]);
        let first = classify(RetentionPolicy::Redundancy(1), 1, &snapshot, &xlogdb, now);
        let second = classify(RetentionPolicy::Redundancy(1), 1, &snapshot, &xlogdb, now);
        assert_eq!(first, second);
    }

    #[test]
    fn deletions_respect_pins_and_the_floor() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=db'
archiver = true
minimum_redundancy = 2
"#,
            home = dir.path()
        );
        let config = crate::config::Config::from_toml(&toml, &[]).unwrap();
        let server = config.server("main").unwrap();

        let now = Utc::now();
        let mut pinned = done_backup("20260701T000000", 31, now);
        pinned.keep = Some(KeepTarget::Full);
        let plain = done_backup("20260729T000000", 3, now);
        let snapshot = vec![pinned.clone(), plain.clone()];

        let err = ensure_deletable(server, &snapshot, &pinned).unwrap_err();
        assert!(err.to_string().contains("pinned"));

        let err = ensure_deletable(server, &snapshot, &plain).unwrap_err();
        assert!(err.to_string().contains("minimum_redundancy"));

        // A FAILED backup is never floor-protected.
        let mut failed = done_backup("20260730T000000", 2, now);
        failed.status = BackupStatus::Failed;
        assert!(ensure_deletable(server, &snapshot, &failed).is_ok());
    }
}
