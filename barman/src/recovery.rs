//! The recovery planner.
//!
//! `recover` turns a catalog entry plus a recovery target into a directory
//! PostgreSQL can start from. Planning is pure and fails fast: every
//! precondition (backup state, staging paths, required WAL presence) is
//! checked before the destination is touched. Execution then stages,
//! copies, rewrites configuration, and cleans up after itself. The planner
//! never starts the instance.

use std::process::Stdio;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use utils::lsn::Lsn;

use crate::backup_info::{BackupInfo, BackupStatus, BackupType, Tablespace};
use crate::catalog::{BackupFilter, Catalog};
use crate::compression::{self, CompressionAlg};
use crate::config::ServerConfig;
use crate::error::BarmanError;
use crate::hooks::{self, HookEnvironment, HookEvent, HookOutcome, HookPhase};
use crate::xlog;

/// Options that would make the restored instance clobber the live one;
/// they are commented out of the restored configuration files.
pub const DANGEROUS_OPTIONS: &[&str] = &[
    "archive_command",
    "archive_cleanup_command",
    "primary_conninfo",
    "primary_slot_name",
    "recovery_end_command",
    "restore_command",
    "synchronous_standby_names",
];

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryTarget {
    /// Stop as soon as a consistent state is reached.
    Immediate,
    Time(DateTime<Utc>),
    Xid(String),
    Name(String),
    Lsn(Lsn),
    TimelineId(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TargetAction {
    Pause,
    Promote,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum Destination {
    Local(Utf8PathBuf),
    Remote {
        ssh_command: String,
        path: Utf8PathBuf,
    },
}

impl Destination {
    pub fn path(&self) -> &Utf8Path {
        match self {
            Destination::Local(path) => path,
            Destination::Remote { path, .. } => path,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Destination::Remote { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryOptions {
    pub destination: Utf8PathBuf,
    /// Remote recovery when set; the destination path lives on that host.
    pub remote_ssh_command: Option<String>,
    pub target: Option<RecoveryTarget>,
    /// Stop *before* the target instead of after it.
    pub exclusive: bool,
    pub target_action: Option<TargetAction>,
    pub standby_mode: bool,
    /// NAME:LOCATION redirections.
    pub tablespace_mappings: Vec<(String, Utf8PathBuf)>,
    /// Fetch WAL on demand instead of staging it.
    pub get_wal: bool,
    /// Rsync in place over a pre-existing destination.
    pub delta: bool,
    pub local_staging_path: Option<Utf8PathBuf>,
}

/// Everything `execute` needs, fully validated.
#[derive(Debug)]
pub struct RecoveryPlan {
    pub backup: BackupInfo,
    /// Root-first block-level chain ending at the chosen backup; a single
    /// element for everything else.
    pub chain: Vec<BackupInfo>,
    pub destination: Destination,
    /// Synthesis / decompression scratch space, when the backup shape
    /// requires one.
    pub staging_path: Option<Utf8PathBuf>,
    /// Archived names to stage into `pg_wal`, empty in get-wal mode.
    pub wal_range: Vec<String>,
    pub recovery_conf_lines: Vec<String>,
    pub signal_file: &'static str,
    pub tablespace_mappings: Vec<(Tablespace, Utf8PathBuf)>,
    pub delta: bool,
    pub get_wal: bool,
}

/// Build and validate a recovery plan. Nothing outside the catalog is read
/// and nothing at all is written.
pub fn plan(
    server: &ServerConfig,
    catalog: &Catalog<'_>,
    backup_spec: &str,
    options: &RecoveryOptions,
) -> anyhow::Result<RecoveryPlan> {
    // 1. Resolve the backup, including target-aware `auto`.
    let backup_id = if backup_spec == "auto" {
        resolve_auto(catalog, options.target.as_ref())?
    } else {
        catalog.resolve_backup_id(backup_spec)?
    };
    let backup = catalog.load_backup_info(&backup_id)?;
    if backup.status != BackupStatus::Done {
        return Err(BarmanError::UnsupportedOperation(format!(
            "backup '{backup_id}' is {}, only DONE backups are recoverable",
            backup.status
        ))
        .into());
    }
    validate_target(&backup, options.target.as_ref())?;

    // 2. Block-level chains are materialised through staging.
    let chain = resolve_chain(catalog, &backup)?;
    let compressed = backup.compression.is_some();
    let needs_staging = chain.len() > 1 || compressed;
    let staging_path = if needs_staging {
        let staging = options
            .local_staging_path
            .clone()
            .or_else(|| server.local_staging_path.clone())
            .or_else(|| server.recovery_staging_path.clone())
            .ok_or_else(|| {
                BarmanError::Configuration(
                    "this backup needs a staging path (local_staging_path) to be recovered".into(),
                )
            })?;
        if !staging.is_dir() {
            return Err(BarmanError::Configuration(format!(
                "staging path {staging:?} does not exist"
            ))
            .into());
        }
        Some(staging)
    } else {
        None
    };

    // 3. Delta restore is only safe when the tree on disk is the tree in
    //    the catalog: plain, full, uncompressed.
    if options.delta && (compressed || chain.len() > 1) {
        return Err(BarmanError::UnsupportedOperation(
            "delta restore is only available for uncompressed, non-incremental backups".into(),
        )
        .into());
    }

    // 4. The WAL fence must be in the archive before anything is copied,
    //    in every mode.
    let begin_wal = backup
        .begin_wal
        .clone()
        .ok_or_else(|| BarmanError::Catalog(format!("backup '{backup_id}' has no begin_wal")))?;
    let end_wal = backup
        .end_wal
        .clone()
        .ok_or_else(|| BarmanError::Catalog(format!("backup '{backup_id}' has no end_wal")))?;
    let fence = xlog::segment_range(&begin_wal, &end_wal)?;
    for name in &fence {
        if catalog.lookup_wal(name)?.is_none() {
            return Err(BarmanError::Catalog(format!(
                "required WAL segment {name} is not in the archive; recovery refused"
            ))
            .into());
        }
    }
    let wal_range = if options.get_wal {
        Vec::new()
    } else {
        required_wal_range(catalog, &backup, options.target.as_ref(), &end_wal)?
    };

    // 5. Tablespace redirections must name tablespaces the backup has.
    let mut tablespace_mappings = Vec::new();
    for (name, location) in &options.tablespace_mappings {
        let tablespace = backup
            .tablespaces
            .iter()
            .find(|t| &t.name == name)
            .ok_or_else(|| {
                BarmanError::Configuration(format!(
                    "backup '{backup_id}' has no tablespace named '{name}'"
                ))
            })?;
        tablespace_mappings.push((tablespace.clone(), location.clone()));
    }

    let destination = match &options.remote_ssh_command {
        Some(ssh) => Destination::Remote {
            ssh_command: ssh.clone(),
            path: options.destination.clone(),
        },
        None => Destination::Local(options.destination.clone()),
    };

    let recovery_conf_lines = recovery_conf_lines(server, options)?;
    let signal_file = if options.standby_mode {
        "standby.signal"
    } else {
        "recovery.signal"
    };

    Ok(RecoveryPlan {
        backup,
        chain,
        destination,
        staging_path,
        wal_range,
        recovery_conf_lines,
        signal_file,
        tablespace_mappings,
        delta: options.delta,
        get_wal: options.get_wal,
    })
}

/// `auto`: the newest DONE backup compatible with the target.
fn resolve_auto(
    catalog: &Catalog<'_>,
    target: Option<&RecoveryTarget>,
) -> anyhow::Result<String> {
    let done = catalog.list_backups(&BackupFilter {
        status: Some(BackupStatus::Done),
        ..Default::default()
    })?;
    let compatible = |backup: &BackupInfo| match target {
        Some(RecoveryTarget::Time(t)) => backup.end_time.map(|e| e <= *t).unwrap_or(false),
        Some(RecoveryTarget::Lsn(lsn)) => backup.end_lsn.map(|e| e <= *lsn).unwrap_or(false),
        Some(RecoveryTarget::TimelineId(tli)) => backup.timeline == Some(*tli),
        _ => true,
    };
    done.into_iter()
        .filter(|b| compatible(b))
        .next_back()
        .map(|b| b.backup_id)
        .ok_or_else(|| {
            BarmanError::Catalog("no DONE backup is compatible with the recovery target".into())
                .into()
        })
}

/// A target lying before the backup finished can never be reached from it.
fn validate_target(backup: &BackupInfo, target: Option<&RecoveryTarget>) -> anyhow::Result<()> {
    match target {
        Some(RecoveryTarget::Time(t)) => {
            if let Some(end_time) = backup.end_time {
                if *t < end_time {
                    return Err(BarmanError::UnsupportedOperation(format!(
                        "recovery target time {t} precedes the end of backup '{}' ({end_time})",
                        backup.backup_id
                    ))
                    .into());
                }
            }
        }
        Some(RecoveryTarget::Lsn(lsn)) => {
            if let Some(end_lsn) = backup.end_lsn {
                if *lsn < end_lsn {
                    return Err(BarmanError::UnsupportedOperation(format!(
                        "recovery target LSN {lsn} precedes the end of backup '{}' ({end_lsn})",
                        backup.backup_id
                    ))
                    .into());
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Root-first chain for a block-level incremental; all links must be DONE.
fn resolve_chain(catalog: &Catalog<'_>, backup: &BackupInfo) -> anyhow::Result<Vec<BackupInfo>> {
    let mut chain = vec![backup.clone()];
    let mut cursor = backup.clone();
    while cursor.backup_type == BackupType::IncrementalBlockLevel {
        let parent_id = cursor.parent_backup_id.clone().ok_or_else(|| {
            BarmanError::Catalog(format!(
                "incremental backup '{}' has no parent recorded",
                cursor.backup_id
            ))
        })?;
        let parent = catalog.load_backup_info(&parent_id)?;
        if parent.status != BackupStatus::Done {
            return Err(BarmanError::Catalog(format!(
                "chain link '{parent_id}' is {}, the chain is not recoverable",
                parent.status
            ))
            .into());
        }
        chain.push(parent.clone());
        cursor = parent;
    }
    chain.reverse();
    Ok(chain)
}

/// Names to stage into `pg_wal`: the fence plus, for open-ended targets,
/// everything newer on the backup's timeline.
fn required_wal_range(
    catalog: &Catalog<'_>,
    backup: &BackupInfo,
    target: Option<&RecoveryTarget>,
    end_wal: &str,
) -> anyhow::Result<Vec<String>> {
    let begin_wal = backup.begin_wal.as_deref().expect("validated by the caller");
    let mut names = xlog::segment_range(begin_wal, end_wal)?;
    if !matches!(target, Some(RecoveryTarget::Immediate)) {
        let end_key = xlog::sort_key(end_wal);
        let tli = backup.timeline;
        for entry in catalog.read_xlogdb()? {
            if xlog::timeline_of(&entry.name) == tli
                && !xlog::is_history_name(&entry.name)
                && xlog::sort_key(&entry.name) > end_key
            {
                names.push(entry.name);
            }
        }
    }
    Ok(names)
}

/// The settings appended to the auto configuration file.
fn recovery_conf_lines(
    server: &ServerConfig,
    options: &RecoveryOptions,
) -> anyhow::Result<Vec<String>> {
    let mut lines = Vec::new();
    if options.get_wal {
        lines.push(format!(
            "restore_command = '{}'",
            get_wal_restore_command(&server.name, options.remote_ssh_command.is_some())?
        ));
    } else {
        // WAL is staged under the destination; fetch it from there.
        lines.push("restore_command = 'cp pg_wal/%f \"%p\"'".to_string());
    }
    match &options.target {
        Some(RecoveryTarget::Immediate) => {
            lines.push("recovery_target = 'immediate'".to_string());
        }
        Some(RecoveryTarget::Time(t)) => {
            lines.push(format!(
                "recovery_target_time = '{}'",
                t.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        Some(RecoveryTarget::Xid(xid)) => {
            lines.push(format!("recovery_target_xid = '{xid}'"));
        }
        Some(RecoveryTarget::Name(name)) => {
            lines.push(format!("recovery_target_name = '{name}'"));
        }
        Some(RecoveryTarget::Lsn(lsn)) => {
            lines.push(format!("recovery_target_lsn = '{lsn}'"));
        }
        Some(RecoveryTarget::TimelineId(tli)) => {
            lines.push(format!("recovery_target_timeline = '{tli}'"));
        }
        None => {}
    }
    if options.exclusive {
        lines.push("recovery_target_inclusive = false".to_string());
    }
    if let Some(action) = options.target_action {
        if options.target.is_none() {
            return Err(BarmanError::Configuration(
                "a target action needs a recovery target".into(),
            )
            .into());
        }
        lines.push(format!("recovery_target_action = '{action}'"));
    }
    Ok(lines)
}

/// restore_command for on-demand WAL fetching. A remote destination calls
/// back into this host over SSH; peek-ahead warms the client cache.
fn get_wal_restore_command(server_name: &str, remote: bool) -> anyhow::Result<String> {
    if !remote {
        return Ok(format!("barman get-wal {server_name} %f > \"%p\""));
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "barman".to_string());
    let host = nix::unistd::gethostname()
        .context("failed to read the local host name")?
        .into_string()
        .map_err(|_| anyhow::anyhow!("host name is not valid UTF-8"))?;
    Ok(format!(
        "ssh {user}@{host} barman get-wal --peek 8 {server_name} %f > \"%p\""
    ))
}

/// Comment out options that must not survive into the restored instance.
pub fn mangle_config(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        let dangerous = DANGEROUS_OPTIONS.iter().any(|option| {
            trimmed
                .strip_prefix(option)
                .map(|rest| rest.trim_start().starts_with('='))
                .unwrap_or(false)
        });
        if dangerous {
            out.push_str("#BARMAN# ");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Execute a validated plan.
pub async fn execute(
    server: &ServerConfig,
    catalog: &Catalog<'_>,
    plan: &RecoveryPlan,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let span = info_span!("recover", server = %server.name, backup_id = %plan.backup.backup_id);
    async {
        let env = HookEnvironment::new(server).with_backup(
            &plan.backup,
            &catalog.backup_dir(&plan.backup.backup_id),
            None,
            None,
        );
        if hooks::run_hooks(server, HookEvent::Recovery, HookPhase::Pre, &env).await?
            == HookOutcome::Abort
        {
            anyhow::bail!("recovery aborted by pre-recovery hook");
        }

        // Stage: synthesize the chain and/or unpack compressed tars.
        let mut scratch: Option<Utf8PathBuf> = None;
        let source_data = match (&plan.staging_path, plan.chain.len() > 1) {
            (Some(staging), true) => {
                let work = staging.join(format!("barman-recover-{}", plan.backup.backup_id));
                tokio::fs::create_dir_all(&work).await?;
                scratch = Some(work.clone());
                combine_chain(catalog, &plan.chain, &work, cancel).await?
            }
            (Some(staging), false) => {
                let work = staging.join(format!("barman-recover-{}", plan.backup.backup_id));
                tokio::fs::create_dir_all(&work).await?;
                scratch = Some(work.clone());
                unpack_tars(catalog, &plan.backup, &work, cancel).await?
            }
            (None, _) => catalog.backup_dir(&plan.backup.backup_id).join("data"),
        };

        let result = copy_and_configure(server, catalog, plan, &source_data, cancel).await;

        // All temporary staging is removed, success or not.
        if let Some(work) = scratch {
            if let Err(e) = tokio::fs::remove_dir_all(&work).await {
                warn!("failed to clean staging {work}: {e}");
            }
        }
        result?;

        hooks::run_hooks(server, HookEvent::Recovery, HookPhase::Post, &env).await?;
        info!("recovery of backup '{}' complete", plan.backup.backup_id);
        Ok(())
    }
    .instrument(span)
    .await
}

async fn copy_and_configure(
    server: &ServerConfig,
    catalog: &Catalog<'_>,
    plan: &RecoveryPlan,
    source_data: &Utf8Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    // Copy the data tree.
    match &plan.destination {
        Destination::Local(dest) => {
            tokio::fs::create_dir_all(dest).await?;
            copy_tree_local(source_data, dest).await?;
        }
        Destination::Remote { ssh_command, path } => {
            rsync_to_remote(server, source_data, ssh_command, path, cancel).await?;
        }
    }

    // Tablespace redirections.
    for (tablespace, location) in &plan.tablespace_mappings {
        relocate_tablespace(&plan.destination, tablespace, location).await?;
    }

    // Stage WAL into pg_wal.
    if !plan.get_wal {
        stage_wal_files(catalog, &plan.wal_range, &plan.destination, cancel).await?;
    }

    // Neutralise dangerous settings, then append ours.
    for config_file in ["postgresql.conf", "postgresql.auto.conf"] {
        if let Some(content) = read_dest_file(&plan.destination, config_file).await? {
            write_dest_file(&plan.destination, config_file, &mangle_config(&content)).await?;
        }
    }
    let mut auto_conf = read_dest_file(&plan.destination, "postgresql.auto.conf")
        .await?
        .unwrap_or_default();
    auto_conf.push('\n');
    for line in &plan.recovery_conf_lines {
        auto_conf.push_str(line);
        auto_conf.push('\n');
    }
    write_dest_file(&plan.destination, "postgresql.auto.conf", &auto_conf).await?;
    write_dest_file(&plan.destination, plan.signal_file, "").await?;
    Ok(())
}

/// Materialise a synthetic full backup from a block-level chain with
/// pg_combinebackup, into the staging area.
async fn combine_chain(
    catalog: &Catalog<'_>,
    chain: &[BackupInfo],
    work: &Utf8Path,
    cancel: &CancellationToken,
) -> anyhow::Result<Utf8PathBuf> {
    let output = work.join("synthetic");
    let mut command = tokio::process::Command::new("pg_combinebackup");
    for link in chain {
        command.arg(catalog.backup_dir(&link.backup_id).join("data"));
    }
    command.arg("-o").arg(&output);
    command.stdin(Stdio::null());
    info!("combining {} chain links into {output}", chain.len());
    let mut child = command.spawn().context("failed to spawn pg_combinebackup")?;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            anyhow::bail!("pg_combinebackup cancelled");
        }
    };
    if !status.success() {
        return Err(BarmanError::Protocol(format!(
            "pg_combinebackup exited with {status}"
        ))
        .into());
    }
    Ok(output)
}

/// Unpack a compressed tar-mode backup into the staging area.
async fn unpack_tars(
    catalog: &Catalog<'_>,
    backup: &BackupInfo,
    work: &Utf8Path,
    cancel: &CancellationToken,
) -> anyhow::Result<Utf8PathBuf> {
    let backup_dir = catalog.backup_dir(&backup.backup_id);
    let output = work.join("data");
    tokio::fs::create_dir_all(&output).await?;
    for entry in backup_dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.contains(".tar") {
            continue;
        }
        // base.tar unpacks into the data root; <oid>.tar into the matching
        // tablespace directory.
        let target = match name.split('.').next() {
            Some("base") => output.clone(),
            Some(oid) => output.join("pg_tblspc").join(oid),
            None => output.clone(),
        };
        tokio::fs::create_dir_all(&target).await?;
        let status = tokio::process::Command::new("tar")
            .arg("xaf")
            .arg(entry.path())
            .arg("-C")
            .arg(&target)
            .stdin(Stdio::null())
            .status()
            .await
            .context("failed to spawn tar")?;
        if !status.success() {
            return Err(BarmanError::Protocol(format!(
                "tar exited with {status} while unpacking {name}"
            ))
            .into());
        }
        if cancel.is_cancelled() {
            anyhow::bail!("unpacking cancelled");
        }
    }
    Ok(output)
}

/// Local destination copy: plain recursive copy, overwriting in place
/// (which is also what a delta restore amounts to locally).
async fn copy_tree_local(src: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(src.as_std_path()) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src.as_std_path())
            .expect("walkdir yields children of src");
        let rel = Utf8Path::from_path(rel).ok_or_else(|| anyhow::anyhow!("non-UTF8 path"))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            tokio::fs::create_dir_all(&target).await?;
        } else if entry.file_type().is_symlink() {
            let link = tokio::fs::read_link(entry.path()).await?;
            let _ = tokio::fs::remove_file(&target).await;
            tokio::fs::symlink(link, &target).await?;
        } else {
            tokio::fs::copy(entry.path(), &target)
                .await
                .with_context(|| format!("failed to copy {rel}"))?;
        }
    }
    Ok(())
}

/// Remote destination copy: rsync over the configured transport, with the
/// server's retry budget against transport failures.
async fn rsync_to_remote(
    server: &ServerConfig,
    src: &Utf8Path,
    ssh_command: &str,
    dest: &Utf8Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let args = vec![
        "-a".to_string(),
        "-e".to_string(),
        ssh_command.to_string(),
        format!("{src}/"),
        format!("remote:{dest}/"),
    ];
    let mut attempt = 0;
    loop {
        let mut child = tokio::process::Command::new("rsync")
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .context("failed to spawn rsync")?;
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                anyhow::bail!("rsync cancelled");
            }
        };
        if status.success() {
            return Ok(());
        }
        let code = status.code().unwrap_or(-1);
        let transport = matches!(code, 10 | 12 | 30 | 35 | 255);
        if transport && attempt < server.basebackup_retry_times {
            attempt += 1;
            warn!(
                "remote copy failed (exit {code}), attempt {attempt}/{}",
                server.basebackup_retry_times
            );
            tokio::time::sleep(server.basebackup_retry_sleep).await;
            continue;
        }
        let err = if transport {
            BarmanError::Connection(format!("rsync transport failure (exit {code})"))
        } else {
            BarmanError::Protocol(format!("rsync failed (exit {code})"))
        };
        return Err(err.into());
    }
}

/// Point the `pg_tblspc` entry of a tablespace at its (possibly remapped)
/// location, creating the location when missing.
async fn relocate_tablespace(
    destination: &Destination,
    tablespace: &Tablespace,
    location: &Utf8Path,
) -> anyhow::Result<()> {
    match destination {
        Destination::Local(dest) => {
            tokio::fs::create_dir_all(location).await?;
            let link = dest.join("pg_tblspc").join(tablespace.oid.to_string());
            tokio::fs::create_dir_all(link.parent().expect("pg_tblspc has a parent")).await?;
            let _ = tokio::fs::remove_file(&link).await;
            tokio::fs::symlink(location, &link).await?;
        }
        Destination::Remote { ssh_command, path } => {
            let link = path.join("pg_tblspc").join(tablespace.oid.to_string());
            run_ssh(
                ssh_command,
                &format!("mkdir -p '{location}' && ln -sfn '{location}' '{link}'"),
            )
            .await?;
        }
    }
    Ok(())
}

/// Copy the required archived segments, decompressed, into `pg_wal`.
async fn stage_wal_files(
    catalog: &Catalog<'_>,
    wal_range: &[String],
    destination: &Destination,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    // Always materialise locally first; a remote destination gets one rsync
    // of the whole directory afterwards.
    let local_wal_dir = match destination {
        Destination::Local(dest) => dest.join("pg_wal"),
        Destination::Remote { .. } => {
            let tmp = camino_tempdir()?;
            tmp
        }
    };
    tokio::fs::create_dir_all(&local_wal_dir).await?;

    for name in wal_range {
        if cancel.is_cancelled() {
            anyhow::bail!("WAL staging cancelled");
        }
        let entry = catalog.lookup_wal(name)?.ok_or_else(|| {
            BarmanError::Catalog(format!("segment {name} vanished from the archive"))
        })?;
        let source = catalog.find_wal_file(name)?.ok_or_else(|| {
            BarmanError::Catalog(format!(
                "segment {name} is indexed but missing from the archive"
            ))
        })?;
        let target = local_wal_dir.join(name);
        match entry
            .compression
            .as_deref()
            .map(str::parse::<CompressionAlg>)
            .transpose()
            .map_err(|_| BarmanError::Catalog(format!("unknown compression on {name}")))?
        {
            Some(alg) => compression::decompress_file(alg, &source, &target).await?,
            None => {
                tokio::fs::copy(&source, &target).await?;
            }
        }
    }

    if let Destination::Remote { ssh_command, path } = destination {
        let args = vec![
            "-a".to_string(),
            "-e".to_string(),
            ssh_command.clone(),
            format!("{local_wal_dir}/"),
            format!("remote:{}/pg_wal/", path),
        ];
        let status = tokio::process::Command::new("rsync")
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .await
            .context("failed to spawn rsync for WAL staging")?;
        let _ = tokio::fs::remove_dir_all(&local_wal_dir).await;
        if !status.success() {
            return Err(BarmanError::Connection(format!(
                "WAL staging rsync exited with {status}"
            ))
            .into());
        }
    }
    Ok(())
}

fn camino_tempdir() -> anyhow::Result<Utf8PathBuf> {
    let dir = std::env::temp_dir().join(format!("barman-wal-{}", std::process::id()));
    let dir = Utf8PathBuf::from_path_buf(dir)
        .map_err(|_| anyhow::anyhow!("temp dir path is not valid UTF-8"))?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

async fn read_dest_file(
    destination: &Destination,
    file_name: &str,
) -> anyhow::Result<Option<String>> {
    match destination {
        Destination::Local(dest) => match tokio::fs::read_to_string(dest.join(file_name)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        },
        Destination::Remote { ssh_command, path } => {
            let output = ssh_output(ssh_command, &format!("cat '{}' 2>/dev/null", path.join(file_name)))
                .await?;
            Ok(output)
        }
    }
}

async fn write_dest_file(
    destination: &Destination,
    file_name: &str,
    content: &str,
) -> anyhow::Result<()> {
    match destination {
        Destination::Local(dest) => {
            tokio::fs::create_dir_all(dest).await?;
            tokio::fs::write(dest.join(file_name), content).await?;
            Ok(())
        }
        Destination::Remote { ssh_command, path } => {
            use tokio::io::AsyncWriteExt;
            let target = path.join(file_name);
            let mut parts = ssh_command.split_whitespace();
            let program = parts.next().ok_or_else(|| {
                BarmanError::Configuration("empty remote ssh command".into())
            })?;
            let mut child = tokio::process::Command::new(program)
                .args(parts)
                .arg(format!("cat > '{target}'"))
                .stdin(Stdio::piped())
                .spawn()
                .context("failed to spawn ssh")?;
            child
                .stdin
                .as_mut()
                .expect("stdin is piped")
                .write_all(content.as_bytes())
                .await?;
            let status = child.wait().await?;
            if !status.success() {
                return Err(BarmanError::Connection(format!(
                    "remote write of {file_name} exited with {status}"
                ))
                .into());
            }
            Ok(())
        }
    }
}

async fn run_ssh(ssh_command: &str, remote_command: &str) -> anyhow::Result<()> {
    let mut parts = ssh_command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| BarmanError::Configuration("empty remote ssh command".into()))?;
    let status = tokio::process::Command::new(program)
        .args(parts)
        .arg(remote_command)
        .stdin(Stdio::null())
        .status()
        .await
        .context("failed to spawn ssh")?;
    if !status.success() {
        return Err(BarmanError::Connection(format!(
            "remote command exited with {status}"
        ))
        .into());
    }
    Ok(())
}

async fn ssh_output(ssh_command: &str, remote_command: &str) -> anyhow::Result<Option<String>> {
    let mut parts = ssh_command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| BarmanError::Configuration("empty remote ssh command".into()))?;
    let output = tokio::process::Command::new(program)
        .args(parts)
        .arg(remote_command)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to spawn ssh")?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// Snapshot recovery never copies data: it validates that the cloned disks
/// are attached where the metadata says, then runs only the WAL and
/// configuration steps.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMount {
    pub device: String,
    pub mount_point: Utf8PathBuf,
}

pub fn validate_snapshot_mounts(
    backup_dir: &Utf8Path,
    mounts_table: &str,
) -> anyhow::Result<Vec<SnapshotMount>> {
    let metadata_path = backup_dir.join("snapshot_metadata.json");
    let content = std::fs::read_to_string(&metadata_path)
        .with_context(|| format!("failed to read {metadata_path:?}"))?;
    let mounts: Vec<SnapshotMount> =
        serde_json::from_str(&content).context("corrupt snapshot metadata")?;
    for mount in &mounts {
        let mounted = mounts_table.lines().any(|line| {
            let mut fields = line.split_whitespace();
            matches!(
                (fields.next(), fields.next()),
                (Some(device), Some(point))
                    if device == mount.device && point == mount.mount_point.as_str()
            )
        });
        if !mounted {
            return Err(BarmanError::UnsupportedOperation(format!(
                "snapshot disk {} is not mounted at {}",
                mount.device, mount.mount_point
            ))
            .into());
        }
    }
    Ok(mounts)
}
