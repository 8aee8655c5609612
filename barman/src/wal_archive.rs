//! The archiver pass: promote WAL files from the landing directories into
//! the per-server archive.
//!
//! Two ingress paths feed the same archive. The streaming receiver renames
//! `NAME.partial` to `NAME` in `streaming/` when a segment completes; the
//! upstream's archive_command drops finished segments into `incoming/`.
//! One pass picks up both, in ascending segment order, so that `xlog.db`
//! stays monotonic per timeline.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use utils::crashsafe;

use crate::catalog::{self, Catalog, XlogDbEntry};
use crate::compression::{self, CompressionAlg};
use crate::config::ServerConfig;
use crate::error::BarmanError;
use crate::hooks::{self, HookEnvironment, HookEvent, HookOutcome, HookPhase};
use crate::xlog;

/// Result of one archiver pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchiverStats {
    pub archived: usize,
    /// Safe duplicates dropped silently.
    pub duplicates: usize,
    /// Files moved to `errors/` (bad names, content-diverging duplicates).
    pub rejected: usize,
    /// Files left in place because a pre-archive hook aborted them.
    pub skipped: usize,
}

/// Run one archiver pass under the archive lock.
pub async fn archive_wal(
    server: &ServerConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<ArchiverStats> {
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;
    let _lock = catalog.try_lock(catalog::ARCHIVE_LOCK)?;

    settle_partial_files(&catalog)?;

    let mut candidates = collect_candidates(&catalog)?;
    candidates.sort_by(|a, b| xlog::sort_key(&a.name).cmp(&xlog::sort_key(&b.name)));

    let mut stats = ArchiverStats::default();
    for candidate in candidates {
        if cancel.is_cancelled() {
            info!("archiver pass cancelled, remaining files stay in place");
            break;
        }
        let name = candidate.name.clone();
        archive_one(&catalog, candidate, &mut stats)
            .instrument(info_span!("archive", segment = %name))
            .await?;
    }
    if stats.archived > 0 {
        info!(
            archived = stats.archived,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            "archiver pass complete"
        );
    }
    Ok(stats)
}

struct Candidate {
    name: String,
    path: Utf8PathBuf,
}

/// Everything promotable from the two landing directories. `.partial`
/// files are never candidates.
fn collect_candidates(catalog: &Catalog<'_>) -> anyhow::Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for dir in [
        &catalog.server.incoming_wals_directory,
        &catalog.server.streaming_wals_directory,
    ] {
        if !dir.is_dir() {
            continue;
        }
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string();
            if xlog::is_partial_name(&name) || crashsafe::is_temporary(entry.path()) {
                continue;
            }
            candidates.push(Candidate {
                name,
                path: entry.path().to_owned(),
            });
        }
    }
    Ok(candidates)
}

/// Enforce the one-`.partial`-per-timeline rule on the streaming directory:
/// when two appear, the later-modified one wins and the older moves to
/// `errors/`.
fn settle_partial_files(catalog: &Catalog<'_>) -> anyhow::Result<()> {
    use std::collections::BTreeMap;

    let dir = &catalog.server.streaming_wals_directory;
    if !dir.is_dir() {
        return Ok(());
    }
    let mut partials: BTreeMap<u32, Vec<(std::time::SystemTime, Utf8PathBuf)>> = BTreeMap::new();
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        if xlog::is_partial_name(name) {
            let tli = xlog::timeline_of(name).expect("partial names carry a timeline");
            let mtime = entry.path().metadata()?.modified()?;
            partials
                .entry(tli)
                .or_default()
                .push((mtime, entry.path().to_owned()));
        }
    }
    for (tli, mut files) in partials {
        if files.len() <= 1 {
            continue;
        }
        files.sort_by_key(|(mtime, _)| *mtime);
        let (_, winner) = files.pop().expect("non-empty after length check");
        warn!(
            "timeline {tli} has {} partial files, keeping {winner}",
            files.len() + 1
        );
        for (_, loser) in files {
            quarantine(catalog, &loser)?;
        }
    }
    Ok(())
}

/// Move a rejected file into `errors/` under a collision-free name.
fn quarantine(catalog: &Catalog<'_>, path: &Utf8Path) -> anyhow::Result<()> {
    let errors = &catalog.server.errors_directory;
    std::fs::create_dir_all(errors)?;
    let file_name = path.file_name().expect("quarantined path has a file name");
    let mut target = errors.join(file_name);
    let mut n = 0;
    while target.exists() {
        n += 1;
        target = errors.join(format!("{file_name}.duplicate{n}"));
    }
    std::fs::rename(path, &target)
        .with_context(|| format!("failed to move {path:?} to {target:?}"))?;
    warn!("moved {path} to {target}");
    Ok(())
}

async fn archive_one(
    catalog: &Catalog<'_>,
    candidate: Candidate,
    stats: &mut ArchiverStats,
) -> anyhow::Result<()> {
    let server = catalog.server;
    let name = &candidate.name;

    // 1. The name must be a legal segment, history, or backup label file.
    if !xlog::is_archivable_name(name) {
        warn!("rejecting alien file name {name:?}");
        quarantine(catalog, &candidate.path)?;
        stats.rejected += 1;
        return Ok(());
    }

    // 2. Same canonical name already archived: content decides.
    if let Some(existing) = catalog.find_wal_file(name)? {
        let existing_hash = uncompressed_hash(&existing).await?;
        let incoming_hash = uncompressed_hash(&candidate.path).await?;
        if existing_hash == incoming_hash {
            tokio::fs::remove_file(&candidate.path).await?;
            stats.duplicates += 1;
            return Ok(());
        }
        // Surface the duplication, keep the pass going with the next file.
        warn!(
            "{:#}",
            BarmanError::Duplication {
                name: name.to_string()
            }
        );
        quarantine(catalog, &candidate.path)?;
        stats.rejected += 1;
        return Ok(());
    }

    // 3. Choose the stored form: already-compressed input goes straight
    //    through with its detected algorithm; otherwise the configured
    //    policy applies.
    let head = read_head(&candidate.path, 8).await?;
    let detected = compression::identify(&head);
    let (target_compression, compress_now) = match (detected, server.compression) {
        (Some(found), _) => (Some(found), false),
        (None, Some(configured)) => (Some(configured), true),
        (None, None) => (None, false),
    };

    let final_path = catalog.wal_path(name, target_compression);
    tokio::fs::create_dir_all(final_path.parent().expect("wal path has a parent")).await?;
    let tmp_path = crashsafe::path_with_suffix_extension(&final_path, crashsafe::TEMP_FILE_SUFFIX);

    let env = HookEnvironment::new(server).with_wal(
        name,
        &final_path,
        candidate.path.metadata()?.len(),
        now_unix(),
        target_compression.map(|c| c.suffix()),
    );
    if hooks::run_hooks(server, HookEvent::Archive, HookPhase::Pre, &env).await?
        == HookOutcome::Abort
    {
        warn!("pre-archive hook aborted {name}, leaving it in place");
        stats.skipped += 1;
        return Ok(());
    }

    // 4. Write to temp, fsync, rename: atomic publication.
    if compress_now {
        let alg = target_compression.expect("compress_now implies an algorithm");
        compression::compress_file(alg, &candidate.path, &tmp_path).await?;
    } else {
        tokio::fs::copy(&candidate.path, &tmp_path)
            .await
            .with_context(|| format!("failed to stage {name}"))?;
        crashsafe::fsync_async(&tmp_path).await?;
    }
    let stored_size = tmp_path.metadata()?.len();
    crashsafe::durable_rename(&tmp_path, &final_path).await?;

    // 5. Index it; the append fsyncs before returning.
    catalog.append_xlogdb(&XlogDbEntry {
        name: name.clone(),
        size: stored_size,
        time: now_unix(),
        compression: target_compression.map(|c| c.to_string()),
    })?;

    tokio::fs::remove_file(&candidate.path).await?;
    catalog.write_meta(catalog::META_LAST_ARCHIVED, name)?;
    stats.archived += 1;

    // 6. Post hooks fire after the segment is durable.
    hooks::run_hooks(server, HookEvent::Archive, HookPhase::Post, &env).await?;
    Ok(())
}

/// SHA-256 of the logical (uncompressed) content of a file, whatever its
/// stored form. Used to tell safe duplicates from diverging ones.
async fn uncompressed_hash(path: &Utf8Path) -> anyhow::Result<[u8; 32]> {
    let head = read_head(path, 8).await?;
    match compression::identify(&head) {
        Some(alg) => {
            let mut plain = Vec::new();
            compression::decompress_to_writer(alg, path, &mut plain).await?;
            Ok(catalog::sha256(&plain))
        }
        None => catalog::sha256_file(path),
    }
}

async fn read_head(path: &Utf8Path, len: usize) -> anyhow::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {path:?}"))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
