//! Backup manifest generation and verification.
//!
//! The manifest follows the PostgreSQL backup_manifest shape: one entry per
//! file with size and SHA-256, plus a checksum over the manifest itself.
//! pg_basebackup produces one natively; for file-tree backups barman
//! generates an equivalent, and `verify-backup` re-hashes either kind.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::catalog::{sha256_file, Catalog};
use crate::error::BarmanError;

pub const MANIFEST_FILE: &str = "backup_manifest";

/// Paths never covered by the manifest: the manifest itself and WAL, which
/// the archive owns.
const EXCLUDED: &[&str] = &[MANIFEST_FILE, "pg_wal", "postmaster.pid", "postmaster.opts"];

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Checksum-Algorithm")]
    pub checksum_algorithm: String,
    #[serde(rename = "Checksum")]
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupManifest {
    #[serde(rename = "PostgreSQL-Backup-Manifest-Version")]
    pub version: u32,
    #[serde(rename = "Files")]
    pub files: Vec<ManifestFile>,
    #[serde(rename = "Manifest-Checksum")]
    pub manifest_checksum: String,
}

impl BackupManifest {
    fn checksum_of(files: &[ManifestFile]) -> anyhow::Result<String> {
        let payload = serde_json::to_vec(files).context("serializing manifest files")?;
        Ok(hex::encode(Sha256::digest(payload)))
    }
}

/// Walk a data tree and write its manifest. Returns the number of files
/// covered.
pub fn generate(data_dir: &Utf8Path) -> anyhow::Result<usize> {
    if !data_dir.is_dir() {
        return Err(BarmanError::Catalog(format!("{data_dir:?} is not a directory")).into());
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(data_dir.as_std_path()).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| anyhow::anyhow!("non-UTF8 path under {data_dir:?}"))?;
        let rel = path
            .strip_prefix(data_dir)
            .expect("walkdir yields children of data_dir");
        if is_excluded(rel) {
            continue;
        }
        files.push(ManifestFile {
            path: rel.to_string(),
            size: path.metadata()?.len(),
            checksum_algorithm: "SHA256".to_string(),
            checksum: hex::encode(sha256_file(path)?),
        });
    }
    let manifest = BackupManifest {
        version: 1,
        manifest_checksum: BackupManifest::checksum_of(&files)?,
        files,
    };
    let content = serde_json::to_string_pretty(&manifest).context("serializing manifest")?;
    utils::crashsafe::overwrite_file(&data_dir.join(MANIFEST_FILE), content.as_bytes())?;
    info!("wrote manifest covering {} files", manifest.files.len());
    Ok(manifest.files.len())
}

fn is_excluded(rel: &Utf8Path) -> bool {
    EXCLUDED.iter().any(|excluded| {
        rel.as_str() == *excluded || rel.as_str().starts_with(&format!("{excluded}/"))
    })
}

/// One discrepancy found by verification.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub path: String,
    pub problem: String,
}

/// Re-hash a data tree against its manifest.
pub fn verify(data_dir: &Utf8Path) -> anyhow::Result<Vec<Discrepancy>> {
    let manifest_path = data_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {manifest_path:?}"))?;
    let manifest: BackupManifest = serde_json::from_str(&content)
        .map_err(|e| BarmanError::Catalog(format!("corrupt manifest: {e}")))?;

    let mut problems = Vec::new();
    if BackupManifest::checksum_of(&manifest.files)? != manifest.manifest_checksum {
        problems.push(Discrepancy {
            path: MANIFEST_FILE.to_string(),
            problem: "manifest checksum mismatch".to_string(),
        });
    }
    for file in &manifest.files {
        let path = data_dir.join(&file.path);
        if !path.is_file() {
            problems.push(Discrepancy {
                path: file.path.clone(),
                problem: "missing".to_string(),
            });
            continue;
        }
        let size = path.metadata()?.len();
        if size != file.size {
            problems.push(Discrepancy {
                path: file.path.clone(),
                problem: format!("size {size}, manifest says {}", file.size),
            });
            continue;
        }
        if hex::encode(sha256_file(&path)?) != file.checksum {
            problems.push(Discrepancy {
                path: file.path.clone(),
                problem: "checksum mismatch".to_string(),
            });
        }
    }
    Ok(problems)
}

/// The data tree of a backup, for manifest purposes.
pub fn data_dir_of(catalog: &Catalog<'_>, backup_id: &str) -> Utf8PathBuf {
    catalog.backup_dir(backup_id).join("data")
}

/// Files a recovery of this backup would stage: the data tree plus the
/// required WAL fence. Feeds the `list-files` command.
pub fn list_files(
    catalog: &Catalog<'_>,
    backup_id: &str,
) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let info = catalog.load_backup_info(backup_id)?;
    let mut result = Vec::new();
    let backup_dir = catalog.backup_dir(backup_id);
    for entry in walkdir::WalkDir::new(backup_dir.as_std_path()).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| anyhow::anyhow!("non-UTF8 path in backup"))?;
            result.push(path.to_owned());
        }
    }
    if let (Some(begin), Some(end)) = (&info.begin_wal, &info.end_wal) {
        for name in crate::xlog::segment_range(begin, end)? {
            if let Some(path) = catalog.find_wal_file(&name)? {
                result.push(path);
            }
        }
    }
    Ok(result)
}
