//! Streaming copy engine built on pg_basebackup.
//!
//! The replication protocol stays inside the subprocess; barman only
//! assembles the invocation and supervises it. Without compression the
//! backup lands as a plain `data/` tree; with compression it lands as one
//! tar per tablespace. Block-level incremental mode hands the parent's
//! manifest to the server, which requires the WAL summarizer.

use std::process::Stdio;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compression::CompressionAlg;
use crate::config::ServerConfig;
use crate::error::BarmanError;

pub struct StreamingCopyEngine<'a> {
    server: &'a ServerConfig,
}

impl<'a> StreamingCopyEngine<'a> {
    pub fn new(server: &'a ServerConfig) -> Self {
        StreamingCopyEngine { server }
    }

    /// Assemble the pg_basebackup invocation.
    ///
    /// WAL is never bundled: the archive is the WAL source for recovery.
    /// Parallelism is whatever pg_basebackup supports; barman does not fan
    /// out its own workers here.
    pub fn basebackup_args(
        &self,
        backup_dir: &Utf8Path,
        label: &str,
        immediate_checkpoint: bool,
        parent_manifest: Option<&Utf8Path>,
    ) -> Vec<String> {
        let conninfo = self
            .server
            .streaming_conninfo
            .as_deref()
            .unwrap_or(&self.server.conninfo);
        let mut args = vec![
            "--dbname".to_string(),
            conninfo.to_string(),
            "--label".to_string(),
            label.to_string(),
            "--wal-method=none".to_string(),
            format!(
                "--checkpoint={}",
                if immediate_checkpoint { "fast" } else { "spread" }
            ),
            "--no-password".to_string(),
        ];
        match self.server.compression {
            Some(alg) => {
                args.push("--format=tar".to_string());
                args.push(format!("--compress={}", compress_flag(alg)));
                args.push("--pgdata".to_string());
                args.push(backup_dir.to_string());
            }
            None => {
                args.push("--format=plain".to_string());
                args.push("--pgdata".to_string());
                args.push(backup_dir.join("data").to_string());
            }
        }
        if let Some(manifest) = parent_manifest {
            args.push(format!("--incremental={manifest}"));
        }
        args
    }

    pub async fn copy(
        &self,
        backup_dir: &Utf8Path,
        label: &str,
        immediate_checkpoint: bool,
        parent_manifest: Option<&Utf8Path>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let args = self.basebackup_args(backup_dir, label, immediate_checkpoint, parent_manifest);
        info!("running pg_basebackup");
        let mut child = Command::new("pg_basebackup")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BarmanError::Connection(format!("failed to spawn pg_basebackup: {e}")))?;

        let stderr = child.stderr.take().expect("stderr is piped");
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!("cancelling pg_basebackup");
                let _ = child.kill().await;
                return Err(anyhow::anyhow!("pg_basebackup cancelled"));
            }
        };
        if !status.success() {
            let mut detail = String::new();
            use tokio::io::AsyncReadExt;
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut detail).await;
            return Err(BarmanError::Protocol(format!(
                "pg_basebackup exited with {status}: {}",
                detail.trim()
            ))
            .into());
        }
        Ok(())
    }

    /// Where pg_basebackup leaves the manifest, by output layout.
    pub fn manifest_path(&self, backup_dir: &Utf8Path) -> Utf8PathBuf {
        match self.server.compression {
            Some(_) => backup_dir.join("backup_manifest"),
            None => backup_dir.join("data").join("backup_manifest"),
        }
    }
}

/// pg_basebackup server-side compression spec for our algorithms. gzip and
/// zstd compress on the server; the rest fall back to client-side gzip,
/// which every supported pg_basebackup understands.
fn compress_flag(alg: CompressionAlg) -> &'static str {
    match alg {
        CompressionAlg::Gzip | CompressionAlg::Pigz => "server-gzip",
        CompressionAlg::Zstd => "server-zstd",
        CompressionAlg::Lz4 => "server-lz4",
        CompressionAlg::Bzip2 | CompressionAlg::Xz => "gzip",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use camino_tempfile::Utf8TempDir;

    fn server(home: &Utf8Path, extra: &str) -> ServerConfig {
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=db user=barman'
streaming_conninfo = 'host=db user=streaming_barman'
backup_method = 'postgres'
streaming_archiver = true
slot_name = 'barman'
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
    fn plain_layout_without_compression() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server(dir.path(), "");
        let engine = StreamingCopyEngine::new(&server);
        let backup_dir = dir.path().join("base/20260801T120000");
        let args = engine.basebackup_args(&backup_dir, "barman backup", true, None);

        assert!(args.iter().any(|a| a == "--format=plain"));
        assert!(args.iter().any(|a| a == "--checkpoint=fast"));
        assert!(args.iter().any(|a| a == "--wal-method=none"));
        let pgdata_idx = args.iter().position(|a| a == "--pgdata").unwrap();
        assert!(args[pgdata_idx + 1].ends_with("/data"));
        assert!(!args.iter().any(|a| a.starts_with("--compress")));
        assert!(engine
            .manifest_path(&backup_dir)
            .as_str()
            .ends_with("/data/backup_manifest"));
    }

    #[test]
    fn tar_layout_with_server_compression() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server(dir.path(), "compression = 'zstd'");
        let engine = StreamingCopyEngine::new(&server);
        let backup_dir = dir.path().join("base/20260801T120000");
        let args = engine.basebackup_args(&backup_dir, "barman backup", false, None);

        assert!(args.iter().any(|a| a == "--format=tar"));
        assert!(args.iter().any(|a| a == "--compress=server-zstd"));
        assert!(args.iter().any(|a| a == "--checkpoint=spread"));
        let pgdata_idx = args.iter().position(|a| a == "--pgdata").unwrap();
        assert!(!args[pgdata_idx + 1].ends_with("/data"));
    }

    #[test]
    fn incremental_passes_the_parent_manifest() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server(dir.path(), "");
        let engine = StreamingCopyEngine::new(&server);
        let manifest = dir.path().join("base/20260801T090000/data/backup_manifest");
        let args = engine.basebackup_args(
            &dir.path().join("base/20260801T120000"),
            "barman backup",
            false,
            Some(&manifest),
        );
        assert!(args
            .iter()
            .any(|a| a == &format!("--incremental={manifest}")));
    }

    #[test]
    fn streaming_conninfo_is_preferred() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server(dir.path(), "");
        let engine = StreamingCopyEngine::new(&server);
        let args =
            engine.basebackup_args(&dir.path().join("b"), "label", false, None);
        let dbname_idx = args.iter().position(|a| a == "--dbname").unwrap();
        assert!(args[dbname_idx + 1].contains("user=streaming_barman"));
    }
}
