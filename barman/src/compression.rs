//! WAL compression as a family of pluggable filters.
//!
//! Each algorithm knows its file suffix, its magic bytes, and how to run in
//! both directions. gzip and zstd run in-process; bzip2, lz4, xz and pigz
//! fork the system tool and stream through it. The catalog stores the
//! algorithm *name*, never the filter, so archives survive configuration
//! changes.

use std::process::Stdio;

use anyhow::Context;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::BarmanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CompressionAlg {
    Gzip,
    Bzip2,
    Lz4,
    Zstd,
    Xz,
    Pigz,
}

impl CompressionAlg {
    pub const ALL: [CompressionAlg; 6] = [
        CompressionAlg::Gzip,
        CompressionAlg::Bzip2,
        CompressionAlg::Lz4,
        CompressionAlg::Zstd,
        CompressionAlg::Xz,
        CompressionAlg::Pigz,
    ];

    /// File name suffix for archived output. pigz produces gzip streams.
    pub fn suffix(self) -> &'static str {
        match self {
            CompressionAlg::Gzip | CompressionAlg::Pigz => "gz",
            CompressionAlg::Bzip2 => "bz2",
            CompressionAlg::Lz4 => "lz4",
            CompressionAlg::Zstd => "zst",
            CompressionAlg::Xz => "xz",
        }
    }

    /// Leading bytes identifying a stream of this algorithm.
    pub fn magic_bytes(self) -> &'static [u8] {
        match self {
            CompressionAlg::Gzip | CompressionAlg::Pigz => &[0x1f, 0x8b],
            CompressionAlg::Bzip2 => b"BZh",
            CompressionAlg::Lz4 => &[0x04, 0x22, 0x4d, 0x18],
            CompressionAlg::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            CompressionAlg::Xz => &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00],
        }
    }

    /// True when this filter runs inside the process; the rest fork a tool.
    pub fn in_process(self) -> bool {
        matches!(self, CompressionAlg::Gzip | CompressionAlg::Zstd)
    }

    fn tool(self) -> &'static str {
        match self {
            CompressionAlg::Gzip => "gzip",
            CompressionAlg::Bzip2 => "bzip2",
            CompressionAlg::Lz4 => "lz4",
            CompressionAlg::Zstd => "zstd",
            CompressionAlg::Xz => "xz",
            CompressionAlg::Pigz => "pigz",
        }
    }
}

/// Identify a known compression from the leading bytes of a file. The
/// archiver uses this to pass through WAL that arrived pre-compressed.
pub fn identify(content: &[u8]) -> Option<CompressionAlg> {
    // pigz is indistinguishable from gzip on the wire, report gzip.
    for alg in [
        CompressionAlg::Gzip,
        CompressionAlg::Bzip2,
        CompressionAlg::Lz4,
        CompressionAlg::Zstd,
        CompressionAlg::Xz,
    ] {
        if content.starts_with(alg.magic_bytes()) {
            return Some(alg);
        }
    }
    None
}

/// Compress `src` into `dst`. Returns the size of the output.
pub async fn compress_file(
    alg: CompressionAlg,
    src: &Utf8Path,
    dst: &Utf8Path,
) -> anyhow::Result<u64> {
    if alg.in_process() {
        let mut input = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("failed to open {src:?}"))?;
        let output = tokio::fs::File::create(dst)
            .await
            .with_context(|| format!("failed to create {dst:?}"))?;
        match alg {
            CompressionAlg::Gzip => {
                let mut encoder = GzipEncoder::new(output);
                tokio::io::copy(&mut input, &mut encoder).await?;
                encoder.shutdown().await?;
                encoder.into_inner().sync_all().await?;
            }
            CompressionAlg::Zstd => {
                let mut encoder = ZstdEncoder::new(output);
                tokio::io::copy(&mut input, &mut encoder).await?;
                encoder.shutdown().await?;
                encoder.into_inner().sync_all().await?;
            }
            _ => unreachable!("in_process covers gzip and zstd only"),
        }
    } else {
        filter_through_tool(alg, &["-c"], src, dst).await?;
    }
    Ok(dst
        .metadata()
        .with_context(|| format!("failed to stat {dst:?}"))?
        .len())
}

/// Decompress `src` into `dst`.
pub async fn decompress_file(
    alg: CompressionAlg,
    src: &Utf8Path,
    dst: &Utf8Path,
) -> anyhow::Result<()> {
    if alg.in_process() {
        let output = tokio::fs::File::create(dst)
            .await
            .with_context(|| format!("failed to create {dst:?}"))?;
        let mut output = output;
        decompress_to_writer(alg, src, &mut output).await?;
        output.sync_all().await?;
    } else {
        filter_through_tool(alg, &["-d", "-c"], src, dst).await?;
    }
    Ok(())
}

/// Decompress `src` onto an arbitrary writer (stdout for get-wal).
pub async fn decompress_to_writer<W>(
    alg: CompressionAlg,
    src: &Utf8Path,
    writer: &mut W,
) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let input = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("failed to open {src:?}"))?;
    let reader = BufReader::new(input);
    let copied = match alg {
        CompressionAlg::Gzip | CompressionAlg::Pigz => {
            copy_decoded(GzipDecoder::new(reader), writer).await?
        }
        CompressionAlg::Zstd => copy_decoded(ZstdDecoder::new(reader), writer).await?,
        CompressionAlg::Bzip2 | CompressionAlg::Lz4 | CompressionAlg::Xz => {
            let mut child = Command::new(alg.tool())
                .args(["-d", "-c", src.as_str()])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("failed to spawn {}", alg.tool()))?;
            let mut stdout = child.stdout.take().expect("stdout is piped");
            let copied = tokio::io::copy(&mut stdout, writer).await?;
            let status = child.wait().await?;
            if !status.success() {
                return Err(BarmanError::Protocol(format!(
                    "{} exited with {status} while decompressing {src:?}",
                    alg.tool()
                ))
                .into());
            }
            copied
        }
    };
    writer.flush().await?;
    Ok(copied)
}

async fn copy_decoded<R, W>(mut decoder: R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy(&mut decoder, writer).await
}

/// Run the external tool with the file on stdin and `dst` as stdout.
async fn filter_through_tool(
    alg: CompressionAlg,
    args: &[&str],
    src: &Utf8Path,
    dst: &Utf8Path,
) -> anyhow::Result<()> {
    let input = std::fs::File::open(src).with_context(|| format!("failed to open {src:?}"))?;
    let output = std::fs::File::create(dst).with_context(|| format!("failed to create {dst:?}"))?;
    let status = Command::new(alg.tool())
        .args(args)
        .stdin(Stdio::from(input))
        .stdout(Stdio::from(output))
        .stderr(Stdio::piped())
        .status()
        .await
        .with_context(|| format!("failed to run {}", alg.tool()))?;
    if !status.success() {
        return Err(BarmanError::Protocol(format!(
            "{} {args:?} exited with {status} on {src:?}",
            alg.tool()
        ))
        .into());
    }
    // The tool wrote through its own descriptor; make the result durable.
    utils::crashsafe::fsync(dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn suffixes_and_names() {
        assert_eq!(CompressionAlg::Gzip.suffix(), "gz");
        assert_eq!(CompressionAlg::Pigz.suffix(), "gz");
        assert_eq!(CompressionAlg::Zstd.suffix(), "zst");
        assert_eq!(CompressionAlg::Bzip2.to_string(), "bzip2");
        assert_eq!("lz4".parse::<CompressionAlg>().unwrap(), CompressionAlg::Lz4);
    }

    #[test]
    fn identify_magic() {
        assert_eq!(identify(&[0x1f, 0x8b, 0x08]), Some(CompressionAlg::Gzip));
        assert_eq!(identify(b"BZh91AY"), Some(CompressionAlg::Bzip2));
        assert_eq!(
            identify(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]),
            Some(CompressionAlg::Zstd)
        );
        assert_eq!(
            identify(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00]),
            Some(CompressionAlg::Xz)
        );
        assert_eq!(identify(b"plain WAL bytes"), None);
        assert_eq!(identify(&[]), None);
    }

    #[tokio::test]
    async fn gzip_roundtrip_is_byte_identical() {
        let dir = Utf8TempDir::new().unwrap();
        let src = dir.path().join("segment");
        let compressed = dir.path().join("segment.gz");
        let restored = dir.path().join("segment.out");

        let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        tokio::fs::write(&src, &payload).await.unwrap();

        let size = compress_file(CompressionAlg::Gzip, &src, &compressed)
            .await
            .unwrap();
        assert!(size > 0);
        let head = tokio::fs::read(&compressed).await.unwrap();
        assert_eq!(identify(&head), Some(CompressionAlg::Gzip));

        decompress_file(CompressionAlg::Gzip, &compressed, &restored)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&restored).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn zstd_roundtrip_is_byte_identical() {
        let dir = Utf8TempDir::new().unwrap();
        let src = dir.path().join("segment");
        let compressed = dir.path().join("segment.zst");
        let restored = dir.path().join("segment.out");

        let payload = vec![0xabu8; 65536];
        tokio::fs::write(&src, &payload).await.unwrap();

        compress_file(CompressionAlg::Zstd, &src, &compressed)
            .await
            .unwrap();
        let head = tokio::fs::read(&compressed).await.unwrap();
        assert_eq!(identify(&head), Some(CompressionAlg::Zstd));

        decompress_file(CompressionAlg::Zstd, &compressed, &restored)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&restored).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn decompress_to_writer_streams_content() {
        let dir = Utf8TempDir::new().unwrap();
        let src = dir.path().join("in");
        let compressed = dir.path().join("in.gz");
        tokio::fs::write(&src, b"stream me").await.unwrap();
        compress_file(CompressionAlg::Gzip, &src, &compressed)
            .await
            .unwrap();

        let mut sink = Vec::new();
        let copied = decompress_to_writer(CompressionAlg::Gzip, &compressed, &mut sink)
            .await
            .unwrap();
        assert_eq!(copied, 9);
        assert_eq!(sink, b"stream me");
    }
}
