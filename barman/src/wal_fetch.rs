//! The WAL-fetch endpoints: `get-wal` serving a segment on stdout, and
//! `put-wal` accepting one on stdin with an integrity check.
//!
//! `get-wal` is what a recovering PostgreSQL calls through its
//! restore_command, locally or over SSH. `put-wal` is the SSH-based
//! archive_command transport; its exit codes distinguish connection
//! failures (2) and input errors (3) so the upstream can react sensibly.

use anyhow::Context;
use camino::Utf8PathBuf;
use sha2::Digest;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use utils::crashsafe;

use crate::catalog::{self, Catalog};
use crate::compression::{self, CompressionAlg};
use crate::config::ServerConfig;
use crate::error::BarmanError;
use crate::xlog;

#[derive(Debug, Default, Clone)]
pub struct GetWalOptions {
    /// Instead of content, report the names of up to N archived segments
    /// starting at the requested one, for client-side warm caching.
    pub peek: Option<usize>,
    /// Serve the in-flight `.partial` file when the segment is not yet
    /// archived.
    pub partial: bool,
    /// Emit the content compressed with this algorithm.
    pub output_compression: Option<CompressionAlg>,
}

/// Serve one WAL file on the given writer.
pub async fn get_wal<W>(
    server: &ServerConfig,
    wal_name: &str,
    options: &GetWalOptions,
    output: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if !xlog::is_archivable_name(wal_name) && !xlog::is_segment_name(wal_name) {
        return Err(BarmanError::Input(format!("'{wal_name}' is not a WAL file name")).into());
    }
    let catalog = Catalog::new(server);

    if let Some(count) = options.peek {
        return peek_names(&catalog, wal_name, count, output).await;
    }

    if let Some(entry) = catalog.lookup_wal(wal_name)? {
        let path = catalog.find_wal_file(wal_name)?.ok_or_else(|| {
            BarmanError::Catalog(format!(
                "segment {wal_name} is indexed but missing from the archive"
            ))
        })?;
        let stored = entry
            .compression
            .as_deref()
            .map(str::parse::<CompressionAlg>)
            .transpose()
            .map_err(|_| {
                BarmanError::Catalog(format!("unknown compression recorded for {wal_name}"))
            })?;
        stream_converted(&path, stored, options.output_compression, output).await?;
        debug!("served {wal_name}");
        return Ok(());
    }

    // Not archived yet: the current partial may be requested explicitly.
    if options.partial {
        let partial_path = server
            .streaming_wals_directory
            .join(format!("{wal_name}.partial"));
        if partial_path.is_file() {
            stream_converted(&partial_path, None, options.output_compression, output).await?;
            info!("served partial file for {wal_name}");
            return Ok(());
        }
    }

    Err(BarmanError::Input(format!("WAL file {wal_name} is not in the archive")).into())
}

/// Names of up to `count` archived files starting at `wal_name`, one per
/// line, in archive order.
async fn peek_names<W>(
    catalog: &Catalog<'_>,
    wal_name: &str,
    count: usize,
    output: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let start = xlog::sort_key(wal_name);
    let mut names: Vec<String> = catalog
        .read_xlogdb()?
        .into_iter()
        .map(|entry| entry.name)
        .filter(|name| !xlog::is_history_name(name) && xlog::sort_key(name) >= start)
        .collect();
    names.sort_by_key(|name| xlog::sort_key(name));
    for name in names.into_iter().take(count) {
        output.write_all(name.as_bytes()).await?;
        output.write_all(b"\n").await?;
    }
    output.flush().await?;
    Ok(())
}

/// Stream a stored file, converting between its stored compression and the
/// requested output compression.
async fn stream_converted<W>(
    path: &camino::Utf8Path,
    stored: Option<CompressionAlg>,
    wanted: Option<CompressionAlg>,
    output: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match (stored, wanted) {
        // Stored form is already what the client wants: raw copy.
        (stored, wanted) if stored == wanted => {
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {path:?}"))?;
            tokio::io::copy(&mut file, output).await?;
            output.flush().await?;
        }
        (Some(alg), None) => {
            compression::decompress_to_writer(alg, path, output).await?;
        }
        (None, None) => {
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {path:?}"))?;
            tokio::io::copy(&mut file, output).await?;
            output.flush().await?;
        }
        (stored, Some(target)) => {
            // Re-encode through a scratch file; only in-process algorithms
            // can compress on the way out.
            if !target.in_process() {
                return Err(BarmanError::UnsupportedOperation(format!(
                    "output compression {target} is not available for streaming"
                ))
                .into());
            }
            let scratch = crashsafe::path_with_suffix_extension(
                &Utf8PathBuf::from(format!(
                    "{}/barman-getwal-{}",
                    std::env::temp_dir().display(),
                    std::process::id()
                )),
                "tmp",
            );
            match stored {
                Some(alg) => compression::decompress_file(alg, path, &scratch).await?,
                None => {
                    tokio::fs::copy(path, &scratch).await?;
                }
            }
            let compressed = crashsafe::path_with_suffix_extension(&scratch, target.suffix());
            compression::compress_file(target, &scratch, &compressed).await?;
            let mut file = tokio::fs::File::open(&compressed).await?;
            tokio::io::copy(&mut file, output).await?;
            output.flush().await?;
            let _ = tokio::fs::remove_file(&scratch).await;
            let _ = tokio::fs::remove_file(&compressed).await;
        }
    }
    Ok(())
}

/// Wire header of a put-wal exchange: `put-wal <name> <size> <sha256hex>`.
#[derive(Debug, PartialEq, Eq)]
pub struct PutWalHeader {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

impl PutWalHeader {
    pub fn parse(line: &str) -> anyhow::Result<PutWalHeader> {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some("put-wal"), Some(name), Some(size), Some(sha256), None) => {
                if !xlog::is_archivable_name(name) {
                    return Err(
                        BarmanError::Input(format!("'{name}' is not an archivable name")).into(),
                    );
                }
                Ok(PutWalHeader {
                    name: name.to_string(),
                    size: size
                        .parse()
                        .map_err(|_| BarmanError::Input(format!("bad size field {size:?}")))?,
                    sha256: sha256.to_ascii_lowercase(),
                })
            }
            _ => Err(BarmanError::Input(format!("malformed put-wal header {line:?}")).into()),
        }
    }
}

/// Receive one WAL file into `incoming/`, verifying length and checksum
/// before publication. Identical re-delivery is accepted silently.
pub async fn put_wal<R>(server: &ServerConfig, input: &mut R) -> anyhow::Result<String>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;

    let mut reader = BufReader::new(input);
    let mut header_line = String::new();
    reader
        .read_line(&mut header_line)
        .await
        .map_err(|e| BarmanError::Connection(format!("failed to read put-wal header: {e}")))?;
    let header = PutWalHeader::parse(header_line.trim_end())?;

    let mut content = vec![0u8; header.size as usize];
    reader
        .read_exact(&mut content)
        .await
        .map_err(|e| BarmanError::Connection(format!("short read of WAL payload: {e}")))?;

    let digest = hex::encode(sha2::Sha256::digest(&content));
    if digest != header.sha256 {
        return Err(BarmanError::Input(format!(
            "checksum mismatch for {}: got {digest}, header says {}",
            header.name, header.sha256
        ))
        .into());
    }

    let target = server.incoming_wals_directory.join(&header.name);
    if target.is_file() {
        let existing = catalog::sha256_file(&target)?;
        if hex::encode(existing) == digest {
            info!("{} re-delivered identically, accepting", header.name);
            return Ok(header.name);
        }
        return Err(BarmanError::Duplication {
            name: header.name.clone(),
        }
        .into());
    }
    crashsafe::overwrite_file(&target, &content)
        .with_context(|| format!("failed to store {target:?}"))?;
    info!("received {} ({} bytes)", header.name, header.size);
    Ok(header.name)
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn put_wal_frame(name: &str, content: &[u8]) -> Vec<u8> {
        let digest = hex::encode(sha2::Sha256::digest(content));
        let mut frame = format!("put-wal {name} {} {digest}\n", content.len()).into_bytes();
        frame.extend_from_slice(content);
        frame
    }

    #[tokio::test]
    async fn get_wal_streams_archived_content() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let catalog = Catalog::new(&server);
        catalog.ensure_layout().unwrap();
        catalog
            .record_wal("0000000100000001000000A0", b"segment payload", None)
            .unwrap();

        let mut out = Vec::new();
        get_wal(
            &server,
            "0000000100000001000000A0",
            &GetWalOptions::default(),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(out, b"segment payload");
    }

    #[tokio::test]
    async fn get_wal_decompresses_on_the_fly() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let catalog = Catalog::new(&server);
        catalog.ensure_layout().unwrap();

        // Store a gzip-compressed segment the way the archiver would.
        let plain = dir.path().join("plain");
        let gz = dir.path().join("gz");
        tokio::fs::write(&plain, b"compressed payload").await.unwrap();
        compression::compress_file(CompressionAlg::Gzip, &plain, &gz)
            .await
            .unwrap();
        let gz_bytes = std::fs::read(&gz).unwrap();
        catalog
            .record_wal(
                "0000000100000001000000A0",
                &gz_bytes,
                Some(CompressionAlg::Gzip),
            )
            .unwrap();

        let mut out = Vec::new();
        get_wal(
            &server,
            "0000000100000001000000A0",
            &GetWalOptions::default(),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(out, b"compressed payload");
    }

    #[tokio::test]
    async fn get_wal_peek_lists_archived_names() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let catalog = Catalog::new(&server);
        catalog.ensure_layout().unwrap();
        for name in [
            "000000010000000000000001",
            "000000010000000000000002",
            "000000010000000000000003",
        ] {
            catalog.record_wal(name, b"x", None).unwrap();
        }

        let mut out = Vec::new();
        get_wal(
            &server,
            "000000010000000000000002",
            &GetWalOptions {
                peek: Some(5),
                ..Default::default()
            },
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "000000010000000000000002\n000000010000000000000003\n"
        );
    }

    #[tokio::test]
    async fn get_wal_serves_the_partial_only_on_request() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");
        let catalog = Catalog::new(&server);
        catalog.ensure_layout().unwrap();
        std::fs::write(
            server
                .streaming_wals_directory
                .join("0000000100000001000000A0.partial"),
            b"half a segment",
        )
        .unwrap();

        let mut out = Vec::new();
        let err = get_wal(
            &server,
            "0000000100000001000000A0",
            &GetWalOptions::default(),
            &mut out,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not in the archive"));

        let mut out = Vec::new();
        get_wal(
            &server,
            "0000000100000001000000A0",
            &GetWalOptions {
                partial: true,
                ..Default::default()
            },
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(out, b"half a segment");
    }

    #[tokio::test]
    async fn put_wal_verifies_and_stores_into_incoming() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");

        let frame = put_wal_frame("0000000100000001000000A0", b"shipped segment");
        let name = put_wal(&server, &mut frame.as_slice()).await.unwrap();
        assert_eq!(name, "0000000100000001000000A0");
        assert_eq!(
            std::fs::read(server.incoming_wals_directory.join(&name)).unwrap(),
            b"shipped segment"
        );

        // Identical re-delivery is fine; diverging content is refused.
        put_wal(&server, &mut frame.as_slice()).await.unwrap();
        let other = put_wal_frame("0000000100000001000000A0", b"different");
        let err = put_wal(&server, &mut other.as_slice()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BarmanError>(),
            Some(BarmanError::Duplication { .. })
        ));
    }

    #[tokio::test]
    async fn put_wal_rejects_corruption_and_bad_names() {
        let dir = Utf8TempDir::new().unwrap();
        let server = test_server(dir.path(), "");

        // Corrupt payload: header checksum no longer matches.
        let mut frame = put_wal_frame("0000000100000001000000A0", b"payload");
        let len = frame.len();
        frame[len - 1] ^= 0xff;
        let err = put_wal(&server, &mut frame.as_slice()).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), crate::error::EXIT_INPUT_ERROR);

        let frame = put_wal_frame("not-a-wal-name", b"payload");
        let err = put_wal(&server, &mut frame.as_slice()).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), crate::error::EXIT_INPUT_ERROR);

        // A truncated stream is a connection-class failure.
        let mut frame = put_wal_frame("0000000100000001000000A0", b"payload");
        frame.truncate(frame.len() - 3);
        let err = put_wal(&server, &mut frame.as_slice()).await.unwrap_err();
        assert_eq!(
            crate::error::exit_code_for(&err),
            crate::error::EXIT_CONNECTION_ERROR
        );
    }

    #[test]
    fn header_parsing() {
        let header =
            PutWalHeader::parse("put-wal 0000000100000001000000A0 7 ABCDEF0123").unwrap();
        assert_eq!(header.name, "0000000100000001000000A0");
        assert_eq!(header.size, 7);
        assert_eq!(header.sha256, "abcdef0123");
        assert!(PutWalHeader::parse("get-wal x y z").is_err());
        assert!(PutWalHeader::parse("put-wal bad-name 7 abc").is_err());
        assert!(PutWalHeader::parse("put-wal 0000000100000001000000A0 x abc").is_err());
    }
}
