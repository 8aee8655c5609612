//! Helpers for updating files on disk so that a crash at any point leaves
//! either the old or the new content, never a torn mix.

use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(
    original_path: impl AsRef<Utf8Path>,
    suffix: &str,
) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.as_ref().with_extension(new_extension)
}

/// Writes a file to a temporary name next to the final one, fsyncs it, then
/// renames it into place and fsyncs the parent directory.
///
/// The rename is what makes readers see either the old or the new content;
/// the directory fsync is what makes the rename itself durable.
pub fn overwrite_file(final_path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = path_with_suffix_extension(final_path, TEMP_FILE_SUFFIX);
    let mut file = File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, final_path)?;
    fsync_parent(final_path)?;
    Ok(())
}

/// Suffix for not-yet-durable files; anything wearing it after a crash is
/// garbage and gets swept by maintenance.
pub const TEMP_FILE_SUFFIX: &str = "tmp";

/// True if the file name marks a leftover from an interrupted atomic write.
pub fn is_temporary(path: &Utf8Path) -> bool {
    path.as_str().ends_with(&format!(".{TEMP_FILE_SUFFIX}"))
}

/// fsync a file by path.
pub fn fsync(path: &Utf8Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// fsync the parent directory of the given path.
pub fn fsync_parent(path: &Utf8Path) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {path:?} has no parent"),
        )
    })?;
    File::open(parent)?.sync_all()
}

/// Async version of [`fsync`].
pub async fn fsync_async(path: impl AsRef<Utf8Path>) -> Result<(), io::Error> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

/// Rename a file into place and fsync the destination directory, async.
pub async fn durable_rename(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    tokio::fs::rename(from, to).await?;
    let parent = to.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {to:?} has no parent"),
        )
    })?;
    tokio::fs::File::open(parent).await?.sync_all().await?;
    Ok(())
}

/// Ignore "not found" errors; everything else propagates.
///
/// Deleting something that is already gone is a success for our purposes:
/// it happens when an interrupted removal is retried.
pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn test_path_with_suffix_extension() {
        let p = Utf8PathBuf::from("/foo/bar");
        assert_eq!(
            &path_with_suffix_extension(p, "temp").to_string(),
            "/foo/bar.temp"
        );
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            &path_with_suffix_extension(p, "temp_temp").to_string(),
            "/foo/bar.baz.temp_temp"
        );
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            &path_with_suffix_extension(p, ".temp").to_string(),
            "/foo/bar.baz..temp"
        );
    }

    #[test]
    fn overwrite_is_atomic_visible() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("state");

        overwrite_file(&target, b"one").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"one");

        overwrite_file(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");

        // No temp residue after a successful write.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn temporary_detection() {
        assert!(is_temporary(Utf8Path::new("/a/b/backup.info.tmp")));
        assert!(!is_temporary(Utf8Path::new("/a/b/backup.info")));
    }
}
