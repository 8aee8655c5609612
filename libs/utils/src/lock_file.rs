//! Advisory lock files.
//!
//! Every mutating barman operation takes an exclusive flock on a well-known
//! file before touching the catalog, so that concurrent invocations (cron and
//! a user command, or two user commands) serialize instead of corrupting
//! state. The lock is tied to the open file descriptor and disappears with
//! the process, so a crash never leaves a stale lock behind; the pid written
//! into the file is informational only.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;

/// Outcome of a lock acquisition attempt.
pub enum LockAcquireResult {
    Acquired(LockFileGuard),
    /// Another process holds the lock. The pid is what that process wrote
    /// into the lock file, if it could be read back.
    AlreadyLocked { holder_pid: Option<u32> },
}

/// Holds the exclusive lock on the file for as long as the guard is alive.
///
/// Dropping the guard releases the lock; the file itself stays on disk so
/// the inode remains stable for future contenders.
pub struct LockFileGuard {
    file: fs::File,
    path: Utf8PathBuf,
}

impl LockFileGuard {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Try to create the lock file and grab an exclusive flock on it.
///
/// Returns `AlreadyLocked` if the flock is held elsewhere; any other failure
/// (permission, I/O) is an error.
pub fn create_exclusive(lock_file_path: &Utf8Path) -> anyhow::Result<LockAcquireResult> {
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .mode(0o644)
        .open(lock_file_path)
        .with_context(|| format!("failed to open lock file {lock_file_path:?}"))?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            let holder_pid = fs::read_to_string(lock_file_path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            return Ok(LockAcquireResult::AlreadyLocked { holder_pid });
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to flock {lock_file_path:?}"));
        }
    }

    // We own the lock; record our pid for diagnostics.
    let mut file = file;
    file.set_len(0)
        .and_then(|()| file.write_all(format!("{}\n", std::process::id()).as_bytes()))
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to stamp pid into lock file {lock_file_path:?}"))?;

    Ok(LockAcquireResult::Acquired(LockFileGuard {
        file,
        path: lock_file_path.to_owned(),
    }))
}

/// Read the pid recorded in a lock file, without taking the lock.
///
/// Used by liveness probes (is the receiver for this server running?). The
/// pid is meaningful only while the flock is actually held; callers must
/// verify with [`is_process_alive`].
pub fn peek_pid(lock_file_path: &Utf8Path) -> Option<u32> {
    fs::read_to_string(lock_file_path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

/// Check whether a pid still refers to a live process.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn lock_is_exclusive_within_process_scope() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let first = create_exclusive(&path).unwrap();
        let guard = match first {
            LockAcquireResult::Acquired(g) => g,
            LockAcquireResult::AlreadyLocked { .. } => panic!("fresh lock reported busy"),
        };
        assert_eq!(guard.path(), path);

        // The pid stamp must be ours.
        assert_eq!(peek_pid(&path), Some(std::process::id()));

        drop(guard);

        // After release, it can be taken again.
        match create_exclusive(&path).unwrap() {
            LockAcquireResult::Acquired(_) => {}
            LockAcquireResult::AlreadyLocked { .. } => panic!("released lock reported busy"),
        }
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }
}
