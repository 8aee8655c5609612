//! Error taxonomy shared by every subsystem.
//!
//! Operations return `anyhow::Result` and attach one of these variants at
//! the point where the failure class is known; the command boundary
//! downcasts to pick the exit code and the log line shape.

use thiserror::Error;

/// Process exit code signalling that a needed lock was held elsewhere.
pub const EXIT_LOCK_BUSY: i32 = 4;
/// Exit code for connection-level failures of the WAL helper commands.
pub const EXIT_CONNECTION_ERROR: i32 = 2;
/// Exit code for malformed input to the WAL helper commands.
pub const EXIT_INPUT_ERROR: i32 = 3;

#[derive(Error, Debug)]
pub enum BarmanError {
    /// A required option is missing, a value is out of range, or two
    /// mutually exclusive options are both set.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// libpq or SSH refused, timed out, or dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// PostgreSQL answered a backup-control call with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Corruption detected in backup.info or xlog.db.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// A WAL segment arrived twice with different content.
    #[error("duplicate WAL file '{name}' with different content")]
    Duplication { name: String },

    /// Another process holds the lock we need.
    #[error("another process holds the lock {lock_name}{}", holder_pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    LockBusy {
        lock_name: String,
        holder_pid: Option<u32>,
    },

    /// A proposed deletion would breach minimum redundancy or remove a
    /// KEEP-pinned backup.
    #[error("retention violation: {0}")]
    RetentionViolation(String),

    /// The requested behaviour is not valid for the backup method.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Malformed input handed to a WAL helper (bad segment name, short read).
    #[error("input error: {0}")]
    Input(String),
}

impl BarmanError {
    /// Exit code for the command boundary. Anything not listed here is a
    /// generic failure (1).
    pub fn exit_code(&self) -> i32 {
        match self {
            BarmanError::LockBusy { .. } => EXIT_LOCK_BUSY,
            BarmanError::Connection(_) => EXIT_CONNECTION_ERROR,
            BarmanError::Input(_) => EXIT_INPUT_ERROR,
            _ => 1,
        }
    }
}

/// Map an error chain to the process exit code, looking for a typed variant
/// anywhere in the chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<BarmanError>() {
            return e.exit_code();
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_codes() {
        assert_eq!(
            BarmanError::LockBusy {
                lock_name: "backup.lock".into(),
                holder_pid: Some(42)
            }
            .exit_code(),
            EXIT_LOCK_BUSY
        );
        assert_eq!(
            BarmanError::Connection("refused".into()).exit_code(),
            EXIT_CONNECTION_ERROR
        );
        assert_eq!(
            BarmanError::Input("bad name".into()).exit_code(),
            EXIT_INPUT_ERROR
        );
        assert_eq!(BarmanError::Catalog("bad".into()).exit_code(), 1);
    }

    #[test]
    fn exit_code_found_through_context() {
        let err = anyhow::Error::new(BarmanError::LockBusy {
            lock_name: "cron.lock".into(),
            holder_pid: None,
        })
        .context("while running cron");
        assert_eq!(exit_code_for(&err), EXIT_LOCK_BUSY);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), 1);
    }
}
