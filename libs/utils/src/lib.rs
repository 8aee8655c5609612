//! Leaf utility crate shared by the barman workspace: things that do not
//! depend on any of the domain code and can be pulled in from anywhere.

// async and sync helpers for crash-safe file updates
pub mod crashsafe;

// advisory lock files with pid stamping
pub mod lock_file;

// logging setup (tracing-subscriber wiring)
pub mod logging;

// PostgreSQL log sequence numbers
pub mod lsn;
