//! Supervision of the streaming WAL receiver.
//!
//! One `pg_receivewal` child per server with `streaming_archiver = on`. It
//! lands `NAME.partial` files in `streaming/` and renames them on segment
//! completion, at which point the archiver pass picks them up. The
//! scheduler owns the receiver's lifetime: every cron sweep restarts a dead
//! one. A pid file under `meta/` carries liveness across our short-lived
//! processes.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::lock_file;

use crate::catalog::{self, Catalog};
use crate::config::{CreateSlot, ServerConfig};
use crate::error::BarmanError;
use crate::postgres::PostgresConnection;

/// Grace period between SIGTERM and SIGKILL when stopping the receiver.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Build the `pg_receivewal` invocation for a server. The conninfo gets the
/// configured application name injected so the receiver is identifiable in
/// `pg_stat_replication` on the upstream.
pub fn receivewal_args(server: &ServerConfig) -> Vec<String> {
    let conninfo = server
        .streaming_conninfo
        .as_deref()
        .unwrap_or(&server.conninfo);
    let mut args = vec![
        "--directory".to_string(),
        server.streaming_wals_directory.to_string(),
        "--dbname".to_string(),
        format!(
            "{conninfo} application_name={}",
            server.streaming_archiver_name
        ),
        "--no-loop".to_string(),
    ];
    if let Some(slot) = &server.slot_name {
        args.push("--slot".to_string());
        args.push(slot.clone());
    }
    args
}

/// Pid of a live receiver for this server, if any.
pub fn receiver_pid(catalog: &Catalog<'_>) -> Option<u32> {
    let pid = catalog
        .read_meta(catalog::META_RECEIVER_PID)?
        .parse::<u32>()
        .ok()?;
    lock_file::is_process_alive(pid).then_some(pid)
}

/// Create the configured replication slot on the upstream when asked to.
///
/// Streaming without a slot risks WAL loss on receiver downtime; with
/// `create_slot = auto` barman owns the slot's existence.
pub async fn ensure_slot(server: &ServerConfig) -> anyhow::Result<()> {
    let Some(slot_name) = &server.slot_name else {
        return Ok(());
    };
    if server.create_slot != CreateSlot::Auto {
        return Ok(());
    }
    let conninfo = server
        .streaming_conninfo
        .as_deref()
        .unwrap_or(&server.conninfo);
    let conn = PostgresConnection::connect(conninfo).await?;
    if conn.slot_status(slot_name).await?.is_none() {
        info!("creating replication slot '{slot_name}'");
        conn.create_physical_slot(slot_name).await?;
    }
    Ok(())
}

/// Start a detached receiver if none is live. Called from cron; returns the
/// pid of the (running or fresh) receiver.
pub async fn ensure_receiver(server: &ServerConfig) -> anyhow::Result<u32> {
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;

    if let Some(pid) = receiver_pid(&catalog) {
        return Ok(pid);
    }

    ensure_slot(server).await?;

    let log_path = server.meta_directory.join("receive-wal.log");
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {log_path:?}"))?;

    let mut command = Command::new("pg_receivewal");
    command
        .args(receivewal_args(server))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));
    // The child must outlive this short-lived process.
    command.process_group(0);
    let child = command
        .spawn()
        .map_err(|e| BarmanError::Connection(format!("failed to spawn pg_receivewal: {e}")))?;
    let pid = child.id().expect("freshly spawned child has a pid");
    catalog.write_meta(catalog::META_RECEIVER_PID, &pid.to_string())?;
    info!("started pg_receivewal (pid {pid})");
    Ok(pid)
}

/// Run the receiver in the foreground, holding the receiver lock, until the
/// child exits or the token cancels. This is the `receive-wal` command.
pub async fn run_receiver(
    server: &ServerConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let catalog = Catalog::new(server);
    catalog.ensure_layout()?;
    let _lock = catalog.try_lock(catalog::RECEIVER_LOCK)?;

    if !server.streaming_archiver {
        return Err(BarmanError::Configuration(format!(
            "server '{}' has streaming_archiver disabled",
            server.name
        ))
        .into());
    }

    ensure_slot(server).await?;

    let mut child = Command::new("pg_receivewal")
        .args(receivewal_args(server))
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| BarmanError::Connection(format!("failed to spawn pg_receivewal: {e}")))?;
    let pid = child.id().expect("freshly spawned child has a pid");
    catalog.write_meta(catalog::META_RECEIVER_PID, &pid.to_string())?;
    info!("pg_receivewal running in foreground (pid {pid})");

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                info!("pg_receivewal exited cleanly");
                Ok(())
            } else {
                Err(BarmanError::Connection(format!(
                    "pg_receivewal exited with {status}"
                ))
                .into())
            }
        }
        _ = cancel.cancelled() => {
            info!("stopping pg_receivewal (pid {pid})");
            terminate_with_grace(&mut child, pid).await;
            Ok(())
        }
    }
}

/// Stop a detached receiver. The `receive-wal --stop` command.
pub async fn stop_receiver(server: &ServerConfig) -> anyhow::Result<bool> {
    let catalog = Catalog::new(server);
    let Some(pid) = receiver_pid(&catalog) else {
        return Ok(false);
    };
    signal_pid(pid, Signal::SIGTERM)?;
    // Wait out the grace period, then force.
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !lock_file::is_process_alive(pid) {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    warn!("pg_receivewal (pid {pid}) ignored SIGTERM, sending SIGKILL");
    signal_pid(pid, Signal::SIGKILL)?;
    Ok(true)
}

async fn terminate_with_grace(child: &mut tokio::process::Child, pid: u32) {
    if signal_pid(pid, Signal::SIGTERM).is_err() {
        return;
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("pg_receivewal (pid {pid}) ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

fn signal_pid(pid: u32, signal: Signal) -> anyhow::Result<()> {
    kill(Pid::from_raw(pid as i32), signal)
        .with_context(|| format!("failed to signal pid {pid}"))
}
