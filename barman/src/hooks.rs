//! Hook-script dispatcher.
//!
//! Around every lifecycle event an operator can configure a *standard*
//! script, whose exit code is ignored, and a *retry* script, which is
//! re-invoked until it reports success (0), ABORT_CONTINUE (62) or
//! ABORT_STOP (63). The execution order around an event is:
//! standard-pre, retry-pre, event, retry-post, standard-post. Scripts see a
//! consistent view of the catalog exclusively through environment
//! variables; they run outside all barman locks.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backup_info::BackupInfo;
use crate::config::ServerConfig;

/// Exit code by which a retry script asks to proceed while flagging trouble.
pub const HOOK_ABORT_CONTINUE: i32 = 62;
/// Exit code by which a pre retry script aborts the enclosing event.
pub const HOOK_ABORT_STOP: i32 = 63;

/// Delay between invocations of a retry script that returned a non-terminal
/// exit code.
const RETRY_HOOK_SLEEP: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HookEvent {
    Backup,
    Delete,
    Archive,
    WalDelete,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

/// What the caller should do after the pre hooks have run.
#[derive(Debug, PartialEq, Eq)]
pub enum HookOutcome {
    Proceed,
    /// A pre retry script returned ABORT_STOP.
    Abort,
}

/// The documented environment a hook script receives.
#[derive(Debug, Default, Clone)]
pub struct HookEnvironment {
    vars: Vec<(String, String)>,
}

impl HookEnvironment {
    pub fn new(server: &ServerConfig) -> Self {
        let mut env = HookEnvironment::default();
        env.set("BARMAN_SERVER", &server.name);
        env.set("BARMAN_CONFIGURATION", server.backup_directory.as_str());
        env
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.push((key.to_string(), value.to_string()));
    }

    /// Variables for backup-scoped events, with neighbours in catalog order
    /// where the caller knows them.
    pub fn with_backup(
        mut self,
        info: &BackupInfo,
        backup_dir: &camino::Utf8Path,
        previous_id: Option<&str>,
        next_id: Option<&str>,
    ) -> Self {
        self.set("BARMAN_BACKUP_ID", &info.backup_id);
        self.set("BARMAN_BACKUP_DIR", backup_dir.as_str());
        self.set("BARMAN_STATUS", &info.status.to_string());
        if let Some(prev) = previous_id {
            self.set("BARMAN_PREVIOUS_ID", prev);
        }
        if let Some(next) = next_id {
            self.set("BARMAN_NEXT_ID", next);
        }
        self
    }

    /// Variables for WAL-scoped events.
    pub fn with_wal(
        mut self,
        name: &str,
        path: &camino::Utf8Path,
        size: u64,
        timestamp: u64,
        compression: Option<&str>,
    ) -> Self {
        self.set("BARMAN_SEGMENT", name);
        self.set("BARMAN_FILE", path.as_str());
        self.set("BARMAN_SIZE", &size.to_string());
        self.set("BARMAN_TIMESTAMP", &timestamp.to_string());
        self.set("BARMAN_COMPRESSION", compression.unwrap_or("None"));
        self
    }

    pub fn with_error(mut self, message: &str) -> Self {
        self.set("BARMAN_ERROR", message);
        self
    }
}

/// Run the hooks for one (event, phase) pair.
///
/// Pre order is standard first, then retry; post order is retry first, then
/// standard, so that the standard scripts always bracket the whole event.
pub async fn run_hooks(
    server: &ServerConfig,
    event: HookEvent,
    phase: HookPhase,
    env: &HookEnvironment,
) -> anyhow::Result<HookOutcome> {
    let (standard, retry) = scripts_for(server, event, phase);

    let mut env = env.clone();
    env.set("BARMAN_PHASE", &phase.to_string());
    env.set("BARMAN_HOOK", &format!("{phase}_{event}_script"));

    let run_order: [(&Option<String>, bool); 2] = match phase {
        HookPhase::Pre => [(&standard, false), (&retry, true)],
        HookPhase::Post => [(&retry, true), (&standard, false)],
    };

    for (script, is_retry) in run_order {
        let Some(script) = script else { continue };
        if is_retry {
            match run_retry_script(script, &env).await? {
                HOOK_ABORT_STOP if phase == HookPhase::Pre => {
                    info!("{phase} {event} retry hook requested abort");
                    return Ok(HookOutcome::Abort);
                }
                HOOK_ABORT_STOP => {
                    // In a post hook ABORT_STOP degrades to ABORT_CONTINUE.
                    warn!("{phase} {event} retry hook returned ABORT_STOP, continuing");
                }
                HOOK_ABORT_CONTINUE => {
                    warn!("{phase} {event} retry hook returned ABORT_CONTINUE");
                }
                _ => {}
            }
        } else {
            run_standard_script(script, &env).await?;
        }
    }
    Ok(HookOutcome::Proceed)
}

fn scripts_for(
    server: &ServerConfig,
    event: HookEvent,
    phase: HookPhase,
) -> (Option<String>, Option<String>) {
    let h = &server.hooks;
    let pair = match (event, phase) {
        (HookEvent::Backup, HookPhase::Pre) => (&h.pre_backup_script, &h.pre_backup_retry_script),
        (HookEvent::Backup, HookPhase::Post) => (&h.post_backup_script, &h.post_backup_retry_script),
        (HookEvent::Delete, HookPhase::Pre) => (&h.pre_delete_script, &h.pre_delete_retry_script),
        (HookEvent::Delete, HookPhase::Post) => (&h.post_delete_script, &h.post_delete_retry_script),
        (HookEvent::Archive, HookPhase::Pre) => (&h.pre_archive_script, &h.pre_archive_retry_script),
        (HookEvent::Archive, HookPhase::Post) => {
            (&h.post_archive_script, &h.post_archive_retry_script)
        }
        (HookEvent::WalDelete, HookPhase::Pre) => {
            (&h.pre_wal_delete_script, &h.pre_wal_delete_retry_script)
        }
        (HookEvent::WalDelete, HookPhase::Post) => {
            (&h.post_wal_delete_script, &h.post_wal_delete_retry_script)
        }
        (HookEvent::Recovery, HookPhase::Pre) => {
            (&h.pre_recovery_script, &h.pre_recovery_retry_script)
        }
        (HookEvent::Recovery, HookPhase::Post) => {
            (&h.post_recovery_script, &h.post_recovery_retry_script)
        }
    };
    (pair.0.clone(), pair.1.clone())
}

/// Fire-and-forget semantics: a failing standard script is logged, never
/// propagated.
async fn run_standard_script(script: &str, env: &HookEnvironment) -> anyhow::Result<()> {
    let status = spawn_script(script, env).await?;
    if !status.success() {
        warn!("standard hook script '{script}' exited with {status}");
    }
    Ok(())
}

/// Re-invoke until the script reports one of the terminal exit codes.
async fn run_retry_script(script: &str, env: &HookEnvironment) -> anyhow::Result<i32> {
    loop {
        let status = spawn_script(script, env).await?;
        let code = status.code().unwrap_or(-1);
        match code {
            0 | HOOK_ABORT_CONTINUE | HOOK_ABORT_STOP => return Ok(code),
            other => {
                debug!("retry hook script '{script}' exited with {other}, retrying");
                tokio::time::sleep(RETRY_HOOK_SLEEP).await;
            }
        }
    }
}

async fn spawn_script(
    script: &str,
    env: &HookEnvironment,
) -> anyhow::Result<std::process::ExitStatus> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in &env.vars {
        command.env(key, value);
    }
    command
        .status()
        .await
        .with_context(|| format!("failed to spawn hook script '{script}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use camino_tempfile::Utf8TempDir;

    fn server_with_hooks(home: &camino::Utf8Path, hooks: &str) -> ServerConfig {
        let toml = format!(
            r#"
[barman]
barman_home = '{home}'

[main]
conninfo = 'host=db'
archiver = true
{hooks}
"#
        );
        Config::from_toml(&toml, &[])
            .unwrap()
            .server("main")
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn standard_script_receives_environment_and_failures_are_ignored() {
        let dir = Utf8TempDir::new().unwrap();
        let out = dir.path().join("env-dump");
        let server = server_with_hooks(
            dir.path(),
            &format!(
                "pre_archive_script = 'echo \"$BARMAN_SERVER $BARMAN_PHASE $BARMAN_SEGMENT\" > {out}; exit 7'"
            ),
        );

        let env = HookEnvironment::new(&server).with_wal(
            "0000000100000001000000A0",
            camino::Utf8Path::new("/archive/path"),
            16777216,
            1769904000,
            None,
        );
        let outcome = run_hooks(&server, HookEvent::Archive, HookPhase::Pre, &env)
            .await
            .unwrap();
        // exit 7 from a standard script does not abort the event
        assert_eq!(outcome, HookOutcome::Proceed);
        let dumped = std::fs::read_to_string(&out).unwrap();
        assert_eq!(dumped.trim(), "main pre 0000000100000001000000A0");
    }

    #[tokio::test]
    async fn pre_retry_abort_stop_aborts_the_event() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server_with_hooks(dir.path(), "pre_backup_retry_script = 'exit 63'");
        let env = HookEnvironment::new(&server);
        let outcome = run_hooks(&server, HookEvent::Backup, HookPhase::Pre, &env)
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Abort);
    }

    #[tokio::test]
    async fn post_retry_abort_stop_degrades_to_continue() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server_with_hooks(dir.path(), "post_backup_retry_script = 'exit 63'");
        let env = HookEnvironment::new(&server);
        let outcome = run_hooks(&server, HookEvent::Backup, HookPhase::Post, &env)
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Proceed);
    }

    #[tokio::test]
    async fn retry_script_is_reinvoked_until_terminal() {
        let dir = Utf8TempDir::new().unwrap();
        let marker = dir.path().join("attempted");
        // First invocation fails with a non-terminal code, second succeeds.
        let script = format!(
            "if [ -f {marker} ]; then exit 0; else touch {marker}; exit 1; fi"
        );
        let server =
            server_with_hooks(dir.path(), &format!("pre_delete_retry_script = '{script}'"));
        let env = HookEnvironment::new(&server);

        let start = std::time::Instant::now();
        let outcome = run_hooks(&server, HookEvent::Delete, HookPhase::Pre, &env)
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Proceed);
        // One retry means at least one sleep elapsed.
        assert!(start.elapsed() >= RETRY_HOOK_SLEEP);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn events_without_scripts_are_noops() {
        let dir = Utf8TempDir::new().unwrap();
        let server = server_with_hooks(dir.path(), "");
        let env = HookEnvironment::new(&server);
        for event in [
            HookEvent::Backup,
            HookEvent::Delete,
            HookEvent::Archive,
            HookEvent::WalDelete,
            HookEvent::Recovery,
        ] {
            assert_eq!(
                run_hooks(&server, event, HookPhase::Pre, &env).await.unwrap(),
                HookOutcome::Proceed
            );
        }
    }
}
