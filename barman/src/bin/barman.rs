//! Disaster-recovery manager for PostgreSQL: the `barman` command.
//!
//! Every invocation is a short-lived process; per-server advisory locks
//! under the barman home coordinate concurrent invocations and the cron
//! sweeps. Exit codes: 0 success, 1 generic failure, 2 connection failure,
//! 3 malformed input (WAL helpers), 4 lock contention.

use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use barman::backup::{self, BackupOptions};
use barman::backup_info::KeepTarget;
use barman::catalog::{self, BackupFilter, Catalog};
use barman::check;
use barman::compression::CompressionAlg;
use barman::config::{Config, ReuseMode, ServerConfig};
use barman::cron;
use barman::error::exit_code_for;
use barman::hooks::{self, HookEnvironment, HookEvent, HookOutcome, HookPhase};
use barman::manifest;
use barman::postgres::PostgresConnection;
use barman::receive_wal;
use barman::recovery::{self, RecoveryOptions, RecoveryTarget, TargetAction};
use barman::retention;
use barman::sync;
use barman::wal_archive;
use barman::wal_fetch::{self, GetWalOptions};
use barman::BarmanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Parser)]
#[command(name = "barman", about = "Backup and Recovery Manager for PostgreSQL")]
struct Cli {
    /// Configuration file.
    #[arg(short = 'c', long, default_value = "/etc/barman.toml", global = true)]
    config: Utf8PathBuf,
    /// Output format for list-type commands.
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain, global = true)]
    format: OutputFormat,
    /// Machine-friendly plain output: one record per line, no decoration.
    #[arg(long, global = true)]
    minimal: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the configured servers.
    ListServers,
    /// Show the configuration of every server.
    ShowServers,
    /// Show live status information for a server.
    Status { server: String },
    /// Run the check suite against one server or all of them.
    Check {
        server: String,
        /// Emit one monitoring-tool line instead of the human listing.
        #[arg(long)]
        nagios: bool,
    },
    /// Dump a machine-readable snapshot of configuration and catalogs.
    Diagnose,
    /// List the backups of a server.
    ListBackups { server: String },
    /// Show one backup in detail.
    ShowBackup { server: String, backup_id: String },
    /// Take a base backup.
    Backup {
        server: String,
        /// Friendly name recorded with the backup.
        #[arg(long)]
        name: Option<String>,
        /// Parent backup id for a block-level incremental.
        #[arg(long)]
        incremental: Option<String>,
        #[arg(long)]
        immediate_checkpoint: bool,
        /// Deduplication against the previous backup: off, copy or link.
        #[arg(long)]
        reuse_backup: Option<ReuseMode>,
        /// Wait for the WAL fence before returning.
        #[arg(short = 'w', long)]
        wait: bool,
        /// Seconds to wait for the fence.
        #[arg(long)]
        wait_timeout: Option<u64>,
    },
    /// Recover a backup into a destination directory.
    Recover {
        server: String,
        backup_id: String,
        destination: Utf8PathBuf,
        #[arg(long)]
        target_time: Option<String>,
        #[arg(long)]
        target_xid: Option<String>,
        #[arg(long)]
        target_name: Option<String>,
        #[arg(long)]
        target_lsn: Option<String>,
        #[arg(long)]
        target_immediate: bool,
        #[arg(long)]
        target_tli: Option<u32>,
        /// Stop before the target instead of after it.
        #[arg(long)]
        exclusive: bool,
        #[arg(long)]
        target_action: Option<TargetAction>,
        #[arg(long)]
        standby_mode: bool,
        /// NAME:LOCATION tablespace relocation, repeatable.
        #[arg(long = "tablespace")]
        tablespaces: Vec<String>,
        /// Recover onto a remote host through this ssh command.
        #[arg(long)]
        remote_ssh_command: Option<String>,
        /// Fetch WAL on demand through barman instead of staging it.
        #[arg(long)]
        get_wal: bool,
        /// Rsync in place over an existing destination.
        #[arg(long)]
        delta: bool,
        #[arg(long)]
        local_staging_path: Option<Utf8PathBuf>,
    },
    /// Delete a backup.
    Delete { server: String, backup_id: String },
    /// Pin or unpin a backup against retention.
    Keep {
        server: String,
        backup_id: String,
        /// full: keep the backup and all later WAL; standalone: keep only
        /// its own WAL range.
        #[arg(long)]
        target: Option<KeepTarget>,
        /// Remove the pin.
        #[arg(long)]
        release: bool,
        /// Print the current pin, if any.
        #[arg(long)]
        status: bool,
    },
    /// Force a WAL switch on the server.
    SwitchWal { server: String },
    /// Run the streaming WAL receiver in the foreground.
    ReceiveWal {
        server: String,
        /// Stop the detached receiver instead.
        #[arg(long)]
        stop: bool,
        /// Create the configured replication slot and exit.
        #[arg(long)]
        create_slot: bool,
        /// Drop the configured replication slot and exit.
        #[arg(long)]
        drop_slot: bool,
    },
    /// Run one archiver pass over the landing directories.
    ArchiveWal { server: String },
    /// Rebuild the WAL index from the files on disk.
    RebuildXlogdb { server: String },
    /// Write an archived WAL file to standard output.
    GetWal {
        server: String,
        wal_name: String,
        /// Report the names of up to N archived segments instead.
        #[arg(long)]
        peek: Option<usize>,
        /// Serve the in-flight partial file when not yet archived.
        #[arg(short = 'P', long)]
        partial: bool,
        /// Compress the output with gzip.
        #[arg(short = 'z', long)]
        gzip: bool,
    },
    /// Receive a WAL file on standard input into the incoming directory.
    PutWal { server: String },
    /// Show streaming replication standings on the server.
    ReplicationStatus { server: String },
    /// One maintenance sweep over every server.
    Cron,
    /// Describe the local catalog for a passive peer.
    SyncInfo { server: String },
    /// Pull one backup from the upstream barman.
    SyncBackup { server: String, backup_id: String },
    /// Pull missing WAL files from the upstream barman.
    SyncWals { server: String },
    /// List every file a recovery of this backup would use.
    ListFiles { server: String, backup_id: String },
    /// Re-hash a backup against its manifest.
    VerifyBackup { server: String, backup_id: String },
    /// Generate a manifest over a backup's data tree.
    GenerateManifest { server: String, backup_id: String },
    /// Switch a configuration model onto a server, or reset it.
    ConfigSwitch {
        server: String,
        /// Model name, or the literal `--reset` flag below.
        model: Option<String>,
        #[arg(long)]
        reset: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = utils::logging::init(config.log_format, &config.log_level) {
        eprintln!("ERROR: {e:#}");
        return ExitCode::from(1);
    }
    for warning in &config.warnings {
        warn!("{warning}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            signal_cancel.cancel();
        }
    });

    match runtime.block_on(dispatch(&cli, &config, &cancel)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e) as u8)
        }
    }
}

/// Resolve a server argument, where the reserved name `all` fans out.
fn servers_for<'a>(config: &'a Config, name: &str) -> anyhow::Result<Vec<&'a ServerConfig>> {
    if name == "all" {
        Ok(config.servers().collect())
    } else {
        Ok(vec![config.server(name)?])
    }
}

async fn dispatch(cli: &Cli, config: &Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    match &cli.command {
        Command::ListServers => {
            if cli.format == OutputFormat::Json {
                let names: Vec<_> = config.servers().map(|s| &s.name).collect();
                println!("{}", serde_json::to_string(&names)?);
            } else {
                for server in config.servers() {
                    if cli.minimal {
                        println!("{}", server.name);
                    } else {
                        println!(
                            "{} - {}",
                            server.name,
                            server.description.as_deref().unwrap_or("(no description)")
                        );
                    }
                }
            }
            Ok(())
        }
        Command::ShowServers => {
            for server in config.servers() {
                if cli.format == OutputFormat::Json {
                    println!("{}", serde_json::to_string(&server_summary(server))?);
                } else {
                    println!("Server {}:", server.name);
                    let summary = server_summary(server);
                    let object = summary.as_object().expect("summary is an object");
                    for (key, value) in object {
                        println!("\t{key}: {value}");
                    }
                }
            }
            Ok(())
        }
        Command::Status { server } => {
            for server in servers_for(config, server)? {
                let catalog = Catalog::new(server);
                let backups = catalog.list_backups(&BackupFilter::default())?;
                let done = backups
                    .iter()
                    .filter(|b| b.status == barman::backup_info::BackupStatus::Done)
                    .count();
                println!("Server {}:", server.name);
                if let Some(description) = &server.description {
                    println!("\tdescription: {description}");
                }
                println!("\tbackups: {} ({done} DONE)", backups.len());
                if let Some(last) = backups.last() {
                    println!("\tlast backup: {} ({})", last.backup_id, last.status);
                }
                match catalog.read_meta(catalog::META_LAST_ARCHIVED) {
                    Some(name) => println!("\tlast archived WAL: {name}"),
                    None => println!("\tlast archived WAL: (none)"),
                }
            }
            Ok(())
        }
        Command::Check { server, nagios } => {
            let mut worst = check::CheckStatus::Ok;
            for server in servers_for(config, server)? {
                let results = check::run_checks(server).await;
                if *nagios {
                    println!("{}", check::monitoring_line(&server.name, &results));
                } else if cli.format == OutputFormat::Json {
                    println!("{}", serde_json::to_string(&results)?);
                } else {
                    println!("Server {}:", server.name);
                    for result in &results {
                        match &result.hint {
                            Some(hint) => println!("\t{}: {} ({hint})", result.name, result.status),
                            None => println!("\t{}: {}", result.name, result.status),
                        }
                    }
                }
                let status = check::overall_status(&results);
                if status == check::CheckStatus::Failed {
                    worst = status;
                }
            }
            if worst == check::CheckStatus::Failed {
                anyhow::bail!("at least one check failed");
            }
            Ok(())
        }
        Command::Diagnose => {
            let mut servers = serde_json::Map::new();
            for server in config.servers() {
                let catalog = Catalog::new(server);
                let backups = catalog.list_backups(&BackupFilter::default())?;
                servers.insert(
                    server.name.clone(),
                    serde_json::json!({
                        "config": server_summary(server),
                        "backups": backups,
                        "wals_indexed": catalog.read_xlogdb()?.len(),
                    }),
                );
            }
            let report = serde_json::json!({
                "barman_home": config.barman_home,
                "servers": servers,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::ListBackups { server } => {
            for server in servers_for(config, server)? {
                let catalog = Catalog::new(server);
                let backups = catalog.list_backups(&BackupFilter::default())?;
                if cli.format == OutputFormat::Json {
                    println!("{}", serde_json::to_string(&backups)?);
                } else if cli.minimal {
                    for info in &backups {
                        println!("{}", info.backup_id);
                    }
                } else {
                    let mut table = Table::new();
                    table.set_header(["server", "id", "status", "type", "size", "end time"]);
                    for info in &backups {
                        table.add_row([
                            server.name.clone(),
                            info.backup_id.clone(),
                            info.status.to_string(),
                            info.backup_type.to_string(),
                            info.size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                            info.end_time
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".into()),
                        ]);
                    }
                    println!("{table}");
                }
            }
            Ok(())
        }
        Command::ShowBackup { server, backup_id } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let id = catalog.resolve_backup_id(backup_id)?;
            let info = catalog.load_backup_info(&id)?;
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string(&info)?);
            } else {
                print!("{}", info.to_file_content());
            }
            Ok(())
        }
        Command::Backup {
            server,
            name,
            incremental,
            immediate_checkpoint,
            reuse_backup,
            wait,
            wait_timeout,
        } => {
            let options = BackupOptions {
                name: name.clone(),
                incremental_parent: incremental.clone(),
                immediate_checkpoint: immediate_checkpoint.then_some(true),
                reuse_backup: *reuse_backup,
                wait_for_wals: *wait,
                wait_timeout: wait_timeout.map(Duration::from_secs),
            };
            for server in servers_for(config, server)? {
                let info = backup::backup(server, &options, cancel).await?;
                println!(
                    "Backup {} of server {} is {}",
                    info.backup_id, server.name, info.status
                );
            }
            Ok(())
        }
        Command::Recover {
            server,
            backup_id,
            destination,
            target_time,
            target_xid,
            target_name,
            target_lsn,
            target_immediate,
            target_tli,
            exclusive,
            target_action,
            standby_mode,
            tablespaces,
            remote_ssh_command,
            get_wal,
            delta,
            local_staging_path,
        } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let target = parse_target(
                target_time.as_deref(),
                target_xid.clone(),
                target_name.clone(),
                target_lsn.as_deref(),
                *target_immediate,
                *target_tli,
            )?;
            let mut tablespace_mappings = Vec::new();
            for mapping in tablespaces {
                let (name, location) = mapping.split_once(':').ok_or_else(|| {
                    BarmanError::Configuration(format!(
                        "tablespace mapping '{mapping}' is not NAME:LOCATION"
                    ))
                })?;
                tablespace_mappings.push((name.to_string(), Utf8PathBuf::from(location)));
            }
            let options = RecoveryOptions {
                destination: destination.clone(),
                remote_ssh_command: remote_ssh_command.clone(),
                target,
                exclusive: *exclusive,
                target_action: *target_action,
                standby_mode: *standby_mode,
                tablespace_mappings,
                get_wal: *get_wal,
                delta: *delta,
                local_staging_path: local_staging_path.clone(),
            };
            let _server_lock = catalog.try_lock(catalog::SERVER_LOCK)?;
            let plan = recovery::plan(server, &catalog, backup_id, &options)?;
            recovery::execute(server, &catalog, &plan, cancel).await?;
            println!(
                "Recovered backup {} of server {} into {}",
                plan.backup.backup_id, server.name, destination
            );
            Ok(())
        }
        Command::Delete { server, backup_id } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let _server_lock = catalog.try_lock(catalog::SERVER_LOCK)?;
            let id = catalog.resolve_backup_id(backup_id)?;
            let info = catalog.load_backup_info(&id)?;
            let snapshot = catalog.list_backups(&BackupFilter::default())?;
            retention::ensure_deletable(server, &snapshot, &info)?;

            let env = HookEnvironment::new(server).with_backup(
                &info,
                &catalog.backup_dir(&id),
                None,
                None,
            );
            if hooks::run_hooks(server, HookEvent::Delete, HookPhase::Pre, &env).await?
                == HookOutcome::Abort
            {
                anyhow::bail!("deletion aborted by pre-delete hook");
            }
            catalog.delete_backup(&id)?;
            hooks::run_hooks(server, HookEvent::Delete, HookPhase::Post, &env).await?;
            println!("Deleted backup {id} of server {}", server.name);
            Ok(())
        }
        Command::Keep {
            server,
            backup_id,
            target,
            release,
            status,
        } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let id = catalog.resolve_backup_id(backup_id)?;
            let mut info = catalog.load_backup_info(&id)?;
            if *status {
                match info.keep {
                    Some(keep) => println!("{keep}"),
                    None => println!("nokeep"),
                }
                return Ok(());
            }
            if *release {
                info.keep = None;
                catalog.write_backup_info(&info)?;
                println!("Released keep on backup {id}");
                return Ok(());
            }
            let Some(target) = *target else {
                return Err(BarmanError::Configuration(
                    "keep needs --target, --release or --status".into(),
                )
                .into());
            };
            if info.status != barman::backup_info::BackupStatus::Done {
                return Err(BarmanError::UnsupportedOperation(format!(
                    "only DONE backups can be pinned, '{id}' is {}",
                    info.status
                ))
                .into());
            }
            info.keep = Some(target);
            catalog.write_backup_info(&info)?;
            println!("Backup {id} is now kept: {target}");
            Ok(())
        }
        Command::SwitchWal { server } => {
            let server = config.server(server)?;
            let conn = PostgresConnection::connect(&server.conninfo).await?;
            let lsn = conn.switch_wal().await?;
            println!("WAL switched at {lsn}");
            Ok(())
        }
        Command::ReceiveWal {
            server,
            stop,
            create_slot,
            drop_slot,
        } => {
            let server = config.server(server)?;
            if *create_slot {
                receive_wal::ensure_slot(server).await?;
                println!("Replication slot ready");
                return Ok(());
            }
            if *drop_slot {
                let slot = server.slot_name.as_deref().ok_or_else(|| {
                    BarmanError::Configuration("no slot_name configured".into())
                })?;
                let conninfo = server
                    .streaming_conninfo
                    .as_deref()
                    .unwrap_or(&server.conninfo);
                let conn = PostgresConnection::connect(conninfo).await?;
                conn.drop_physical_slot(slot).await?;
                println!("Dropped replication slot {slot}");
                return Ok(());
            }
            if *stop {
                if receive_wal::stop_receiver(server).await? {
                    println!("Receiver stopped");
                } else {
                    println!("No receiver was running");
                }
                return Ok(());
            }
            receive_wal::run_receiver(server, cancel).await
        }
        Command::ArchiveWal { server } => {
            for server in servers_for(config, server)? {
                let stats = wal_archive::archive_wal(server, cancel).await?;
                println!(
                    "Server {}: {} archived, {} duplicates, {} rejected",
                    server.name, stats.archived, stats.duplicates, stats.rejected
                );
            }
            Ok(())
        }
        Command::RebuildXlogdb { server } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            catalog.ensure_layout()?;
            let _archive_lock = catalog.try_lock(catalog::ARCHIVE_LOCK)?;
            let count = catalog.rebuild_xlogdb()?;
            println!("Rebuilt xlog.db with {count} entries");
            Ok(())
        }
        Command::GetWal {
            server,
            wal_name,
            peek,
            partial,
            gzip,
        } => {
            let server = config.server(server)?;
            let options = GetWalOptions {
                peek: *peek,
                partial: *partial,
                output_compression: gzip.then_some(CompressionAlg::Gzip),
            };
            let mut stdout = tokio::io::stdout();
            wal_fetch::get_wal(server, wal_name, &options, &mut stdout).await
        }
        Command::PutWal { server } => {
            let server = config.server(server)?;
            let mut stdin = tokio::io::stdin();
            let name = wal_fetch::put_wal(server, &mut stdin).await?;
            eprintln!("Received {name}");
            Ok(())
        }
        Command::ReplicationStatus { server } => {
            let server = config.server(server)?;
            let conn = PostgresConnection::connect(&server.conninfo).await?;
            let standings = conn.replication_status().await?;
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string(&standings)?);
            } else if standings.is_empty() {
                println!("No streaming clients attached to {}", server.name);
            } else {
                for standing in &standings {
                    println!(
                        "{} {} {} sent={} replay={}",
                        standing.application_name.as_deref().unwrap_or("-"),
                        standing.client_addr.as_deref().unwrap_or("-"),
                        standing.state.as_deref().unwrap_or("-"),
                        standing
                            .sent_lsn
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "-".into()),
                        standing
                            .replay_lsn
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "-".into()),
                    );
                }
            }
            Ok(())
        }
        Command::Cron => {
            let report = cron::cron(config, cancel).await?;
            println!(
                "Processed {} server(s), skipped {}, archived {} WAL(s), promoted {} backup(s)",
                report.servers_processed,
                report.servers_skipped,
                report.wals_archived,
                report.backups_promoted
            );
            Ok(())
        }
        Command::SyncInfo { server } => {
            let server = config.server(server)?;
            let payload = sync::sync_info(server)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Command::SyncBackup { server, backup_id } => {
            let server = config.server(server)?;
            sync::sync_backup(server, backup_id, cancel).await
        }
        Command::SyncWals { server } => {
            let server = config.server(server)?;
            let synced = sync::sync_wals(server, cancel).await?;
            println!("Synced {synced} WAL file(s)");
            Ok(())
        }
        Command::ListFiles { server, backup_id } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let id = catalog.resolve_backup_id(backup_id)?;
            for path in manifest::list_files(&catalog, &id)? {
                println!("{path}");
            }
            Ok(())
        }
        Command::VerifyBackup { server, backup_id } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let id = catalog.resolve_backup_id(backup_id)?;
            let problems = manifest::verify(&manifest::data_dir_of(&catalog, &id))?;
            if problems.is_empty() {
                println!("Backup {id} verified, no discrepancies");
                Ok(())
            } else {
                for problem in &problems {
                    println!("{}: {}", problem.path, problem.problem);
                }
                anyhow::bail!("{} discrepancies found", problems.len());
            }
        }
        Command::GenerateManifest { server, backup_id } => {
            let server = config.server(server)?;
            let catalog = Catalog::new(server);
            let id = catalog.resolve_backup_id(backup_id)?;
            let covered = manifest::generate(&manifest::data_dir_of(&catalog, &id))?;
            println!("Manifest written, {covered} files covered");
            Ok(())
        }
        Command::ConfigSwitch {
            server,
            model,
            reset,
        } => {
            match (model.as_deref(), *reset) {
                (Some(model), false) => {
                    config.switch_model(server, Some(model))?;
                    println!("Server {server} now uses model {model}");
                }
                (None, true) => {
                    config.switch_model(server, None)?;
                    println!("Server {server} reset to its plain configuration");
                }
                _ => {
                    return Err(BarmanError::Configuration(
                        "config-switch needs a model name or --reset".into(),
                    )
                    .into())
                }
            }
            Ok(())
        }
    }
}

fn server_summary(server: &ServerConfig) -> serde_json::Value {
    serde_json::json!({
        "name": server.name,
        "description": server.description,
        "cluster": server.cluster,
        "conninfo": server.conninfo,
        "backup_method": server.backup_method.to_string(),
        "archiver": server.archiver,
        "streaming_archiver": server.streaming_archiver,
        "slot_name": server.slot_name,
        "compression": server.compression.map(|c| c.to_string()),
        "retention_policy": server.retention_policy.map(|p| p.to_string()),
        "minimum_redundancy": server.minimum_redundancy,
        "backup_directory": server.backup_directory,
        "wals_directory": server.wals_directory,
        "active_model": server.active_model,
    })
}

fn parse_target(
    time: Option<&str>,
    xid: Option<String>,
    name: Option<String>,
    lsn: Option<&str>,
    immediate: bool,
    tli: Option<u32>,
) -> anyhow::Result<Option<RecoveryTarget>> {
    let mut targets = Vec::new();
    if let Some(time) = time {
        let parsed = chrono::DateTime::parse_from_rfc3339(time)
            .map_err(|e| BarmanError::Configuration(format!("bad --target-time: {e}")))?;
        targets.push(RecoveryTarget::Time(parsed.with_timezone(&chrono::Utc)));
    }
    if let Some(xid) = xid {
        targets.push(RecoveryTarget::Xid(xid));
    }
    if let Some(name) = name {
        targets.push(RecoveryTarget::Name(name));
    }
    if let Some(lsn) = lsn {
        let parsed = lsn
            .parse()
            .map_err(|_| BarmanError::Configuration(format!("bad --target-lsn {lsn:?}")))?;
        targets.push(RecoveryTarget::Lsn(parsed));
    }
    if immediate {
        targets.push(RecoveryTarget::Immediate);
    }
    if let Some(tli) = tli {
        targets.push(RecoveryTarget::TimelineId(tli));
    }
    if targets.len() > 1 {
        return Err(BarmanError::Configuration(
            "recovery targets are mutually exclusive".into(),
        )
        .into());
    }
    Ok(targets.pop())
}
