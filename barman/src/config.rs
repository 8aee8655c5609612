//! Typed configuration layer.
//!
//! Configuration lives in a TOML file: one `[barman]` table with global
//! options, one table per managed server, and `[model.<name>]` overlay
//! tables. Server tables may also be split across files in a configured
//! directory. Options are a closed, typed set; unknown keys are collected
//! as warnings instead of being rejected, so configs written for newer
//! versions keep loading.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use utils::logging::LogFormat;

use crate::compression::CompressionAlg;
use crate::error::BarmanError;
use crate::retention::RetentionPolicy;

pub mod defaults {
    pub const DEFAULT_LOG_LEVEL: &str = "info";
    pub const DEFAULT_MINIMUM_REDUNDANCY: u32 = 0;
    pub const DEFAULT_PARALLEL_JOBS: usize = 1;
    pub const DEFAULT_PARALLEL_JOBS_START_BATCH_SIZE: usize = 10;
    pub const DEFAULT_PARALLEL_JOBS_START_BATCH_PERIOD: &str = "1s";
    pub const DEFAULT_ARCHIVE_TIMEOUT: &str = "60s";
    pub const DEFAULT_WAIT_FOR_WALS_TIMEOUT: &str = "30s";
    pub const DEFAULT_KEEPALIVE_INTERVAL: &str = "60s";
    pub const DEFAULT_SSH_CONNECT_TIMEOUT: &str = "30s";
    pub const DEFAULT_BASEBACKUP_RETRY_TIMES: u32 = 0;
    pub const DEFAULT_BASEBACKUP_RETRY_SLEEP: &str = "30s";
    pub const DEFAULT_RECEIVER_APPLICATION_NAME: &str = "barman_receive_wal";

    /// Initial configuration file created by 'barman --init'-style tooling.
    pub const DEFAULT_CONFIG_FILE: &str = r#"
[barman]
barman_home = '/var/lib/barman'
#log_level = 'info'
#log_format = 'plain'
#configuration_files_directory = '/etc/barman.d'

# One table per server, for example:
#
#[main]
#description = 'primary production cluster'
#conninfo = 'host=pg.example.com user=barman dbname=postgres'
#streaming_conninfo = 'host=pg.example.com user=streaming_barman'
#backup_method = 'rsync'
#ssh_command = 'ssh postgres@pg.example.com'
#archiver = true
#streaming_archiver = true
#slot_name = 'barman'
#retention_policy = 'RECOVERY WINDOW OF 7 DAYS'
#minimum_redundancy = 2
"#;
}

/// Section names no server may use.
pub const RESERVED_SECTIONS: &[&str] = &["barman", "all", "model"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackupMethod {
    Rsync,
    LocalRsync,
    Postgres,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CreateSlot {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReuseMode {
    Off,
    Copy,
    Link,
}

/// Operator-supplied commands fired around lifecycle events. Each event has
/// a fire-and-forget *standard* script and an exit-code-aware *retry* script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookScripts {
    pub pre_backup_script: Option<String>,
    pub pre_backup_retry_script: Option<String>,
    pub post_backup_script: Option<String>,
    pub post_backup_retry_script: Option<String>,
    pub pre_delete_script: Option<String>,
    pub pre_delete_retry_script: Option<String>,
    pub post_delete_script: Option<String>,
    pub post_delete_retry_script: Option<String>,
    pub pre_archive_script: Option<String>,
    pub pre_archive_retry_script: Option<String>,
    pub post_archive_script: Option<String>,
    pub post_archive_retry_script: Option<String>,
    pub pre_wal_delete_script: Option<String>,
    pub pre_wal_delete_retry_script: Option<String>,
    pub post_wal_delete_script: Option<String>,
    pub post_wal_delete_retry_script: Option<String>,
    pub pre_recovery_script: Option<String>,
    pub pre_recovery_retry_script: Option<String>,
    pub post_recovery_script: Option<String>,
    pub post_recovery_retry_script: Option<String>,
}

/// Raw option set accepted in a server table, a model table, or (as
/// defaults) in the `[barman]` table. Everything is optional here;
/// resolution happens in [`ServerConfig::resolve`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawOptions {
    description: Option<String>,
    cluster: Option<String>,
    conninfo: Option<String>,
    primary_conninfo: Option<String>,
    streaming_conninfo: Option<String>,
    backup_method: Option<BackupMethod>,
    archiver: Option<bool>,
    streaming_archiver: Option<bool>,
    streaming_archiver_name: Option<String>,
    slot_name: Option<String>,
    create_slot: Option<CreateSlot>,
    compression: Option<CompressionAlg>,
    retention_policy: Option<String>,
    retention_policy_auto: Option<bool>,
    minimum_redundancy: Option<u32>,
    #[serde(with = "humantime_serde", default)]
    last_backup_maximum_age: Option<Duration>,
    reuse_backup: Option<ReuseMode>,
    rsync_checksum: Option<bool>,
    bandwidth_limit: Option<u64>,
    tablespace_bandwidth_limit: Option<BTreeMap<String, u64>>,
    parallel_jobs: Option<usize>,
    parallel_jobs_start_batch_size: Option<usize>,
    #[serde(with = "humantime_serde", default)]
    parallel_jobs_start_batch_period: Option<Duration>,
    immediate_checkpoint: Option<bool>,
    backup_options: Option<String>,
    #[serde(with = "humantime_serde", default)]
    archive_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    wait_for_wals_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    keepalive_interval: Option<Duration>,
    ssh_command: Option<String>,
    #[serde(with = "humantime_serde", default)]
    ssh_connect_timeout: Option<Duration>,
    basebackup_retry_times: Option<u32>,
    #[serde(with = "humantime_serde", default)]
    basebackup_retry_sleep: Option<Duration>,
    recovery_staging_path: Option<Utf8PathBuf>,
    local_staging_path: Option<Utf8PathBuf>,
    snapshot_provider_command: Option<String>,
    backup_directory: Option<Utf8PathBuf>,
    basebackups_directory: Option<Utf8PathBuf>,
    wals_directory: Option<Utf8PathBuf>,
    incoming_wals_directory: Option<Utf8PathBuf>,
    streaming_wals_directory: Option<Utf8PathBuf>,
    errors_directory: Option<Utf8PathBuf>,
    meta_directory: Option<Utf8PathBuf>,
    #[serde(flatten)]
    hooks: HookScripts,
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

impl RawOptions {
    /// Overlay `other` on top of `self`: set fields of `other` win.
    fn overlay(&self, other: &RawOptions) -> RawOptions {
        macro_rules! pick {
            ($field:ident) => {
                other.$field.clone().or_else(|| self.$field.clone())
            };
        }
        macro_rules! pick_hook {
            ($field:ident) => {
                other.hooks.$field.clone().or_else(|| self.hooks.$field.clone())
            };
        }
        RawOptions {
            description: pick!(description),
            cluster: pick!(cluster),
            conninfo: pick!(conninfo),
            primary_conninfo: pick!(primary_conninfo),
            streaming_conninfo: pick!(streaming_conninfo),
            backup_method: pick!(backup_method),
            archiver: pick!(archiver),
            streaming_archiver: pick!(streaming_archiver),
            streaming_archiver_name: pick!(streaming_archiver_name),
            slot_name: pick!(slot_name),
            create_slot: pick!(create_slot),
            compression: pick!(compression),
            retention_policy: pick!(retention_policy),
            retention_policy_auto: pick!(retention_policy_auto),
            minimum_redundancy: pick!(minimum_redundancy),
            last_backup_maximum_age: pick!(last_backup_maximum_age),
            reuse_backup: pick!(reuse_backup),
            rsync_checksum: pick!(rsync_checksum),
            bandwidth_limit: pick!(bandwidth_limit),
            tablespace_bandwidth_limit: pick!(tablespace_bandwidth_limit),
            parallel_jobs: pick!(parallel_jobs),
            parallel_jobs_start_batch_size: pick!(parallel_jobs_start_batch_size),
            parallel_jobs_start_batch_period: pick!(parallel_jobs_start_batch_period),
            immediate_checkpoint: pick!(immediate_checkpoint),
            backup_options: pick!(backup_options),
            archive_timeout: pick!(archive_timeout),
            wait_for_wals_timeout: pick!(wait_for_wals_timeout),
            keepalive_interval: pick!(keepalive_interval),
            ssh_command: pick!(ssh_command),
            ssh_connect_timeout: pick!(ssh_connect_timeout),
            basebackup_retry_times: pick!(basebackup_retry_times),
            basebackup_retry_sleep: pick!(basebackup_retry_sleep),
            recovery_staging_path: pick!(recovery_staging_path),
            local_staging_path: pick!(local_staging_path),
            snapshot_provider_command: pick!(snapshot_provider_command),
            backup_directory: pick!(backup_directory),
            basebackups_directory: pick!(basebackups_directory),
            wals_directory: pick!(wals_directory),
            incoming_wals_directory: pick!(incoming_wals_directory),
            streaming_wals_directory: pick!(streaming_wals_directory),
            errors_directory: pick!(errors_directory),
            meta_directory: pick!(meta_directory),
            hooks: HookScripts {
                pre_backup_script: pick_hook!(pre_backup_script),
                pre_backup_retry_script: pick_hook!(pre_backup_retry_script),
                post_backup_script: pick_hook!(post_backup_script),
                post_backup_retry_script: pick_hook!(post_backup_retry_script),
                pre_delete_script: pick_hook!(pre_delete_script),
                pre_delete_retry_script: pick_hook!(pre_delete_retry_script),
                post_delete_script: pick_hook!(post_delete_script),
                post_delete_retry_script: pick_hook!(post_delete_retry_script),
                pre_archive_script: pick_hook!(pre_archive_script),
                pre_archive_retry_script: pick_hook!(pre_archive_retry_script),
                post_archive_script: pick_hook!(post_archive_script),
                post_archive_retry_script: pick_hook!(post_archive_retry_script),
                pre_wal_delete_script: pick_hook!(pre_wal_delete_script),
                pre_wal_delete_retry_script: pick_hook!(pre_wal_delete_retry_script),
                post_wal_delete_script: pick_hook!(post_wal_delete_script),
                post_wal_delete_retry_script: pick_hook!(post_wal_delete_retry_script),
                pre_recovery_script: pick_hook!(pre_recovery_script),
                pre_recovery_retry_script: pick_hook!(pre_recovery_retry_script),
                post_recovery_script: pick_hook!(post_recovery_script),
                post_recovery_retry_script: pick_hook!(post_recovery_retry_script),
            },
            unknown: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawGlobal {
    barman_home: Utf8PathBuf,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    configuration_files_directory: Option<Utf8PathBuf>,
    #[serde(flatten)]
    shared: RawOptions,
}

/// Immutable descriptor of one managed PostgreSQL cluster, after defaults,
/// model overlays, and validation.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub description: Option<String>,
    pub cluster: Option<String>,
    pub conninfo: String,
    pub primary_conninfo: Option<String>,
    pub streaming_conninfo: Option<String>,
    pub backup_method: BackupMethod,
    pub archiver: bool,
    pub streaming_archiver: bool,
    pub streaming_archiver_name: String,
    pub slot_name: Option<String>,
    pub create_slot: CreateSlot,
    pub compression: Option<CompressionAlg>,
    pub retention_policy: Option<RetentionPolicy>,
    /// Apply retention automatically from cron.
    pub retention_policy_auto: bool,
    pub minimum_redundancy: u32,
    pub last_backup_maximum_age: Option<Duration>,
    pub reuse_backup: ReuseMode,
    pub rsync_checksum: bool,
    /// KiB/s cap for copy operations; per-tablespace overrides by name.
    pub bandwidth_limit: Option<u64>,
    pub tablespace_bandwidth_limit: BTreeMap<String, u64>,
    pub parallel_jobs: usize,
    pub parallel_jobs_start_batch_size: usize,
    pub parallel_jobs_start_batch_period: Duration,
    pub immediate_checkpoint: bool,
    pub archive_timeout: Duration,
    pub wait_for_wals_timeout: Duration,
    pub keepalive_interval: Duration,
    pub ssh_command: Option<String>,
    pub ssh_connect_timeout: Duration,
    pub basebackup_retry_times: u32,
    pub basebackup_retry_sleep: Duration,
    pub recovery_staging_path: Option<Utf8PathBuf>,
    pub local_staging_path: Option<Utf8PathBuf>,
    pub snapshot_provider_command: Option<String>,
    pub backup_directory: Utf8PathBuf,
    pub basebackups_directory: Utf8PathBuf,
    pub wals_directory: Utf8PathBuf,
    pub incoming_wals_directory: Utf8PathBuf,
    pub streaming_wals_directory: Utf8PathBuf,
    pub errors_directory: Utf8PathBuf,
    pub meta_directory: Utf8PathBuf,
    pub hooks: HookScripts,
    /// Name of the model overlay in effect, if any.
    pub active_model: Option<String>,
}

impl ServerConfig {
    pub fn xlogdb_path(&self) -> Utf8PathBuf {
        self.wals_directory.join("xlog.db")
    }

    fn resolve(
        name: &str,
        raw: &RawOptions,
        barman_home: &Utf8Path,
        active_model: Option<String>,
        warnings: &mut Vec<String>,
    ) -> anyhow::Result<ServerConfig> {
        let conninfo = raw.conninfo.clone().ok_or_else(|| {
            BarmanError::Configuration(format!("server '{name}' has no conninfo"))
        })?;

        // Archiver flags: at least one ingestion path must be on. An entirely
        // unset pair defaults to the plain archiver, with a warning.
        let (archiver, streaming_archiver) = match (raw.archiver, raw.streaming_archiver) {
            (None, None) => {
                warnings.push(format!(
                    "server '{name}': neither archiver nor streaming_archiver set, \
                     assuming archiver = true"
                ));
                (true, false)
            }
            (a, s) => (a.unwrap_or(false), s.unwrap_or(false)),
        };
        if !archiver && !streaming_archiver {
            return Err(BarmanError::Configuration(format!(
                "server '{name}': at least one of archiver and streaming_archiver \
                 must be enabled"
            ))
            .into());
        }

        let create_slot = raw.create_slot.unwrap_or(CreateSlot::Manual);
        if streaming_archiver && create_slot == CreateSlot::Auto && raw.slot_name.is_none() {
            return Err(BarmanError::Configuration(format!(
                "server '{name}': create_slot = auto requires slot_name"
            ))
            .into());
        }

        if let Some(opts) = &raw.backup_options {
            for opt in opts.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match opt {
                    "concurrent_backup" => {}
                    "exclusive_backup" => {
                        return Err(BarmanError::Configuration(format!(
                            "server '{name}': exclusive backup mode is not supported"
                        ))
                        .into());
                    }
                    other => warnings
                        .push(format!("server '{name}': unknown backup option '{other}'")),
                }
            }
        }

        let retention_policy = raw
            .retention_policy
            .as_deref()
            .map(RetentionPolicy::parse)
            .transpose()
            .with_context(|| format!("server '{name}': bad retention_policy"))?;

        let parallel_jobs = raw.parallel_jobs.unwrap_or(defaults::DEFAULT_PARALLEL_JOBS);
        if parallel_jobs == 0 {
            return Err(BarmanError::Configuration(format!(
                "server '{name}': parallel_jobs must be >= 1"
            ))
            .into());
        }

        let backup_directory = raw
            .backup_directory
            .clone()
            .unwrap_or_else(|| barman_home.join(name));
        let basebackups_directory = raw
            .basebackups_directory
            .clone()
            .unwrap_or_else(|| backup_directory.join("base"));
        let wals_directory = raw
            .wals_directory
            .clone()
            .unwrap_or_else(|| backup_directory.join("wals"));
        let incoming_wals_directory = raw
            .incoming_wals_directory
            .clone()
            .unwrap_or_else(|| backup_directory.join("incoming"));
        let streaming_wals_directory = raw
            .streaming_wals_directory
            .clone()
            .unwrap_or_else(|| backup_directory.join("streaming"));
        let errors_directory = raw
            .errors_directory
            .clone()
            .unwrap_or_else(|| backup_directory.join("errors"));
        let meta_directory = raw
            .meta_directory
            .clone()
            .unwrap_or_else(|| backup_directory.join("meta"));

        let parse_default = |s: &str| humantime::parse_duration(s).expect("default is parseable");

        Ok(ServerConfig {
            name: name.to_string(),
            description: raw.description.clone(),
            cluster: raw.cluster.clone(),
            conninfo,
            primary_conninfo: raw.primary_conninfo.clone(),
            streaming_conninfo: raw.streaming_conninfo.clone(),
            backup_method: raw.backup_method.unwrap_or(BackupMethod::Rsync),
            archiver,
            streaming_archiver,
            streaming_archiver_name: raw
                .streaming_archiver_name
                .clone()
                .unwrap_or_else(|| defaults::DEFAULT_RECEIVER_APPLICATION_NAME.to_string()),
            slot_name: raw.slot_name.clone(),
            create_slot,
            compression: raw.compression,
            retention_policy,
            retention_policy_auto: raw.retention_policy_auto.unwrap_or(true),
            minimum_redundancy: raw
                .minimum_redundancy
                .unwrap_or(defaults::DEFAULT_MINIMUM_REDUNDANCY),
            last_backup_maximum_age: raw.last_backup_maximum_age,
            reuse_backup: raw.reuse_backup.unwrap_or(ReuseMode::Off),
            rsync_checksum: raw.rsync_checksum.unwrap_or(false),
            bandwidth_limit: raw.bandwidth_limit,
            tablespace_bandwidth_limit: raw.tablespace_bandwidth_limit.clone().unwrap_or_default(),
            parallel_jobs,
            parallel_jobs_start_batch_size: raw
                .parallel_jobs_start_batch_size
                .unwrap_or(defaults::DEFAULT_PARALLEL_JOBS_START_BATCH_SIZE),
            parallel_jobs_start_batch_period: raw
                .parallel_jobs_start_batch_period
                .unwrap_or_else(|| parse_default(defaults::DEFAULT_PARALLEL_JOBS_START_BATCH_PERIOD)),
            immediate_checkpoint: raw.immediate_checkpoint.unwrap_or(false),
            archive_timeout: raw
                .archive_timeout
                .unwrap_or_else(|| parse_default(defaults::DEFAULT_ARCHIVE_TIMEOUT)),
            wait_for_wals_timeout: raw
                .wait_for_wals_timeout
                .unwrap_or_else(|| parse_default(defaults::DEFAULT_WAIT_FOR_WALS_TIMEOUT)),
            keepalive_interval: raw
                .keepalive_interval
                .unwrap_or_else(|| parse_default(defaults::DEFAULT_KEEPALIVE_INTERVAL)),
            ssh_command: raw.ssh_command.clone(),
            ssh_connect_timeout: raw
                .ssh_connect_timeout
                .unwrap_or_else(|| parse_default(defaults::DEFAULT_SSH_CONNECT_TIMEOUT)),
            basebackup_retry_times: raw
                .basebackup_retry_times
                .unwrap_or(defaults::DEFAULT_BASEBACKUP_RETRY_TIMES),
            basebackup_retry_sleep: raw
                .basebackup_retry_sleep
                .unwrap_or_else(|| parse_default(defaults::DEFAULT_BASEBACKUP_RETRY_SLEEP)),
            recovery_staging_path: raw.recovery_staging_path.clone(),
            local_staging_path: raw.local_staging_path.clone(),
            snapshot_provider_command: raw.snapshot_provider_command.clone(),
            backup_directory,
            basebackups_directory,
            wals_directory,
            incoming_wals_directory,
            streaming_wals_directory,
            errors_directory,
            meta_directory,
            hooks: raw.hooks.clone(),
            active_model,
        })
    }
}

/// A named configuration overlay, switchable onto servers of the same
/// cluster with `config-switch`. Passive against the data layer: switching
/// models never moves the catalog.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub cluster: Option<String>,
    raw: RawOptions,
}

#[derive(Debug)]
pub struct Config {
    pub barman_home: Utf8PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    pub warnings: Vec<String>,
    servers: BTreeMap<String, ServerConfig>,
    models: BTreeMap<String, ModelConfig>,
}

impl Config {
    /// Load the main configuration file plus any server files from the
    /// configured directory.
    pub fn load(path: &Utf8Path) -> anyhow::Result<Config> {
        let main = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {path:?}"))?;

        // Peek at the directory option before full parsing so included
        // fragments participate in the same namespace pass.
        let doc: toml::Value = main
            .parse()
            .with_context(|| format!("configuration file {path:?} is not valid TOML"))?;
        let conf_dir = doc
            .get("barman")
            .and_then(|b| b.get("configuration_files_directory"))
            .and_then(|v| v.as_str())
            .map(Utf8PathBuf::from);

        let mut extras = Vec::new();
        if let Some(dir) = conf_dir {
            if dir.is_dir() {
                let mut paths: Vec<_> = dir
                    .read_dir_utf8()
                    .with_context(|| format!("failed to list {dir:?}"))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path().to_owned())
                    .filter(|p| p.extension() == Some("conf") || p.extension() == Some("toml"))
                    .collect();
                paths.sort();
                for p in paths {
                    let content = std::fs::read_to_string(&p)
                        .with_context(|| format!("failed to read {p:?}"))?;
                    extras.push((p.to_string(), content));
                }
            }
        }

        Self::from_toml(&main, &extras)
    }

    /// Parse from in-memory TOML fragments. The first fragment must contain
    /// the `[barman]` table; the rest may only add servers and models.
    pub fn from_toml(main: &str, extras: &[(String, String)]) -> anyhow::Result<Config> {
        let mut warnings = Vec::new();

        let mut doc: toml::value::Table = main
            .parse::<toml::Value>()
            .context("configuration is not valid TOML")?
            .try_into()
            .context("configuration root is not a table")?;

        for (source, content) in extras {
            let extra: toml::value::Table = content
                .parse::<toml::Value>()
                .with_context(|| format!("{source} is not valid TOML"))?
                .try_into()
                .with_context(|| format!("{source} root is not a table"))?;
            for (key, value) in extra {
                if key == "barman" {
                    return Err(BarmanError::Configuration(format!(
                        "{source}: the [barman] table may only appear in the main file"
                    ))
                    .into());
                }
                if doc.contains_key(&key) {
                    return Err(BarmanError::Configuration(format!(
                        "{source}: section '{key}' is defined twice"
                    ))
                    .into());
                }
                doc.insert(key, value);
            }
        }

        let global_value = doc.remove("barman").ok_or_else(|| {
            BarmanError::Configuration("configuration misses the [barman] table".into())
        })?;
        let global: RawGlobal = global_value
            .try_into()
            .map_err(|e| BarmanError::Configuration(format!("bad [barman] table: {e}")))?;
        for key in global.shared.unknown.keys() {
            warnings.push(format!("unknown option '{key}' in [barman]"));
        }

        let mut models = BTreeMap::new();
        if let Some(model_tables) = doc.remove("model") {
            let model_tables: toml::value::Table = model_tables
                .try_into()
                .map_err(|e| BarmanError::Configuration(format!("bad [model] tables: {e}")))?;
            for (model_name, value) in model_tables {
                let raw: RawOptions = value.try_into().map_err(|e| {
                    BarmanError::Configuration(format!("bad [model.{model_name}] table: {e}"))
                })?;
                for key in raw.unknown.keys() {
                    warnings.push(format!("unknown option '{key}' in [model.{model_name}]"));
                }
                models.insert(
                    model_name.clone(),
                    ModelConfig {
                        name: model_name,
                        cluster: raw.cluster.clone(),
                        raw,
                    },
                );
            }
        }

        let mut servers = BTreeMap::new();
        for (server_name, value) in doc {
            if RESERVED_SECTIONS.contains(&server_name.as_str()) {
                return Err(BarmanError::Configuration(format!(
                    "'{server_name}' is a reserved section name"
                ))
                .into());
            }
            let raw: RawOptions = value.try_into().map_err(|e| {
                BarmanError::Configuration(format!("bad [{server_name}] table: {e}"))
            })?;
            for key in raw.unknown.keys() {
                warnings.push(format!("unknown option '{key}' in [{server_name}]"));
            }

            // Global-or-server options flow down from [barman].
            let merged = global.shared.overlay(&raw);

            // A previously switched-on model keeps applying across loads.
            let meta_dir = merged
                .meta_directory
                .clone()
                .or_else(|| merged.backup_directory.clone().map(|d| d.join("meta")))
                .unwrap_or_else(|| global.barman_home.join(&server_name).join("meta"));
            let active_model = read_active_model(&meta_dir);
            let (effective, active_model) = match active_model {
                Some(model_name) => match models.get(&model_name) {
                    Some(model) => (merged.overlay(&model.raw), Some(model_name)),
                    None => {
                        warnings.push(format!(
                            "server '{server_name}': active model '{model_name}' is not \
                             defined, ignoring it"
                        ));
                        (merged, None)
                    }
                },
                None => (merged, None),
            };

            let server = ServerConfig::resolve(
                &server_name,
                &effective,
                &global.barman_home,
                active_model,
                &mut warnings,
            )?;
            servers.insert(server_name, server);
        }

        Ok(Config {
            barman_home: global.barman_home,
            log_level: global
                .log_level
                .unwrap_or_else(|| defaults::DEFAULT_LOG_LEVEL.to_string()),
            log_format: global.log_format.unwrap_or(LogFormat::Plain),
            warnings,
            servers,
            models,
        })
    }

    pub fn server(&self, name: &str) -> anyhow::Result<&ServerConfig> {
        self.servers.get(name).ok_or_else(|| {
            BarmanError::Configuration(format!("unknown server '{name}'")).into()
        })
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values()
    }

    pub fn model(&self, name: &str) -> anyhow::Result<&ModelConfig> {
        self.models.get(name).ok_or_else(|| {
            BarmanError::Configuration(format!("unknown configuration model '{name}'")).into()
        })
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.values()
    }

    /// Persist a model switch for a server; `None` resets to the plain
    /// configuration. Takes effect on the next load.
    pub fn switch_model(&self, server: &str, model: Option<&str>) -> anyhow::Result<()> {
        let server = self.server(server)?;
        if let Some(model_name) = model {
            let model = self.model(model_name)?;
            if model.cluster.is_some() && model.cluster != server.cluster {
                return Err(BarmanError::Configuration(format!(
                    "model '{model_name}' belongs to cluster {:?}, server '{}' to {:?}",
                    model.cluster, server.name, server.cluster
                ))
                .into());
            }
        }
        std::fs::create_dir_all(&server.meta_directory)
            .with_context(|| format!("failed to create {:?}", server.meta_directory))?;
        let marker = server.meta_directory.join(ACTIVE_MODEL_FILE);
        match model {
            Some(name) => utils::crashsafe::overwrite_file(&marker, name.as_bytes())
                .with_context(|| format!("failed to write {marker:?}"))?,
            None => std::fs::remove_file(&marker)
                .or_else(utils::crashsafe::ignore_not_found)
                .with_context(|| format!("failed to remove {marker:?}"))?,
        }
        Ok(())
    }
}

const ACTIVE_MODEL_FILE: &str = "active-model";

fn read_active_model(meta_dir: &Utf8Path) -> Option<String> {
    let name = std::fs::read_to_string(meta_dir.join(ACTIVE_MODEL_FILE)).ok()?;
    let name = name.trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(extra: &str) -> String {
        format!(
            r#"
[barman]
barman_home = '/var/lib/barman'

[main]
conninfo = 'host=db user=barman'
archiver = true
{extra}
"#
        )
    }

    #[test]
    fn minimal_server_resolves_with_defaults() {
        let config = Config::from_toml(&minimal(""), &[]).unwrap();
        let s = config.server("main").unwrap();
        assert_eq!(s.backup_method, BackupMethod::Rsync);
        assert_eq!(s.backup_directory, Utf8PathBuf::from("/var/lib/barman/main"));
        assert_eq!(s.wals_directory, Utf8PathBuf::from("/var/lib/barman/main/wals"));
        assert_eq!(s.xlogdb_path(), Utf8PathBuf::from("/var/lib/barman/main/wals/xlog.db"));
        assert_eq!(s.parallel_jobs, 1);
        assert!(s.archiver);
        assert!(!s.streaming_archiver);
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn missing_conninfo_is_a_configuration_error() {
        let toml = r#"
[barman]
barman_home = '/var/lib/barman'

[main]
archiver = true
"#;
        let err = Config::from_toml(toml, &[]).unwrap_err();
        assert!(err.to_string().contains("conninfo"));
    }

    #[test]
    fn reserved_server_names_are_rejected() {
        let toml = r#"
[barman]
barman_home = '/var/lib/barman'

[all]
conninfo = 'host=db'
"#;
        assert!(Config::from_toml(toml, &[]).is_err());
    }

    #[test]
    fn unset_archiver_pair_defaults_with_warning() {
        let toml = r#"
[barman]
barman_home = '/var/lib/barman'

[main]
conninfo = 'host=db'
"#;
        let config = Config::from_toml(toml, &[]).unwrap();
        assert!(config.server("main").unwrap().archiver);
        assert!(config.warnings.iter().any(|w| w.contains("assuming archiver")));
    }

    #[test]
    fn both_archivers_disabled_is_an_error() {
        let err = Config::from_toml(
            &minimal("streaming_archiver = false").replace("archiver = true", "archiver = false"),
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn auto_slot_requires_slot_name() {
        let toml = minimal(
            r#"streaming_archiver = true
create_slot = 'auto'"#,
        );
        assert!(Config::from_toml(&toml, &[]).is_err());
    }

    #[test]
    fn exclusive_backup_is_refused() {
        let toml = minimal(r#"backup_options = 'exclusive_backup'"#);
        let err = Config::from_toml(&toml, &[]).unwrap_err();
        assert!(err.to_string().contains("exclusive"));
    }

    #[test]
    fn unknown_options_warn_but_load() {
        let toml = minimal("made_up_option = 42");
        let config = Config::from_toml(&toml, &[]).unwrap();
        assert!(config
            .warnings
            .iter()
            .any(|w| w.contains("made_up_option")));
        assert!(config.server("main").is_ok());
    }

    #[test]
    fn global_options_flow_to_servers() {
        let toml = r#"
[barman]
barman_home = '/var/lib/barman'
minimum_redundancy = 3
compression = 'gzip'

[main]
conninfo = 'host=db'
archiver = true

[other]
conninfo = 'host=db2'
archiver = true
minimum_redundancy = 1
"#;
        let config = Config::from_toml(toml, &[]).unwrap();
        assert_eq!(config.server("main").unwrap().minimum_redundancy, 3);
        assert_eq!(config.server("other").unwrap().minimum_redundancy, 1);
        assert_eq!(
            config.server("other").unwrap().compression,
            Some(CompressionAlg::Gzip)
        );
    }

    #[test]
    fn duplicate_section_across_files_is_rejected() {
        let extras = vec![(
            "extra.conf".to_string(),
            "[main]\nconninfo = 'host=again'\n".to_string(),
        )];
        assert!(Config::from_toml(&minimal(""), &extras).is_err());
    }

    #[test]
    fn retention_policy_is_parsed_at_load() {
        let toml = minimal(r#"retention_policy = 'REDUNDANCY 4'"#);
        let config = Config::from_toml(&toml, &[]).unwrap();
        assert!(matches!(
            config.server("main").unwrap().retention_policy,
            Some(RetentionPolicy::Redundancy(4))
        ));

        let bad = minimal(r#"retention_policy = 'KEEP FOREVER'"#);
        assert!(Config::from_toml(&bad, &[]).is_err());
    }

    #[test]
    fn hook_scripts_are_picked_up() {
        let toml = minimal(r#"pre_backup_script = '/usr/local/bin/quiesce'"#);
        let config = Config::from_toml(&toml, &[]).unwrap();
        assert_eq!(
            config.server("main").unwrap().hooks.pre_backup_script.as_deref(),
            Some("/usr/local/bin/quiesce")
        );
    }
}
